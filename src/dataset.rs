use std::fs::File;
use std::io::Read;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord, Trim};
use flate2::read::GzDecoder;
use ndarray::{Array, Array1, Array2, ArrayView1, Axis};

use crate::config::IMAGE_PIXELS;
use crate::error::{Error, Result};

// Paired training examples. Column `j` of `features` is an image flattened to
// a [pixels x 1] column, and column `j` of `labels` is its one-hot class.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    features: Array2<f32>,
    labels: Array2<f32>,
}

impl Dataset {
    pub fn new(features: Array2<f32>, labels: Array2<f32>) -> Result<Dataset> {
        if features.ncols() != labels.ncols() {
            return Err(Error::ExampleCountMismatch {
                features: features.ncols(),
                labels: labels.ncols(),
            });
        }
        if features.ncols() == 0 {
            return Err(Error::EmptyDataset);
        }
        Ok(Dataset { features, labels })
    }

    // Number of examples.
    pub fn len(&self) -> usize {
        self.features.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn feature_count(&self) -> usize {
        self.features.nrows()
    }

    pub fn class_count(&self) -> usize {
        self.labels.nrows()
    }

    pub fn features(&self) -> &Array2<f32> {
        &self.features
    }

    pub fn labels(&self) -> &Array2<f32> {
        &self.labels
    }

    // The input column and label column of a single example.
    pub fn example(&self, index: usize) -> (ArrayView1<'_, f32>, ArrayView1<'_, f32>) {
        (
            self.features.column(index),
            self.labels.column(index),
        )
    }

    // Gathers the given example columns, in the given order, into a new pair
    // of matrices.
    pub fn columns(&self, indices: &[usize]) -> (Array2<f32>, Array2<f32>) {
        (
            self.features.select(Axis(1), indices),
            self.labels.select(Axis(1), indices),
        )
    }
}

// Turns class indices into a [classes x labels.len()] matrix where column `j` is
// all zeros except for a 1.0 in row `labels[j]`.
pub fn one_hot(labels: &[usize], classes: usize) -> Result<Array2<f32>> {
    if let Some(&label) = labels.iter().find(|&&label| label >= classes) {
        return Err(Error::MalformedTensor {
            name: "labels".to_string(),
            reason: format!("label {label} is outside 0..{classes}"),
        });
    }
    Ok(Array::from_shape_fn((classes, labels.len()), |(i, j)| {
        if labels[j] == i { 1.0 } else { 0.0 }
    }))
}

// Open a file for reading, transparently unzipping it if the file name ends in ".gz".
fn open(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path)?;
    if path.extension().is_some_and(|extension| extension == "gz") {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

// Line on which a record starts, as reported by the CSV reader.
fn line_of(record: &StringRecord) -> usize {
    record
        .position()
        .map_or(0, |position| position.line() as usize)
}

// Loads a `label,pixel1,...,pixelN` CSV file (plain or gzip) with a header row.
// Pixels are scaled from 0..=255 into [0, 1] and labels are one-hot encoded.
pub fn load_csv(path: impl AsRef<Path>, classes: usize) -> Result<Dataset> {
    let path = path.as_ref();
    let parse_error = |line: usize, reason: String| Error::Parse {
        path: path.to_path_buf(),
        line,
        reason,
    };

    // Rows are allowed to differ in length here so a ragged row is reported with its line number.
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(open(path)?);

    let mut labels = Vec::new();
    let mut pixels = Vec::new();
    let mut width = None;

    for record in reader.records() {
        let record = record?;
        let line = line_of(&record);

        let mut fields = record.iter();
        let label = fields
            .next()
            .unwrap_or_default()
            .parse::<usize>()
            .map_err(|e| parse_error(line, format!("bad label: {e}")))?;
        if label >= classes {
            return Err(parse_error(
                line,
                format!("label {label} is outside 0..{classes}"),
            ));
        }

        let row_start = pixels.len();
        for field in fields {
            let value = field
                .parse::<f32>()
                .map_err(|e| parse_error(line, format!("bad pixel {field:?}: {e}")))?;
            pixels.push(value / 255.0);
        }

        // Every example must have as many pixels as the first one.
        let row_width = pixels.len() - row_start;
        match width {
            None => width = Some(row_width),
            Some(expected) if expected != row_width => {
                return Err(parse_error(
                    line,
                    format!("expected {expected} pixels, found {row_width}"),
                ));
            }
            Some(_) => {}
        }
        labels.push(label);
    }

    let width = width.ok_or(Error::EmptyDataset)?;
    // The pixels were read one example per row, but the network wants one example per column.
    let features = Array2::from_shape_vec((labels.len(), width), pixels)?.reversed_axes();
    let labels = one_hot(&labels, classes)?;

    tracing::info!(
        path = %path.display(),
        examples = labels.ncols(),
        features = features.nrows(),
        "loaded dataset"
    );
    Dataset::new(features, labels)
}

// Scales raw 0..=255 pixel values into a single [0, 1] input column, refusing
// anything that is not exactly one 28x28 image.
pub fn image_from_pixels(pixels: &[f32]) -> Result<Array1<f32>> {
    if pixels.len() != IMAGE_PIXELS {
        return Err(Error::ShapeMismatch {
            name: "image".to_string(),
            expected: vec![IMAGE_PIXELS],
            got: vec![pixels.len()],
        });
    }
    Ok(pixels.iter().map(|pixel| pixel / 255.0).collect())
}

// Reads one image stored as comma- or whitespace-separated 0..=255 pixel
// values. A first row containing letters is treated as a header and skipped.
pub fn load_pixel_row(path: impl AsRef<Path>) -> Result<Array1<f32>> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(open(path)?);
    let mut pixels = Vec::with_capacity(IMAGE_PIXELS);

    for (index, record) in reader.records().enumerate() {
        let record = record?;
        if index == 0 && record.iter().any(|field| field.chars().any(char::is_alphabetic)) {
            continue;
        }
        // A whitespace-separated file arrives as a single field per line.
        for value in record.iter().flat_map(str::split_whitespace) {
            let pixel = value.parse::<f32>().map_err(|e| Error::Parse {
                path: path.to_path_buf(),
                line: line_of(&record),
                reason: format!("bad pixel {value:?}: {e}"),
            })?;
            pixels.push(pixel);
        }
    }

    image_from_pixels(&pixels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compression, write::GzEncoder};
    use ndarray::array;
    use std::io::Write;

    #[test]
    fn rejects_mismatched_example_counts() {
        let err = Dataset::new(Array2::zeros((4, 3)), Array2::zeros((2, 5))).unwrap_err();
        assert!(matches!(
            err,
            Error::ExampleCountMismatch {
                features: 3,
                labels: 5
            }
        ));
    }

    #[test]
    fn rejects_empty_dataset() {
        let err = Dataset::new(Array2::zeros((4, 0)), Array2::zeros((2, 0))).unwrap_err();
        assert!(matches!(err, Error::EmptyDataset));
    }

    #[test]
    fn one_hot_places_a_single_one_per_column() {
        let encoded = one_hot(&[2, 0, 1], 3).unwrap();
        assert_eq!(
            encoded,
            array![[0.0f32, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]]
        );
        assert!(one_hot(&[3], 3).is_err());
    }

    #[test]
    fn columns_follow_requested_order() {
        let dataset = Dataset::new(
            array![[0.0, 1.0, 2.0], [10.0, 11.0, 12.0]],
            one_hot(&[0, 1, 0], 2).unwrap(),
        )
        .unwrap();

        let (x, y) = dataset.columns(&[2, 0]);
        assert_eq!(x, array![[2.0f32, 0.0], [12.0, 10.0]]);
        assert_eq!(y, array![[1.0f32, 1.0], [0.0, 0.0]]);
    }

    const SMALL_CSV: &str = "label,pixel1,pixel2,pixel3\n2,0,255,51\n0,255,0,0\n";

    #[test]
    fn loads_plain_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.csv");
        std::fs::write(&path, SMALL_CSV).unwrap();

        let dataset = load_csv(&path, 3).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.feature_count(), 3);
        assert_eq!(dataset.features(), &array![[0.0f32, 1.0], [1.0, 0.0], [0.2, 0.0]]);
        assert_eq!(dataset.labels().column(0), array![0.0f32, 0.0, 1.0]);
    }

    #[test]
    fn loads_gzipped_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.csv.gz");
        let mut encoder = GzEncoder::new(std::fs::File::create(&path).unwrap(), Compression::fast());
        encoder.write_all(SMALL_CSV.as_bytes()).unwrap();
        encoder.finish().unwrap();

        let dataset = load_csv(&path, 3).unwrap();
        assert_eq!(dataset.len(), 2);
    }

    #[test]
    fn reports_line_of_ragged_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragged.csv");
        std::fs::write(&path, "label,a,b\n1,0,0\n1,0\n").unwrap();

        match load_csv(&path, 3).unwrap_err() {
            Error::Parse { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn undersized_image_is_a_shape_mismatch() {
        let err = image_from_pixels(&[0.0; 100]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn pixel_row_skips_header_and_normalizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.csv");
        let header = (1..=IMAGE_PIXELS).map(|i| format!("pixel{i}")).collect::<Vec<_>>();
        let row = vec!["255"; IMAGE_PIXELS];
        std::fs::write(&path, format!("{}\n{}\n", header.join(","), row.join(","))).unwrap();

        let image = load_pixel_row(&path).unwrap();
        assert_eq!(image.len(), IMAGE_PIXELS);
        assert!(image.iter().all(|&pixel| pixel == 1.0));
    }

    #[test]
    fn accepts_quoted_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quoted.csv");
        std::fs::write(&path, "\"label\",\"p1\",\"p2\"\n\"1\",\"0\",\"255\"\n").unwrap();

        let dataset = load_csv(&path, 2).unwrap();
        assert_eq!(dataset.features(), &array![[0.0f32], [1.0]]);
        assert_eq!(dataset.labels(), &array![[0.0f32], [1.0]]);
    }

    #[test]
    fn reports_line_of_bad_label() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.csv");
        std::fs::write(&path, "label,a\n0,1\n1,2\n7,3\n").unwrap();

        match load_csv(&path, 3).unwrap_err() {
            Error::Parse { line, reason, .. } => {
                assert_eq!(line, 4);
                assert!(reason.contains("outside"), "{reason}");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn pixel_row_accepts_whitespace_separated_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.txt");
        let lines: Vec<String> = (0..28).map(|_| vec!["0"; 28].join(" ")).collect();
        std::fs::write(&path, lines.join("\n")).unwrap();

        let image = load_pixel_row(&path).unwrap();
        assert_eq!(image.len(), IMAGE_PIXELS);
        assert!(image.iter().all(|&pixel| pixel == 0.0));
    }
}
