// Learned weights and biases, and their on-disk JSON document.
//
// The network always has exactly `LAYER_COUNT` fully-connected layers. Layer
// `k` (1-based) owns `Wk`, a [units x inputs] weight matrix, and `bk`, a
// [units x 1] bias column.

use std::fs;
use std::path::Path;

use ndarray::{Array, Array2};
use ndarray_rand::RandomExt;
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand_distr::Uniform;
use serde::{Deserialize, Serialize};

use crate::config::LayerSizes;
use crate::error::{Error, Result};
use crate::network::Gradients;
use crate::optim::Adam;

pub const LAYER_COUNT: usize = 4;

// Seed the Xavier initializer uses unless told otherwise.
pub const DEFAULT_INIT_SEED: u64 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub(crate) weights: Array2<f32>,
    pub(crate) biases: Array2<f32>,
}

impl Layer {
    pub fn new(weights: Array2<f32>, biases: Array2<f32>) -> Result<Layer> {
        let expected = [weights.nrows(), 1];
        if biases.shape() != expected {
            return Err(Error::ShapeMismatch {
                name: "bias".to_string(),
                expected: expected.to_vec(),
                got: biases.shape().to_vec(),
            });
        }
        Ok(Layer { weights, biases })
    }

    pub fn weights(&self) -> &Array2<f32> {
        &self.weights
    }

    pub fn biases(&self) -> &Array2<f32> {
        &self.biases
    }

    pub fn units(&self) -> usize {
        self.weights.nrows()
    }

    pub fn inputs(&self) -> usize {
        self.weights.ncols()
    }
}

// Name of the weight matrix of layer `index` (0-based), e.g. `W1`.
pub fn weight_name(index: usize) -> String {
    format!("W{}", index + 1)
}

// Name of the bias column of layer `index` (0-based), e.g. `b1`.
pub fn bias_name(index: usize) -> String {
    format!("b{}", index + 1)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameters {
    layers: [Layer; LAYER_COUNT],
}

impl Parameters {
    // Glorot/Xavier uniform weights, `U(-l, l)` with `l = sqrt(6 / (fan_in + fan_out))`,
    // and zero biases. The same `seed` always yields the same parameters.
    pub fn xavier(input: usize, sizes: &LayerSizes, seed: u64) -> Parameters {
        let mut rng = StdRng::seed_from_u64(seed);
        let layers = sizes.weight_shapes(input).map(|(units, inputs)| {
            let limit = (6.0 / (units + inputs) as f32).sqrt();
            Layer {
                weights: Array::random_using((units, inputs), Uniform::new(-limit, limit), &mut rng),
                biases: Array2::zeros((units, 1)),
            }
        });
        Parameters { layers }
    }

    // Builds parameters from explicit layers, checking that each layer consumes
    // exactly what the previous one produces.
    pub fn from_layers(layers: [Layer; LAYER_COUNT]) -> Result<Parameters> {
        for (index, pair) in layers.windows(2).enumerate() {
            let (previous, next) = (&pair[0], &pair[1]);
            if next.inputs() != previous.units() {
                return Err(Error::ShapeMismatch {
                    name: weight_name(index + 1),
                    expected: vec![next.units(), previous.units()],
                    got: next.weights.shape().to_vec(),
                });
            }
        }
        Ok(Parameters { layers })
    }

    pub fn layers(&self) -> &[Layer; LAYER_COUNT] {
        &self.layers
    }

    pub(crate) fn layers_mut(&mut self) -> &mut [Layer; LAYER_COUNT] {
        &mut self.layers
    }

    pub fn input_size(&self) -> usize {
        self.layers[0].inputs()
    }

    pub fn output_size(&self) -> usize {
        self.layers[LAYER_COUNT - 1].units()
    }

    pub fn layer_sizes(&self) -> LayerSizes {
        let [l1, l2, l3, l4] = self.layers.each_ref().map(Layer::units);
        LayerSizes { l1, l2, l3, l4 }
    }

    pub fn to_document(&self) -> ParameterDocument {
        let [w1, w2, w3, w4] = self.layers.each_ref().map(|layer| to_rows(&layer.weights));
        let [b1, b2, b3, b4] = self.layers.each_ref().map(|layer| to_rows(&layer.biases));
        ParameterDocument {
            w1,
            b1,
            w2,
            b2,
            w3,
            b3,
            w4,
            b4,
        }
    }

    pub fn from_document(document: ParameterDocument) -> Result<Parameters> {
        let ParameterDocument {
            w1,
            b1,
            w2,
            b2,
            w3,
            b3,
            w4,
            b4,
        } = document;

        let mut layers = Vec::with_capacity(LAYER_COUNT);
        for (index, (weights, biases)) in [(w1, b1), (w2, b2), (w3, b3), (w4, b4)]
            .into_iter()
            .enumerate()
        {
            let weights = from_rows(&weight_name(index), weights)?;
            let biases = from_rows(&bias_name(index), biases)?;
            layers.push(rename_bias_error(Layer::new(weights, biases), index)?);
        }

        let layers: [Layer; LAYER_COUNT] = layers
            .try_into()
            .map_err(|_| Error::InvalidConfig("expected exactly four layers".to_string()))?;
        Parameters::from_layers(layers)
    }
}

// Layer::new only knows it is looking at "a bias"; give the error the document name instead.
fn rename_bias_error(layer: Result<Layer>, index: usize) -> Result<Layer> {
    layer.map_err(|err| match err {
        Error::ShapeMismatch { expected, got, .. } => Error::ShapeMismatch {
            name: bias_name(index),
            expected,
            got,
        },
        other => other,
    })
}

fn to_rows(matrix: &Array2<f32>) -> Vec<Vec<f32>> {
    matrix.rows().into_iter().map(|row| row.to_vec()).collect()
}

fn from_rows(name: &str, rows: Vec<Vec<f32>>) -> Result<Array2<f32>> {
    let malformed = |reason: String| Error::MalformedTensor {
        name: name.to_string(),
        reason,
    };

    let width = rows
        .first()
        .map(Vec::len)
        .ok_or_else(|| malformed("tensor has no rows".to_string()))?;
    if width == 0 {
        return Err(malformed("tensor has no columns".to_string()));
    }
    if let Some(row) = rows.iter().position(|row| row.len() != width) {
        return Err(malformed(format!(
            "row {row} has {} values, expected {width}",
            rows[row].len()
        )));
    }

    let height = rows.len();
    let values: Vec<f32> = rows.into_iter().flatten().collect();
    if values.iter().any(|value| !value.is_finite()) {
        return Err(malformed("values must be finite".to_string()));
    }
    Ok(Array2::from_shape_vec((height, width), values)?)
}

// The persisted form of `Parameters`: every tensor as a list of rows under
// its conventional name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterDocument {
    #[serde(rename = "W1")]
    pub w1: Vec<Vec<f32>>,
    pub b1: Vec<Vec<f32>>,
    #[serde(rename = "W2")]
    pub w2: Vec<Vec<f32>>,
    pub b2: Vec<Vec<f32>>,
    #[serde(rename = "W3")]
    pub w3: Vec<Vec<f32>>,
    pub b3: Vec<Vec<f32>>,
    #[serde(rename = "W4")]
    pub w4: Vec<Vec<f32>>,
    pub b4: Vec<Vec<f32>>,
}

// Sole owner of the parameters during a training run.
#[derive(Debug, Clone)]
pub struct ParameterStore {
    parameters: Parameters,
}

impl ParameterStore {
    pub fn new(parameters: Parameters) -> ParameterStore {
        ParameterStore { parameters }
    }

    pub fn initialize(input: usize, sizes: &LayerSizes, seed: u64) -> ParameterStore {
        ParameterStore::new(Parameters::xavier(input, sizes, seed))
    }

    pub fn read(&self) -> &Parameters {
        &self.parameters
    }

    pub fn apply_update(&mut self, gradients: &Gradients, optimizer: &mut Adam) {
        optimizer.step(&mut self.parameters, gradients);
    }

    pub fn into_parameters(self) -> Parameters {
        self.parameters
    }

    pub fn serialize(&self) -> ParameterDocument {
        self.parameters.to_document()
    }

    pub fn deserialize(document: ParameterDocument) -> Result<Parameters> {
        Parameters::from_document(document)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, serde_json::to_string(&self.serialize())?)?;
        tracing::info!(path = %path.display(), "saved parameters");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Parameters> {
        let document: ParameterDocument = serde_json::from_str(&fs::read_to_string(path)?)?;
        ParameterStore::deserialize(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sizes() -> LayerSizes {
        LayerSizes {
            l1: 5,
            l2: 4,
            l3: 3,
            l4: 2,
        }
    }

    #[test]
    fn xavier_shapes_and_zero_biases() {
        let parameters = Parameters::xavier(6, &sizes(), DEFAULT_INIT_SEED);
        let shapes: Vec<_> = parameters
            .layers()
            .iter()
            .map(|layer| (layer.weights().dim(), layer.biases().dim()))
            .collect();
        assert_eq!(
            shapes,
            vec![((5, 6), (5, 1)), ((4, 5), (4, 1)), ((3, 4), (3, 1)), ((2, 3), (2, 1))]
        );
        assert!(parameters.layers().iter().all(|layer| layer.biases().iter().all(|&b| b == 0.0)));
    }

    #[test]
    fn xavier_respects_limit_and_seed() {
        let a = Parameters::xavier(6, &sizes(), 7);
        let b = Parameters::xavier(6, &sizes(), 7);
        let c = Parameters::xavier(6, &sizes(), 8);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let limit = (6.0f32 / 11.0).sqrt();
        assert!(a.layers()[0].weights().iter().all(|w| w.abs() <= limit));
    }

    #[test]
    fn from_layers_rejects_broken_chain() {
        let layer = |units: usize, inputs: usize| {
            Layer::new(Array2::zeros((units, inputs)), Array2::zeros((units, 1))).unwrap()
        };
        let err = Parameters::from_layers([layer(3, 2), layer(2, 4), layer(2, 2), layer(1, 2)])
            .unwrap_err();
        match err {
            Error::ShapeMismatch { name, .. } => assert_eq!(name, "W2"),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn document_uses_conventional_names() {
        let parameters = Parameters::xavier(3, &sizes(), 1);
        let value = serde_json::to_value(parameters.to_document()).unwrap();
        let mut keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, ["W1", "W2", "W3", "W4", "b1", "b2", "b3", "b4"]);
        assert_eq!(value["b2"], serde_json::json!([[0.0], [0.0], [0.0], [0.0]]));
    }

    #[test]
    fn document_roundtrip_is_exact() {
        let parameters = Parameters::xavier(3, &sizes(), 1);
        let json = serde_json::to_string(&parameters.to_document()).unwrap();
        let restored =
            Parameters::from_document(serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(restored, parameters);
    }

    #[test]
    fn missing_entry_names_the_tensor() {
        let parameters = Parameters::xavier(3, &sizes(), 1);
        let mut value = serde_json::to_value(parameters.to_document()).unwrap();
        value.as_object_mut().unwrap().remove("W3");

        let err = serde_json::from_value::<ParameterDocument>(value).unwrap_err();
        assert!(err.to_string().contains("W3"), "{err}");
    }

    #[test]
    fn ragged_tensor_is_rejected() {
        let mut document = Parameters::xavier(3, &sizes(), 1).to_document();
        document.w2[1].pop();
        match Parameters::from_document(document).unwrap_err() {
            Error::MalformedTensor { name, .. } => assert_eq!(name, "W2"),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn bias_shape_mismatch_is_rejected() {
        let mut document = Parameters::xavier(3, &sizes(), 1).to_document();
        document.b4 = vec![vec![0.0]];
        match Parameters::from_document(document).unwrap_err() {
            Error::ShapeMismatch {
                name,
                expected,
                got,
            } => {
                assert_eq!(name, "b4");
                assert_eq!(expected, vec![2, 1]);
                assert_eq!(got, vec![1, 1]);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn store_saves_and_loads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parameters.json");
        let store = ParameterStore::initialize(3, &sizes(), 1);
        store.save(&path).unwrap();

        assert_eq!(&ParameterStore::load(&path).unwrap(), store.read());
    }

    #[test]
    fn layer_rejects_row_bias() {
        assert!(Layer::new(Array2::zeros((2, 3)), array![[0.0, 0.0]]).is_err());
    }
}
