use ndarray::{Array1, ArrayView1, Axis};

use crate::error::{Error, Result};
use crate::network::{argmax, feedforward};
use crate::params::Parameters;

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    // Index of the largest logit.
    pub class: usize,
    // Sigmoid of each logit, scaled to sum to 1. A display heuristic, not a
    // calibrated probability.
    pub scores: Array1<f32>,
    pub logits: Array1<f32>,
}

// Classifies a single input column with dropout disabled.
pub fn predict(input: ArrayView1<'_, f32>, parameters: &Parameters) -> Result<Prediction> {
    if input.len() != parameters.input_size() {
        return Err(Error::ShapeMismatch {
            name: "input".to_string(),
            expected: vec![parameters.input_size(), 1],
            got: vec![input.len(), 1],
        });
    }

    let column = input.to_owned().insert_axis(Axis(1));
    let logits = feedforward(parameters, &column).remove_axis(Axis(1));
    let class = argmax(logits.view());

    let sigmoid = logits.mapv(|z| 1.0 / (1.0 + (-z).exp()));
    let total = sigmoid.sum();
    let scores = if total > 0.0 {
        sigmoid / total
    } else {
        Array1::from_elem(logits.len(), 1.0 / logits.len() as f32)
    };

    Ok(Prediction {
        class,
        scores,
        logits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayerSizes;
    use crate::params::Layer;
    use ndarray::{Array2, array};

    fn parameters() -> Parameters {
        let sizes = LayerSizes {
            l1: 5,
            l2: 4,
            l3: 4,
            l4: 3,
        };
        Parameters::xavier(6, &sizes, 11)
    }

    #[test]
    fn scores_are_normalized_and_class_follows_logits() {
        let input = array![0.3f32, 0.1, 0.9, 0.0, 0.5, 0.7];
        let prediction = predict(input.view(), &parameters()).unwrap();

        assert!((prediction.scores.sum() - 1.0).abs() < 1e-6);
        assert_eq!(prediction.class, argmax(prediction.logits.view()));
        assert_eq!(prediction.logits.len(), 3);
    }

    #[test]
    fn repeated_calls_are_identical() {
        let parameters = parameters();
        let input = array![0.3f32, 0.1, 0.9, 0.0, 0.5, 0.7];
        let first = predict(input.view(), &parameters).unwrap();
        let second = predict(input.view(), &parameters).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn wrong_length_fails_before_forward_pass() {
        let err = predict(array![0.0f32, 0.0, 0.0, 0.0].view(), &parameters()).unwrap_err();
        match err {
            Error::ShapeMismatch { expected, got, .. } => {
                assert_eq!(expected, vec![6, 1]);
                assert_eq!(got, vec![4, 1]);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn bias_only_network_predicts_largest_bias() {
        let layer = |units: usize, inputs: usize, bias: Array2<f32>| {
            Layer::new(Array2::zeros((units, inputs)), bias).unwrap()
        };
        let parameters = Parameters::from_layers([
            layer(2, 2, Array2::zeros((2, 1))),
            layer(2, 2, Array2::zeros((2, 1))),
            layer(2, 2, Array2::zeros((2, 1))),
            layer(3, 2, array![[0.5], [2.0], [-1.0]]),
        ])
        .unwrap();

        let prediction = predict(array![1.0f32, 1.0].view(), &parameters).unwrap();
        assert_eq!(prediction.class, 1);
        assert_eq!(prediction.logits, array![0.5f32, 2.0, -1.0]);
        assert!(prediction.scores[1] > prediction.scores[0]);
    }
}
