use ndarray::{Array2, ArrayView1, Axis, Zip};
use ndarray_rand::RandomExt;
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand_distr::Uniform;

use crate::dataset::Dataset;
use crate::params::{LAYER_COUNT, Parameters};

// Whether a forward pass applies dropout to the hidden activations.
pub enum Mode<'a> {
    // Keep each hidden unit with probability `keep_prob`, scaling survivors by
    // `1 / keep_prob` so the expected activation is unchanged.
    Train { keep_prob: f32, rng: &'a mut StdRng },
    // Every unit is kept; used for evaluation and prediction.
    Inference,
}

// Everything the backward pass needs from the forward pass.
pub struct ForwardPass {
    // The matrix fed into each layer: the network input for layer 0, the (dropped-out) hidden
    // activation of the previous layer for the rest.
    inputs: Vec<Array2<f32>>,
    // Z = W.a + b for every layer. The last one holds the logits.
    pre_activations: Vec<Array2<f32>>,
    // Dropout masks of the hidden layers, already scaled by 1 / keep_prob.
    masks: Vec<Option<Array2<f32>>>,
}

impl ForwardPass {
    pub fn logits(&self) -> &Array2<f32> {
        &self.pre_activations[LAYER_COUNT - 1]
    }

    pub fn into_logits(mut self) -> Array2<f32> {
        self.pre_activations.swap_remove(LAYER_COUNT - 1)
    }
}

// Per-tensor gradients of the cost, in layer order.
#[derive(Debug, Clone)]
pub struct Gradients {
    pub weights: Vec<Array2<f32>>,
    pub biases: Vec<Array2<f32>>,
}

// Runs LINEAR -> RELU (-> DROPOUT) for the three hidden layers and a final
// LINEAR layer producing one column of logits per input column.
pub fn forward(parameters: &Parameters, input: &Array2<f32>, mut mode: Mode<'_>) -> ForwardPass {
    let mut inputs = Vec::with_capacity(LAYER_COUNT);
    let mut pre_activations = Vec::with_capacity(LAYER_COUNT);
    let mut masks = Vec::with_capacity(LAYER_COUNT - 1);

    let mut activation = input.clone();
    for (index, layer) in parameters.layers().iter().enumerate() {
        let z = layer.weights().dot(&activation) + layer.biases();
        inputs.push(activation);

        if index == LAYER_COUNT - 1 {
            pre_activations.push(z);
            break;
        }

        activation = z.mapv(relu);
        let mask = match &mut mode {
            Mode::Train { keep_prob, rng } if *keep_prob < 1.0 => {
                let mask = dropout_mask(activation.dim(), *keep_prob, rng);
                activation *= &mask;
                Some(mask)
            }
            _ => None,
        };
        masks.push(mask);
        pre_activations.push(z);
    }

    ForwardPass {
        inputs,
        pre_activations,
        masks,
    }
}

// Logits for every column of `input`, without dropout.
pub fn feedforward(parameters: &Parameters, input: &Array2<f32>) -> Array2<f32> {
    forward(parameters, input, Mode::Inference).into_logits()
}

// Mean softmax cross-entropy of the logits against one-hot labels.
pub fn cost(logits: &Array2<f32>, labels: &Array2<f32>) -> f32 {
    let total: f32 = logits
        .columns()
        .into_iter()
        .zip(labels.columns())
        .map(|(z, y)| {
            // -sum(y * log_softmax(z)) with log_softmax(z) = z - logsumexp(z).
            let log_sum_exp = log_sum_exp(z);
            y.iter()
                .zip(z.iter())
                .map(|(&y, &z)| y * (log_sum_exp - z))
                .sum::<f32>()
        })
        .sum();
    total / logits.ncols() as f32
}

// Gradients of `cost` with respect to every weight and bias, given the
// forward pass that produced the logits.
pub fn backpropagate(
    parameters: &Parameters,
    pass: &ForwardPass,
    labels: &Array2<f32>,
) -> Gradients {
    let examples = labels.ncols() as f32;
    let mut weights = vec![Array2::zeros((0, 0)); LAYER_COUNT];
    let mut biases = vec![Array2::zeros((0, 0)); LAYER_COUNT];

    // For softmax followed by cross-entropy, the derivative of the mean cost with respect to the
    // logits collapses to (softmax(Z) - Y) / m.
    let mut delta = (softmax(pass.logits()) - labels) / examples;

    for index in (0..LAYER_COUNT).rev() {
        // Summing delta over its columns gives the bias gradient, and the dot product with the
        // transposed layer input sums the per-example outer products for the weight gradient.
        weights[index] = delta.dot(&pass.inputs[index].t());
        biases[index] = delta.sum_axis(Axis(1)).insert_axis(Axis(1));

        if index == 0 {
            break;
        }

        // Push delta back through this layer's weights, then through the previous layer's
        // dropout mask and ReLU.
        let mut upstream = parameters.layers()[index].weights().t().dot(&delta);
        if let Some(mask) = &pass.masks[index - 1] {
            upstream *= mask;
        }
        Zip::from(&mut upstream)
            .and(&pass.pre_activations[index - 1])
            .for_each(|d, &z| {
                if z <= 0.0 {
                    *d = 0.0;
                }
            });
        delta = upstream;
    }

    Gradients { weights, biases }
}

// Fraction of examples whose highest logit is the labelled class.
pub fn accuracy(parameters: &Parameters, dataset: &Dataset) -> f32 {
    let logits = feedforward(parameters, dataset.features());
    let correct_answers = logits
        .columns()
        .into_iter()
        .zip(dataset.labels().columns())
        .filter(|(z, y)| argmax(*z) == argmax(*y))
        .count();
    correct_answers as f32 / dataset.len() as f32
}

// Index of the largest value. Ties go to the last maximum; an empty view yields 0.
pub fn argmax(values: ArrayView1<'_, f32>) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(index, _)| index)
        .unwrap_or(0)
}

// Column-wise softmax.
pub fn softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut probabilities = logits.clone();
    for mut column in probabilities.columns_mut() {
        let max = column.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        column.mapv_inplace(|z| (z - max).exp());
        let sum = column.sum();
        column.mapv_inplace(|e| e / sum);
    }
    probabilities
}

fn log_sum_exp(values: ArrayView1<'_, f32>) -> f32 {
    let max = values.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    max + values.iter().map(|&v| (v - max).exp()).sum::<f32>().ln()
}

fn dropout_mask(shape: (usize, usize), keep_prob: f32, rng: &mut StdRng) -> Array2<f32> {
    Array2::random_using(shape, Uniform::new(0.0f32, 1.0), rng)
        .mapv(|u| if u < keep_prob { 1.0 / keep_prob } else { 0.0 })
}

fn relu(z: f32) -> f32 {
    z.max(0.0)
}
