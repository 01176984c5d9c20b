// Adam optimizer.
//
// The moment estimates live here rather than in `Parameters`; the training
// session owns one `Adam` and hands it to the parameter store on every step.

use ndarray::{Array2, Zip};

use crate::network::Gradients;
use crate::params::Parameters;

#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    t: i32,
    // First and second moments, one per tensor: weights of every layer first, then biases.
    moments: Vec<(Array2<f32>, Array2<f32>)>,
}

impl Adam {
    pub fn new(learning_rate: f32) -> Adam {
        Adam::with_betas(learning_rate, 0.9, 0.999, 1e-8)
    }

    pub fn with_betas(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Adam {
        Adam {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            t: 0,
            moments: Vec::new(),
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    // Number of updates applied so far.
    pub fn steps(&self) -> i32 {
        self.t
    }

    // Applies one bias-corrected Adam update to every tensor in place.
    pub fn step(&mut self, parameters: &mut Parameters, gradients: &Gradients) {
        let layers = parameters.layers_mut();
        if self.moments.is_empty() {
            self.moments = layers
                .iter()
                .map(|layer| layer.weights.raw_dim())
                .chain(layers.iter().map(|layer| layer.biases.raw_dim()))
                .map(|dim| (Array2::zeros(dim), Array2::zeros(dim)))
                .collect();
        }

        self.t += 1;
        let correction = (1.0 - self.beta2.powi(self.t)).sqrt() / (1.0 - self.beta1.powi(self.t));
        let step_size = self.learning_rate * correction;
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);

        let (weight_moments, bias_moments) = self.moments.split_at_mut(layers.len());
        let tensors = layers
            .iter_mut()
            .zip(weight_moments.iter_mut().zip(&gradients.weights))
            .zip(bias_moments.iter_mut().zip(&gradients.biases));

        for ((layer, (weight_moment, weight_grad)), (bias_moment, bias_grad)) in tensors {
            for (param, (m, v), grad) in [
                (&mut layer.weights, weight_moment, weight_grad),
                (&mut layer.biases, bias_moment, bias_grad),
            ] {
                Zip::from(param)
                    .and(m)
                    .and(v)
                    .and(grad)
                    .for_each(|p, m, v, &g| {
                        *m = beta1 * *m + (1.0 - beta1) * g;
                        *v = beta2 * *v + (1.0 - beta2) * g * g;
                        *p -= step_size * *m / (v.sqrt() + epsilon);
                    });
            }
        }
    }
}
