// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Fully connected and dropout layers, with their backward passes.
//!
//! Layers do not own their parameters, they read them by name
//! in a `ParameterStore`. Batches are stored one example per row.

use rand::distributions::{Distribution, Normal};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::core::params::{scoped, ParameterStore};
use crate::error::PoseNetError;
use crate::misc::type_aliases::{Float, Mat};

/// "MSRA" initialization: truncated normal with variance `1.3 * 2 / fan_in`,
/// samples further than two standard deviations are redrawn.
pub fn variance_scaling(fan_in: usize, fan_out: usize, rng: &mut StdRng) -> Mat {
    let std_dev = (1.3 * 2.0 / fan_in as f64).sqrt();
    let normal = Normal::new(0.0, std_dev);
    Mat::from_fn(fan_in, fan_out, |_, _| loop {
        let sample = normal.sample(rng);
        if sample.abs() <= 2.0 * std_dev {
            return sample as Float;
        }
    })
}

/// Activation applied at the output of a fully connected layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// `max(0, x)`.
    Relu,
    /// No activation.
    Identity,
}

/// Values computed by a fully connected layer, kept for the backward pass.
#[derive(Debug, Clone)]
pub struct FcForward {
    /// `input * weights + biases`.
    pub pre_activation: Mat,
    /// Activated output.
    pub output: Mat,
}

/// Gradients of a fully connected layer.
#[derive(Debug, Clone)]
pub struct FcGradients {
    /// Gradient with respect to the layer input.
    pub input: Mat,
    /// Gradient with respect to the weights.
    pub weights: Mat,
    /// Gradient with respect to the biases.
    pub biases: Mat,
}

/// Fully connected layer `activation(input * W + b)`.
#[derive(Debug, Clone)]
pub struct FullyConnected {
    weights_name: String,
    biases_name: String,
    activation: Activation,
}

impl FullyConnected {
    /// Layer whose parameters are `PoseNet/<name>/weights` and `PoseNet/<name>/biases`.
    pub fn new(name: &str, activation: Activation) -> Self {
        Self {
            weights_name: scoped(name, "weights"),
            biases_name: scoped(name, "biases"),
            activation,
        }
    }

    /// Name of the weights parameter.
    pub fn weights_name(&self) -> &str {
        &self.weights_name
    }

    /// Name of the biases parameter.
    pub fn biases_name(&self) -> &str {
        &self.biases_name
    }

    /// Create the layer parameters: MSRA weights and zero biases.
    pub fn init(&self, store: &mut ParameterStore, fan_in: usize, fan_out: usize, rng: &mut StdRng) {
        store.insert(&self.weights_name, variance_scaling(fan_in, fan_out, rng));
        store.insert(&self.biases_name, Mat::zeros(1, fan_out));
    }

    /// Forward pass on a batch.
    pub fn forward(&self, store: &ParameterStore, input: &Mat) -> Result<FcForward, PoseNetError> {
        let weights = store.get(&self.weights_name)?;
        let biases = store.get(&self.biases_name)?;
        if input.ncols() != weights.nrows() {
            return Err(PoseNetError::ShapeMismatch {
                left: input.shape(),
                right: weights.shape(),
            });
        }
        let product = input * weights;
        let pre_activation = Mat::from_fn(product.nrows(), product.ncols(), |i, j| {
            product[(i, j)] + biases[(0, j)]
        });
        let output = match self.activation {
            Activation::Relu => pre_activation.map(|x| x.max(0.0)),
            Activation::Identity => pre_activation.clone(),
        };
        Ok(FcForward {
            pre_activation,
            output,
        })
    }

    /// Backward pass, given the gradient of the loss with respect to the output.
    pub fn backward(
        &self,
        store: &ParameterStore,
        input: &Mat,
        forward: &FcForward,
        grad_output: &Mat,
    ) -> Result<FcGradients, PoseNetError> {
        if grad_output.shape() != forward.output.shape() {
            return Err(PoseNetError::ShapeMismatch {
                left: grad_output.shape(),
                right: forward.output.shape(),
            });
        }
        let grad_pre = match self.activation {
            Activation::Relu => grad_output.zip_map(&forward.pre_activation, |g, x| {
                if x > 0.0 {
                    g
                } else {
                    0.0
                }
            }),
            Activation::Identity => grad_output.clone(),
        };
        let weights = store.get(&self.weights_name)?;
        let biases = Mat::from_fn(1, grad_pre.ncols(), |_, j| {
            grad_pre.column(j).iter().sum()
        });
        Ok(FcGradients {
            input: &grad_pre * weights.transpose(),
            weights: input.transpose() * &grad_pre,
            biases,
        })
    }
}

/// Inverted dropout: kept activations are scaled by `1 / keep_prob`.
#[derive(Debug, Clone)]
pub struct Dropout {
    keep_prob: Float,
    rng: StdRng,
}

impl Dropout {
    /// Dropout keeping each activation with probability `keep_prob`.
    pub fn new(keep_prob: Float, seed: u64) -> Result<Self, PoseNetError> {
        if !(keep_prob > 0.0 && keep_prob <= 1.0) {
            return Err(PoseNetError::InvalidKeepProb(keep_prob));
        }
        Ok(Self {
            keep_prob,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Probability of keeping an activation.
    pub fn keep_prob(&self) -> Float {
        self.keep_prob
    }

    /// Draw a new mask, with values in `{0, 1 / keep_prob}`.
    pub fn sample_mask(&mut self, rows: usize, cols: usize) -> Mat {
        let keep_prob = self.keep_prob;
        let scale = 1.0 / keep_prob;
        let rng = &mut self.rng;
        Mat::from_fn(rows, cols, |_, _| {
            if rng.gen::<Float>() < keep_prob {
                scale
            } else {
                0.0
            }
        })
    }
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;

    fn store_with(fc: &FullyConnected, weights: Mat, biases: Mat) -> ParameterStore {
        let mut store = ParameterStore::new();
        store.insert(fc.weights_name(), weights);
        store.insert(fc.biases_name(), biases);
        store
    }

    #[test]
    fn forward_relu() {
        let fc = FullyConnected::new("fc0", Activation::Relu);
        let store = store_with(
            &fc,
            Mat::from_row_slice(2, 2, &[1.0, -1.0, 2.0, 0.5]),
            Mat::from_row_slice(1, 2, &[0.5, 0.0]),
        );
        let input = Mat::from_row_slice(1, 2, &[1.0, 1.0]);
        let forward = fc.forward(&store, &input).unwrap();
        assert_eq!(Mat::from_row_slice(1, 2, &[3.5, -0.5]), forward.pre_activation);
        assert_eq!(Mat::from_row_slice(1, 2, &[3.5, 0.0]), forward.output);
    }

    #[test]
    fn backward_relu_masks_and_sums_biases() {
        let fc = FullyConnected::new("fc0", Activation::Relu);
        let store = store_with(
            &fc,
            Mat::from_row_slice(2, 2, &[1.0, -1.0, 2.0, 0.5]),
            Mat::zeros(1, 2),
        );
        let input = Mat::from_row_slice(2, 2, &[1.0, 1.0, 2.0, 0.0]);
        let forward = fc.forward(&store, &input).unwrap();
        let grad_output = Mat::from_element(2, 2, 1.0);
        let grads = fc.backward(&store, &input, &forward, &grad_output).unwrap();
        // Second unit is inactive for both examples (-0.5 and -2).
        assert_eq!(Mat::from_row_slice(1, 2, &[2.0, 0.0]), grads.biases);
        assert_eq!(Mat::from_row_slice(2, 2, &[3.0, 0.0, 1.0, 0.0]), grads.weights);
        assert_eq!(Mat::from_row_slice(2, 2, &[1.0, 2.0, 1.0, 2.0]), grads.input);
    }

    #[test]
    fn forward_checks_width() {
        let fc = FullyConnected::new("fc1", Activation::Identity);
        let store = store_with(&fc, Mat::zeros(3, 7), Mat::zeros(1, 7));
        assert!(fc.forward(&store, &Mat::zeros(2, 4)).is_err());
    }

    #[test]
    fn msra_init_is_truncated() {
        let mut rng = StdRng::seed_from_u64(42);
        let w = variance_scaling(50, 20, &mut rng);
        let bound = 2.0 * (2.6 / 50.0 as Float).sqrt();
        assert_eq!((50, 20), w.shape());
        assert!(w.iter().all(|x| x.abs() <= bound + 1e-6));
    }

    #[test]
    fn dropout_mask_values() {
        let mut dropout = Dropout::new(0.5, 7).unwrap();
        let mask = dropout.sample_mask(10, 10);
        assert!(mask.iter().all(|&m| m == 0.0 || m == 2.0));
        assert!(mask.iter().any(|&m| m == 0.0));
        assert!(mask.iter().any(|&m| m == 2.0));
    }

    #[test]
    fn dropout_rejects_bad_keep_prob() {
        assert!(Dropout::new(0.0, 0).is_err());
        assert!(Dropout::new(1.5, 0).is_err());
        assert!(Dropout::new(1.0, 0).is_ok());
    }
}
