// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Named parameters shared by the training, validation and inference graphs.
//!
//! Every parameter lives in a single `PoseNet/...` scope so that names stay
//! stable across graphs and checkpoints. Graphs never own parameters,
//! they hold a `SharedParameters` handle to the same store.

use log::warn;
use std::cell::RefCell;
use std::collections::btree_map;
use std::rc::Rc;

use crate::error::PoseNetError;
use crate::misc::type_aliases::{Float, Mat, NamedMats};

/// Root scope of every parameter.
pub const SCOPE: &str = "PoseNet";

/// Name of the trainable loss weight.
pub const LEARNED_BETA: &str = "PoseNet/learned_beta";

/// Scale of the L2 weight decay applied to fully connected weights.
pub const WEIGHT_DECAY: Float = 5e-5;

/// Shared handle on a parameter store.
pub type SharedParameters = Rc<RefCell<ParameterStore>>;

/// Full name of a parameter of a given layer, e.g. `PoseNet/fc0/weights`.
pub fn scoped(layer: &str, kind: &str) -> String {
    format!("{}/{}/{}", SCOPE, layer, kind)
}

/// Map from stable names to parameter values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterStore {
    params: NamedMats,
}

impl ParameterStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap the store into a shared handle.
    pub fn shared(self) -> SharedParameters {
        Rc::new(RefCell::new(self))
    }

    /// Insert or replace a parameter, returning the previous value.
    pub fn insert(&mut self, name: &str, value: Mat) -> Option<Mat> {
        self.params.insert(name.to_string(), value)
    }

    /// Whether a parameter exists under that name.
    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    /// Look up a parameter by name.
    pub fn get(&self, name: &str) -> Result<&Mat, PoseNetError> {
        self.params
            .get(name)
            .ok_or_else(|| PoseNetError::MissingParameter(name.to_string()))
    }

    /// Look up a scalar (1x1) parameter.
    pub fn scalar(&self, name: &str) -> Result<Float, PoseNetError> {
        let value = self.get(name)?;
        if value.shape() != (1, 1) {
            return Err(PoseNetError::ShapeMismatch {
                left: value.shape(),
                right: (1, 1),
            });
        }
        Ok(value[(0, 0)])
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// True if there is no parameter.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Iterate over `(name, value)` in name order.
    pub fn iter(&self) -> btree_map::Iter<String, Mat> {
        self.params.iter()
    }

    /// Plain gradient descent step: `p -= learning_rate * grad` for each gradient.
    /// Gradients of unknown parameters are an error, nothing is updated then.
    pub fn apply_gradients(
        &mut self,
        gradients: &NamedMats,
        learning_rate: Float,
    ) -> Result<(), PoseNetError> {
        for (name, grad) in gradients.iter() {
            let value = self.get(name)?;
            if value.shape() != grad.shape() {
                return Err(PoseNetError::ShapeMismatch {
                    left: value.shape(),
                    right: grad.shape(),
                });
            }
        }
        for (name, grad) in gradients.iter() {
            if let Some(value) = self.params.get_mut(name) {
                *value -= grad * learning_rate;
            }
        }
        if let Ok(beta) = self.scalar(LEARNED_BETA) {
            if beta <= 0.0 {
                warn!("learned beta is not positive anymore: {}", beta);
            }
        }
        Ok(())
    }
}

/// L2 weight decay of a weight matrix: `WEIGHT_DECAY * sum(w^2) / 2`.
pub fn l2_regularization(weights: &Mat) -> Float {
    0.5 * WEIGHT_DECAY * weights.norm_squared()
}

/// Gradient of `l2_regularization`.
pub fn l2_regularization_gradient(weights: &Mat) -> Mat {
    weights * WEIGHT_DECAY
}

// TESTS #############################################################
