// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Pose regression head.
//!
//! Global average pooling of the backbone feature map,
//! a fully connected bottleneck (ReLU, weight decay, optional dropout),
//! then a linear layer producing the raw pose vector:
//! 3 position components followed by 4 quaternion (or 3 axis) components.
//! The orientation slice is L2-normalized in both modes,
//! the axis mode included, which keeps gradients well scaled.

use rand::rngs::StdRng;

use crate::core::backbone::Layers;
use crate::core::config::{OrientationMode, RegressionConfig};
use crate::core::layers::{Activation, Dropout, FcForward, FullyConnected};
use crate::core::params::{l2_regularization, l2_regularization_gradient, ParameterStore};
use crate::error::PoseNetError;
use crate::math::tensor::Tensor4;
use crate::misc::type_aliases::{Float, Mat, NamedMats, Vec3, Vec4};

/// Squared norms below this value are clamped before normalization.
const NORMALIZE_EPSILON: Float = 1e-12;

/// Structured pose prediction (or ground truth) for a batch, one example per row.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseOutput {
    position: Mat,
    orientation: Mat,
}

impl PoseOutput {
    /// Split raw `batch x (3 + k)` values into position and normalized orientation.
    pub fn from_raw(raw: &Mat, mode: OrientationMode) -> Result<Self, PoseNetError> {
        let expected = mode.output_size();
        if raw.ncols() != expected {
            return Err(PoseNetError::LabelWidth {
                expected,
                got: raw.ncols(),
            });
        }
        let position = raw.columns(0, 3).into_owned();
        let orientation = l2_normalize_rows(&raw.columns(3, mode.orientation_size()).into_owned());
        Ok(Self {
            position,
            orientation,
        })
    }

    /// `batch x 3` positions.
    pub fn position(&self) -> &Mat {
        &self.position
    }

    /// `batch x k` orientations, each row of unit norm.
    pub fn orientation(&self) -> &Mat {
        &self.orientation
    }

    /// Number of examples.
    pub fn batch(&self) -> usize {
        self.position.nrows()
    }

    /// Position of one example.
    pub fn position_at(&self, i: usize) -> Vec3 {
        Vec3::new(
            self.position[(i, 0)],
            self.position[(i, 1)],
            self.position[(i, 2)],
        )
    }

    /// Quaternion `(w, x, y, z)` of one example, if in quaternion mode.
    pub fn quaternion_at(&self, i: usize) -> Option<Vec4> {
        if self.orientation.ncols() == 4 {
            let q = &self.orientation;
            Some(Vec4::new(q[(i, 0)], q[(i, 1)], q[(i, 2)], q[(i, 3)]))
        } else {
            None
        }
    }

    /// Viewing direction of one example, if in axis mode.
    pub fn axis_at(&self, i: usize) -> Option<Vec3> {
        if self.orientation.ncols() == 3 {
            let a = &self.orientation;
            Some(Vec3::new(a[(i, 0)], a[(i, 1)], a[(i, 2)]))
        } else {
            None
        }
    }
}

/// Gradient of a scalar with respect to a `PoseOutput`.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseGradient {
    /// Gradient with respect to the positions.
    pub position: Mat,
    /// Gradient with respect to the normalized orientations.
    pub orientation: Mat,
}

impl PoseGradient {
    /// Gradient of the sum of all output components.
    pub fn ones(batch: usize, mode: OrientationMode) -> Self {
        Self {
            position: Mat::from_element(batch, 3, 1.0),
            orientation: Mat::from_element(batch, mode.orientation_size(), 1.0),
        }
    }
}

/// Normalize each row to unit L2 norm.
pub fn l2_normalize_rows(mat: &Mat) -> Mat {
    let mut normalized = mat.clone();
    for i in 0..mat.nrows() {
        let norm = mat.row(i).norm_squared().max(NORMALIZE_EPSILON).sqrt();
        for j in 0..mat.ncols() {
            normalized[(i, j)] /= norm;
        }
    }
    normalized
}

/// Backward pass of `l2_normalize_rows`.
/// `dx = (dy - y (y . dy)) / |x|` for each row.
pub fn l2_normalize_rows_backward(input: &Mat, grad_output: &Mat) -> Mat {
    let mut grad_input = Mat::zeros(input.nrows(), input.ncols());
    for i in 0..input.nrows() {
        let squared = input.row(i).norm_squared();
        let norm = squared.max(NORMALIZE_EPSILON).sqrt();
        let projection = if squared > NORMALIZE_EPSILON {
            input.row(i).dot(&grad_output.row(i)) / norm
        } else {
            0.0
        };
        for j in 0..input.ncols() {
            let y = input[(i, j)] / norm;
            grad_input[(i, j)] = (grad_output[(i, j)] - y * projection) / norm;
        }
    }
    grad_input
}

/// Everything computed by one forward pass of the head.
#[derive(Debug, Clone)]
pub struct Stream {
    pose: PoseOutput,
    layers: Layers,
    trainable: bool,
    tape: Tape,
}

/// Intermediate values needed by the backward pass.
#[derive(Debug, Clone)]
struct Tape {
    spatial: (usize, usize),
    pooled: Mat,
    fc0: FcForward,
    dropout_mask: Option<Mat>,
    dropped: Mat,
    fc1: FcForward,
}

impl Stream {
    /// Structured prediction.
    pub fn pose(&self) -> &PoseOutput {
        &self.pose
    }

    /// Backbone layers plus `pooled`, `fc0` and `last_output`.
    pub fn layers(&self) -> &Layers {
        &self.layers
    }

    /// Whether the backward pass produces parameter gradients.
    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    /// Add the backbone layers.
    pub fn extend_layers(&mut self, layers: Layers) {
        self.layers.extend(layers);
    }

    /// Split into prediction and layers.
    pub fn into_parts(self) -> (PoseOutput, Layers) {
        (self.pose, self.layers)
    }
}

/// Gradients produced by the backward pass of the head.
#[derive(Debug, Clone)]
pub struct StreamGradients {
    /// Gradient with respect to the backbone feature map.
    pub features: Tensor4,
    /// Gradients of the head parameters, weight decay included.
    /// `None` for frozen (non trainable) streams.
    pub parameters: Option<NamedMats>,
}

/// Regression head reading its parameters from a shared store.
#[derive(Debug, Clone)]
pub struct RegressionHead {
    config: RegressionConfig,
    fc0: FullyConnected,
    fc1: FullyConnected,
}

impl RegressionHead {
    /// Head for a given configuration.
    pub fn new(config: RegressionConfig) -> Self {
        Self {
            config,
            fc0: FullyConnected::new("fc0", Activation::Relu),
            fc1: FullyConnected::new("fc1", Activation::Identity),
        }
    }

    /// Configuration of the head.
    pub fn config(&self) -> &RegressionConfig {
        &self.config
    }

    /// Create `fc0` and `fc1` parameters.
    pub fn init_parameters(&self, store: &mut ParameterStore, rng: &mut StdRng) {
        let width = self.config.hidden_width();
        let n_last = self.config.orientation_mode().output_size();
        self.fc0.init(store, width, width, rng);
        self.fc1.init(store, width, n_last, rng);
    }

    /// Weight decay of the head weights.
    pub fn regularization_loss(&self, store: &ParameterStore) -> Result<Float, PoseNetError> {
        Ok(l2_regularization(store.get(self.fc0.weights_name())?)
            + l2_regularization(store.get(self.fc1.weights_name())?))
    }

    /// Forward pass on a backbone feature map.
    ///
    /// Dropout is applied after `fc0` only if a `Dropout` is given.
    /// A non trainable stream still back-propagates to its input,
    /// it just never reports parameter gradients.
    pub fn build(
        &self,
        store: &ParameterStore,
        feature_map: &Tensor4,
        dropout: Option<&mut Dropout>,
        trainable: bool,
    ) -> Result<Stream, PoseNetError> {
        let (_, height, width, channels) = feature_map.shape();
        let hidden_width = self.config.hidden_width();
        if channels != hidden_width {
            return Err(PoseNetError::FeatureWidth {
                expected: hidden_width,
                got: channels,
            });
        }
        let pooled = feature_map.global_average_pool();
        let fc0 = self.fc0.forward(store, &pooled)?;
        let (dropout_mask, dropped) = match dropout {
            Some(dropout) => {
                let mask = dropout.sample_mask(fc0.output.nrows(), fc0.output.ncols());
                let dropped = fc0.output.component_mul(&mask);
                (Some(mask), dropped)
            }
            None => (None, fc0.output.clone()),
        };
        let fc1 = self.fc1.forward(store, &dropped)?;
        let pose = PoseOutput::from_raw(&fc1.output, self.config.orientation_mode())?;

        let mut layers = Layers::new();
        layers.insert("pooled".to_string(), Tensor4::from_flat(&pooled));
        layers.insert("fc0".to_string(), Tensor4::from_flat(&dropped));
        layers.insert("last_output".to_string(), Tensor4::from_flat(&fc1.output));

        Ok(Stream {
            pose,
            layers,
            trainable,
            tape: Tape {
                spatial: (height, width),
                pooled,
                fc0,
                dropout_mask,
                dropped,
                fc1,
            },
        })
    }

    /// Backward pass from a gradient on the structured output.
    pub fn backward(
        &self,
        store: &ParameterStore,
        stream: &Stream,
        grad: &PoseGradient,
    ) -> Result<StreamGradients, PoseNetError> {
        let tape = &stream.tape;
        let raw = &tape.fc1.output;
        let k = self.config.orientation_mode().orientation_size();
        if grad.position.shape() != (raw.nrows(), 3) || grad.orientation.shape() != (raw.nrows(), k)
        {
            return Err(PoseNetError::ShapeMismatch {
                left: grad.orientation.shape(),
                right: (raw.nrows(), k),
            });
        }

        let mut grad_raw = Mat::zeros(raw.nrows(), raw.ncols());
        grad_raw.columns_mut(0, 3).copy_from(&grad.position);
        let raw_orientation = raw.columns(3, k).into_owned();
        grad_raw
            .columns_mut(3, k)
            .copy_from(&l2_normalize_rows_backward(&raw_orientation, &grad.orientation));

        let fc1_grads = self.fc1.backward(store, &tape.dropped, &tape.fc1, &grad_raw)?;
        let grad_fc0 = match &tape.dropout_mask {
            Some(mask) => fc1_grads.input.component_mul(mask),
            None => fc1_grads.input.clone(),
        };
        let fc0_grads = self.fc0.backward(store, &tape.pooled, &tape.fc0, &grad_fc0)?;
        let (height, width) = tape.spatial;
        let features = Tensor4::global_average_pool_backward(&fc0_grads.input, height, width);

        let parameters = if stream.trainable {
            let mut params = NamedMats::new();
            let fc0_weights = store.get(self.fc0.weights_name())?;
            let fc1_weights = store.get(self.fc1.weights_name())?;
            params.insert(
                self.fc0.weights_name().to_string(),
                fc0_grads.weights + l2_regularization_gradient(fc0_weights),
            );
            params.insert(self.fc0.biases_name().to_string(), fc0_grads.biases);
            params.insert(
                self.fc1.weights_name().to_string(),
                fc1_grads.weights + l2_regularization_gradient(fc1_weights),
            );
            params.insert(self.fc1.biases_name().to_string(), fc1_grads.biases);
            Some(params)
        } else {
            None
        };

        Ok(StreamGradients {
            features,
            parameters,
        })
    }
}

// TESTS #############################################################
