// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Feature extractors feeding the regression head.
//!
//! A backbone is typically a pretrained classification network
//! truncated at a given layer (the endpoint). The regression head only needs
//! the resulting spatial feature map, and the saliency computation needs
//! to back-propagate a feature map gradient to the input pixels.

use rand::rngs::StdRng;
use std::collections::BTreeMap;

use crate::core::layers::{Activation, FullyConnected};
use crate::core::params::{l2_regularization, l2_regularization_gradient, ParameterStore};
use crate::error::PoseNetError;
use crate::math::tensor::Tensor4;
use crate::misc::type_aliases::{Float, Mat, NamedMats};

/// Intermediate activations, by layer name.
pub type Layers = BTreeMap<String, Tensor4>;

/// Gradients produced by the backward pass of a backbone.
#[derive(Debug, Clone)]
pub struct BackboneGradients {
    /// Gradient with respect to the input images.
    pub input: Tensor4,
    /// Gradients of the backbone parameters, weight decay included.
    pub parameters: NamedMats,
}

/// Image feature extractor truncated at a named endpoint.
pub trait Backbone {
    /// Create the backbone parameters in the store.
    fn init_parameters(&self, store: &mut ParameterStore, rng: &mut StdRng);

    /// Compute the feature map at `endpoint` and the intermediate layers.
    fn forward(
        &self,
        store: &ParameterStore,
        images: &Tensor4,
        endpoint: &str,
    ) -> Result<(Tensor4, Layers), PoseNetError>;

    /// Weight decay of the backbone weights.
    fn regularization_loss(&self, store: &ParameterStore) -> Result<Float, PoseNetError>;

    /// Gradients with respect to the input images and the parameters,
    /// given the gradient with respect to the feature map at `endpoint`.
    fn backward(
        &self,
        store: &ParameterStore,
        images: &Tensor4,
        endpoint: &str,
        grad_features: &Tensor4,
    ) -> Result<BackboneGradients, PoseNetError>;
}

/// Only endpoint of the `PointwiseBackbone`.
pub const POINTWISE_ENDPOINT: &str = "Pointwise_1x1";

/// Minimal backbone: a single 1x1 convolution with ReLU activation.
///
/// Each pixel is projected independently from the image channels
/// to the feature channels. Mostly useful to exercise the whole pipeline.
#[derive(Debug, Clone)]
pub struct PointwiseBackbone {
    in_channels: usize,
    out_channels: usize,
    conv: FullyConnected,
}

impl PointwiseBackbone {
    /// Projection from `in_channels` image channels to `out_channels` features.
    pub fn new(in_channels: usize, out_channels: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            conv: FullyConnected::new(POINTWISE_ENDPOINT, Activation::Relu),
        }
    }

    /// Number of feature channels.
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    fn check_endpoint(endpoint: &str) -> Result<(), PoseNetError> {
        if endpoint == POINTWISE_ENDPOINT {
            Ok(())
        } else {
            Err(PoseNetError::UnknownEndpoint(endpoint.to_string()))
        }
    }

    fn reshape(images: &Tensor4, rows: &Mat) -> Result<Tensor4, PoseNetError> {
        let (b, h, w, _) = images.shape();
        Tensor4::from_pixel_rows(b, h, w, rows).ok_or(PoseNetError::ShapeMismatch {
            left: rows.shape(),
            right: (b * h * w, rows.ncols()),
        })
    }
}

impl Backbone for PointwiseBackbone {
    fn init_parameters(&self, store: &mut ParameterStore, rng: &mut StdRng) {
        self.conv
            .init(store, self.in_channels, self.out_channels, rng);
    }

    fn forward(
        &self,
        store: &ParameterStore,
        images: &Tensor4,
        endpoint: &str,
    ) -> Result<(Tensor4, Layers), PoseNetError> {
        Self::check_endpoint(endpoint)?;
        let forward = self.conv.forward(store, &images.to_pixel_rows())?;
        let features = Self::reshape(images, &forward.output)?;
        let mut layers = Layers::new();
        layers.insert(endpoint.to_string(), features.clone());
        Ok((features, layers))
    }

    fn regularization_loss(&self, store: &ParameterStore) -> Result<Float, PoseNetError> {
        Ok(l2_regularization(store.get(self.conv.weights_name())?))
    }

    fn backward(
        &self,
        store: &ParameterStore,
        images: &Tensor4,
        endpoint: &str,
        grad_features: &Tensor4,
    ) -> Result<BackboneGradients, PoseNetError> {
        Self::check_endpoint(endpoint)?;
        let input = images.to_pixel_rows();
        let forward = self.conv.forward(store, &input)?;
        let grads = self
            .conv
            .backward(store, &input, &forward, &grad_features.to_pixel_rows())?;
        let weights = store.get(self.conv.weights_name())?;
        let mut parameters = NamedMats::new();
        parameters.insert(
            self.conv.weights_name().to_string(),
            grads.weights + l2_regularization_gradient(weights),
        );
        parameters.insert(self.conv.biases_name().to_string(), grads.biases);
        Ok(BackboneGradients {
            input: Self::reshape(images, &grads.input)?,
            parameters,
        })
    }
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use crate::core::params::WEIGHT_DECAY;
    use rand::SeedableRng;

    fn identity_backbone() -> (PointwiseBackbone, ParameterStore) {
        let backbone = PointwiseBackbone::new(2, 2);
        let mut store = ParameterStore::new();
        store.insert("PoseNet/Pointwise_1x1/weights", Mat::identity(2, 2));
        store.insert("PoseNet/Pointwise_1x1/biases", Mat::zeros(1, 2));
        (backbone, store)
    }

    #[test]
    fn init_creates_parameters() {
        let backbone = PointwiseBackbone::new(3, 8);
        let mut store = ParameterStore::new();
        backbone.init_parameters(&mut store, &mut StdRng::seed_from_u64(0));
        assert_eq!((3, 8), store.get("PoseNet/Pointwise_1x1/weights").unwrap().shape());
        assert_eq!(2, store.len());
    }

    #[test]
    fn forward_applies_relu_per_pixel() {
        let (backbone, store) = identity_backbone();
        let images = Tensor4::from_fn(1, 2, 2, 2, |_, y, x, c| {
            if c == 0 {
                (y + x) as Float
            } else {
                -1.0
            }
        });
        let (features, layers) = backbone.forward(&store, &images, POINTWISE_ENDPOINT).unwrap();
        assert_eq!((1, 2, 2, 2), features.shape());
        assert_eq!(2.0, features.get(0, 1, 1, 0));
        assert_eq!(0.0, features.get(0, 1, 1, 1));
        assert!(layers.contains_key(POINTWISE_ENDPOINT));
    }

    #[test]
    fn unknown_endpoint() {
        let (backbone, store) = identity_backbone();
        let images = Tensor4::from_fn(1, 1, 1, 2, |_, _, _, _| 0.0);
        assert!(backbone.forward(&store, &images, "Mixed_7c").is_err());
    }

    #[test]
    fn input_gradient_through_relu() {
        let (backbone, store) = identity_backbone();
        let images = Tensor4::from_fn(1, 1, 1, 2, |_, _, _, c| if c == 0 { 1.0 } else { -1.0 });
        let grad = Tensor4::from_fn(1, 1, 1, 2, |_, _, _, _| 3.0);
        let grads = backbone
            .backward(&store, &images, POINTWISE_ENDPOINT, &grad)
            .unwrap();
        assert_eq!(&[3.0, 0.0], grads.input.data());
    }

    #[test]
    fn parameter_gradients_include_weight_decay() {
        let (backbone, store) = identity_backbone();
        let images = Tensor4::from_fn(1, 1, 2, 2, |_, _, x, c| if c == 0 { (x + 1) as Float } else { -1.0 });
        let grad = Tensor4::from_fn(1, 1, 2, 2, |_, _, _, _| 1.0);
        let grads = backbone
            .backward(&store, &images, POINTWISE_ENDPOINT, &grad)
            .unwrap();
        // Only the first feature is active, fed by inputs 1 and 2 on channel 0.
        let weights = &grads.parameters["PoseNet/Pointwise_1x1/weights"];
        let decay = WEIGHT_DECAY;
        assert_eq!(
            Mat::from_row_slice(2, 2, &[3.0 + decay, 0.0, -2.0, decay]),
            *weights
        );
        assert_eq!(
            Mat::from_row_slice(1, 2, &[2.0, 0.0]),
            grads.parameters["PoseNet/Pointwise_1x1/biases"]
        );
        assert_eq!(
            WEIGHT_DECAY,
            backbone.regularization_loss(&store).unwrap()
        );
    }
}
