// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Training, validation and inference graphs.
//!
//! The three graphs are built independently from the same `PoseNet` handle,
//! and thus read the very same parameters:
//!
//! | graph        | dropout | parameter gradients | loss |
//! |--------------|---------|---------------------|------|
//! | `Trainable`  | yes     | yes                 | yes  |
//! | `Validation` | no      | no                  | yes  |
//! | `Testable`   | no      | no                  | no   |

use log::{debug, info};
use rand::{rngs::StdRng, SeedableRng};
use std::rc::Rc;

use crate::core::backbone::{Backbone, Layers};
use crate::core::config::{RegressionConfig, TrainOptions};
use crate::core::head::{PoseGradient, PoseOutput, RegressionHead, Stream};
use crate::core::layers::Dropout;
use crate::core::loss::{Losses, PoseLoss};
use crate::core::params::{ParameterStore, SharedParameters, LEARNED_BETA};
use crate::core::saliency;
use crate::error::PoseNetError;
use crate::math::tensor::Tensor4;
use crate::misc::type_aliases::{Float, Mat, NamedMats};

/// Backbone and regression head sharing one parameter store.
/// Cloning gives another handle on the same parameters.
#[derive(Clone)]
pub struct PoseNet {
    head: RegressionHead,
    backbone: Rc<dyn Backbone>,
    params: SharedParameters,
}

impl PoseNet {
    /// Create the model and initialize every parameter (backbone and head).
    pub fn new(config: RegressionConfig, backbone: Rc<dyn Backbone>, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let head = RegressionHead::new(config);
        let mut store = ParameterStore::new();
        backbone.init_parameters(&mut store, &mut rng);
        head.init_parameters(&mut store, &mut rng);
        info!(
            "PoseNet created with {} parameters, endpoint {}",
            store.len(),
            head.config().feature_endpoint()
        );
        Self {
            head,
            backbone,
            params: store.shared(),
        }
    }

    /// Model using already existing parameters, typically loaded from a checkpoint.
    pub fn from_parameters(
        config: RegressionConfig,
        backbone: Rc<dyn Backbone>,
        params: ParameterStore,
    ) -> Self {
        Self {
            head: RegressionHead::new(config),
            backbone,
            params: params.shared(),
        }
    }

    /// Model configuration.
    pub fn config(&self) -> &RegressionConfig {
        self.head.config()
    }

    /// Shared parameter store.
    pub fn parameters(&self) -> &SharedParameters {
        &self.params
    }

    /// Handle on the learned loss weight, if the store contains one.
    pub fn learned_weight(&self) -> Option<LearnedWeight> {
        if self.params.borrow().contains(LEARNED_BETA) {
            Some(LearnedWeight {
                params: Rc::clone(&self.params),
            })
        } else {
            None
        }
    }

    /// Weight decay of the backbone and head weights.
    pub fn regularization_loss(&self) -> Result<Float, PoseNetError> {
        let store = self.params.borrow();
        Ok(self.backbone.regularization_loss(&store)? + self.head.regularization_loss(&store)?)
    }

    fn stream(
        &self,
        images: &Tensor4,
        dropout: Option<&mut Dropout>,
        trainable: bool,
    ) -> Result<Stream, PoseNetError> {
        let store = self.params.borrow();
        let endpoint = self.config().feature_endpoint();
        let (features, backbone_layers) = self.backbone.forward(&store, images, endpoint)?;
        let mut stream = self.head.build(&store, &features, dropout, trainable)?;
        stream.extend_layers(backbone_layers);
        Ok(stream)
    }

    fn ground_truth(&self, labels: &Mat) -> Result<PoseOutput, PoseNetError> {
        PoseOutput::from_raw(labels, self.config().orientation_mode())
    }
}

/// Handle on the trainable `PoseNet/learned_beta` parameter.
#[derive(Clone)]
pub struct LearnedWeight {
    params: SharedParameters,
}

impl LearnedWeight {
    /// Current value of the weight.
    pub fn value(&self) -> Result<Float, PoseNetError> {
        self.params
            .borrow()
            .scalar(LEARNED_BETA)
            .map_err(|_| PoseNetError::MissingLearnedWeight(LEARNED_BETA.to_string()))
    }

    /// Name of the parameter.
    pub fn name(&self) -> &'static str {
        LEARNED_BETA
    }
}

/// Weight balancing position and orientation losses.
#[derive(Clone)]
pub enum LossWeight {
    /// Constant for the lifetime of the graph.
    Fixed(Float),
    /// Parameter updated by the optimizer.
    Learned(LearnedWeight),
}

impl LossWeight {
    /// Current value.
    pub fn value(&self) -> Result<Float, PoseNetError> {
        match self {
            LossWeight::Fixed(beta) => Ok(*beta),
            LossWeight::Learned(weight) => weight.value(),
        }
    }

    /// Whether the weight is a trainable parameter.
    pub fn is_learned(&self) -> bool {
        match self {
            LossWeight::Fixed(_) => false,
            LossWeight::Learned(_) => true,
        }
    }
}

/// Scalar summary of a training or validation step.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    /// Tag, e.g. `train/Total Loss`.
    pub tag: String,
    /// Value.
    pub value: Float,
}

fn loss_summaries(namespace: &str, losses: &Losses) -> Vec<Summary> {
    vec![
        Summary {
            tag: format!("{}/Positional Loss", namespace),
            value: losses.position,
        },
        Summary {
            tag: format!("{}/Orientation Loss", namespace),
            value: losses.orientation,
        },
        Summary {
            tag: format!("{}/Total Loss", namespace),
            value: losses.total,
        },
    ]
}

/// Result of one training step.
#[derive(Debug, Clone)]
pub struct TrainStep {
    /// Predicted poses.
    pub outputs: PoseOutput,
    /// Loss values.
    pub losses: Losses,
    /// Weight decay of the backbone and head, not included in `losses.total`.
    pub regularization: Float,
    /// `train/...` summaries.
    pub summaries: Vec<Summary>,
    /// Gradients of `losses.total + regularization` for the backbone and head
    /// parameters and the learned weight, by parameter name.
    pub gradients: NamedMats,
    /// Gradient with respect to the backbone feature map.
    pub feature_gradient: Tensor4,
}

/// Training graph: dropout, trainable parameters, and loss.
pub struct Trainable {
    model: PoseNet,
    loss: PoseLoss,
    weight: LossWeight,
    dropout: Option<Dropout>,
}

impl Trainable {
    /// Build the training graph.
    /// With `learn_beta`, the `PoseNet/learned_beta` parameter is created
    /// with value `beta`, unless it already exists in the store.
    pub fn new(model: &PoseNet, options: &TrainOptions) -> Result<Self, PoseNetError> {
        let dropout = match options.keep_prob {
            Some(keep_prob) => Some(Dropout::new(keep_prob, options.seed)?),
            None => None,
        };
        let weight = if options.learn_beta {
            if !(options.beta > 0.0) {
                return Err(PoseNetError::InvalidLossWeight(options.beta));
            }
            let mut store = model.params.borrow_mut();
            if !store.contains(LEARNED_BETA) {
                store.insert(LEARNED_BETA, Mat::from_element(1, 1, options.beta));
            }
            LossWeight::Learned(LearnedWeight {
                params: Rc::clone(&model.params),
            })
        } else {
            LossWeight::Fixed(options.beta)
        };
        info!(
            "trainable graph: keep_prob {:?}, beta {}, learned {}",
            options.keep_prob,
            options.beta,
            weight.is_learned()
        );
        Ok(Self {
            model: model.clone(),
            loss: PoseLoss::from_config(model.config()),
            weight,
            dropout,
        })
    }

    /// Loss weight of this graph.
    pub fn weight(&self) -> &LossWeight {
        &self.weight
    }

    /// Forward and backward pass on a batch.
    /// `labels` is `batch x 7` (quaternion) or `batch x 6` (axis).
    pub fn step(&mut self, images: &Tensor4, labels: &Mat) -> Result<TrainStep, PoseNetError> {
        let ground_truth = self.model.ground_truth(labels)?;
        let stream = self.model.stream(images, self.dropout.as_mut(), true)?;
        let beta = self.weight.value()?;
        let learned = self.weight.is_learned();
        let (losses, loss_grads) =
            self.loss
                .evaluate_with_gradients(stream.pose(), &ground_truth, beta, learned)?;

        let store = self.model.params.borrow();
        let head_grads = self.model.head.backward(&store, &stream, &loss_grads.pose)?;
        let backbone_grads = self.model.backbone.backward(
            &store,
            images,
            self.model.config().feature_endpoint(),
            &head_grads.features,
        )?;
        let regularization = self.model.backbone.regularization_loss(&store)?
            + self.model.head.regularization_loss(&store)?;
        let mut gradients = head_grads.parameters.unwrap_or_default();
        gradients.extend(backbone_grads.parameters);

        let mut summaries = Vec::with_capacity(4);
        if learned {
            gradients.insert(
                LEARNED_BETA.to_string(),
                Mat::from_element(1, 1, loss_grads.weight),
            );
            summaries.push(Summary {
                tag: "train/Beta".to_string(),
                value: beta,
            });
        }
        summaries.extend(loss_summaries("train", &losses));
        debug!(
            "train: position {} orientation {} total {} (beta {})",
            losses.position, losses.orientation, losses.total, beta
        );

        Ok(TrainStep {
            outputs: stream.into_parts().0,
            losses,
            regularization,
            summaries,
            gradients,
            feature_gradient: head_grads.features,
        })
    }
}

/// Result of a validation pass.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Predicted poses.
    pub outputs: PoseOutput,
    /// Loss values.
    pub losses: Losses,
    /// `validation/...` summaries.
    pub summaries: Vec<Summary>,
}

/// Validation graph: frozen parameters, no dropout, loss.
pub struct Validation {
    model: PoseNet,
    loss: PoseLoss,
    weight: LossWeight,
}

impl Validation {
    /// Build the validation graph.
    ///
    /// With `has_learned_weight`, the loss is weighted by the learned
    /// parameter, which must exist in the model store.
    /// Otherwise `fallback_beta` is required.
    pub fn new(
        model: &PoseNet,
        has_learned_weight: bool,
        fallback_beta: Option<Float>,
    ) -> Result<Self, PoseNetError> {
        let weight = if has_learned_weight {
            let handle = model
                .learned_weight()
                .ok_or_else(|| PoseNetError::MissingLearnedWeight(LEARNED_BETA.to_string()))?;
            info!("validation graph using learned beta {}", handle.value()?);
            LossWeight::Learned(handle)
        } else {
            LossWeight::Fixed(fallback_beta.ok_or(PoseNetError::MissingLossWeight)?)
        };
        Ok(Self {
            model: model.clone(),
            loss: PoseLoss::from_config(model.config()),
            weight,
        })
    }

    /// Loss weight of this graph.
    pub fn weight(&self) -> &LossWeight {
        &self.weight
    }

    /// Forward pass and losses on a batch.
    pub fn evaluate(&self, images: &Tensor4, labels: &Mat) -> Result<Evaluation, PoseNetError> {
        let ground_truth = self.model.ground_truth(labels)?;
        let stream = self.model.stream(images, None, false)?;
        let beta = self.weight.value()?;
        let losses =
            self.loss
                .evaluate(stream.pose(), &ground_truth, beta, self.weight.is_learned())?;
        debug!(
            "validation: position {} orientation {} total {}",
            losses.position, losses.orientation, losses.total
        );
        Ok(Evaluation {
            outputs: stream.into_parts().0,
            losses,
            summaries: loss_summaries("validation", &losses),
        })
    }
}

/// Inference graph: frozen parameters, no dropout, no loss.
pub struct Testable {
    model: PoseNet,
}

impl Testable {
    /// Build the inference graph.
    pub fn new(model: &PoseNet) -> Self {
        Self {
            model: model.clone(),
        }
    }

    /// Model configuration.
    pub fn config(&self) -> &RegressionConfig {
        self.model.config()
    }

    /// Predicted poses of a batch of images.
    pub fn predict(&self, images: &Tensor4) -> Result<PoseOutput, PoseNetError> {
        Ok(self.model.stream(images, None, false)?.into_parts().0)
    }

    /// Predicted poses and every intermediate layer.
    pub fn predict_with_layers(
        &self,
        images: &Tensor4,
    ) -> Result<(PoseOutput, Layers), PoseNetError> {
        Ok(self.model.stream(images, None, false)?.into_parts())
    }

    /// Gradient with respect to the input images of a scalar function of the
    /// outputs, given its gradient `grad` with respect to the outputs.
    pub fn input_gradient(
        &self,
        images: &Tensor4,
        grad: &PoseGradient,
    ) -> Result<Tensor4, PoseNetError> {
        let stream = self.model.stream(images, None, false)?;
        let store = self.model.params.borrow();
        let head_grads = self.model.head.backward(&store, &stream, grad)?;
        let backbone_grads = self.model.backbone.backward(
            &store,
            images,
            self.config().feature_endpoint(),
            &head_grads.features,
        )?;
        Ok(backbone_grads.input)
    }

    /// Raw saliency of each image: per-pixel maximum over channels of the
    /// absolute gradient of the sum of all pose outputs.
    pub fn saliency(&self, images: &Tensor4) -> Result<Vec<Mat>, PoseNetError> {
        let grad = PoseGradient::ones(images.batch(), self.config().orientation_mode());
        Ok(saliency::pixel_saliency(&self.input_gradient(images, &grad)?))
    }
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use crate::core::backbone::{PointwiseBackbone, POINTWISE_ENDPOINT};
    use crate::core::config::{LossVariant, OrientationMode};
    use crate::core::params::l2_regularization;

    const WIDTH: usize = 16;

    fn model(mode: OrientationMode) -> PoseNet {
        let config =
            RegressionConfig::new(POINTWISE_ENDPOINT, WIDTH, LossVariant::Standard, mode).unwrap();
        PoseNet::new(config, Rc::new(PointwiseBackbone::new(3, WIDTH)), 11)
    }

    fn images(batch: usize) -> Tensor4 {
        Tensor4::from_fn(batch, 4, 5, 3, |b, y, x, c| {
            ((b * 7 + y * 3 + x * 2 + c) % 11) as Float / 11.0 - 0.3
        })
    }

    fn labels(batch: usize) -> Mat {
        Mat::from_fn(batch, 7, |i, j| match j {
            0..=2 => (i + j) as Float,
            3 => 1.0,
            _ => 0.0,
        })
    }

    fn no_dropout(learn_beta: bool) -> TrainOptions {
        TrainOptions {
            keep_prob: None,
            beta: 2.0,
            learn_beta,
            seed: 5,
        }
    }

    #[test]
    fn validation_and_testable_share_parameters() {
        let net = model(OrientationMode::Quaternion);
        let validation = Validation::new(&net, false, Some(500.0)).unwrap();
        let testable = Testable::new(&net);
        let evaluation = validation.evaluate(&images(2), &labels(2)).unwrap();
        assert_eq!(evaluation.outputs, testable.predict(&images(2)).unwrap());
    }

    #[test]
    fn trainable_without_dropout_matches_testable() {
        let net = model(OrientationMode::Quaternion);
        let mut trainable = Trainable::new(&net, &no_dropout(false)).unwrap();
        let step = trainable.step(&images(2), &labels(2)).unwrap();
        assert_eq!(step.outputs, Testable::new(&net).predict(&images(2)).unwrap());
    }

    #[test]
    fn validation_requires_a_weight() {
        let net = model(OrientationMode::Quaternion);
        match Validation::new(&net, false, None) {
            Err(PoseNetError::MissingLossWeight) => (),
            _ => panic!("validation without weight must fail"),
        }
    }

    #[test]
    fn validation_requires_existing_learned_weight() {
        let net = model(OrientationMode::Quaternion);
        match Validation::new(&net, true, Some(1.0)) {
            Err(PoseNetError::MissingLearnedWeight(name)) => assert_eq!(LEARNED_BETA, name),
            _ => panic!("learned weight was never created"),
        }
        let other = model(OrientationMode::Quaternion);
        Trainable::new(&other, &no_dropout(true)).unwrap();
        assert!(Validation::new(&net, true, None).is_err());
        assert!(Validation::new(&other, true, None).is_ok());
    }

    #[test]
    fn summaries_fixed_and_learned() {
        let net = model(OrientationMode::Quaternion);
        let mut fixed = Trainable::new(&net, &no_dropout(false)).unwrap();
        let tags: Vec<String> = fixed
            .step(&images(1), &labels(1))
            .unwrap()
            .summaries
            .into_iter()
            .map(|s| s.tag)
            .collect();
        assert_eq!(
            vec!["train/Positional Loss", "train/Orientation Loss", "train/Total Loss"],
            tags
        );
        let mut learned = Trainable::new(&net, &no_dropout(true)).unwrap();
        let step = learned.step(&images(1), &labels(1)).unwrap();
        assert_eq!("train/Beta", step.summaries[0].tag);
        assert_eq!(2.0, step.summaries[0].value);
        assert_eq!(4, step.summaries.len());

        let validation = Validation::new(&net, true, None).unwrap();
        let evaluation = validation.evaluate(&images(1), &labels(1)).unwrap();
        assert_eq!("validation/Total Loss", evaluation.summaries[2].tag);
        assert!(validation.weight().is_learned());
    }

    #[test]
    fn learned_beta_updates_are_shared() {
        let net = model(OrientationMode::Quaternion);
        let mut trainable = Trainable::new(&net, &no_dropout(true)).unwrap();
        let step = trainable.step(&images(2), &labels(2)).unwrap();
        let beta_grad = step.gradients[LEARNED_BETA][(0, 0)];
        let expected = step.losses.orientation - step.losses.position / 4.0;
        assert!((beta_grad - expected).abs() < 1e-4);

        net.parameters()
            .borrow_mut()
            .apply_gradients(&step.gradients, 0.01)
            .unwrap();
        let validation = Validation::new(&net, true, None).unwrap();
        let beta = validation.weight().value().unwrap();
        assert!((beta - (2.0 - 0.01 * beta_grad)).abs() < 1e-6);
    }

    #[test]
    fn existing_learned_beta_is_reused() {
        let net = model(OrientationMode::Quaternion);
        net.parameters()
            .borrow_mut()
            .insert(LEARNED_BETA, Mat::from_element(1, 1, 7.0));
        let trainable = Trainable::new(&net, &no_dropout(true)).unwrap();
        assert_eq!(7.0, trainable.weight().value().unwrap());
    }

    #[test]
    fn learned_beta_must_be_positive() {
        let net = model(OrientationMode::Quaternion);
        let mut options = no_dropout(true);
        options.beta = 0.0;
        assert!(Trainable::new(&net, &options).is_err());
    }

    #[test]
    fn training_reduces_loss() {
        let net = model(OrientationMode::Quaternion);
        let mut trainable = Trainable::new(&net, &no_dropout(false)).unwrap();
        let validation = Validation::new(&net, false, Some(2.0)).unwrap();
        let before = validation.evaluate(&images(2), &labels(2)).unwrap().losses.total;
        for _ in 0..20 {
            let step = trainable.step(&images(2), &labels(2)).unwrap();
            net.parameters()
                .borrow_mut()
                .apply_gradients(&step.gradients, 1e-3)
                .unwrap();
        }
        let after = validation.evaluate(&images(2), &labels(2)).unwrap().losses.total;
        assert!(after < before);
    }

    #[test]
    fn gradients_have_parameter_shapes() {
        let net = model(OrientationMode::Axis);
        let mut trainable = Trainable::new(&net, &TrainOptions::default()).unwrap();
        let labels = Mat::from_fn(3, 6, |i, j| if j == 5 { -1.0 } else { i as Float });
        let step = trainable.step(&images(3), &labels).unwrap();
        let store = net.parameters().borrow();
        for (name, grad) in step.gradients.iter() {
            assert_eq!(store.get(name).unwrap().shape(), grad.shape());
        }
        assert_eq!((3, 4, 5, WIDTH), step.feature_gradient.shape());
    }

    #[test]
    fn every_parameter_gets_a_gradient() {
        let net = model(OrientationMode::Quaternion);
        let mut trainable = Trainable::new(&net, &no_dropout(true)).unwrap();
        let step = trainable.step(&images(2), &labels(2)).unwrap();
        let store = net.parameters().borrow();
        let names: Vec<&String> = store.iter().map(|(name, _)| name).collect();
        assert_eq!(names, step.gradients.keys().collect::<Vec<_>>());
        assert!(step.gradients.contains_key("PoseNet/Pointwise_1x1/weights"));
        for (name, value) in store.iter() {
            assert_eq!(value.shape(), step.gradients[name].shape());
        }
    }

    #[test]
    fn regularization_covers_backbone() {
        let net = model(OrientationMode::Quaternion);
        let mut trainable = Trainable::new(&net, &no_dropout(false)).unwrap();
        let step = trainable.step(&images(1), &labels(1)).unwrap();
        let store = net.parameters().borrow();
        let expected: Float = ["Pointwise_1x1", "fc0", "fc1"]
            .iter()
            .map(|layer| l2_regularization(store.get(&format!("PoseNet/{}/weights", layer)).unwrap()))
            .sum();
        assert!((expected - step.regularization).abs() < 1e-6);
        assert!((expected - net.regularization_loss().unwrap()).abs() < 1e-6);
    }

    #[test]
    fn wrong_label_width() {
        let net = model(OrientationMode::Axis);
        let validation = Validation::new(&net, false, Some(1.0)).unwrap();
        assert!(validation.evaluate(&images(1), &labels(1)).is_err());
    }

    #[test]
    fn layers_include_backbone_and_head() {
        let net = model(OrientationMode::Quaternion);
        let (_, layers) = Testable::new(&net).predict_with_layers(&images(1)).unwrap();
        for name in &[POINTWISE_ENDPOINT, "pooled", "fc0", "last_output"] {
            assert!(layers.contains_key(*name), "missing layer {}", name);
        }
    }

    #[test]
    fn input_gradient_has_image_shape() {
        let net = model(OrientationMode::Quaternion);
        let testable = Testable::new(&net);
        let grad = testable
            .input_gradient(&images(2), &PoseGradient::ones(2, OrientationMode::Quaternion))
            .unwrap();
        assert_eq!(images(2).shape(), grad.shape());
    }
}
