// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Position and orientation losses, and their weighting.
//!
//! Both terms are batch means of per-example L1 distances.
//! With a fixed weight beta: `total = position + beta * orientation`.
//! With a learned weight: `total = position / beta + beta * orientation`,
//! which does not collapse to beta = 0 when minimized over beta.

use itertools::izip;

use crate::core::config::{LossVariant, OrientationMode, RegressionConfig};
use crate::core::head::{PoseGradient, PoseOutput};
use crate::error::PoseNetError;
use crate::misc::type_aliases::{Float, Mat};

/// Scalar losses of a batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Losses {
    /// Mean L1 position error.
    pub position: Float,
    /// Mean L1 orientation error.
    pub orientation: Float,
    /// Weighted combination of both.
    pub total: Float,
}

/// Gradients of the total loss.
#[derive(Debug, Clone, PartialEq)]
pub struct LossGradients {
    /// Gradient with respect to the predicted pose.
    pub pose: PoseGradient,
    /// Gradient with respect to the loss weight.
    /// Only meaningful for a learned weight.
    pub weight: Float,
}

/// Weighted L1 pose loss.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseLoss {
    variant: LossVariant,
    mode: OrientationMode,
}

/// Sign with `sign(0) = 0`.
fn sign(x: Float) -> Float {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn check_shapes(a: &Mat, b: &Mat) -> Result<(), PoseNetError> {
    if a.shape() == b.shape() {
        Ok(())
    } else {
        Err(PoseNetError::ShapeMismatch {
            left: a.shape(),
            right: b.shape(),
        })
    }
}

/// Sum of absolute differences of row `i`, optionally negating `a`.
fn l1_row(a: &Mat, b: &Mat, i: usize, negate: bool) -> Float {
    let s = if negate { -1.0 } else { 1.0 };
    izip!(a.row(i).iter(), b.row(i).iter())
        .map(|(x, y)| (s * x - y).abs())
        .sum()
}

impl PoseLoss {
    /// Loss for a variant and an orientation mode.
    /// The symmetric variant only has an effect on quaternions.
    pub fn new(variant: LossVariant, mode: OrientationMode) -> Self {
        Self { variant, mode }
    }

    /// Loss matching a model configuration.
    pub fn from_config(config: &RegressionConfig) -> Self {
        Self::new(config.loss_variant(), config.orientation_mode())
    }

    fn symmetric(&self) -> bool {
        self.variant == LossVariant::MinSymmetric && self.mode == OrientationMode::Quaternion
    }

    /// For each example, whether the negated orientation is strictly closer.
    fn flipped(&self, predicted: &PoseOutput, ground_truth: &PoseOutput) -> Vec<bool> {
        let (q, q_gt) = (predicted.orientation(), ground_truth.orientation());
        (0..q.nrows())
            .map(|i| self.symmetric() && l1_row(q, q_gt, i, true) < l1_row(q, q_gt, i, false))
            .collect()
    }

    /// Returns `(position, orientation, total)` losses.
    #[allow(clippy::cast_precision_loss)]
    pub fn evaluate(
        &self,
        predicted: &PoseOutput,
        ground_truth: &PoseOutput,
        weight: Float,
        use_learned_weight: bool,
    ) -> Result<Losses, PoseNetError> {
        check_shapes(predicted.position(), ground_truth.position())?;
        check_shapes(predicted.orientation(), ground_truth.orientation())?;
        let batch = predicted.batch() as Float;
        let (x, x_gt) = (predicted.position(), ground_truth.position());
        let (q, q_gt) = (predicted.orientation(), ground_truth.orientation());
        let flipped = self.flipped(predicted, ground_truth);
        let mut position = 0.0;
        let mut orientation = 0.0;
        for (i, &flip) in flipped.iter().enumerate() {
            position += l1_row(x, x_gt, i, false);
            orientation += l1_row(q, q_gt, i, flip);
        }
        let position = position / batch;
        let orientation = orientation / batch;
        let total = if use_learned_weight {
            position / weight + weight * orientation
        } else {
            position + weight * orientation
        };
        Ok(Losses {
            position,
            orientation,
            total,
        })
    }

    /// Losses and gradients of the total loss.
    #[allow(clippy::cast_precision_loss)]
    pub fn evaluate_with_gradients(
        &self,
        predicted: &PoseOutput,
        ground_truth: &PoseOutput,
        weight: Float,
        use_learned_weight: bool,
    ) -> Result<(Losses, LossGradients), PoseNetError> {
        let losses = self.evaluate(predicted, ground_truth, weight, use_learned_weight)?;
        let batch = predicted.batch() as Float;
        let (d_position, d_orientation, d_weight) = if use_learned_weight {
            (
                1.0 / weight,
                weight,
                losses.orientation - losses.position / (weight * weight),
            )
        } else {
            (1.0, weight, losses.orientation)
        };

        let (x, x_gt) = (predicted.position(), ground_truth.position());
        let position = x.zip_map(x_gt, |a, b| d_position * sign(a - b) / batch);

        let (q, q_gt) = (predicted.orientation(), ground_truth.orientation());
        let flipped = self.flipped(predicted, ground_truth);
        let orientation = Mat::from_fn(q.nrows(), q.ncols(), |i, j| {
            let g = if flipped[i] {
                -sign(-q[(i, j)] - q_gt[(i, j)])
            } else {
                sign(q[(i, j)] - q_gt[(i, j)])
            };
            d_orientation * g / batch
        });

        Ok((
            losses,
            LossGradients {
                pose: PoseGradient {
                    position,
                    orientation,
                },
                weight: d_weight,
            },
        ))
    }
}

// TESTS #############################################################
