// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Localisation errors of predicted poses against ground truth.

use std::cmp::Ordering;

use crate::core::head::PoseOutput;
use crate::error::PoseNetError;
use crate::math::quaternion::quaternion_distance;
use crate::misc::type_aliases::Float;

/// Position and orientation errors of every example.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseErrors {
    /// Euclidean distances between positions.
    pub position: Vec<Float>,
    /// Angles in degrees between orientations.
    pub orientation: Vec<Float>,
}

impl PoseErrors {
    /// Errors of `predicted` against `ground_truth`, example per example.
    pub fn new(predicted: &PoseOutput, ground_truth: &PoseOutput) -> Result<Self, PoseNetError> {
        let (p_shape, g_shape) = (
            predicted.orientation().shape(),
            ground_truth.orientation().shape(),
        );
        if p_shape != g_shape {
            return Err(PoseNetError::ShapeMismatch {
                left: p_shape,
                right: g_shape,
            });
        }
        let position = (0..predicted.batch())
            .map(|i| (predicted.position_at(i) - ground_truth.position_at(i)).norm())
            .collect();
        let orientation = (0..predicted.batch())
            .map(|i| orientation_error(predicted, ground_truth, i).to_degrees())
            .collect();
        Ok(Self {
            position,
            orientation,
        })
    }

    /// Median position error, `None` for an empty batch.
    pub fn median_position(&self) -> Option<Float> {
        median(&self.position)
    }

    /// Median orientation error in degrees, `None` for an empty batch.
    pub fn median_orientation(&self) -> Option<Float> {
        median(&self.orientation)
    }
}

// Angle in radians, quaternion distance or angle between axes.
fn orientation_error(predicted: &PoseOutput, ground_truth: &PoseOutput, i: usize) -> Float {
    match (predicted.quaternion_at(i), ground_truth.quaternion_at(i)) {
        (Some(p), Some(g)) => quaternion_distance(&p, &g),
        _ => {
            let o_p = predicted.orientation().row(i);
            let o_g = ground_truth.orientation().row(i);
            num_traits::clamp(o_p.dot(&o_g), -1.0, 1.0).acos()
        }
    }
}

/// Median of a slice, average of the two middle values for even lengths.
pub fn median(values: &[Float]) -> Option<Float> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some(0.5 * (sorted[mid - 1] + sorted[mid]))
    } else {
        Some(sorted[mid])
    }
}

// TESTS #############################################################
