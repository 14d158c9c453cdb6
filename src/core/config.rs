// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Configuration of the regression model and of the training graph.

use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PoseNetError;
use crate::misc::type_aliases::Float;

/// How the orientation loss treats the quaternion sign ambiguity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossVariant {
    /// Plain L1 distance.
    Standard,
    /// Minimum of the L1 distances of `q` and `-q` to the ground truth.
    MinSymmetric,
}

/// What the orientation part of the output represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrientationMode {
    /// Unit quaternion `(w, x, y, z)`.
    Quaternion,
    /// Viewing direction of the camera.
    Axis,
}

impl OrientationMode {
    /// Number of orientation components.
    pub fn orientation_size(self) -> usize {
        match self {
            OrientationMode::Quaternion => 4,
            OrientationMode::Axis => 3,
        }
    }

    /// Number of raw outputs of the last layer (position + orientation).
    pub fn output_size(self) -> usize {
        3 + self.orientation_size()
    }
}

impl FromStr for LossVariant {
    type Err = PoseNetError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(LossVariant::Standard),
            "min" => Ok(LossVariant::MinSymmetric),
            _ => Err(PoseNetError::UnknownLossVariant(s.to_string())),
        }
    }
}

impl FromStr for OrientationMode {
    type Err = PoseNetError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quat" => Ok(OrientationMode::Quaternion),
            "axis" => Ok(OrientationMode::Axis),
            _ => Err(PoseNetError::UnknownOrientationMode(s.to_string())),
        }
    }
}

impl fmt::Display for OrientationMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OrientationMode::Quaternion => write!(f, "quat"),
            OrientationMode::Axis => write!(f, "axis"),
        }
    }
}

/// Immutable configuration of the regression model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionConfig {
    feature_endpoint: String,
    hidden_width: usize,
    loss_variant: LossVariant,
    orientation_mode: OrientationMode,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            feature_endpoint: "Mixed_7c".to_string(),
            hidden_width: 2048,
            loss_variant: LossVariant::Standard,
            orientation_mode: OrientationMode::Quaternion,
        }
    }
}

impl RegressionConfig {
    /// Build a validated configuration.
    pub fn new(
        feature_endpoint: &str,
        hidden_width: usize,
        loss_variant: LossVariant,
        orientation_mode: OrientationMode,
    ) -> Result<Self, PoseNetError> {
        if hidden_width == 0 {
            return Err(PoseNetError::ZeroHiddenWidth);
        }
        Ok(Self {
            feature_endpoint: feature_endpoint.to_string(),
            hidden_width,
            loss_variant,
            orientation_mode,
        })
    }

    /// Build a configuration from the textual names
    /// `"standard" | "min"` and `"quat" | "axis"`.
    pub fn parse(
        feature_endpoint: &str,
        hidden_width: usize,
        loss_variant: &str,
        orientation_mode: &str,
    ) -> Result<Self, PoseNetError> {
        Self::new(
            feature_endpoint,
            hidden_width,
            loss_variant.parse()?,
            orientation_mode.parse()?,
        )
    }

    /// Re-check the invariants, for configurations coming from deserialization.
    pub fn validate(self) -> Result<Self, PoseNetError> {
        Self::new(
            &self.feature_endpoint,
            self.hidden_width,
            self.loss_variant,
            self.orientation_mode,
        )
    }

    /// Name of the backbone layer used as feature map.
    pub fn feature_endpoint(&self) -> &str {
        &self.feature_endpoint
    }

    /// Width of the fully connected bottleneck.
    pub fn hidden_width(&self) -> usize {
        self.hidden_width
    }

    /// Orientation loss variant.
    pub fn loss_variant(&self) -> LossVariant {
        self.loss_variant
    }

    /// Orientation output mode.
    pub fn orientation_mode(&self) -> OrientationMode {
        self.orientation_mode
    }
}

/// Options of the trainable graph.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOptions {
    /// Dropout keep probability after the first fully connected layer.
    pub keep_prob: Option<Float>,
    /// Weight of the orientation loss (initial value if learned).
    pub beta: Float,
    /// Turn beta into a trainable parameter.
    pub learn_beta: bool,
    /// Seed of the dropout masks.
    pub seed: u64,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            keep_prob: Some(0.7),
            beta: 500.0,
            learn_beta: false,
            seed: 0,
        }
    }
}

// TESTS #############################################################
