// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type shared by the whole crate.

use thiserror::Error;

/// Errors that can occur while building or evaluating a pose regression model.
#[derive(Debug, Error)]
pub enum PoseNetError {
    /// The loss variant is neither "standard" nor "min".
    #[error("unknown loss variant: {0}")]
    UnknownLossVariant(String),
    /// The orientation mode is neither "quat" nor "axis".
    #[error("unknown orientation mode: {0}")]
    UnknownOrientationMode(String),
    /// The fully connected bottleneck must have at least one unit.
    #[error("hidden width must be positive")]
    ZeroHiddenWidth,
    /// Dropout keep probability outside of (0, 1].
    #[error("dropout keep probability must be in (0, 1], got {0}")]
    InvalidKeepProb(f32),
    /// A loss weight must be strictly positive when learned.
    #[error("learned loss weight must be strictly positive, got {0}")]
    InvalidLossWeight(f32),
    /// Validation graph without learned weight and without fallback constant.
    #[error("the value of beta has to be specified")]
    MissingLossWeight,
    /// Validation graph asked for a learned weight that was never created.
    #[error("no learned beta parameter in scope: {0}")]
    MissingLearnedWeight(String),
    /// A parameter looked up by name does not exist.
    #[error("missing parameter: {0}")]
    MissingParameter(String),
    /// Pooled features cannot be reshaped to the hidden width.
    #[error("feature map has {got} channels but the hidden width is {expected}")]
    FeatureWidth {
        /// Configured hidden width.
        expected: usize,
        /// Number of channels of the feature map.
        got: usize,
    },
    /// Labels do not have the number of columns required by the orientation mode.
    #[error("labels have {got} columns but {expected} are required")]
    LabelWidth {
        /// Expected number of columns.
        expected: usize,
        /// Actual number of columns.
        got: usize,
    },
    /// Two tensors that should agree in shape do not.
    #[error("shape mismatch: {left:?} vs {right:?}")]
    ShapeMismatch {
        /// Shape of the first operand.
        left: (usize, usize),
        /// Shape of the second operand.
        right: (usize, usize),
    },
    /// The backbone cannot be truncated at the requested layer.
    #[error("unknown backbone endpoint: {0}")]
    UnknownEndpoint(String),
    /// The model orientation mode does not match the requested one.
    #[error("model predicts {model} orientations but {requested} was requested")]
    OrientationModeMismatch {
        /// Mode stored in the model.
        model: String,
        /// Mode requested by the caller.
        requested: String,
    },
    /// Malformed checkpoint file.
    #[error("invalid checkpoint: {0}")]
    Checkpoint(String),
    /// Malformed label file.
    #[error("label file parsing error at line {0}")]
    LabelParse(usize),
    /// Checkpoint configuration header error.
    #[error("checkpoint configuration: {0}")]
    Json(#[from] serde_json::Error),
    /// Input/output error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
