// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Camera pose regression from a single image.
//!
//! A backbone feature map goes through a small regression head
//! (global average pooling and two fully connected layers)
//! that predicts a position and an orientation.
//! Training and validation graphs add an L1 loss on top of it,
//! with a fixed or learned weighting between the two terms.

#![warn(missing_docs)]

pub mod core;
pub mod dataset;
pub mod error;
pub mod math;
pub mod misc;
