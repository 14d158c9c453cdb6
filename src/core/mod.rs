// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Core functionalities of PoseNet.

pub mod backbone;
pub mod checkpoint;
pub mod config;
pub mod eval;
pub mod graph;
pub mod head;
pub mod layers;
pub mod loss;
pub mod params;
pub mod saliency;
