// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Type aliases for common types used all over the code base.

use nalgebra as na;
use std::collections::BTreeMap;

/// At the moment, the library is focused on f32 computation.
pub type Float = f32;

/// A vector with three Float coordinates.
pub type Vec3 = na::Vector3<Float>;
/// A vector with four Float coordinates.
/// Used for quaternions in the scalar first convention `(w, x, y, z)`.
pub type Vec4 = na::Vector4<Float>;

/// A dynamically sized matrix of Floats.
/// Batched values are stored one example per row.
pub type Mat = na::DMatrix<Float>;

/// Named matrices, used for parameters and their gradients.
pub type NamedMats = BTreeMap<String, Mat>;
