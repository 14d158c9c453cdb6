// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Quaternion functions on raw 4-vectors.
//!
//! Quaternions are stored in the scalar first convention `(w, x, y, z)`.
//! Contrary to `nalgebra::UnitQuaternion`, nothing here enforces unit norm,
//! so the same functions can be used on raw network outputs.

use crate::misc::type_aliases::{Float, Vec3, Vec4};

/// Default viewing direction of the camera (looking down the negative z axis).
pub const DEFAULT_AXIS: [Float; 3] = [0.0, 0.0, -1.0];

/// Angle (radians, in [0, pi]) of the rotation bringing `q1` onto `q2`.
///
/// Uses the squared dot product so that `q` and `-q` are at distance 0.
/// The cosine is clamped to [-1, 1] to absorb rounding errors.
pub fn quaternion_distance(q1: &Vec4, q2: &Vec4) -> Float {
    let dot = q1.dot(q2);
    let cos = 2.0 * dot * dot - 1.0;
    num_traits::clamp(cos, -1.0, 1.0).acos()
}

/// Hamilton product `a * b`.
#[rustfmt::skip]
pub fn quaternion_mult(a: &Vec4, b: &Vec4) -> Vec4 {
    Vec4::new(
        a[0] * b[0] - a[1] * b[1] - a[2] * b[2] - a[3] * b[3],
        a[0] * b[1] + a[1] * b[0] + a[2] * b[3] - a[3] * b[2],
        a[0] * b[2] - a[1] * b[3] + a[2] * b[0] + a[3] * b[1],
        a[0] * b[3] + a[1] * b[2] - a[2] * b[1] + a[3] * b[0],
    )
}

/// Conjugate `(w, -x, -y, -z)`.
pub fn conjugate(q: &Vec4) -> Vec4 {
    Vec4::new(q[0], -q[1], -q[2], -q[3])
}

/// Rotate a vector by a quaternion: `q * (0, vec) * conj(q)`.
/// The quaternion is normalized first.
/// Warning! the result is undefined (NaN) for the zero quaternion.
pub fn rotate_by_quaternion(vec: &Vec3, q: &Vec4) -> Vec3 {
    let q = q.normalize();
    let pure = Vec4::new(0.0, vec.x, vec.y, vec.z);
    let rotated = quaternion_mult(&quaternion_mult(&q, &pure), &conjugate(&q));
    Vec3::new(rotated[1], rotated[2], rotated[3])
}

/// Direction of the default camera axis `(0, 0, -1)` after rotation by `q`.
pub fn quat_to_axis(q: &Vec4) -> Vec3 {
    rotate_by_quaternion(&Vec3::from_column_slice(&DEFAULT_AXIS), q)
}

// TESTS #############################################################
