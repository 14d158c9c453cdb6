// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Saliency maps: which pixels the predicted pose is most sensitive to.
//!
//! The raw saliency of a pixel is the largest absolute gradient,
//! over the color channels, of the sum of all pose outputs.
//! Raw maps are then smoothed with a median filter over a disk
//! and rescaled into `[0, 1]`.

use std::cmp::Ordering;

use crate::core::graph::Testable;
use crate::error::PoseNetError;
use crate::math::tensor::Tensor4;
use crate::misc::type_aliases::{Float, Mat};

/// Radius of the median filter disk.
pub const MEDIAN_RADIUS: usize = 3;

/// Post-processing of raw saliency maps.
#[derive(Debug, Clone, PartialEq)]
pub struct SaliencyOptions {
    /// Radius of the median filter, 0 to disable it.
    pub median_radius: usize,
    /// Divide by this value and clip to `[0, 1]`.
    /// If `None` or not strictly positive, each map is divided by its own maximum.
    pub scale: Option<Float>,
}

impl Default for SaliencyOptions {
    fn default() -> Self {
        Self {
            median_radius: MEDIAN_RADIUS,
            scale: None,
        }
    }
}

/// Per-pixel maximum of the absolute gradient over channels.
/// One `height x width` map per example.
pub fn pixel_saliency(grad: &Tensor4) -> Vec<Mat> {
    let (batch, height, width, channels) = grad.shape();
    (0..batch)
        .map(|b| {
            Mat::from_fn(height, width, |y, x| {
                (0..channels)
                    .map(|c| grad.get(b, y, x, c).abs())
                    .fold(0.0, Float::max)
            })
        })
        .collect()
}

/// Median over a disk of given radius around each pixel.
/// Only pixels inside the map are taken into account at the borders.
#[allow(clippy::cast_possible_wrap)]
pub fn median_disk(map: &Mat, radius: usize) -> Mat {
    if radius == 0 {
        return map.clone();
    }
    let (nb_rows, nb_cols) = map.shape();
    let r = radius as isize;
    let offsets: Vec<(isize, isize)> = (-r..=r)
        .flat_map(|dy| (-r..=r).map(move |dx| (dy, dx)))
        .filter(|(dy, dx)| dy * dy + dx * dx <= r * r)
        .collect();
    let mut neighbors = Vec::with_capacity(offsets.len());
    Mat::from_fn(nb_rows, nb_cols, |y, x| {
        neighbors.clear();
        for (dy, dx) in offsets.iter() {
            let (ny, nx) = (y as isize + dy, x as isize + dx);
            if ny >= 0 && nx >= 0 && (ny as usize) < nb_rows && (nx as usize) < nb_cols {
                neighbors.push(map[(ny as usize, nx as usize)]);
            }
        }
        neighbors.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        neighbors[neighbors.len() / 2]
    })
}

/// Bring a map into `[0, 1]`.
/// A scale that is not strictly positive is ignored.
/// A map that is zero everywhere stays zero.
pub fn rescale(map: &Mat, scale: Option<Float>) -> Mat {
    match scale {
        Some(scale) if scale > 0.0 => map.map(|v| num_traits::clamp(v / scale, 0.0, 1.0)),
        _ => {
            let max = map.iter().cloned().fold(0.0, Float::max);
            if max > 0.0 {
                map / max
            } else {
                map.clone()
            }
        }
    }
}

/// Smoothed and rescaled saliency maps of a batch of images.
pub fn saliency_maps(
    testable: &Testable,
    images: &Tensor4,
    options: &SaliencyOptions,
) -> Result<Vec<Mat>, PoseNetError> {
    Ok(testable
        .saliency(images)?
        .iter()
        .map(|raw| rescale(&median_disk(raw, options.median_radius), options.scale))
        .collect())
}

// TESTS #############################################################
