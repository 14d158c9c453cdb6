// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Batched 4D tensors in NHWC layout,
//! used for images and spatial feature maps.

use crate::misc::type_aliases::{Float, Mat};

/// Batch of multi-channel 2D arrays, stored as `[batch][height][width][channels]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor4 {
    shape: (usize, usize, usize, usize),
    data: Vec<Float>,
}

impl Tensor4 {
    /// Tensor whose value at `(b, y, x, c)` is `f(b, y, x, c)`.
    pub fn from_fn<F>(batch: usize, height: usize, width: usize, channels: usize, mut f: F) -> Self
    where
        F: FnMut(usize, usize, usize, usize) -> Float,
    {
        let mut data = Vec::with_capacity(batch * height * width * channels);
        for b in 0..batch {
            for y in 0..height {
                for x in 0..width {
                    for c in 0..channels {
                        data.push(f(b, y, x, c));
                    }
                }
            }
        }
        Self {
            shape: (batch, height, width, channels),
            data,
        }
    }

    /// View a `batch x channels` matrix as a `batch x 1 x 1 x channels` tensor.
    pub fn from_flat(mat: &Mat) -> Self {
        let (batch, channels) = mat.shape();
        Self::from_fn(batch, 1, 1, channels, |b, _, _, c| mat[(b, c)])
    }

    /// `(batch, height, width, channels)`.
    pub fn shape(&self) -> (usize, usize, usize, usize) {
        self.shape
    }

    /// Number of examples in the batch.
    pub fn batch(&self) -> usize {
        self.shape.0
    }

    /// Raw NHWC buffer.
    pub fn data(&self) -> &[Float] {
        &self.data
    }

    #[inline]
    fn index(&self, b: usize, y: usize, x: usize, c: usize) -> usize {
        let (_, h, w, ch) = self.shape;
        ((b * h + y) * w + x) * ch + c
    }

    /// Value at `(b, y, x, c)`.
    #[inline]
    pub fn get(&self, b: usize, y: usize, x: usize, c: usize) -> Float {
        self.data[self.index(b, y, x, c)]
    }

    /// Mean over the spatial dimensions, producing a `batch x channels` matrix.
    #[allow(clippy::cast_precision_loss)]
    pub fn global_average_pool(&self) -> Mat {
        let (batch, height, width, channels) = self.shape;
        let nb_pixels = (height * width) as Float;
        let mut pooled = Mat::zeros(batch, channels);
        for b in 0..batch {
            for y in 0..height {
                for x in 0..width {
                    for c in 0..channels {
                        pooled[(b, c)] += self.get(b, y, x, c);
                    }
                }
            }
        }
        pooled / nb_pixels
    }

    /// Backward pass of `global_average_pool`.
    /// Spreads each pooled gradient uniformly over the spatial positions.
    #[allow(clippy::cast_precision_loss)]
    pub fn global_average_pool_backward(grad: &Mat, height: usize, width: usize) -> Self {
        let (batch, channels) = grad.shape();
        let nb_pixels = (height * width) as Float;
        Self::from_fn(batch, height, width, channels, |b, _, _, c| {
            grad[(b, c)] / nb_pixels
        })
    }

    /// One row per pixel (`batch * height * width` rows), one column per channel.
    pub fn to_pixel_rows(&self) -> Mat {
        let (b, h, w, c) = self.shape;
        Mat::from_row_slice(b * h * w, c, &self.data)
    }

    /// Inverse of `to_pixel_rows`, with a possibly different number of channels.
    /// Returns `None` if the number of rows does not match.
    pub fn from_pixel_rows(batch: usize, height: usize, width: usize, rows: &Mat) -> Option<Self> {
        if rows.nrows() != batch * height * width {
            return None;
        }
        let channels = rows.ncols();
        let data = (0..rows.nrows())
            .flat_map(|i| (0..channels).map(move |j| rows[(i, j)]))
            .collect();
        Some(Self {
            shape: (batch, height, width, channels),
            data,
        })
    }
}

// TESTS #############################################################
