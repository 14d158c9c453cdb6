// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Interoperability conversions between the image, matrix and tensor types.

use image::{imageops, FilterType, GrayImage, Luma, RgbImage, Rgba, RgbaImage};

use crate::math::tensor::Tensor4;
use crate::misc::type_aliases::{Float, Mat};

/// Largest centered square of an image.
pub fn centre_crop(img: &RgbImage) -> RgbImage {
    let (width, height) = img.dimensions();
    let side = width.min(height);
    let (x0, y0) = ((width - side) / 2, (height - side) / 2);
    RgbImage::from_fn(side, side, |x, y| *img.get_pixel(x0 + x, y0 + y))
}

/// Resize an image to `width x height`.
pub fn resize(img: &RgbImage, width: u32, height: u32) -> RgbImage {
    imageops::resize(img, width, height, FilterType::Triangle)
}

/// Convert an `RgbImage` into a `1 x height x width x 3` tensor
/// with values normalized into `[-1, 1]`.
pub fn tensor_from_rgb(img: &RgbImage) -> Tensor4 {
    let (width, height) = img.dimensions();
    Tensor4::from_fn(1, height as usize, width as usize, 3, |_, y, x, c| {
        let value = Float::from(img.get_pixel(x as u32, y as u32)[c]);
        (value / 255.0 - 0.5) * 2.0
    })
}

/// Convert a `[0, 1]` matrix into a `GrayImage`.
///
/// Performs a transposition to accomodate for the
/// column major matrix into the row major image.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn gray_from_matrix(mat: &Mat) -> GrayImage {
    let (nb_rows, nb_cols) = mat.shape();
    let mut img_buf = GrayImage::new(nb_cols as u32, nb_rows as u32);
    for (x, y, pixel) in img_buf.enumerate_pixels_mut() {
        *pixel = Luma([to_u8(mat[(y as usize, x as usize)])]);
    }
    img_buf
}

/// Convert a `[0, 1]` matrix into a red `RgbaImage`,
/// the matrix values becoming the alpha channel.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn red_from_matrix(mat: &Mat) -> RgbaImage {
    let (nb_rows, nb_cols) = mat.shape();
    let mut img_buf = RgbaImage::new(nb_cols as u32, nb_rows as u32);
    for (x, y, pixel) in img_buf.enumerate_pixels_mut() {
        *pixel = Rgba([255, 0, 0, to_u8(mat[(y as usize, x as usize)])]);
    }
    img_buf
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_u8(value: Float) -> u8 {
    (num_traits::clamp(value, 0.0, 1.0) * 255.0).round() as u8
}

// TESTS #############################################################
