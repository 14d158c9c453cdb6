// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Helper functions to handle label files in the Cambridge Landmarks format.
//!
//! ```text
//! Visual Landmark Dataset V1
//! ImageFile, Camera Position [X Y Z W P Q R]
//!
//! seq1/frame00001.png 57.47 -19.93 1.48 0.68 0.63 -0.27 0.27
//! ```

use log::info;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::config::OrientationMode;
use crate::error::PoseNetError;
use crate::math::quaternion::quat_to_axis;
use crate::misc::type_aliases::{Mat, Vec3, Vec4};

/// Number of header lines before the first label.
pub const HEADER_LINES: usize = 3;

/// Image file path and camera pose.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelledImage {
    /// Path of the image, as written in the file or resolved (see `read_label_file`).
    pub image_path: PathBuf,
    /// Camera position `(x, y, z)`.
    pub position: Vec3,
    /// Camera orientation `(w, p, q, r)`, scalar first.
    pub orientation: Vec4,
}

/// Read and parse a label file.
/// With `full_paths`, image paths are made relative to the label file directory.
pub fn read_label_file<P: AsRef<Path>>(
    path: P,
    full_paths: bool,
) -> Result<Vec<LabelledImage>, PoseNetError> {
    let content = fs::read_to_string(&path)?;
    let mut labels = parse::labels(&content)?;
    if full_paths {
        let directory = path.as_ref().parent().unwrap_or_else(|| Path::new(""));
        for label in labels.iter_mut() {
            label.image_path = directory.join(&label.image_path);
        }
    }
    info!(
        "{} labelled images in {}",
        labels.len(),
        path.as_ref().display()
    );
    Ok(labels)
}

/// Raw label rows (`batch x 7` or `batch x 6`) for the given orientation mode.
/// Axis labels are the default camera axis rotated by the label quaternion.
pub fn to_raw(labels: &[LabelledImage], mode: OrientationMode) -> Mat {
    let mut raw = Mat::zeros(labels.len(), mode.output_size());
    for (i, label) in labels.iter().enumerate() {
        raw.fixed_slice_mut::<nalgebra::U1, nalgebra::U3>(i, 0)
            .copy_from(&label.position.transpose());
        match mode {
            OrientationMode::Quaternion => raw
                .fixed_slice_mut::<nalgebra::U1, nalgebra::U4>(i, 3)
                .copy_from(&label.orientation.transpose()),
            OrientationMode::Axis => raw
                .fixed_slice_mut::<nalgebra::U1, nalgebra::U3>(i, 3)
                .copy_from(&quat_to_axis(&label.orientation).transpose()),
        }
    }
    raw
}

/// Parse label files content.
pub mod parse {
    use super::*;
    use nom::{do_parse, float, is_not, map, named, space, types::CompleteStr};

    /// Parse a label file, skipping its header and empty lines.
    pub fn labels(file_content: &str) -> Result<Vec<LabelledImage>, PoseNetError> {
        let mut vec_data = Vec::new();
        for (index, line) in file_content.lines().enumerate().skip(HEADER_LINES) {
            if line.trim().is_empty() {
                continue;
            }
            match label_line(CompleteStr(line)) {
                Ok((_, label)) => vec_data.push(label),
                Err(_) => return Err(PoseNetError::LabelParse(index + 1)),
            }
        }
        Ok(vec_data)
    }

    // nom parsers #############################################################

    // Parse an image path followed by its position and orientation.
    named!(label_line<CompleteStr, LabelledImage>,
        do_parse!(
            image_path: path >> space >>
            position: position >> space >>
            orientation: orientation >>
            (LabelledImage { image_path, position, orientation })
        )
    );

    named!(path<CompleteStr, PathBuf>,
        map!(is_not!(" \t\r\n"), |s| PathBuf::from(*s))
    );

    // Parse components of a position.
    named!(position<CompleteStr, Vec3>,
        do_parse!(
            x: float >> space >>
            y: float >> space >>
            z: float >>
            (Vec3::new(x, y, z))
        )
    );

    // Parse components of a quaternion, scalar first.
    named!(orientation<CompleteStr, Vec4>,
        do_parse!(
            w: float >> space >>
            p: float >> space >>
            q: float >> space >>
            r: float >>
            (Vec4::new(w, p, q, r))
        )
    );

} // pub mod parse

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use std::io::Write;

    const CONTENT: &str = "Visual Landmark Dataset V1
ImageFile, Camera Position [X Y Z W P Q R]

seq1/frame00001.png 57.47 -19.93 1.48 0.68 0.63 -0.27 0.27
seq1/frame00002.png 1 2 3 1 0 0 0

";

    #[test]
    fn parse_skips_header() {
        let labels = parse::labels(CONTENT).unwrap();
        assert_eq!(2, labels.len());
        assert_eq!(PathBuf::from("seq1/frame00001.png"), labels[0].image_path);
        assert_eq!(Vec3::new(57.47, -19.93, 1.48), labels[0].position);
        assert_eq!(Vec4::new(0.68, 0.63, -0.27, 0.27), labels[0].orientation);
    }

    #[test]
    fn parse_error_reports_line() {
        let content = format!("{}seq1/frame00003.png 1 2 3\n", CONTENT);
        match parse::labels(&content) {
            Err(PoseNetError::LabelParse(line)) => assert_eq!(7, line),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn raw_labels_per_mode() {
        let labels = parse::labels(CONTENT).unwrap();
        let quat = to_raw(&labels, OrientationMode::Quaternion);
        assert_eq!((2, 7), quat.shape());
        assert_eq!(
            vec![1.0, 2.0, 3.0, 1.0, 0.0, 0.0, 0.0],
            quat.row(1).iter().cloned().collect::<Vec<_>>()
        );
        let axis = to_raw(&labels, OrientationMode::Axis);
        assert_eq!((2, 6), axis.shape());
        assert_eq!(
            vec![1.0, 2.0, 3.0, 0.0, 0.0, -1.0],
            axis.row(1).iter().cloned().collect::<Vec<_>>()
        );
    }

    #[test]
    fn full_paths_relative_to_label_file() {
        let dir = tempfile::tempdir().unwrap();
        let label_path = dir.path().join("dataset_train.txt");
        fs::File::create(&label_path)
            .unwrap()
            .write_all(CONTENT.as_bytes())
            .unwrap();
        let labels = read_label_file(&label_path, true).unwrap();
        assert_eq!(dir.path().join("seq1/frame00002.png"), labels[1].image_path);
        let labels = read_label_file(&label_path, false).unwrap();
        assert_eq!(PathBuf::from("seq1/frame00002.png"), labels[1].image_path);
    }
}
