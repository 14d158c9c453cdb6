// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use clap::Parser;
use log::info;
use std::{error::Error, fs, path::Path, path::PathBuf, rc::Rc};

use posenet_rs::core::backbone::PointwiseBackbone;
use posenet_rs::core::checkpoint;
use posenet_rs::core::config::OrientationMode;
use posenet_rs::core::graph::{PoseNet, Testable};
use posenet_rs::core::saliency::{self, SaliencyOptions};
use posenet_rs::dataset::cambridge;
use posenet_rs::error::PoseNetError;
use posenet_rs::misc::interop;

/// Saliency maps of a trained pose regression model.
#[derive(Debug, Parser)]
#[command(author, version, about = "Compute PoseNet saliency maps")]
struct Args {
    /// Path to a model checkpoint.
    #[arg(short, long)]
    model: PathBuf,

    /// Directory of .png images, .txt label file, or single .png image.
    #[arg(short, long)]
    dataset: PathBuf,

    /// Output directory, required with more than one image.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// The model predicts camera axes instead of quaternions.
    #[arg(short, long)]
    axis: bool,

    /// Red saliency maps, with transparency.
    #[arg(short, long)]
    red: bool,

    /// Clip value, instead of normalizing each map by its maximum (0 to disable).
    #[arg(short = 'k', long)]
    scale: Option<f32>,

    /// Size of the network input.
    #[arg(short, long, num_args = 2, value_names = ["WIDTH", "HEIGHT"], default_values_t = vec![256, 256])]
    size: Vec<u32>,
}

/// File name of the map when a single image is given without output directory.
const SINGLE_OUTPUT: &str = "saliency.png";

fn main() {
    env_logger::init();
    if let Err(error) = try_main() {
        eprintln!("{}", error);
        std::process::exit(1);
    }
}

fn try_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    if let Some(scale) = args.scale {
        if !(scale >= 0.0) {
            return Err(format!("--scale must not be negative, got {}", scale).into());
        }
    }

    // Gather the images.
    let images = list_images(&args.dataset)?;
    if images.len() > 1 && args.output.is_none() {
        return Err("--output argument required".into());
    }
    if images.is_empty() {
        return Err("No images found".into());
    }
    if let Some(output) = &args.output {
        fs::create_dir_all(output)?;
    }

    // Load the model.
    let testable = load_model(&args.model, args.axis)?;
    let options = SaliencyOptions {
        scale: args.scale,
        ..SaliencyOptions::default()
    };

    // Compute and save one saliency map per image.
    let (width, height) = (args.size[0], args.size[1]);
    for (i, image_path) in images.iter().enumerate() {
        let img = image::open(image_path)?.to_rgb();
        let img = interop::resize(&interop::centre_crop(&img), width, height);
        let maps = saliency::saliency_maps(&testable, &interop::tensor_from_rgb(&img), &options)?;
        let output_path = match &args.output {
            Some(dir) => dir.join(image_path.file_name().ok_or("image path without file name")?),
            None => PathBuf::from(SINGLE_OUTPUT),
        };
        if args.red {
            interop::red_from_matrix(&maps[0]).save(&output_path)?;
        } else {
            interop::gray_from_matrix(&maps[0]).save(&output_path)?;
        }
        info!(
            "{}/{}: {}",
            i + 1,
            images.len(),
            output_path.display()
        );
    }
    Ok(())
}

/// Images of a directory, of a label file, or a single image.
fn list_images(dataset: &Path) -> Result<Vec<PathBuf>, Box<dyn Error>> {
    let is_ext = |path: &Path, ext: &str| path.extension().map_or(false, |e| e == ext);
    if dataset.is_dir() {
        let mut images: Vec<PathBuf> = fs::read_dir(dataset)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_ext(path, "png"))
            .collect();
        images.sort();
        Ok(images)
    } else if is_ext(dataset, "txt") {
        Ok(cambridge::read_label_file(dataset, true)?
            .into_iter()
            .map(|label| label.image_path)
            .collect())
    } else if is_ext(dataset, "png") {
        Ok(vec![dataset.to_path_buf()])
    } else {
        Ok(Vec::new())
    }
}

/// Load a checkpoint into an inference graph.
fn load_model(path: &Path, axis: bool) -> Result<Testable, PoseNetError> {
    let (config, store) = checkpoint::load(path)?;
    let requested = if axis {
        OrientationMode::Axis
    } else {
        OrientationMode::Quaternion
    };
    if config.orientation_mode() != requested {
        return Err(PoseNetError::OrientationModeMismatch {
            model: config.orientation_mode().to_string(),
            requested: requested.to_string(),
        });
    }
    let backbone = Rc::new(PointwiseBackbone::new(3, config.hidden_width()));
    Ok(Testable::new(&PoseNet::from_parameters(config, backbone, store)))
}
