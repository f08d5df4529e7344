use std::path::Path;

use anyhow::Result;
use tracing::warn;

use crate::{camera::{CameraConfig, CameraMode}, LabelTable, VisionConfig};

/// Model and backend checks. Threshold and top_k ranges live in
/// `LoopSettings::validate`, which `run` applies too.
pub fn check_vision(cfg: &VisionConfig, labels: &LabelTable) -> Result<()> {
    anyhow::ensure!(cfg.num_threads >= 1, "vision.num_threads must be >= 1");
    anyhow::ensure!(!labels.is_empty(), "labels must not be empty");

    let model = cfg.active_model_path();
    anyhow::ensure!(!model.is_empty(), "no model path configured (vision.model_path or --model)");
    anyhow::ensure!(Path::new(model).is_file(), "model file not found: {}", model);
    if cfg.use_coral && cfg.model_path_edgetpu.is_empty() {
        warn!("vision.use_coral=true but model_path_edgetpu empty; using {}", model);
    }
    Ok(())
}

pub fn check_camera(cfg: &CameraConfig) -> Result<()> {
    anyhow::ensure!(cfg.width > 0 && cfg.height > 0, "camera size must be non-zero");
    // yuv/mjpeg pipelines upstream of rgb24 reject odd sizes
    anyhow::ensure!(cfg.width % 2 == 0 && cfg.height % 2 == 0, "camera width/height must be even");
    anyhow::ensure!(cfg.fps >= 1 && cfg.fps <= 120, "camera.fps should be 1..120");
    match cfg.mode {
        CameraMode::V4l2 => {
            if !Path::new(&cfg.device).exists() {
                warn!("camera device {} not present (unplugged?)", cfg.device);
            }
        }
        CameraMode::File => {
            let file = cfg.file.as_deref().unwrap_or_default();
            anyhow::ensure!(Path::new(file).is_file(), "camera.file not found: {:?}", file);
        }
        CameraMode::LibcameraJpeg => {}
    }
    Ok(())
}
