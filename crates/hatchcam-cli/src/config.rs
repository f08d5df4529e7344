use anyhow::{Context, Result};
use serde::Deserialize;

use hatchcam_stream::StreamConfig;
use hatchcam_vision::{
    camera::CameraConfig,
    default_labels,
    pipeline::{CaptureFailurePolicy, LoopSettings},
    LabelTable, VisionConfig,
};

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Class names indexed by label id.
    pub labels: Vec<String>,
    pub vision: VisionConfig,
    pub camera: CameraConfig,
    pub stream: StreamConfig,
    pub pipeline: PipelineCfg,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            labels: default_labels(),
            vision: VisionConfig::default(),
            camera: CameraConfig::default(),
            stream: StreamConfig::default(),
            pipeline: PipelineCfg::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PipelineCfg {
    pub on_capture_failure: CaptureFailurePolicy,
}

impl Config {
    /// `--model` wins over whatever the file says, for both cpu and edgetpu paths.
    pub fn override_model(&mut self, path: &str) {
        self.vision.model_path = path.to_string();
        self.vision.model_path_edgetpu = path.to_string();
    }

    pub fn label_table(&self) -> LabelTable {
        LabelTable::new(self.labels.clone())
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            width: self.camera.width,
            height: self.camera.height,
            conf_threshold: self.vision.conf_threshold,
            top_k: self.vision.top_k,
            on_capture_failure: self.pipeline.on_capture_failure,
        }
    }
}

pub fn load_config(path: Option<&str>) -> Result<Config> {
    let Some(path) = path else { return Ok(Config::default()); };
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    parse_config(&s)
}

pub fn parse_config(s: &str) -> Result<Config> {
    toml::from_str(s).context("parse config toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatchcam_vision::camera::CameraMode;
    use std::io::Write;

    #[test]
    fn empty_config_uses_field_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.labels, vec!["hatch", "cargo"]);
        assert_eq!((cfg.camera.width, cfg.camera.height), (320, 240));
        assert_eq!(cfg.vision.conf_threshold, 0.05);
        assert_eq!(cfg.vision.top_k, 10);
        assert_eq!(cfg.stream.name, "MLOut");
        assert_eq!(cfg.pipeline.on_capture_failure, CaptureFailurePolicy::Skip);
    }

    #[test]
    fn full_config_parses() {
        let cfg = parse_config(
            r#"
            labels = ["hatch", "cargo", "robot"]

            [vision]
            model_path = "/models/detect.tflite"
            model_path_edgetpu = "/models/detect_edgetpu.tflite"
            use_coral = true
            conf_threshold = 0.4
            top_k = 5

            [camera]
            mode = "file"
            file = "/data/match3.mp4"
            width = 640
            height = 480
            fps = 15

            [stream]
            bind = "127.0.0.1:5800"
            name = "Annotated"
            jpeg_quality = 60

            [pipeline]
            on_capture_failure = "publish-stale"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.label_table().get(2), Some("robot"));
        assert_eq!(cfg.vision.active_model_path(), "/models/detect_edgetpu.tflite");
        assert_eq!(cfg.camera.mode, CameraMode::File);
        assert_eq!(cfg.stream.jpeg_quality, 60);

        let s = cfg.loop_settings();
        assert_eq!((s.width, s.height, s.top_k), (640, 480, 5));
        assert_eq!(s.on_capture_failure, CaptureFailurePolicy::PublishStale);
    }

    #[test]
    fn unknown_camera_mode_is_rejected() {
        assert!(parse_config("[camera]\nmode = \"gopro\"\n").is_err());
    }

    #[test]
    fn model_override_replaces_both_paths() {
        let mut cfg = Config::default();
        cfg.vision.use_coral = true;
        cfg.override_model("/tmp/m.tflite");
        assert_eq!(cfg.vision.active_model_path(), "/tmp/m.tflite");
    }

    #[test]
    fn load_from_file_and_missing_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[vision]\ntop_k = 3").unwrap();
        let cfg = load_config(Some(f.path().to_str().unwrap())).unwrap();
        assert_eq!(cfg.vision.top_k, 3);

        assert!(load_config(Some("/nonexistent/hatchcam.toml")).is_err());
        assert_eq!(load_config(None).unwrap().vision.top_k, 10);
    }
}
