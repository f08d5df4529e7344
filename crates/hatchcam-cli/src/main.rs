mod config;

use std::{path::Path, thread, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hatchcam_stream::{doctor as stream_doctor, StreamServer};
use hatchcam_vision::{
    camera,
    diag::TracingDiagnostics,
    doctor as vision_doctor,
    engine::InferenceEngine,
    pipeline::Pipeline,
    sink::{FrameSink, NullSink},
    Detector, VisionConfig,
};

#[cfg(feature = "vision-tflite")]
use hatchcam_vision::tflite::TfliteDetector;

use crate::config::{load_config, Config};

#[derive(Debug, Parser)]
#[command(name = "hatchcam", version, about = "hatchcam - on-robot object detection stream")]
struct Cli {
    /// TOML config; every section has defaults.
    #[arg(long, global = true)]
    config: Option<String>,

    /// Detection model, overrides vision.model_path.
    #[arg(long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate config, model and camera without starting the loop.
    Doctor,
    /// Capture, detect, annotate and stream until interrupted.
    Run,
    Vision { #[command(subcommand)] cmd: VisionCmd },
}

#[derive(Debug, Subcommand)]
enum VisionCmd {
    /// Print model input/output tensor shapes.
    Inspect,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut cfg = load_config(cli.config.as_deref())?;
    if let Some(model) = &cli.model {
        cfg.override_model(model);
    }

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Run => run(cfg).await?,
        Command::Vision { cmd } => vision_cmd(&cfg, cmd)?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    cfg.loop_settings().validate()?;
    vision_doctor::check_vision(&cfg.vision, &cfg.label_table())?;
    vision_doctor::check_camera(&cfg.camera)?;
    stream_doctor::check_stream(&cfg.stream)?;

    if !cfg!(feature = "vision-tflite") {
        warn!("doctor: binary built without --features vision-tflite; `run` will refuse to start");
    }
    if cfg.vision.use_coral && !cfg!(feature = "vision-coral") {
        warn!("doctor: vision.use_coral=true but binary built without --features vision-coral");
    }

    info!("doctor: OK");
    Ok(())
}

fn vision_cmd(cfg: &Config, cmd: VisionCmd) -> Result<()> {
    match cmd {
        VisionCmd::Inspect => {
            check_model_path(&cfg.vision)?;
            #[cfg(not(feature = "vision-tflite"))]
            { anyhow::bail!("vision backend not available; build with --features vision-tflite"); }

            #[cfg(feature = "vision-tflite")]
            {
                let mut det = TfliteDetector::new(&cfg.vision)?;
                print!("{}", det.inspect()?);
                Ok(())
            }
        }
    }
}

async fn run(cfg: Config) -> Result<()> {
    info!("run: starting");
    let (pipeline, server) = build_pipeline(&cfg)?;

    let loop_thread = thread::Builder::new()
        .name("perception-loop".into())
        .spawn(move || pipeline.run())
        .context("spawn perception loop thread")?;

    tokio::select! {
        _ = wait_finished(&loop_thread) => {
            error!("run: perception loop thread exited");
            anyhow::bail!("perception loop stopped unexpectedly");
        }
        res = tokio::signal::ctrl_c() => {
            res.context("listen for ctrl-c")?;
            info!("run: interrupted, exiting");
        }
    }

    if let Some(server) = server {
        server.stop();
    }
    Ok(())
}

/// Assemble every collaborator. Order matters: bad loop settings or an
/// unusable model abort before the camera is opened, so no frame is ever captured.
fn build_pipeline(cfg: &Config) -> Result<(Pipeline, Option<StreamServer>)> {
    let settings = cfg.loop_settings();
    settings.validate()?;
    let engine = InferenceEngine::new(init_detector(&cfg.vision)?);
    let source = camera::open(&cfg.camera).context("open camera")?;

    let (sink, server): (Box<dyn FrameSink>, Option<StreamServer>) = if cfg.stream.enable {
        let (sink, server) = hatchcam_stream::serve(&cfg.stream)?;
        (Box::new(sink), Some(server))
    } else {
        warn!("run: stream disabled; frames are dropped after inference");
        (Box::new(NullSink::default()), None)
    };

    let pipeline = Pipeline::new(
        source,
        engine,
        sink,
        Box::new(TracingDiagnostics),
        cfg.label_table(),
        settings,
    );
    Ok((pipeline, server))
}

fn check_model_path(v: &VisionConfig) -> Result<()> {
    let path = v.active_model_path();
    anyhow::ensure!(!path.is_empty(), "no model configured; pass --model or set vision.model_path");
    anyhow::ensure!(Path::new(path).is_file(), "model file not found: {}", path);
    Ok(())
}

fn init_detector(v: &VisionConfig) -> Result<Box<dyn Detector>> {
    check_model_path(v)?;

    #[cfg(not(feature = "vision-tflite"))]
    { anyhow::bail!("vision backend not available; build with --features vision-tflite"); }

    #[cfg(feature = "vision-tflite")]
    { Ok(Box::new(TfliteDetector::new(v)?)) }
}

async fn wait_finished(handle: &thread::JoinHandle<()>) {
    while !handle.is_finished() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatchcam_vision::camera::CameraMode;

    #[test]
    fn cli_parses_run_with_model() {
        let cli = Cli::try_parse_from(["hatchcam", "run", "--model", "detect.tflite"]).unwrap();
        assert!(matches!(cli.cmd, Command::Run));
        assert_eq!(cli.model.as_deref(), Some("detect.tflite"));
        assert!(cli.config.is_none());
    }

    #[test]
    fn cli_parses_vision_inspect() {
        let cli = Cli::try_parse_from(["hatchcam", "--config", "a.toml", "vision", "inspect"]).unwrap();
        assert!(matches!(cli.cmd, Command::Vision { cmd: VisionCmd::Inspect }));
    }

    #[test]
    fn missing_model_is_rejected() {
        let err = init_detector(&VisionConfig::default()).err().unwrap();
        assert!(err.to_string().contains("no model configured"));
    }

    #[test]
    fn invalid_model_aborts_before_camera_is_opened() {
        let mut cfg = Config::default();
        cfg.override_model("/nonexistent/detect_edgetpu.tflite");
        // the camera would fail too; the model error must come first
        cfg.camera.mode = CameraMode::File;
        cfg.camera.file = Some("/nonexistent/replay.mp4".into());

        let err = build_pipeline(&cfg).err().unwrap();
        assert!(format!("{:#}", err).contains("model file not found"), "{:#}", err);
    }

    #[test]
    fn zero_top_k_is_fatal_at_startup() {
        let mut cfg = Config::default();
        cfg.vision.top_k = 0;
        let err = build_pipeline(&cfg).err().unwrap();
        assert!(err.to_string().contains("vision.top_k"), "{:#}", err);

        let mut cfg = Config::default();
        cfg.vision.conf_threshold = 1.5;
        let err = build_pipeline(&cfg).err().unwrap();
        assert!(err.to_string().contains("vision.conf_threshold"), "{:#}", err);
    }

    #[test]
    fn config_flag_is_accepted_after_subcommand() {
        let cli = Cli::try_parse_from(["hatchcam", "run", "--config", "a.toml", "--model", "m.tflite"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some("a.toml"));
        assert_eq!(cli.model.as_deref(), Some("m.tflite"));
    }
}
