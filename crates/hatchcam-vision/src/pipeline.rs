//! The perception loop: capture -> detect -> overlay -> publish, forever.
//!
//! One `Frame` is allocated up front and reused for every iteration. The camera
//! overwrites it in place, the engine and renderer read it, and the sink gets
//! either the renderer's working copy or the raw buffer. Nothing runs
//! concurrently, so there is never more than one capture or inference in flight.
//!
//! Every iteration is isolated: errors and panics are caught at the iteration
//! boundary and recorded, and the next iteration is the retry.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    time::{Duration, Instant},
};

use anyhow::Result;
use hatchcam_proto::diagnostics::{DetectionRecord, Diagnostic, DiagnosticEvent, ThroughputRecord};
use serde::Deserialize;
use tracing::info;

use crate::{
    camera::FrameSource,
    diag::DiagnosticSink,
    engine::InferenceEngine,
    frame::{DEFAULT_HEIGHT, DEFAULT_WIDTH},
    overlay::OverlayRenderer,
    sink::FrameSink,
    Detection, Frame, LabelTable,
};

/// What to do when the camera yields no frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureFailurePolicy {
    /// Record the failure and start the next iteration without publishing.
    #[default]
    Skip,
    /// Record the failure, then run inference on and publish whatever the
    /// buffer still holds.
    PublishStale,
}

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub width: u32,
    pub height: u32,
    pub conf_threshold: f32,
    pub top_k: usize,
    pub on_capture_failure: CaptureFailurePolicy,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            conf_threshold: 0.05,
            top_k: 10,
            on_capture_failure: CaptureFailurePolicy::Skip,
        }
    }
}

impl LoopSettings {
    /// Reject settings under which the loop could never report a detection.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.width > 0 && self.height > 0, "camera size must be non-zero");
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.conf_threshold),
            "vision.conf_threshold must be within 0..=1, got {}",
            self.conf_threshold
        );
        anyhow::ensure!(self.top_k >= 1, "vision.top_k must be >= 1");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Exactly one frame reached the sink.
    Published { detections: usize },
    CaptureSkipped,
    Faulted,
}

pub struct Pipeline {
    source: Box<dyn FrameSource>,
    engine: InferenceEngine,
    renderer: OverlayRenderer,
    sink: Box<dyn FrameSink>,
    diag: Box<dyn DiagnosticSink>,
    labels: LabelTable,
    settings: LoopSettings,
    frame: Frame,
    iteration: u64,
}

impl Pipeline {
    pub fn new(
        source: Box<dyn FrameSource>,
        engine: InferenceEngine,
        sink: Box<dyn FrameSink>,
        diag: Box<dyn DiagnosticSink>,
        labels: LabelTable,
        settings: LoopSettings,
    ) -> Self {
        Self {
            source,
            engine,
            renderer: OverlayRenderer::new(),
            sink,
            diag,
            labels,
            frame: Frame::new(settings.width, settings.height),
            settings,
            iteration: 0,
        }
    }

    /// Run until the process is killed.
    pub fn run(mut self) -> ! {
        info!(
            "pipeline: running {}x{} threshold={} top_k={} backend={}",
            self.settings.width,
            self.settings.height,
            self.settings.conf_threshold,
            self.settings.top_k,
            self.engine.backend_name()
        );
        loop {
            self.step();
        }
    }

    /// One full iteration. Never fails; faults are recorded and reported in the outcome.
    pub fn step(&mut self) -> Outcome {
        self.iteration += 1;
        match panic::catch_unwind(AssertUnwindSafe(|| self.iterate())) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                self.emit(Diagnostic::IterationFault { error: format!("{:#}", e) });
                Outcome::Faulted
            }
            Err(payload) => {
                self.emit(Diagnostic::IterationFault { error: format!("panic: {}", panic_message(&*payload)) });
                Outcome::Faulted
            }
        }
    }

    pub fn iterations(&self) -> u64 {
        self.iteration
    }

    /// The reusable capture buffer.
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    fn iterate(&mut self) -> Result<Outcome> {
        let start = Instant::now();

        if let Err(e) = self.source.capture(&mut self.frame) {
            self.emit(Diagnostic::CaptureFailed { reason: e.to_string() });
            if self.settings.on_capture_failure == CaptureFailurePolicy::Skip {
                return Ok(Outcome::CaptureSkipped);
            }
        }

        // inference and overlay faults, panics included, still publish the raw frame
        let mut faults: Vec<String> = Vec::new();
        let (threshold, top_k) = (self.settings.conf_threshold, self.settings.top_k);
        let detections = match guarded(|| self.engine.detect(&self.frame, threshold, top_k)) {
            Ok(d) => Some(d),
            Err(e) => {
                faults.push(format!("inference: {:#}", e));
                None
            }
        };

        match detections.as_deref() {
            Some(dets) if !dets.is_empty() => match guarded(|| self.renderer.render(&self.frame, dets)) {
                Ok(annotated) => self.sink.publish(annotated),
                Err(e) => {
                    faults.push(format!("overlay: {:#}", e));
                    self.sink.publish(&self.frame);
                }
            },
            _ => self.sink.publish(&self.frame),
        }

        for error in faults {
            self.emit(Diagnostic::IterationFault { error });
        }
        let found = detections.as_ref().map_or(0, Vec::len);
        match detections {
            Some(dets) if dets.is_empty() => self.emit(Diagnostic::NoDetections),
            Some(dets) => {
                for d in &dets {
                    let record = self.detection_record(d);
                    self.emit(Diagnostic::Detection(record));
                }
            }
            None => {}
        }

        let elapsed = start.elapsed();
        self.emit(Diagnostic::Throughput(ThroughputRecord {
            elapsed_ms: elapsed.as_secs_f64() * 1000.0,
            fps: fps(elapsed),
        }));

        Ok(Outcome::Published { detections: found })
    }

    fn detection_record(&self, d: &Detection) -> DetectionRecord {
        DetectionRecord {
            label_id: d.label_id,
            label: self.labels.resolve(d.label_id).into_owned(),
            score: d.score,
            width_delta: d.bbox.width_delta(),
            bbox: d.bbox.to_array(),
        }
    }

    fn emit(&mut self, diag: Diagnostic) {
        self.diag.emit(DiagnosticEvent::now(self.iteration, diag));
    }
}

/// Instantaneous frames per second for one iteration of length `elapsed`.
/// `None` when the clock did not advance.
pub fn fps(elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        Some(1.0 / secs)
    } else {
        None
    }
}

/// Run one stage of the iteration, turning a panic into an error.
fn guarded<T>(stage: impl FnOnce() -> Result<T>) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(stage))
        .unwrap_or_else(|payload| Err(anyhow::anyhow!("panic: {}", panic_message(&*payload))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_is_reciprocal_of_duration() {
        for ms in [1u64, 16, 33, 100, 250, 1000, 2500] {
            let t = Duration::from_millis(ms);
            let got = fps(t).unwrap();
            assert!((got - 1.0 / t.as_secs_f64()).abs() < 1e-9, "{}ms -> {}", ms, got);
        }
        assert!((fps(Duration::from_micros(12_500)).unwrap() - 80.0).abs() < 1e-9);
    }

    #[test]
    fn zero_duration_has_no_fps() {
        assert_eq!(fps(Duration::ZERO), None);
    }

    #[test]
    fn settings_validation() {
        LoopSettings::default().validate().unwrap();
        assert!(LoopSettings { top_k: 0, ..LoopSettings::default() }.validate().is_err());
        assert!(LoopSettings { conf_threshold: 1.5, ..LoopSettings::default() }.validate().is_err());
        assert!(LoopSettings { conf_threshold: f32::NAN, ..LoopSettings::default() }.validate().is_err());
        assert!(LoopSettings { width: 0, ..LoopSettings::default() }.validate().is_err());
    }

    #[test]
    fn guarded_stage_turns_panic_into_error() {
        let err = guarded::<()>(|| panic!("overlay exploded")).unwrap_err();
        assert!(err.to_string().contains("overlay exploded"));
        assert_eq!(guarded(|| Ok(3)).unwrap(), 3);
    }

    #[test]
    fn panic_payloads_are_readable() {
        let p = panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(panic_message(&*p), "boom 7");
        let p = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(&*p), "static");
    }
}
