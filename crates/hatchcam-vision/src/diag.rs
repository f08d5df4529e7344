use hatchcam_proto::diagnostics::{Diagnostic, DiagnosticEvent};
use tracing::{info, warn};

/// Consumer of the loop's structured records.
pub trait DiagnosticSink: Send {
    fn emit(&mut self, event: DiagnosticEvent);
}

impl<R: DiagnosticSink + ?Sized> DiagnosticSink for Box<R> {
    fn emit(&mut self, event: DiagnosticEvent) {
        (**self).emit(event)
    }
}

/// Formats records as `tracing` events with named fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticSink for TracingDiagnostics {
    fn emit(&mut self, event: DiagnosticEvent) {
        let frame = event.frame;
        match event.diag {
            Diagnostic::Detection(d) => info!(
                frame,
                label = %d.label,
                label_id = d.label_id,
                score = d.score,
                width_delta = d.width_delta,
                bbox = ?d.bbox,
                "detection"
            ),
            Diagnostic::NoDetections => info!(frame, "no objects detected"),
            Diagnostic::CaptureFailed { reason } => warn!(frame, %reason, "capture failed"),
            Diagnostic::IterationFault { error } => warn!(frame, %error, "iteration fault"),
            Diagnostic::Throughput(t) => match t.fps {
                Some(fps) => info!(frame, elapsed_ms = t.elapsed_ms, fps, "throughput"),
                None => info!(frame, elapsed_ms = t.elapsed_ms, "throughput (zero-length iteration)"),
            },
        }
    }
}
