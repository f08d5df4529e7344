use serde::{Deserialize, Serialize};

/// One observability record produced by the perception loop.
///
/// Records are outputs only; nothing in the loop reads them back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    Detection(DetectionRecord),
    NoDetections,
    CaptureFailed { reason: String },
    IterationFault { error: String },
    Throughput(ThroughputRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub label_id: u32,
    pub label: String,
    pub score: f32,
    /// |x1 - x2| in pixels
    pub width_delta: f32,
    /// x1, y1, x2, y2 in absolute frame pixels
    pub bbox: [f32; 4],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputRecord {
    pub elapsed_ms: f64,
    // None when the iteration measured as zero-length
    pub fps: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub ts_unix_ms: i64,
    /// Loop iteration the record belongs to, starting at 1.
    pub frame: u64,
    pub diag: Diagnostic,
}

impl DiagnosticEvent {
    pub fn now(frame: u64, diag: Diagnostic) -> Self {
        Self {
            ts_unix_ms: time::OffsetDateTime::now_utc().unix_timestamp_nanos() as i64 / 1_000_000,
            frame,
            diag,
        }
    }
}
