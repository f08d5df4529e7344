use tracing::trace;

use crate::Frame;

/// Publish endpoint for annotated (or raw) frames.
///
/// Best effort: implementations log their own transport failures and never
/// hand them back to the loop.
pub trait FrameSink: Send {
    fn publish(&mut self, frame: &Frame);
}

impl<K: FrameSink + ?Sized> FrameSink for Box<K> {
    fn publish(&mut self, frame: &Frame) {
        (**self).publish(frame)
    }
}

/// Discards frames (stream disabled).
#[derive(Debug, Default)]
pub struct NullSink {
    published: u64,
}

impl NullSink {
    pub fn published(&self) -> u64 {
        self.published
    }
}

impl FrameSink for NullSink {
    fn publish(&mut self, frame: &Frame) {
        self.published += 1;
        trace!("sink: dropped {}x{} frame #{}", frame.width(), frame.height(), self.published);
    }
}
