//! MJPEG-over-HTTP publish endpoint for the perception loop.
//!
//! `MjpegSink` is the loop-side half: it JPEG-encodes each published frame and
//! drops it into a watch slot that only ever holds the latest packet. The
//! server half (see [`server`]) fans that slot out to any number of viewers;
//! a slow viewer skips frames instead of stalling the loop.

pub mod doctor;
pub mod server;

use bytes::Bytes;
use hatchcam_vision::{sink::FrameSink, Frame};
use image::{codecs::jpeg::JpegEncoder, ExtendedColorType};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{trace, warn};

pub use server::{serve, StreamServer};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub enable: bool,
    pub bind: String,
    /// Path segment the stream is also served under, e.g. `/MLOut`.
    pub name: String,
    pub jpeg_quality: u8,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enable: true,
            bind: "0.0.0.0:1181".to_string(),
            name: "MLOut".to_string(),
            jpeg_quality: 80,
        }
    }
}

/// One encoded frame as handed to viewers.
#[derive(Debug, Clone)]
pub struct FramePacket {
    pub seq: u64,
    pub jpeg: Bytes,
}

pub type PacketSlot = watch::Receiver<Option<FramePacket>>;

pub struct MjpegSink {
    quality: u8,
    seq: u64,
    encode_failures: u64,
    // encoder scratch, reused every frame
    buf: Vec<u8>,
    tx: watch::Sender<Option<FramePacket>>,
}

impl MjpegSink {
    pub fn new(jpeg_quality: u8) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            quality: jpeg_quality.clamp(1, 100),
            seq: 0,
            encode_failures: 0,
            buf: Vec::new(),
            tx,
        }
    }

    pub fn subscribe(&self) -> PacketSlot {
        self.tx.subscribe()
    }

    /// Frames successfully handed to viewers so far.
    pub fn published(&self) -> u64 {
        self.seq
    }

    pub fn encode_failures(&self) -> u64 {
        self.encode_failures
    }

    fn encode(&mut self, frame: &Frame) -> image::ImageResult<()> {
        self.buf.clear();
        JpegEncoder::new_with_quality(&mut self.buf, self.quality).encode(
            frame.as_bytes(),
            frame.width(),
            frame.height(),
            ExtendedColorType::Rgb8,
        )
    }
}

impl FrameSink for MjpegSink {
    fn publish(&mut self, frame: &Frame) {
        if let Err(e) = self.encode(frame) {
            self.encode_failures += 1;
            warn!("stream: jpeg encode failed (failures: {}): {}", self.encode_failures, e);
            return;
        }
        self.seq += 1;
        let packet = FramePacket { seq: self.seq, jpeg: Bytes::copy_from_slice(&self.buf) };
        trace!("stream: frame {} ({} bytes, {} viewers)", packet.seq, packet.jpeg.len(), self.tx.receiver_count());
        self.tx.send_replace(Some(packet));
    }
}
