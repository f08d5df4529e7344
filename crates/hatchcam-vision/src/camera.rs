use std::{
    io::{self, Read},
    path::Path,
    process::{Child, ChildStdout, Command, Stdio},
    time::Instant,
};

use anyhow::{Context, Result};
use image::imageops::FilterType;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::frame::{byte_len, Frame, DEFAULT_HEIGHT, DEFAULT_WIDTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CameraMode {
    V4l2,
    File,
    LibcameraJpeg,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub mode: CameraMode,
    pub device: String,       // /dev/video0 (v4l2)
    pub file: Option<String>, // replay input (file)
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            mode: CameraMode::V4l2,
            device: "/dev/video0".to_string(),
            file: None,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: 30,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("camera produced no frame")]
    NoFrame,
    #[error("frame buffer is {actual} bytes, camera delivers {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("camera i/o: {0}")]
    Io(#[from] io::Error),
    #[error("decode camera jpeg: {0}")]
    Decode(#[from] image::ImageError),
}

/// Fills a caller-owned frame with the next camera image.
///
/// The returned instant only signals success; the loop does not schedule on it.
pub trait FrameSource: Send {
    fn capture(&mut self, frame: &mut Frame) -> Result<Instant, CaptureError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn capture(&mut self, frame: &mut Frame) -> Result<Instant, CaptureError> {
        (**self).capture(frame)
    }
}

/// Acquire the configured camera. Failure here is a startup error.
pub fn open(cfg: &CameraConfig) -> Result<Box<dyn FrameSource>> {
    anyhow::ensure!(cfg.width > 0 && cfg.height > 0, "camera size must be non-zero");
    match cfg.mode {
        CameraMode::V4l2 | CameraMode::File => Ok(Box::new(FfmpegSource::open(cfg)?)),
        CameraMode::LibcameraJpeg => Ok(Box::new(LibcameraJpegSource::open(cfg)?)),
    }
}

/// Read exactly one raw rgb24 frame from `reader` into `frame`.
///
/// End of stream before a full frame maps to `NoFrame`; the buffer may then hold
/// a partial overwrite.
pub fn read_frame<R: Read>(reader: &mut R, frame: &mut Frame) -> Result<(), CaptureError> {
    match reader.read_exact(frame.as_bytes_mut()) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(CaptureError::NoFrame),
        Err(e) => Err(e.into()),
    }
}

fn check_shape(cfg: &CameraConfig, frame: &Frame) -> Result<(), CaptureError> {
    let expected = byte_len(cfg.width, cfg.height);
    if frame.len() != expected || frame.width() != cfg.width {
        return Err(CaptureError::SizeMismatch { expected, actual: frame.len() });
    }
    Ok(())
}

/// ffmpeg arguments producing raw rgb24 at exactly the configured size on stdout.
pub fn ffmpeg_args(cfg: &CameraConfig) -> Result<Vec<String>> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"].iter().map(|s| s.to_string()).collect();
    match cfg.mode {
        CameraMode::V4l2 => {
            args.extend([
                "-f".into(), "video4linux2".into(),
                "-framerate".into(), cfg.fps.to_string(),
                "-video_size".into(), format!("{}x{}", cfg.width, cfg.height),
                "-i".into(), cfg.device.clone(),
            ]);
        }
        CameraMode::File => {
            let file = cfg.file.as_ref().context("camera.file missing (mode = \"file\")")?;
            args.extend([
                "-re".into(),
                "-stream_loop".into(), "-1".into(),
                "-i".into(), file.clone(),
            ]);
        }
        CameraMode::LibcameraJpeg => anyhow::bail!("libcamera-jpeg does not use ffmpeg"),
    }
    // force the size even if the device negotiated something else
    args.extend([
        "-vf".into(), format!("scale={}:{}", cfg.width, cfg.height),
        "-f".into(), "rawvideo".into(),
        "-pix_fmt".into(), "rgb24".into(),
        "-".into(),
    ]);
    Ok(args)
}

/// Persistent ffmpeg child streaming raw frames; each capture is one `read_exact`
/// straight into the loop's buffer.
pub struct FfmpegSource {
    cfg: CameraConfig,
    args: Vec<String>,
    child: Option<(Child, ChildStdout)>,
}

impl FfmpegSource {
    pub fn open(cfg: &CameraConfig) -> Result<Self> {
        match cfg.mode {
            CameraMode::V4l2 => anyhow::ensure!(
                Path::new(&cfg.device).exists(),
                "camera device not found: {}", cfg.device
            ),
            CameraMode::File => {
                let file = cfg.file.as_deref().unwrap_or_default();
                anyhow::ensure!(Path::new(file).is_file(), "camera replay file not found: {}", file);
            }
            CameraMode::LibcameraJpeg => anyhow::bail!("use LibcameraJpegSource for libcamera-jpeg"),
        }

        let args = ffmpeg_args(cfg)?;
        let mut src = Self { cfg: cfg.clone(), args, child: None };
        src.spawn().context("start ffmpeg capture")?;
        info!(
            "camera: {:?} {}x{} @ {}fps",
            cfg.mode, cfg.width, cfg.height, cfg.fps
        );
        Ok(src)
    }

    fn spawn(&mut self) -> io::Result<()> {
        debug!("capture: spawning ffmpeg");
        let mut child = Command::new("ffmpeg")
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "ffmpeg stdout not captured"))?;
        self.child = Some((child, stdout));
        Ok(())
    }

    fn reap(&mut self) {
        if let Some((mut child, _)) = self.child.take() {
            let _ = child.kill();
            match child.wait() {
                Ok(status) => warn!("capture: ffmpeg exited ({}), respawning on next capture", status),
                Err(e) => warn!("capture: ffmpeg wait failed: {}", e),
            }
        }
    }
}

impl FrameSource for FfmpegSource {
    fn capture(&mut self, frame: &mut Frame) -> Result<Instant, CaptureError> {
        check_shape(&self.cfg, frame)?;
        if self.child.is_none() {
            self.spawn()?;
        }
        let res = match self.child.as_mut() {
            Some((_, stdout)) => read_frame(stdout, frame),
            None => Err(CaptureError::NoFrame),
        };
        match res {
            Ok(()) => Ok(Instant::now()),
            Err(e) => {
                self.reap();
                Err(e)
            }
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        if let Some((mut child, _)) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// One `libcamera-still` invocation per frame (simple, robust on a Pi),
/// decoded and resized into the loop's buffer.
pub struct LibcameraJpegSource {
    cfg: CameraConfig,
}

impl LibcameraJpegSource {
    pub fn open(cfg: &CameraConfig) -> Result<Self> {
        let out = Command::new("libcamera-still")
            .arg("--version")
            .output()
            .context("run libcamera-still")?;
        anyhow::ensure!(out.status.success(), "libcamera-still --version failed");
        info!("camera: libcamera-jpeg {}x{}", cfg.width, cfg.height);
        Ok(Self { cfg: cfg.clone() })
    }
}

impl FrameSource for LibcameraJpegSource {
    fn capture(&mut self, frame: &mut Frame) -> Result<Instant, CaptureError> {
        check_shape(&self.cfg, frame)?;
        debug!("capture: libcamera-still");
        let out = Command::new("libcamera-still")
            .args([
                "-n",         // no preview
                "-t", "1",    // 1ms
                "--width", &self.cfg.width.to_string(),
                "--height", &self.cfg.height.to_string(),
                "-o", "-",    // stdout
            ])
            .stderr(Stdio::null())
            .output()?;
        if !out.status.success() || out.stdout.is_empty() {
            return Err(CaptureError::NoFrame);
        }
        decode_jpeg_into(&out.stdout, frame)?;
        Ok(Instant::now())
    }
}

/// Decode a JPEG into `frame`, resizing when the camera ignored the requested size.
pub fn decode_jpeg_into(jpeg: &[u8], frame: &mut Frame) -> Result<(), CaptureError> {
    let rgb = image::load_from_memory(jpeg)?.to_rgb8();
    if rgb.dimensions() == (frame.width(), frame.height()) {
        frame.as_bytes_mut().copy_from_slice(rgb.as_raw());
    } else {
        let resized = image::imageops::resize(&rgb, frame.width(), frame.height(), FilterType::Triangle);
        frame.as_bytes_mut().copy_from_slice(resized.as_raw());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn read_frame_fills_buffer_in_place() {
        let mut frame = Frame::new(2, 2);
        let bytes: Vec<u8> = (0..24).collect();
        let mut reader = Cursor::new(bytes.clone());
        read_frame(&mut reader, &mut frame).unwrap();
        assert_eq!(frame.as_bytes(), bytes.as_slice());
    }

    #[test]
    fn short_stream_is_no_frame() {
        let mut frame = Frame::new(2, 2);
        let mut reader = Cursor::new(vec![1u8; 10]);
        assert!(matches!(read_frame(&mut reader, &mut frame), Err(CaptureError::NoFrame)));
    }

    #[test]
    fn consecutive_reads_walk_the_stream() {
        let mut frame = Frame::new(1, 1);
        let mut reader = Cursor::new(vec![1, 1, 1, 2, 2, 2]);
        read_frame(&mut reader, &mut frame).unwrap();
        assert_eq!(frame.pixel(0, 0), Some([1, 1, 1]));
        read_frame(&mut reader, &mut frame).unwrap();
        assert_eq!(frame.pixel(0, 0), Some([2, 2, 2]));
        assert!(read_frame(&mut reader, &mut frame).is_err());
    }

    #[test]
    fn v4l2_args_request_rgb24_at_configured_size() {
        let args = ffmpeg_args(&CameraConfig::default()).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-f video4linux2"));
        assert!(joined.contains("-video_size 320x240"));
        assert!(joined.contains("-i /dev/video0"));
        assert!(joined.contains("scale=320:240"));
        assert!(joined.ends_with("-f rawvideo -pix_fmt rgb24 -"));
    }

    #[test]
    fn file_mode_needs_a_file() {
        let cfg = CameraConfig { mode: CameraMode::File, ..CameraConfig::default() };
        assert!(ffmpeg_args(&cfg).is_err());

        let cfg = CameraConfig { file: Some("match.mp4".into()), ..cfg };
        let joined = ffmpeg_args(&cfg).unwrap().join(" ");
        assert!(joined.contains("-stream_loop -1 -i match.mp4"));
    }

    #[test]
    fn decode_resizes_to_frame() {
        let img = image::RgbImage::from_pixel(8, 6, image::Rgb([200, 10, 10]));
        let mut jpeg = Vec::new();
        img.write_to(&mut Cursor::new(&mut jpeg), image::ImageFormat::Jpeg).unwrap();

        let mut frame = Frame::new(4, 3);
        decode_jpeg_into(&jpeg, &mut frame).unwrap();
        let px = frame.pixel(2, 1).unwrap();
        assert!(px[0] > 150 && px[1] < 60, "unexpected pixel {:?}", px);
    }

    #[test]
    fn missing_device_fails_open() {
        let cfg = CameraConfig { device: "/dev/does-not-exist-42".into(), ..CameraConfig::default() };
        assert!(open(&cfg).is_err());
    }
}
