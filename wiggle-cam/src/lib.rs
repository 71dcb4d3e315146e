//! Camera backend contract and implementations.
//!
//! A [`CameraBackend`] owns the sensor handle exclusively; everything else
//! talks to it through the methods here. The backend runs two threads per
//! engine generation: the camera loop (captures, publishes sensor
//! timestamps) and the phase controller (writes the frame-duration
//! register). Together with the engine's sync thread they rendezvous at a
//! three-party barrier once per clock cycle.

use std::time::Duration;

use bytes::Bytes;
use wiggle_types::ImageFormat;

pub mod align;
pub mod core;
pub mod registry;
pub mod virtual_cam;

#[cfg(all(feature = "picam", target_os = "linux"))]
pub mod picam;

pub use registry::{create_camera_backend, CameraBackendKind};
pub use virtual_cam::VirtualCameraBackend;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("timeout waiting for frame")]
    Timeout,
    #[error("framerate {fps} fps outside sensor limits [{min_fps}, {max_fps}]")]
    FramerateOutOfRange {
        fps: u32,
        min_fps: f64,
        max_fps: f64,
    },
    #[error("barrier broken")]
    BarrierBroken,
    #[error("preview not enabled")]
    PreviewNotEnabled,
    #[error("camera not started")]
    NotStarted,
    #[error("unsupported image format")]
    UnsupportedFormat,
    #[error("image error: {source}")]
    Image {
        #[from]
        source: image::ImageError,
    },
    #[error("camera error: {msg}")]
    Internal { msg: String },
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

fn _test_error_is_send() {
    // Compile-time test to ensure Error implements Send trait.
    fn implements<T: Send>() {}
    implements::<Error>();
}

/// Request for one full-resolution capture.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendRequest {
    pub seq: Option<u32>,
}

/// Artifact produced from a [`BackendRequest`].
#[derive(Debug, Clone)]
pub struct BackendItem {
    pub filepath: std::path::PathBuf,
}

/// One captured full-resolution frame.
///
/// Owned by the camera until handed off through the hi-res cell; the handle
/// is cheap to clone (the pixel data is shared).
#[derive(Debug, Clone)]
pub struct FrameHandle {
    /// Frame counter within the current engine generation.
    pub seq: u64,
    /// Sensor timestamp of the exposure, monotonic nanoseconds.
    pub sensor_ns: i64,
    /// Host wall-clock time at capture, used for artifact filenames.
    pub captured_at: chrono::DateTime<chrono::Local>,
    jpeg: Bytes,
}

impl FrameHandle {
    pub fn from_jpeg(seq: u64, sensor_ns: i64, jpeg: Bytes) -> Self {
        Self {
            seq,
            sensor_ns,
            captured_at: chrono::Local::now(),
            jpeg,
        }
    }

    /// Encode into the requested format. May be CPU-heavy.
    pub fn to_image(&self, format: ImageFormat) -> Result<Bytes> {
        match format {
            ImageFormat::Jpeg => Ok(self.jpeg.clone()),
        }
    }
}

/// Contract between the acquisition engine and a sensor.
pub trait CameraBackend: Send + Sync {
    /// Configure the sensor for `nominal_fps` and begin delivering
    /// metadata. Fails with [`Error::FramerateOutOfRange`] when the rate is
    /// not strictly inside the sensor's advertised limits.
    fn start(&self, nominal_fps: u32) -> Result<()>;

    /// Halt delivery and release the sensor. Idempotent.
    fn stop(&self);

    /// True iff the camera loop and controller threads are running.
    fn alive(&self) -> bool;

    /// Called by the sync thread once per clock cycle. Publishes the
    /// reference timestamp and joins the rendezvous; must not block beyond
    /// the current cycle.
    fn sync_tick(&self, reference_ns: i64) -> Result<()>;

    /// Most recent low-resolution JPEG.
    fn wait_for_lores_image(&self, timeout: Duration) -> Result<Bytes>;

    /// Request one full-resolution frame and wait for the camera loop to
    /// produce it.
    fn wait_for_hires_frame(&self, timeout: Duration) -> Result<FrameHandle>;

    /// Clear the capture request bit so the camera loop returns to
    /// metadata-only cycles.
    fn done_hires_frames(&self);

    fn encode_frame_to_image(&self, frame: &FrameHandle, format: ImageFormat) -> Result<Bytes> {
        frame.to_image(format)
    }

    /// One-shot convenience: request, encode, release.
    fn wait_for_hires_image(&self, format: ImageFormat, timeout: Duration) -> Result<Bytes> {
        let frame = self.wait_for_hires_frame(timeout)?;
        let bytes = self.encode_frame_to_image(&frame, format)?;
        self.done_hires_frames();
        Ok(bytes)
    }

    /// Register a stream consumer; the lo-res encoder runs while at least
    /// one consumer is registered. Fails with [`Error::PreviewNotEnabled`]
    /// when the backend cannot stream.
    fn start_stream(&self) -> Result<()>;

    fn stop_stream(&self);
}
