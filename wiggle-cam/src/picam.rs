//! V4L2 camera backend for the Pi camera stack.
//!
//! Captures MJPEG at full resolution; the hi-res path hands the compressed
//! frame through untouched, the lo-res stream is produced by an on-demand
//! encoder thread that decodes, scales and re-encodes. The per-frame
//! duration register is pushed into the driver's streaming parameters; on
//! drivers that latch `timeperframe` only between frames this is exactly the
//! per-frame control the sync loop needs, elsewhere it is best effort.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use image::codecs::jpeg::JpegEncoder;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC, Fraction};
use wiggle_config::PicamConfig;
use workerlib::{Flag, Worker};

use crate::core::{validate_framerate, CameraCore};
use crate::{CameraBackend, Error, FrameHandle, Result};

const METADATA_TIMEOUT_FRAMES: u32 = 2;

struct Generation {
    core: Arc<CameraCore>,
    camera: Worker,
    encoder: Worker,
}

pub struct PicamBackend {
    config: PicamConfig,
    generation: Mutex<Option<Generation>>,
}

fn v4l_err<E: std::fmt::Display>(err: E) -> Error {
    Error::Internal {
        msg: err.to_string(),
    }
}

impl PicamBackend {
    pub fn new(config: PicamConfig) -> Self {
        Self {
            config,
            generation: Mutex::new(None),
        }
    }

    fn core(&self) -> Result<Arc<CameraCore>> {
        self.generation
            .lock()
            .as_ref()
            .map(|g| g.core.clone())
            .ok_or(Error::NotStarted)
    }

    /// Advertised framerate range for the configured format, from the
    /// driver's frame-interval enumeration.
    fn framerate_limits(&self, dev: &Device) -> Result<(f64, f64)> {
        let intervals = dev
            .enum_frameintervals(
                FourCC::new(b"MJPG"),
                self.config.capture_width,
                self.config.capture_height,
            )
            .map_err(v4l_err)?;

        let mut min_fps = f64::MAX;
        let mut max_fps: f64 = 0.0;
        let mut fold = |frac: &Fraction| {
            if frac.numerator == 0 {
                return;
            }
            let fps = frac.denominator as f64 / frac.numerator as f64;
            min_fps = min_fps.min(fps);
            max_fps = max_fps.max(fps);
        };
        for fi in &intervals {
            match &fi.interval {
                v4l::frameinterval::FrameIntervalEnum::Discrete(frac) => fold(frac),
                v4l::frameinterval::FrameIntervalEnum::Stepwise(step) => {
                    fold(&step.min);
                    fold(&step.max);
                }
            }
        }
        if max_fps == 0.0 {
            return Err(Error::Internal {
                msg: "driver advertises no frame intervals for MJPG".to_string(),
            });
        }
        Ok((min_fps, max_fps))
    }
}

impl CameraBackend for PicamBackend {
    fn start(&self, nominal_fps: u32) -> Result<()> {
        let mut generation = self.generation.lock();
        if generation.is_some() {
            return Ok(());
        }

        let dev = Device::new(self.config.device_index).map_err(v4l_err)?;

        let mut fmt = dev.format().map_err(v4l_err)?;
        fmt.width = self.config.capture_width;
        fmt.height = self.config.capture_height;
        fmt.fourcc = FourCC::new(b"MJPG");
        let fmt = dev.set_format(&fmt).map_err(v4l_err)?;
        if fmt.fourcc != FourCC::new(b"MJPG") {
            return Err(Error::Internal {
                msg: format!("device does not deliver MJPG (got {})", fmt.fourcc),
            });
        }
        info!(
            "picam configured: {}x{} MJPG on /dev/video{}",
            fmt.width, fmt.height, self.config.device_index
        );

        let (min_fps, max_fps) = self.framerate_limits(&dev)?;
        validate_framerate(nominal_fps, min_fps, max_fps)?;

        let core = CameraCore::new(nominal_fps);
        core.start_controller()?;

        let (lores_tx, lores_rx) = bounded::<Bytes>(1);

        let encoder_core = core.clone();
        let config = self.config.clone();
        let encoder = Worker::spawn("lores_encoder", move |flag| {
            encoder_fun(encoder_core, config, lores_rx, flag);
        })
        .map_err(|e| Error::Internal { msg: e.to_string() })?;

        let camera_core = core.clone();
        let camera = Worker::spawn("picam_camera", move |flag| {
            camera_fun(camera_core, dev, lores_tx, flag);
        })
        .map_err(|e| Error::Internal { msg: e.to_string() })?;

        *generation = Some(Generation {
            core,
            camera,
            encoder,
        });
        Ok(())
    }

    fn stop(&self) {
        let generation = self.generation.lock().take();
        if let Some(generation) = generation {
            generation.core.shutdown();
            generation.camera.stop();
            generation.encoder.stop();
            debug!("picam backend stopped");
        }
    }

    fn alive(&self) -> bool {
        let generation = self.generation.lock();
        match generation.as_ref() {
            Some(g) => g.camera.is_alive() && g.core.controller_alive(),
            None => false,
        }
    }

    fn sync_tick(&self, reference_ns: i64) -> Result<()> {
        self.core()?.sync_tick(reference_ns)
    }

    fn wait_for_lores_image(&self, timeout: Duration) -> Result<Bytes> {
        self.core()?.stream.wait_frame(timeout)
    }

    fn wait_for_hires_frame(&self, timeout: Duration) -> Result<FrameHandle> {
        self.core()?
            .request_and_wait_hires(crate::BackendRequest::default(), timeout)
    }

    fn done_hires_frames(&self) {
        if let Ok(core) = self.core() {
            core.done_hires();
        }
    }

    fn start_stream(&self) -> Result<()> {
        self.core()?.stream.add_consumer();
        Ok(())
    }

    fn stop_stream(&self) {
        if let Ok(core) = self.core() {
            core.stream.remove_consumer();
        }
    }
}

fn camera_fun(core: Arc<CameraCore>, dev: Device, lores_tx: Sender<Bytes>, flag: Flag) {
    debug!("picam camera loop started");

    let mut stream = match v4l::io::mmap::Stream::with_buffers(&dev, Type::VideoCapture, 4) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("failed to map capture buffers: {e}");
            core.abort_barrier();
            return;
        }
    };

    let mut applied_duration_us = core.frame_duration.nominal_us();
    apply_frame_duration(&dev, applied_duration_us);
    let mut seq = 0u64;
    let mut consecutive_errors = 0u32;

    while flag.alive() {
        let duration_us = core.frame_duration.load();
        if duration_us != applied_duration_us {
            apply_frame_duration(&dev, duration_us);
            applied_duration_us = duration_us;
        }

        let (jpeg, sensor_ns) = match CaptureStream::next(&mut stream) {
            Ok((buf, meta)) => {
                consecutive_errors = 0;
                let sensor_ns =
                    meta.timestamp.sec as i64 * 1_000_000_000 + meta.timestamp.usec as i64 * 1_000;
                (Bytes::copy_from_slice(buf), sensor_ns)
            }
            Err(e) => {
                consecutive_errors += 1;
                if consecutive_errors >= METADATA_TIMEOUT_FRAMES {
                    warn!("camera timed out: {e}");
                    break;
                }
                continue;
            }
        };
        seq += 1;

        if core.take_drop_frame() {
            continue;
        }

        core.aligner.publish_camera(sensor_ns);

        if core.hires_requested() {
            core.publish_hires(FrameHandle::from_jpeg(seq, sensor_ns, jpeg));
        } else if core.stream.active() {
            // drop the frame rather than stall the capture loop behind the
            // encoder
            if let Err(TrySendError::Disconnected(_)) = lores_tx.try_send(jpeg) {
                break;
            }
        }

        if core.camera_barrier_wait().is_err() {
            debug!("sync barrier broke");
            break;
        }
    }

    core.abort_barrier();
    debug!("picam camera loop left");
}

fn apply_frame_duration(dev: &Device, duration_us: i64) {
    let params = v4l::video::capture::Parameters::new(Fraction::new(
        duration_us as u32,
        1_000_000,
    ));
    if let Err(e) = dev.set_params(&params) {
        debug!("set_params({duration_us} us) failed: {e}");
    }
}

fn encoder_fun(core: Arc<CameraCore>, config: PicamConfig, lores_rx: Receiver<Bytes>, flag: Flag) {
    debug!("lores encoder started");
    while flag.alive() {
        let jpeg = match lores_rx.recv_timeout(Duration::from_secs(1)) {
            Ok(jpeg) => jpeg,
            Err(e) if e.is_timeout() => continue,
            Err(_) => break,
        };
        match encode_lores(&config, &jpeg) {
            Ok(lores) => core.stream.publish(lores),
            Err(e) => debug!("lores encode failed: {e}"),
        }
    }
    debug!("lores encoder left");
}

fn encode_lores(config: &PicamConfig, jpeg: &[u8]) -> Result<Bytes> {
    let img = image::load_from_memory(jpeg)?;
    let thumb = img.thumbnail(config.liveview_width, config.liveview_height);
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(
        &mut std::io::Cursor::new(&mut out),
        config.jpeg_quality,
    )
    .encode_image(&thumb)?;
    Ok(Bytes::from(out))
}
