//! Synthetic camera backend.
//!
//! Simulates a sensor whose exposure cadence follows the frame-duration
//! register, which closes the same control loop a real sensor would: the
//! camera thread sleeps for the registered duration, stamps the "exposure"
//! with the monotonic clock plus a configurable bias, and meets the sync
//! thread and controller at the barrier.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info};
use wiggle_config::VirtualCameraConfig;
use wiggle_types::time::monotonic_ns;
use workerlib::{Flag, Worker};

use crate::core::{validate_framerate, CameraCore};
use crate::{CameraBackend, Error, FrameHandle, Result};

struct Generation {
    core: Arc<CameraCore>,
    camera: Worker,
}

pub struct VirtualCameraBackend {
    config: VirtualCameraConfig,
    generation: Mutex<Option<Generation>>,
}

impl VirtualCameraBackend {
    pub fn new(config: VirtualCameraConfig) -> Self {
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
}

impl CameraBackend for VirtualCameraBackend {
    fn start(&self, nominal_fps: u32) -> Result<()> {
        let mut generation = self.generation.lock();
        if generation.is_some() {
            return Ok(());
        }
        validate_framerate(
            nominal_fps,
            self.config.min_fps as f64,
            self.config.max_fps as f64,
        )?;

        let core = CameraCore::new(nominal_fps);
        core.start_controller()?;

        let camera_core = core.clone();
        let config = self.config.clone();
        let camera = Worker::spawn("virtual_camera", move |flag| {
            camera_fun(camera_core, config, flag);
        })
        .map_err(|e| Error::Internal { msg: e.to_string() })?;

        info!("virtual camera started at {nominal_fps} fps");
        *generation = Some(Generation { core, camera });
        Ok(())
    }

    fn stop(&self) {
        // take the generation out before joining so waiters blocked on the
        // lock are not serialized behind the join
        let generation = self.generation.lock().take();
        if let Some(generation) = generation {
            generation.core.shutdown();
            generation.camera.stop();
            debug!("virtual camera stopped");
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

fn camera_fun(core: Arc<CameraCore>, config: VirtualCameraConfig, flag: Flag) {
    debug!("virtual camera loop started");
    let bias_ns = config.phase_bias_us * 1000;
    let mut seq = 0u64;

    while flag.alive() {
        let duration_us = core.frame_duration.load();
        std::thread::sleep(Duration::from_micros(duration_us as u64));
        seq += 1;
        let sensor_ns = monotonic_ns() + bias_ns;

        if core.take_drop_frame() {
            // resync: consume one simulated frame without pairing it
            continue;
        }

        core.aligner.publish_camera(sensor_ns);

        if let Some(request) = core.current_hires_request() {
            match render_jpeg(&config, seq) {
                Ok(jpeg) => {
                    core.publish_hires(FrameHandle::from_jpeg(seq, sensor_ns, jpeg));
                    if let Some(capture_seq) = request.seq {
                        debug!("serviced capture request {capture_seq}");
                    }
                }
                Err(e) => {
                    debug!("hires render failed: {e}");
                    break;
                }
            }
        } else if core.stream.active() {
            match render_jpeg(&config, seq) {
                Ok(jpeg) => core.stream.publish(jpeg),
                Err(e) => {
                    debug!("lores render failed: {e}");
                    break;
                }
            }
        }

        if core.camera_barrier_wait().is_err() {
            debug!("sync barrier broke");
            break;
        }
    }

    core.abort_barrier();
    debug!("virtual camera loop left");
}

/// A flat-colour frame with a strip of noise, so successive frames differ.
fn render_jpeg(config: &VirtualCameraConfig, seq: u64) -> Result<Bytes> {
    let shade = (seq % 200) as u8 + 30;
    let mut img = image::RgbImage::from_pixel(
        config.width,
        config.height,
        image::Rgb([shade, shade / 2, 255 - shade]),
    );
    let mut rng = rand::rng();
    let noise_rows = config.height.min(16);
    for y in 0..noise_rows {
        for x in 0..config.width {
            img.put_pixel(x, y, image::Rgb([rng.random(), rng.random(), rng.random()]));
        }
    }

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut Cursor::new(&mut out), config.jpeg_quality)
        .encode_image(&img)?;
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiggle_types::ImageFormat;

    fn test_config() -> VirtualCameraConfig {
        VirtualCameraConfig {
            width: 64,
            height: 48,
            jpeg_quality: 70,
            min_fps: 2,
            max_fps: 120,
            phase_bias_us: 0,
        }
    }

    fn drive_sync(camera: Arc<VirtualCameraBackend>, period: Duration) -> Worker {
        Worker::spawn("test_sync", move |flag| {
            while flag.alive() {
                if camera.sync_tick(monotonic_ns()).is_err() {
                    break;
                }
                std::thread::sleep(period);
            }
        })
        .unwrap()
    }

    #[test]
    fn rejects_out_of_range_framerate() {
        let camera = VirtualCameraBackend::new(test_config());
        assert!(matches!(
            camera.start(500),
            Err(Error::FramerateOutOfRange { .. })
        ));
        assert!(!camera.alive());
    }

    #[test]
    fn hires_frames_are_valid_jpegs_with_increasing_seq() {
        let camera = Arc::new(VirtualCameraBackend::new(test_config()));
        camera.start(50).unwrap();
        let sync = drive_sync(camera.clone(), Duration::from_millis(20));

        let first = camera.wait_for_hires_frame(Duration::from_secs(2)).unwrap();
        let second = camera.wait_for_hires_frame(Duration::from_secs(2)).unwrap();
        camera.done_hires_frames();
        assert!(second.seq > first.seq);

        let jpeg = camera
            .encode_frame_to_image(&second, ImageFormat::Jpeg)
            .unwrap();
        assert!(image::load_from_memory(&jpeg).is_ok());

        sync.stop();
        camera.stop();
        assert!(!camera.alive());
    }

    #[test]
    fn lores_stream_needs_a_consumer() {
        let camera = Arc::new(VirtualCameraBackend::new(test_config()));
        camera.start(50).unwrap();
        let sync = drive_sync(camera.clone(), Duration::from_millis(20));

        // no consumer registered: nothing is published
        assert!(camera
            .wait_for_lores_image(Duration::from_millis(200))
            .is_err());

        camera.start_stream().unwrap();
        let jpeg = camera.wait_for_lores_image(Duration::from_secs(2)).unwrap();
        assert!(image::load_from_memory(&jpeg).is_ok());
        camera.stop_stream();

        sync.stop();
        camera.stop();
    }

    #[test]
    fn camera_dies_when_sync_stops() {
        let camera = Arc::new(VirtualCameraBackend::new(test_config()));
        camera.start(50).unwrap();
        let sync = drive_sync(camera.clone(), Duration::from_millis(20));
        assert!(camera.alive());

        // no more sync ticks: the barrier times out and both camera-side
        // threads exit
        sync.stop();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while camera.alive() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(!camera.alive());
        camera.stop();
    }
}
