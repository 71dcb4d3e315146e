//! The synchronized acquisition engine.
//!
//! One engine generation runs five threads. The supervisor owns the
//! lifecycle: it waits for a clock, derives the nominal framerate, starts
//! the camera and the device workers, watches liveness, and tears everything
//! down for a clean restart on any degradation. The sync thread forwards
//! each clock timestamp into the camera's rendezvous; trigger-in consumes
//! shutter events; trigger-out (primary only) drives the shared trigger
//! line phase-aligned to the falling clock edge.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use waitcell::WaitFlag;
use wiggle_cam::{BackendItem, CameraBackend, FrameHandle};
use wiggle_io::IoBackend;
use wiggle_types::{EngineState, EngineStateCell, ImageFormat};
use workerlib::{Flag, Worker};

use crate::{Error, Result};

/// Wait budget for a hi-res frame; waiters that miss a notify time out
/// rather than deadlock.
pub const HIRES_TIMEOUT: Duration = Duration::from_secs(2);

const CLOCK_WAIT: Duration = Duration::from_secs(2);
const SYNC_EDGE_WAIT: Duration = Duration::from_secs(1);
const TRIGGER_WAIT: Duration = Duration::from_secs(1);
const CAMERA_START_BACKOFF: Duration = Duration::from_secs(2);
const SUPERVISOR_TICK: Duration = Duration::from_secs(1);
const LORES_TIMEOUT: Duration = Duration::from_secs(2);

pub struct EngineOptions {
    /// This node drives the clock and trigger wires.
    pub primary: bool,
    /// When set, a trigger-in event directly captures one frame into this
    /// directory instead of raising the job flag.
    pub standalone_dir: Option<PathBuf>,
}

pub struct AcquisitionEngine {
    io: Arc<dyn IoBackend>,
    camera: Arc<dyn CameraBackend>,
    state: Arc<EngineStateCell>,
    trigger_job: Arc<WaitFlag>,
    trigger_out_requested: Arc<WaitFlag>,
    options: EngineOptions,
    supervisor: Mutex<Option<Worker>>,
}

impl AcquisitionEngine {
    pub fn new(
        io: Arc<dyn IoBackend>,
        camera: Arc<dyn CameraBackend>,
        options: EngineOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            io,
            camera,
            state: Arc::new(EngineStateCell::default()),
            trigger_job: Arc::new(WaitFlag::new()),
            trigger_out_requested: Arc::new(WaitFlag::new()),
            options,
            supervisor: Mutex::new(None),
        })
    }

    /// Start the io backend and the supervisor; returns immediately.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_some() {
            return Ok(());
        }
        self.io.start()?;

        let engine = self.clone();
        let worker = Worker::spawn("supervisor", move |flag| {
            engine.supervisor_fun(flag);
        })
        .map_err(|e| Error::Internal { msg: e.to_string() })?;
        *supervisor = Some(worker);
        Ok(())
    }

    /// Stop all threads, then the backends. Safe to call twice.
    pub fn stop(&self) {
        let supervisor = self.supervisor.lock().take();
        if let Some(worker) = supervisor {
            worker.stop();
        }
        self.camera.stop();
        self.io.stop();
        self.state.set(EngineState::Stopped);
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    pub fn is_healthy(&self) -> bool {
        self.state.get() == EngineState::Running
    }

    /// Request a shutter pulse. Valid only on the primary node.
    pub fn trigger_execute_job(&self) -> Result<()> {
        if !self.options.primary {
            return Err(Error::TriggerNotPrimary);
        }
        self.trigger_out_requested.set();
        Ok(())
    }

    /// Consumed by the job processor; true when a trigger fired. The flag is
    /// cleared on observation so one edge executes one job.
    pub fn wait_for_trigger_job(&self, timeout: Duration) -> bool {
        self.trigger_job.take(timeout)
    }

    /// Discard a stale trigger so a newly set-up job is not executed by an
    /// edge from the past.
    pub fn clear_trigger_job(&self) {
        self.trigger_job.clear();
    }

    pub fn wait_for_hires_frame(&self) -> Result<FrameHandle> {
        Ok(self.camera.wait_for_hires_frame(HIRES_TIMEOUT)?)
    }

    pub fn done_hires_frames(&self) {
        self.camera.done_hires_frames();
    }

    pub fn encode_frame_to_image(&self, frame: &FrameHandle, format: ImageFormat) -> Result<Bytes> {
        Ok(self.camera.encode_frame_to_image(frame, format)?)
    }

    pub fn wait_for_hires_image(&self, format: ImageFormat) -> Result<Bytes> {
        Ok(self.camera.wait_for_hires_image(format, HIRES_TIMEOUT)?)
    }

    /// Begin a lo-res stream and return the chunk iterator. Each call is an
    /// independent consumer of the same broadcast frames.
    pub fn gen_stream(&self) -> Result<MjpegStream> {
        info!("livestream requested");
        self.camera.start_stream()?;
        Ok(MjpegStream {
            camera: self.camera.clone(),
            state: self.state.clone(),
            open: true,
        })
    }

    // ----- supervisor -----

    fn supervisor_fun(self: &Arc<Self>, flag: Flag) {
        info!("supervisor started, waiting for clock before starting device");

        while flag.alive() {
            self.state.set(EngineState::WaitingForClock);

            match self.io.wait_for_clock_rise(CLOCK_WAIT) {
                Ok(_) => info!("clock signal received, continuing"),
                Err(_) => continue,
            }

            self.state.set(EngineState::DerivingFramerate);
            let fps = match self.io.derive_nominal_framerate_from_clock() {
                Ok(fps) => {
                    info!("derived nominal framerate: {fps} fps");
                    fps
                }
                Err(e) => {
                    error!("error deriving framerate: {e}");
                    continue;
                }
            };

            if let Err(e) = self.camera.start(fps) {
                error!("error starting camera: {e}");
                self.camera.stop();
                std::thread::sleep(CAMERA_START_BACKOFF);
                continue;
            }

            let workers = match self.start_device_workers() {
                Ok(workers) => workers,
                Err(e) => {
                    error!("error starting device workers: {e}");
                    self.camera.stop();
                    std::thread::sleep(CAMERA_START_BACKOFF);
                    continue;
                }
            };

            self.state.set(EngineState::Running);
            info!("device started");

            while flag.alive() {
                std::thread::sleep(SUPERVISOR_TICK);
                if !self.camera.alive() {
                    warn!("camera no longer alive");
                    break;
                }
                if !self.io.clock_signal_valid() {
                    warn!("clock signal lost");
                    break;
                }
                if !workers.all_alive() {
                    warn!("device worker exited");
                    break;
                }
            }

            if flag.alive() {
                self.state.set(EngineState::Degraded);
            }
            workers.stop_all();
            self.camera.stop();
        }

        self.camera.stop();
        self.state.set(EngineState::Stopped);
        info!("supervisor left");
    }

    fn start_device_workers(self: &Arc<Self>) -> Result<DeviceWorkers> {
        let spawn_err = |e: workerlib::SpawnError| Error::Internal { msg: e.to_string() };

        let engine = self.clone();
        let sync = Worker::spawn("sync", move |flag| engine.sync_fun(flag)).map_err(spawn_err)?;

        let engine = self.clone();
        let trigger_in =
            Worker::spawn("trigger_in", move |flag| engine.trigger_in_fun(flag))
                .map_err(spawn_err)?;

        let trigger_out = if self.options.primary {
            let engine = self.clone();
            Some(
                Worker::spawn("trigger_out", move |flag| engine.trigger_out_fun(flag))
                    .map_err(spawn_err)?,
            )
        } else {
            None
        };

        Ok(DeviceWorkers {
            sync,
            trigger_in,
            trigger_out,
        })
    }

    // ----- device worker loops -----

    fn sync_fun(&self, flag: Flag) {
        debug!("sync thread started");
        while flag.alive() {
            let timestamp_ns = match self.io.wait_for_clock_rise(SYNC_EDGE_WAIT) {
                Ok(ts) => ts,
                Err(_) => {
                    error!("clock signal missing");
                    break;
                }
            };
            if self.camera.sync_tick(timestamp_ns).is_err() {
                debug!("sync barrier broke");
                break;
            }
        }
        debug!("sync thread left");
    }

    fn trigger_in_fun(&self, flag: Flag) {
        debug!("trigger_in thread started");
        while flag.alive() {
            if self.io.wait_for_trigger(TRIGGER_WAIT).is_err() {
                continue;
            }
            match &self.options.standalone_dir {
                None => self.trigger_job.set(),
                Some(dir) => match self.standalone_capture(dir) {
                    Ok(item) => info!("image saved to {}", item.filepath.display()),
                    Err(e) => warn!("standalone capture failed: {e}"),
                },
            }
        }
        debug!("trigger_in thread left");
    }

    fn standalone_capture(&self, dir: &std::path::Path) -> Result<BackendItem> {
        let frame = self.camera.wait_for_hires_frame(HIRES_TIMEOUT)?;
        self.camera.done_hires_frames();
        let jpeg = self.camera.encode_frame_to_image(&frame, ImageFormat::Jpeg)?;
        let filename = format!(
            "img_{}.jpg",
            frame.captured_at.format("%Y%m%d-%H%M%S-%6f")
        );
        let filepath = dir.join(filename);
        std::fs::write(&filepath, &jpeg)?;
        Ok(BackendItem { filepath })
    }

    fn trigger_out_fun(&self, flag: Flag) {
        debug!("trigger_out thread started");
        while flag.alive() {
            if !self.trigger_out_requested.take(TRIGGER_WAIT) {
                continue;
            }
            info!("driving trigger line to execute job");

            // the falling edge is the phase midpoint: rising-edge cameras
            // get half a cycle to arm before the next exposure
            if self.io.wait_for_clock_fall(SYNC_EDGE_WAIT).is_err() {
                error!("clock signal missing");
                break;
            }
            if let Err(e) = self.io.set_trigger_out(true) {
                error!("trigger line error: {e}");
                break;
            }
            if self.io.wait_for_clock_fall(SYNC_EDGE_WAIT).is_err() {
                let _ = self.io.set_trigger_out(false);
                error!("clock signal missing");
                break;
            }
            if let Err(e) = self.io.set_trigger_out(false) {
                error!("trigger line error: {e}");
                break;
            }
        }
        debug!("trigger_out thread left");
    }
}

struct DeviceWorkers {
    sync: Worker,
    trigger_in: Worker,
    trigger_out: Option<Worker>,
}

impl DeviceWorkers {
    fn all_alive(&self) -> bool {
        self.sync.is_alive()
            && self.trigger_in.is_alive()
            && self.trigger_out.as_ref().map(|w| w.is_alive()).unwrap_or(true)
    }

    fn stop_all(self) {
        // signal everything first so the joins overlap the exits
        self.sync.signal_stop();
        self.trigger_in.signal_stop();
        if let Some(w) = &self.trigger_out {
            w.signal_stop();
        }
        self.sync.stop();
        self.trigger_in.stop();
        if let Some(w) = self.trigger_out {
            w.stop();
        }
    }
}

/// Lazy sequence of multipart JPEG chunks for one stream consumer.
pub struct MjpegStream {
    camera: Arc<dyn CameraBackend>,
    state: Arc<EngineStateCell>,
    open: bool,
}

impl MjpegStream {
    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.camera.stop_stream();
        }
    }
}

impl Iterator for MjpegStream {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.open {
            return None;
        }
        if self.state.get() != EngineState::Running {
            debug!("stream ends, engine not running");
            self.close();
            return None;
        }
        match self.camera.wait_for_lores_image(LORES_TIMEOUT) {
            Ok(jpeg) => Some(Ok(frame_chunk(&jpeg))),
            Err(e) => {
                warn!("streaming error: {e}");
                self.close();
                Some(Err(e.into()))
            }
        }
    }
}

impl Drop for MjpegStream {
    fn drop(&mut self) {
        self.close();
    }
}

fn frame_chunk(jpeg: &[u8]) -> Bytes {
    const HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
    const TRAILER: &[u8] = b"\r\n\r\n";
    let mut chunk = BytesMut::with_capacity(HEADER.len() + jpeg.len() + TRAILER.len());
    chunk.put_slice(HEADER);
    chunk.put_slice(jpeg);
    chunk.put_slice(TRAILER);
    chunk.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_chunk_framing_is_exact() {
        let chunk = frame_chunk(b"JPEGDATA");
        assert_eq!(
            &chunk[..],
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\nJPEGDATA\r\n\r\n"
        );
    }
}
