//! Synthesized clock and trigger edges for nodes without wires attached.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};
use wiggle_config::VirtualIoConfig;
use wiggle_types::time::monotonic_ns;
use workerlib::Worker;

use crate::{EdgeSignals, Error, IoBackend, Result};

/// In-process [`IoBackend`] producing a square wave at the configured
/// nominal framerate. `set_trigger_out` is short-circuited directly into
/// trigger-in, which makes a single node behave like a one-node cluster.
pub struct VirtualIoBackend {
    config: VirtualIoConfig,
    signals: Arc<EdgeSignals>,
    clock_enabled: Arc<AtomicBool>,
    edge_worker: Mutex<Option<Worker>>,
}

impl VirtualIoBackend {
    pub fn new(config: VirtualIoConfig) -> Self {
        let clock_enabled = Arc::new(AtomicBool::new(config.enable_clock));
        Self {
            config,
            signals: Arc::new(EdgeSignals::new()),
            clock_enabled,
            edge_worker: Mutex::new(None),
        }
    }

    /// Pause or resume the synthetic clock. With the clock paused the engine
    /// must fall back to waiting-for-clock, which is exactly what the
    /// clock-loss tests exercise.
    pub fn set_clock_enabled(&self, enabled: bool) {
        self.clock_enabled.store(enabled, Ordering::SeqCst);
    }
}

impl IoBackend for VirtualIoBackend {
    fn start(&self) -> Result<()> {
        let mut guard = self.edge_worker.lock();
        if guard.is_some() {
            return Ok(());
        }

        let signals = self.signals.clone();
        let clock_enabled = self.clock_enabled.clone();
        let half_period = Duration::from_secs_f64(0.5 / self.config.fps_nominal as f64);
        info!(
            "virtual clock at {} fps (half period {:?})",
            self.config.fps_nominal, half_period
        );

        let worker = Worker::spawn("virtual_io_edges", move |flag| {
            debug!("virtual edge generator started");
            while flag.alive() {
                if !clock_enabled.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(50));
                    continue;
                }
                std::thread::sleep(half_period);
                signals.notify_rise(monotonic_ns());
                std::thread::sleep(half_period);
                signals.notify_fall();
            }
            debug!("virtual edge generator left");
        })
        .map_err(|e| Error::HardwareUnavailable { msg: e.to_string() })?;

        *guard = Some(worker);
        Ok(())
    }

    fn stop(&self) {
        if let Some(worker) = self.edge_worker.lock().take() {
            worker.stop();
        }
    }

    fn derive_nominal_framerate_from_clock(&self) -> Result<u32> {
        // The synthetic clock is software-timed and jittery, so measuring it
        // would wobble around the configured rate. Confirm the clock is
        // actually ticking, then report the configured value.
        self.signals
            .wait_rise(Duration::from_secs(1))
            .map_err(|_| Error::ClockAbsent)?;
        Ok(self.config.fps_nominal)
    }

    fn wait_for_clock_rise(&self, timeout: Duration) -> Result<i64> {
        self.signals.wait_rise(timeout)
    }

    fn wait_for_clock_fall(&self, timeout: Duration) -> Result<()> {
        self.signals.wait_fall(timeout)
    }

    fn wait_for_trigger(&self, timeout: Duration) -> Result<()> {
        self.signals.wait_trigger(timeout)
    }

    fn set_trigger_out(&self, on: bool) -> Result<()> {
        if on {
            self.signals.notify_trigger();
            debug!("forwarded trigger_out to trigger_in");
        }
        Ok(())
    }

    fn clock_signal_valid(&self) -> bool {
        self.signals.clock_signal_valid()
    }
}
