//! Clock, trigger and shutter-line plumbing.
//!
//! An [`IoBackend`] owns the physical (or synthesized) clock and trigger
//! wires. A single edge-reader thread converts edge events into
//! notifications on three independent condvar-backed cells; consumers block
//! on exactly the edge they care about.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tracing::debug;
use waitcell::{WaitCell, WaitFlag};
use wiggle_types::time::monotonic_ns;

pub mod registry;
pub mod virtual_io;

#[cfg(target_os = "linux")]
pub mod gpio;

pub use registry::{create_io_backend, IoBackendKind};
pub use virtual_io::VirtualIoBackend;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("timeout waiting for edge")]
    Timeout,
    #[error("no clock signal present")]
    ClockAbsent,
    #[error("hardware unavailable: {msg}")]
    HardwareUnavailable { msg: String },
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

/// How long a missing rising edge is tolerated before the clock is
/// considered gone.
const CLOCK_VALID_WINDOW: Duration = Duration::from_millis(500);

/// Per-edge wait budget during framerate derivation.
const DERIVE_EDGE_TIMEOUT: Duration = Duration::from_secs(1);

/// Rising edges observed to derive the nominal framerate (5 intervals).
pub const DERIVE_EDGE_COUNT: usize = 6;

/// Contract between the acquisition engine and the wire hardware.
pub trait IoBackend: Send + Sync {
    /// Acquire hardware resources and begin edge delivery. On a primary node
    /// this also starts the outbound clock pulse train.
    fn start(&self) -> Result<()>;

    /// Release hardware. Idempotent.
    fn stop(&self);

    /// Block until [`DERIVE_EDGE_COUNT`] rising edges were observed and
    /// return the rounded framerate. Fails with [`Error::ClockAbsent`] when
    /// any single edge wait exceeds one second.
    fn derive_nominal_framerate_from_clock(&self) -> Result<u32>;

    /// Kernel-side monotonic timestamp of the next rising clock edge.
    fn wait_for_clock_rise(&self, timeout: Duration) -> Result<i64>;

    fn wait_for_clock_fall(&self, timeout: Duration) -> Result<()>;

    /// Next rising edge on the trigger line. No timestamp; the clock, not
    /// the trigger, carries timing.
    fn wait_for_trigger(&self, timeout: Duration) -> Result<()>;

    /// Drive the outbound trigger line.
    fn set_trigger_out(&self, on: bool) -> Result<()>;

    /// True iff a rising clock edge arrived within the last 0.5 s.
    fn clock_signal_valid(&self) -> bool;
}

/// The three edge notification cells every backend feeds.
///
/// Rising-edge notifications carry the timestamp; falling-edge and trigger
/// notifications do not. Clock edges are broadcast (a consumer that misses
/// one catches the next), but a trigger edge latches until consumed: a
/// shutter event between two waits must not be lost.
pub struct EdgeSignals {
    rise: WaitCell<i64>,
    fall: WaitCell<()>,
    trigger: WaitFlag,
    last_rise_ns: AtomicI64,
}

impl EdgeSignals {
    pub fn new() -> Self {
        Self {
            rise: WaitCell::new(),
            fall: WaitCell::new(),
            trigger: WaitFlag::new(),
            last_rise_ns: AtomicI64::new(i64::MIN),
        }
    }

    pub fn notify_rise(&self, timestamp_ns: i64) {
        self.last_rise_ns.store(timestamp_ns, Ordering::Release);
        self.rise.set(timestamp_ns);
    }

    pub fn notify_fall(&self) {
        self.fall.set(());
    }

    pub fn notify_trigger(&self) {
        self.trigger.set();
    }

    pub fn wait_rise(&self, timeout: Duration) -> Result<i64> {
        self.rise.wait_next(timeout).map_err(|_| Error::Timeout)
    }

    pub fn wait_fall(&self, timeout: Duration) -> Result<()> {
        self.fall.wait_next(timeout).map_err(|_| Error::Timeout)
    }

    pub fn wait_trigger(&self, timeout: Duration) -> Result<()> {
        if self.trigger.take(timeout) {
            Ok(())
        } else {
            Err(Error::Timeout)
        }
    }

    pub fn clock_signal_valid(&self) -> bool {
        let last = self.last_rise_ns.load(Ordering::Acquire);
        if last == i64::MIN {
            return false;
        }
        monotonic_ns().saturating_sub(last) < CLOCK_VALID_WINDOW.as_nanos() as i64
    }
}

impl Default for EdgeSignals {
    fn default() -> Self {
        Self::new()
    }
}

/// Observe [`DERIVE_EDGE_COUNT`] rising edges and reduce them to a
/// framerate.
pub fn derive_framerate(signals: &EdgeSignals) -> Result<u32> {
    let mut edges = [0i64; DERIVE_EDGE_COUNT];
    for slot in edges.iter_mut() {
        *slot = signals
            .wait_rise(DERIVE_EDGE_TIMEOUT)
            .map_err(|_| Error::ClockAbsent)?;
    }
    let fps = fps_from_edges(&edges)?;
    debug!("derived {fps} fps from {DERIVE_EDGE_COUNT} clock edges");
    Ok(fps)
}

/// Round-trip a monotonic edge sequence to an integer framerate.
pub fn fps_from_edges(edges: &[i64]) -> Result<u32> {
    if edges.len() < 2 {
        return Err(Error::ClockAbsent);
    }
    let intervals = (edges.len() - 1) as f64;
    let total_ns = edges[edges.len() - 1].saturating_sub(edges[0]);
    if total_ns <= 0 {
        return Err(Error::ClockAbsent);
    }
    let fps = intervals * 1e9 / total_ns as f64;
    Ok(fps.round() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges_with_period(period_ns: i64, count: usize) -> Vec<i64> {
        (0..count as i64).map(|k| k * period_ns).collect()
    }

    #[test]
    fn fps_matches_round_inverse_period() {
        for fps in [1u32, 5, 9, 10, 24, 30, 60] {
            let period_ns = 1_000_000_000 / fps as i64;
            let edges = edges_with_period(period_ns, DERIVE_EDGE_COUNT);
            assert_eq!(fps_from_edges(&edges).unwrap(), fps);
        }
    }

    #[test]
    fn fps_tolerates_five_percent_jitter() {
        // Alternate +5%/-5% per-sample jitter around a 10 fps period; the
        // derived value must stay within 1 fps.
        let period_ns = 100_000_000i64;
        let mut edges = Vec::new();
        let mut t = 0i64;
        for k in 0..DERIVE_EDGE_COUNT {
            let sign = if k % 2 == 0 { 1 } else { -1 };
            edges.push(t + sign * period_ns / 20);
            t += period_ns;
        }
        let fps = fps_from_edges(&edges).unwrap();
        assert!((9..=11).contains(&fps), "derived {fps} fps");
    }

    #[test]
    fn too_few_edges_is_clock_absent() {
        assert!(matches!(fps_from_edges(&[0]), Err(Error::ClockAbsent)));
    }

    #[test]
    fn clock_validity_decays() {
        let signals = EdgeSignals::new();
        assert!(!signals.clock_signal_valid());
        signals.notify_rise(monotonic_ns());
        assert!(signals.clock_signal_valid());
        signals
            .last_rise_ns
            .store(monotonic_ns() - 600_000_000, Ordering::Release);
        assert!(!signals.clock_signal_valid());
    }
}
