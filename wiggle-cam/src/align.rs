//! Pairing of clock and sensor timestamps, and the feedback law that locks
//! the sensor to the clock.

use std::sync::atomic::{AtomicI64, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

/// Cycles between corrections. The sensor integrates a frame-duration change
/// over the following frames, so the controller stays quiescent in between
/// to let it settle.
pub const ADJUST_EVERY_CYCLES: u32 = 10;

/// Immutable snapshot of one cycle's timestamp pair, produced by the barrier
/// release action and the only datum the controller reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlignTimestampSet {
    pub reference_ns: i64,
    pub camera_ns: i64,
}

impl AlignTimestampSet {
    /// Signed phase error; positive means the sensor runs ahead of the
    /// clock.
    pub fn delta_ns(&self) -> i64 {
        self.camera_ns - self.reference_ns
    }
}

/// Collects the two halves of a [`AlignTimestampSet`].
///
/// The reference side is a single-producer single-consumer slot of depth
/// one: the sync thread publishes, the barrier action consumes, and a late
/// consumer costs the oldest value, never a blocked producer. The camera
/// side is a plain atomic because the camera thread is its only writer.
pub struct TimestampAligner {
    reference_tx: Sender<i64>,
    reference_rx: Receiver<i64>,
    last_reference_ns: AtomicI64,
    camera_ns: AtomicI64,
    snapshot: Mutex<AlignTimestampSet>,
}

impl TimestampAligner {
    pub fn new() -> Self {
        let (reference_tx, reference_rx) = bounded(1);
        Self {
            reference_tx,
            reference_rx,
            last_reference_ns: AtomicI64::new(0),
            camera_ns: AtomicI64::new(0),
            snapshot: Mutex::new(AlignTimestampSet::default()),
        }
    }

    /// Publish the clock timestamp for the current cycle, dropping the
    /// oldest value when the consumer is late.
    pub fn publish_reference(&self, reference_ns: i64) {
        if self.reference_tx.try_send(reference_ns).is_err() {
            let _ = self.reference_rx.try_recv();
            let _ = self.reference_tx.try_send(reference_ns);
        }
    }

    /// Publish the sensor timestamp for the current cycle.
    pub fn publish_camera(&self, camera_ns: i64) {
        self.camera_ns.store(camera_ns, Ordering::Release);
    }

    /// Discard one queued reference timestamp (camera running ahead).
    pub fn drain_reference(&self) {
        let _ = self.reference_rx.try_recv();
    }

    /// Barrier release action: freeze both halves into the snapshot.
    pub fn snapshot_now(&self) {
        let reference_ns = match self.reference_rx.try_recv() {
            Ok(ts) => {
                self.last_reference_ns.store(ts, Ordering::Release);
                ts
            }
            // producer skipped a cycle; reuse the previous value
            Err(_) => self.last_reference_ns.load(Ordering::Acquire),
        };
        let camera_ns = self.camera_ns.load(Ordering::Acquire);
        *self.snapshot.lock() = AlignTimestampSet {
            reference_ns,
            camera_ns,
        };
    }

    pub fn latest(&self) -> AlignTimestampSet {
        *self.snapshot.lock()
    }
}

impl Default for TimestampAligner {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared per-frame frame-duration register, clamped on store.
///
/// The controller writes, the camera thread reads between cycles and pushes
/// the value into the sensor.
pub struct FrameDurationRegister {
    nominal_us: i64,
    value_us: AtomicI64,
}

impl FrameDurationRegister {
    pub fn new(nominal_us: i64) -> Self {
        Self {
            nominal_us,
            value_us: AtomicI64::new(nominal_us),
        }
    }

    pub fn store(&self, duration_us: i64) {
        let lo = self.nominal_us / 10;
        let hi = self.nominal_us * 19 / 10;
        self.value_us
            .store(duration_us.clamp(lo, hi), Ordering::Release);
    }

    pub fn load(&self) -> i64 {
        self.value_us.load(Ordering::Acquire)
    }

    pub fn nominal_us(&self) -> i64 {
        self.nominal_us
    }
}

/// Outcome of one controller cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adjustment {
    /// Register value for the next frame.
    pub frame_duration_us: i64,
    /// Applied correction; zero on quiescent cycles.
    pub adjust_us: i64,
}

/// Single-sample proportional controller on the frame-duration register.
///
/// The sensor is a first-order accumulator of frame-duration error, so one
/// clamped correction every [`ADJUST_EVERY_CYCLES`] cycles is enough;
/// correcting more often drives oscillation.
pub struct PhaseController {
    nominal_duration_us: i64,
    adjust_every: u32,
    cycles_since_adjust: u32,
}

impl PhaseController {
    pub fn new(nominal_fps: u32) -> Self {
        Self {
            nominal_duration_us: 1_000_000 / nominal_fps as i64,
            adjust_every: ADJUST_EVERY_CYCLES,
            cycles_since_adjust: 0,
        }
    }

    pub fn nominal_duration_us(&self) -> i64 {
        self.nominal_duration_us
    }

    /// Correction for a phase error, clamped to ±0.9 of the nominal frame
    /// duration.
    pub fn clamped_adjust_us(&self, delta_ns: i64) -> i64 {
        let limit = self.nominal_duration_us * 9 / 10;
        (-delta_ns / 1000).clamp(-limit, limit)
    }

    /// Advance one cycle and return the register value to apply.
    pub fn update(&mut self, delta_ns: i64) -> Adjustment {
        self.cycles_since_adjust += 1;
        if self.cycles_since_adjust >= self.adjust_every {
            self.cycles_since_adjust = 0;
            let adjust_us = self.clamped_adjust_us(delta_ns);
            Adjustment {
                frame_duration_us: self.nominal_duration_us + adjust_us,
                adjust_us,
            }
        } else {
            Adjustment {
                frame_duration_us: self.nominal_duration_us,
                adjust_us: 0,
            }
        }
    }

    /// Restart the settle window without applying a correction. Used after a
    /// hi-res capture and after a resync, both of which perturb the sensor.
    pub fn hold(&mut self) {
        self.cycles_since_adjust = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjust_is_clamped_to_ninety_percent() {
        let ctl = PhaseController::new(10); // T = 100_000 us
        let limit = 90_000;
        for delta_ns in [
            i64::MIN + 1,
            -10_000_000_000,
            -100_000_000,
            -1,
            0,
            1,
            5_000_000,
            100_000_000,
            10_000_000_000,
            i64::MAX,
        ] {
            let adjust = ctl.clamped_adjust_us(delta_ns);
            assert!(
                (-limit..=limit).contains(&adjust),
                "delta {delta_ns} produced {adjust}"
            );
        }
    }

    #[test]
    fn exactly_ten_adjustments_per_hundred_cycles() {
        let mut ctl = PhaseController::new(10);
        let mut adjusted = Vec::new();
        for cycle in 1..=100u32 {
            // constant nonzero phase error every cycle
            if ctl.update(3_000_000).adjust_us != 0 {
                adjusted.push(cycle);
            }
        }
        assert_eq!(adjusted, vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
    }

    #[test]
    fn hold_restarts_the_settle_window() {
        let mut ctl = PhaseController::new(10);
        for _ in 0..9 {
            assert_eq!(ctl.update(1_000_000).adjust_us, 0);
        }
        ctl.hold();
        // nine more quiescent cycles before the postponed correction
        for _ in 0..9 {
            assert_eq!(ctl.update(1_000_000).adjust_us, 0);
        }
        assert_ne!(ctl.update(1_000_000).adjust_us, 0);
    }

    #[test]
    fn closed_loop_removes_systematic_bias() {
        // Plant model: the sensor's next timestamp advances by exactly the
        // applied frame duration, the clock by the nominal period. A +5 ms
        // initial bias must shrink below 1 ms within 100 cycles, with
        // corrections only at cycles 10, 20, 30, ...
        let nominal_period_ns = 100_000_000i64;
        let mut ctl = PhaseController::new(10);
        let mut reference_ns = 0i64;
        let mut camera_ns = 5_000_000i64;
        let mut adjust_cycles = Vec::new();
        let mut final_delta = i64::MAX;

        for cycle in 1..=110u32 {
            let delta_ns = camera_ns - reference_ns;
            let adjustment = ctl.update(delta_ns);
            if adjustment.adjust_us != 0 {
                adjust_cycles.push(cycle);
            }
            reference_ns += nominal_period_ns;
            camera_ns += adjustment.frame_duration_us * 1000;
            if cycle >= 100 {
                final_delta = (camera_ns - reference_ns).abs();
            }
        }

        assert!(final_delta <= 1_000_000, "residual delta {final_delta} ns");
        assert!(adjust_cycles.contains(&10));
        assert!(adjust_cycles.iter().all(|c| c % 10 == 0));
    }

    #[test]
    fn register_clamps_to_duration_bounds() {
        let register = FrameDurationRegister::new(100_000);
        register.store(5_000);
        assert_eq!(register.load(), 10_000);
        register.store(1_000_000);
        assert_eq!(register.load(), 190_000);
        register.store(123_456);
        assert_eq!(register.load(), 123_456);
    }

    #[test]
    fn aligner_drops_oldest_reference() {
        let aligner = TimestampAligner::new();
        aligner.publish_reference(100);
        aligner.publish_reference(200); // consumer late; 100 is dropped
        aligner.publish_camera(250);
        aligner.snapshot_now();
        assert_eq!(
            aligner.latest(),
            AlignTimestampSet {
                reference_ns: 200,
                camera_ns: 250
            }
        );
    }

    #[test]
    fn snapshot_reuses_reference_when_producer_skipped() {
        let aligner = TimestampAligner::new();
        aligner.publish_reference(100);
        aligner.publish_camera(110);
        aligner.snapshot_now();
        aligner.publish_camera(210);
        aligner.snapshot_now();
        assert_eq!(
            aligner.latest(),
            AlignTimestampSet {
                reference_ns: 100,
                camera_ns: 210
            }
        );
    }
}
