//! N-party rendezvous barrier with a release action and cooperative abort.
//!
//! The standard library barrier has neither an abort nor a way to run code at
//! the release point, both of which the acquisition engine relies on: the
//! release action snapshots the timestamp pair while all participants are
//! still parked, and an abort (or a timed-out wait) must wake every
//! participant with [`BarrierBroken`] so their loops can exit.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Returned once any participant aborted the barrier or timed out in
/// [`ActionBarrier::wait_timeout`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("barrier broken")]
pub struct BarrierBroken;

struct BarrierState {
    waiting: usize,
    generation: u64,
    broken: bool,
}

pub struct ActionBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    condvar: Condvar,
    action: Box<dyn Fn() + Send + Sync>,
}

impl ActionBarrier {
    /// Barrier for `parties` participants. `action` runs exactly once per
    /// release, on the thread of the last participant to arrive, before any
    /// participant is woken.
    pub fn new<F>(parties: usize, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        assert!(parties > 0);
        Self {
            parties,
            state: Mutex::new(BarrierState {
                waiting: 0,
                generation: 0,
                broken: false,
            }),
            condvar: Condvar::new(),
            action: Box::new(action),
        }
    }

    /// Rendezvous with the other participants.
    ///
    /// A timeout breaks the barrier for everyone: a participant that stopped
    /// arriving means the cohort can never be whole again within this
    /// generation, and the others must find out.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), BarrierBroken> {
        let mut state = self.state.lock();
        if state.broken {
            return Err(BarrierBroken);
        }

        state.waiting += 1;
        if state.waiting == self.parties {
            state.waiting = 0;
            state.generation = state.generation.wrapping_add(1);
            (self.action)();
            drop(state);
            self.condvar.notify_all();
            return Ok(());
        }

        let entered_at = state.generation;
        while state.generation == entered_at && !state.broken {
            if self.condvar.wait_for(&mut state, timeout).timed_out() {
                state.broken = true;
                state.waiting = 0;
                drop(state);
                self.condvar.notify_all();
                return Err(BarrierBroken);
            }
        }

        if state.broken {
            Err(BarrierBroken)
        } else {
            Ok(())
        }
    }

    /// Break the barrier; all current and future waiters observe
    /// [`BarrierBroken`].
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.broken = true;
        state.waiting = 0;
        drop(state);
        self.condvar.notify_all();
    }

    pub fn is_broken(&self) -> bool {
        self.state.lock().broken
    }
}

fn _test_barrier_is_send() {
    // Compile-time test to ensure ActionBarrier implements Send+Sync traits.
    fn implements<T: Send + Sync>() {}
    implements::<ActionBarrier>();
}
