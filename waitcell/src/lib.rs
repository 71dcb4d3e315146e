//! Condvar-backed event primitives shared by the io and camera backends.
//!
//! [`WaitCell`] broadcasts the latest published value to any number of
//! waiters, [`WaitFlag`] is a one-shot "something happened" latch. Both wrap
//! a [`parking_lot`] mutex/condvar pair so that every wait carries a timeout.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("timed out waiting for value")]
pub struct WaitTimeout;

struct CellState<T> {
    generation: u64,
    value: Option<T>,
}

/// Latest-value cell with condvar broadcast.
///
/// Producers overwrite the stored value on every [`WaitCell::set`]; consumers
/// block for the *next* publish, so a slow consumer never sees the same
/// notification twice but may skip intermediate values.
pub struct WaitCell<T> {
    state: Mutex<CellState<T>>,
    condvar: Condvar,
}

impl<T: Clone> WaitCell<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CellState {
                generation: 0,
                value: None,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Store `value` and wake all waiters.
    pub fn set(&self, value: T) {
        let mut state = self.state.lock();
        state.generation = state.generation.wrapping_add(1);
        state.value = Some(value);
        drop(state);
        self.condvar.notify_all();
    }

    /// Block until the next [`WaitCell::set`] after this call, then return
    /// the published value.
    pub fn wait_next(&self, timeout: Duration) -> Result<T, WaitTimeout> {
        let mut state = self.state.lock();
        let entered_at = state.generation;
        while state.generation == entered_at {
            if self.condvar.wait_for(&mut state, timeout).timed_out() {
                return Err(WaitTimeout);
            }
        }
        // generation changed, so a value has been stored at least once
        Ok(state.value.clone().unwrap())
    }

    /// The most recently published value, if any.
    pub fn latest(&self) -> Option<T> {
        self.state.lock().value.clone()
    }
}

impl<T: Clone> Default for WaitCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn _test_wait_cell_is_send() {
    // Compile-time test to ensure WaitCell implements Send+Sync traits.
    fn implements<T: Send + Sync>() {}
    implements::<WaitCell<Vec<u8>>>();
}

/// Waitable boolean latch.
///
/// Mirrors the semantics of a manual-reset event: [`WaitFlag::set`] wakes all
/// waiters and leaves the flag raised until somebody clears it.
/// [`WaitFlag::take`] additionally clears on observation, which is the shape
/// every single-consumer trigger flag in the engine wants.
pub struct WaitFlag {
    state: Mutex<bool>,
    condvar: Condvar,
}

impl WaitFlag {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut raised = self.state.lock();
        *raised = true;
        drop(raised);
        self.condvar.notify_all();
    }

    pub fn clear(&self) {
        *self.state.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock()
    }

    /// Wait until the flag is raised or `timeout` expires. The flag stays
    /// raised.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut raised = self.state.lock();
        while !*raised {
            if self.condvar.wait_for(&mut raised, timeout).timed_out() {
                return *raised;
            }
        }
        true
    }

    /// Wait like [`WaitFlag::wait`] but clear the flag atomically on
    /// observation so the event fires exactly once.
    pub fn take(&self, timeout: Duration) -> bool {
        let mut raised = self.state.lock();
        while !*raised {
            if self.condvar.wait_for(&mut raised, timeout).timed_out() {
                break;
            }
        }
        let was_raised = *raised;
        *raised = false;
        was_raised
    }
}

impl Default for WaitFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn wait_next_sees_fresh_value_only() {
        let cell = Arc::new(WaitCell::new());
        cell.set(1u32);

        // A waiter entering after the publish must not be satisfied by the
        // stale value.
        let cell2 = cell.clone();
        let waiter = std::thread::spawn(move || cell2.wait_next(Duration::from_secs(2)));
        std::thread::sleep(Duration::from_millis(50));
        cell.set(2u32);
        assert_eq!(waiter.join().unwrap(), Ok(2));
        assert_eq!(cell.latest(), Some(2));
    }

    #[test]
    fn wait_next_times_out_without_publish() {
        let cell: WaitCell<u8> = WaitCell::new();
        assert_eq!(
            cell.wait_next(Duration::from_millis(20)),
            Err(WaitTimeout)
        );
    }

    #[test]
    fn flag_take_clears_on_observation() {
        let flag = WaitFlag::new();
        flag.set();
        assert!(flag.take(Duration::from_millis(10)));
        assert!(!flag.is_set());
        assert!(!flag.take(Duration::from_millis(10)));
    }

    #[test]
    fn flag_wakes_concurrent_waiter() {
        let flag = Arc::new(WaitFlag::new());
        let flag2 = flag.clone();
        let waiter = std::thread::spawn(move || flag2.take(Duration::from_secs(2)));
        std::thread::sleep(Duration::from_millis(50));
        flag.set();
        assert!(waiter.join().unwrap());
    }
}
