//! Named, stoppable worker threads.
//!
//! Every long-lived thread in the node follows the same shape: loop while the
//! control flag is alive, check the flag at the loop head, exit cleanly on
//! error so a supervisor can restart. [`Worker`] packages the spawn/stop/join
//! choreography once.

use tracing::warn;

pub use thread_control::Flag;

#[derive(thiserror::Error, Debug)]
#[error("failed to spawn thread {name}: {source}")]
pub struct SpawnError {
    name: String,
    source: std::io::Error,
}

/// Handle to a spawned worker thread.
pub struct Worker {
    name: String,
    control: thread_control::Control,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Worker {
    /// Spawn a named thread running `fun` with a stop flag. `fun` is expected
    /// to return promptly once `flag.alive()` turns false; all blocking calls
    /// inside must carry timeouts.
    pub fn spawn<F>(name: &str, fun: F) -> Result<Worker, SpawnError>
    where
        F: FnOnce(thread_control::Flag) + Send + 'static,
    {
        let (flag, control) = thread_control::make_pair();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || fun(flag))
            .map_err(|source| SpawnError {
                name: name.to_string(),
                source,
            })?;
        Ok(Worker {
            name: name.to_string(),
            control,
            handle: Some(handle),
        })
    }

    /// True while the thread function has not returned.
    pub fn is_alive(&self) -> bool {
        !self.control.is_done()
    }

    /// Signal the stop flag without joining.
    pub fn signal_stop(&self) {
        self.control.stop();
    }

    /// Signal stop and join. A panicked worker is logged, not propagated.
    pub fn stop(mut self) {
        self.control.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("worker thread {} panicked", self.name);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.control.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("worker thread {} panicked", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn stop_joins_the_thread() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let worker = Worker::spawn("test_worker", move |flag| {
            while flag.alive() {
                std::thread::sleep(Duration::from_millis(5));
            }
            ran2.store(true, Ordering::SeqCst);
        })
        .unwrap();
        assert!(worker.is_alive());
        worker.stop();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn is_alive_reflects_thread_exit() {
        let worker = Worker::spawn("short_lived", |_flag| {}).unwrap();
        for _ in 0..100 {
            if !worker.is_alive() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!worker.is_alive());
    }
}
