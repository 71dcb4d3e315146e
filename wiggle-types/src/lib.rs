//! Shared plain types for the wigglecam node: engine state, job and media
//! DTOs, and the monotonic clock helper every component stamps edges with.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod time {
    //! Process-wide monotonic nanosecond clock.
    //!
    //! All edge and sensor timestamps in one process come from the same
    //! anchor so that phase errors are directly comparable.

    use std::time::Instant;

    lazy_static::lazy_static! {
        static ref ANCHOR: Instant = Instant::now();
    }

    pub fn monotonic_ns() -> i64 {
        ANCHOR.elapsed().as_nanos() as i64
    }
}

/// Lifecycle of one acquisition-engine generation.
///
/// Written only by the supervisor thread; everybody else reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum EngineState {
    Stopped = 0,
    WaitingForClock = 1,
    DerivingFramerate = 2,
    Running = 3,
    Degraded = 4,
}

impl EngineState {
    fn from_u8(value: u8) -> EngineState {
        match value {
            1 => EngineState::WaitingForClock,
            2 => EngineState::DerivingFramerate,
            3 => EngineState::Running,
            4 => EngineState::Degraded,
            _ => EngineState::Stopped,
        }
    }
}

/// Single-writer atomic cell holding the [`EngineState`].
///
/// Transitions are monotonic within one start/stop generation, so relaxed
/// loads are sufficient for readers.
#[derive(Debug)]
pub struct EngineStateCell(AtomicU8);

impl EngineStateCell {
    pub fn new(state: EngineState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn set(&self, state: EngineState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub fn get(&self) -> EngineState {
        EngineState::from_u8(self.0.load(Ordering::Relaxed))
    }
}

impl Default for EngineStateCell {
    fn default() -> Self {
        Self::new(EngineState::Stopped)
    }
}

fn default_number_captures() -> usize {
    1
}

/// Request to capture a short burst of full-resolution frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobRequest {
    #[serde(default = "default_number_captures")]
    pub number_captures: usize,
}

impl Default for JobRequest {
    fn default() -> Self {
        Self { number_captures: 1 }
    }
}

/// One capture job and its produced artifacts.
#[derive(Debug, Clone, Serialize)]
pub struct JobItem {
    pub id: Uuid,
    pub request: JobRequest,
    pub filepaths: Vec<PathBuf>,
    pub mediaitem_ids: Vec<Uuid>,
}

impl JobItem {
    pub fn new(request: JobRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            filepaths: Vec::new(),
            mediaitem_ids: Vec::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.filepaths.len() == self.request.number_captures
    }
}

/// Downloadable artifact registered in the node's media catalog.
#[derive(Debug, Clone, Serialize)]
pub struct MediaItem {
    pub id: Uuid,
    pub filepath: PathBuf,
}

impl MediaItem {
    pub fn new(filepath: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            filepath,
        }
    }
}

/// Encodings a camera backend can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
}
