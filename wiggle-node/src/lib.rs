//! Per-node service: the synchronized acquisition engine, the job queue and
//! the HTTP control surface, tied together by a [`Node`] root value.

use std::sync::Arc;

use tracing::info;
use wiggle_cam::CameraBackend;
use wiggle_config::AppConfig;
use wiggle_io::IoBackend;

pub mod engine;
pub mod http;
pub mod jobs;

pub use engine::{AcquisitionEngine, EngineOptions};
pub use jobs::JobQueue;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] wiggle_io::Error),
    #[error(transparent)]
    Camera(#[from] wiggle_cam::Error),
    #[error("there is already an unprocessed job; reset first")]
    JobAlreadyActive,
    #[error("only the primary node can trigger job execution")]
    TriggerNotPrimary,
    #[error("not found")]
    NotFound,
    #[error("{msg}")]
    Internal { msg: String },
    #[error("filesystem error: {source}")]
    Filesystem {
        #[from]
        source: std::io::Error,
    },
}

fn _test_error_is_send() {
    // Compile-time test to ensure Error implements Send trait.
    fn implements<T: Send>() {}
    implements::<Error>();
}

/// Root value owning every service of one node.
///
/// Construction wires the components, [`Node::start`] brings them up,
/// [`Node::stop`] tears them down in reverse order.
pub struct Node {
    pub config: AppConfig,
    pub engine: Arc<AcquisitionEngine>,
    pub jobs: Arc<JobQueue>,
}

impl Node {
    pub fn new(
        config: AppConfig,
        io: Arc<dyn IoBackend>,
        camera: Arc<dyn CameraBackend>,
    ) -> Result<Node> {
        let standalone_dir = config.media.data_dir.join("standalone");
        std::fs::create_dir_all(&standalone_dir)?;

        let options = EngineOptions {
            primary: config.acquisition.primary,
            standalone_dir: config
                .acquisition
                .standalone_mode
                .then(|| standalone_dir.clone()),
        };
        let engine = AcquisitionEngine::new(io, camera, options);
        let jobs = JobQueue::new(engine.clone(), &config.media.data_dir)?;

        Ok(Node {
            config,
            engine,
            jobs,
        })
    }

    pub fn start(&self) -> Result<()> {
        self.engine.start()?;
        if self.config.acquisition.standalone_mode {
            // trigger events are consumed by the engine's direct capture
            // path; wiring the job processor too would race it for the edge
            info!("standalone mode: job processor not started");
        } else {
            self.jobs.start()?;
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.jobs.stop();
        self.engine.stop();
    }

    pub fn router(&self) -> axum::Router {
        http::router(http::AppState {
            engine: self.engine.clone(),
            jobs: self.jobs.clone(),
            primary: self.config.acquisition.primary,
        })
    }
}
