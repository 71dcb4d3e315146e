//! Job queue and processor.
//!
//! Jobs are set up over HTTP, executed when the engine reports a trigger
//! edge, and their artifacts land in `media/original/` with a
//! per-capture sequence suffix. At most one job is ever in flight; the
//! current slot enforces it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wiggle_cam::{BackendItem, FrameHandle};
use wiggle_types::{ImageFormat, JobItem, JobRequest, MediaItem};
use workerlib::{Flag, Worker};

use crate::engine::AcquisitionEngine;
use crate::{Error, Result};

const TRIGGER_POLL: Duration = Duration::from_secs(1);

pub struct JobQueue {
    engine: Arc<AcquisitionEngine>,
    original_dir: PathBuf,
    db: Mutex<Vec<JobItem>>,
    media: Mutex<Vec<MediaItem>>,
    current: Mutex<Option<JobItem>>,
    processor: Mutex<Option<Worker>>,
}

impl JobQueue {
    pub fn new(engine: Arc<AcquisitionEngine>, media_dir: &Path) -> Result<Arc<Self>> {
        let original_dir = media_dir.join("original");
        std::fs::create_dir_all(&original_dir)?;
        Ok(Arc::new(Self {
            engine,
            original_dir,
            db: Mutex::new(Vec::new()),
            media: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            processor: Mutex::new(None),
        }))
    }

    /// Spawn the processor thread consuming trigger events.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut processor = self.processor.lock();
        if processor.is_some() {
            return Ok(());
        }
        let queue = self.clone();
        let worker = Worker::spawn("job_processor", move |flag| {
            queue.processor_fun(flag);
        })
        .map_err(|e| Error::Internal { msg: e.to_string() })?;
        *processor = Some(worker);
        Ok(())
    }

    pub fn stop(&self) {
        let processor = self.processor.lock().take();
        if let Some(worker) = processor {
            worker.stop();
        }
    }

    /// Atomically claim the current-job slot.
    pub fn setup_job_request(&self, request: JobRequest) -> Result<JobItem> {
        let mut current = self.current.lock();
        if current.is_some() {
            return Err(Error::JobAlreadyActive);
        }
        // a stale trigger edge must not execute the job we are setting up
        self.engine.clear_trigger_job();

        let item = JobItem::new(request);
        *current = Some(item.clone());
        self.db.lock().insert(0, item.clone());
        info!("job {} set up ({} captures)", item.id, item.request.number_captures);
        Ok(item)
    }

    pub fn reset_job(&self) {
        *self.current.lock() = None;
    }

    pub fn list(&self) -> Vec<JobItem> {
        self.db.lock().clone()
    }

    pub fn get(&self, id: Uuid) -> Option<JobItem> {
        self.db.lock().iter().find(|item| item.id == id).cloned()
    }

    pub fn media_item(&self, id: Uuid) -> Option<MediaItem> {
        self.media.lock().iter().find(|item| item.id == id).cloned()
    }

    fn update_db(&self, job: &JobItem) {
        let mut db = self.db.lock();
        if let Some(slot) = db.iter_mut().find(|item| item.id == job.id) {
            *slot = job.clone();
        }
    }

    fn processor_fun(self: &Arc<Self>, flag: Flag) {
        info!("job processor started");
        while flag.alive() {
            if !self.engine.wait_for_trigger_job(TRIGGER_POLL) {
                continue;
            }

            let current = self.current.lock().clone();
            let mut job = match current {
                Some(job) => {
                    info!("processing job set up prior");
                    job
                }
                None => {
                    // no job was set up; fall back to a default single
                    // capture so an unattended node still produces an image
                    info!("trigger received with no job set up, using default job");
                    match self.setup_job_request(JobRequest::default()) {
                        Ok(job) => job,
                        Err(_) => continue,
                    }
                }
            };

            match self.process_job(&mut job) {
                Ok(()) => {
                    self.update_db(&job);
                    info!("finished job {} successfully", job.id);
                }
                Err(e) => error!("error processing job: {e}"),
            }
            // clear so the node stays responsive even after a failed job
            *self.current.lock() = None;
        }
        info!("job processor left");
    }

    fn process_job(&self, job: &mut JobItem) -> Result<()> {
        // gather all requested frames first, encode afterwards; encoding is
        // CPU-heavy and must not eat into the capture cadence
        let mut frames: Vec<FrameHandle> = Vec::with_capacity(job.request.number_captures);
        for seq in 0..job.request.number_captures {
            let frame = self.engine.wait_for_hires_frame()?;
            debug!("got {}/{} frames", seq + 1, job.request.number_captures);
            frames.push(frame);
        }
        self.engine.done_hires_frames();

        for (seq, frame) in frames.iter().enumerate() {
            let jpeg = self.engine.encode_frame_to_image(frame, ImageFormat::Jpeg)?;
            let filename = format!(
                "img_{}_{:03}.jpg",
                frame.captured_at.format("%Y%m%d-%H%M%S-%6f"),
                seq
            );
            let filepath = self.original_dir.join(filename);
            std::fs::write(&filepath, &jpeg)?;
            let artifact = BackendItem { filepath };

            let media = MediaItem::new(artifact.filepath.clone());
            job.mediaitem_ids.push(media.id);
            self.media.lock().push(media);
            info!("image saved to {}", artifact.filepath.display());
            job.filepaths.push(artifact.filepath);
        }

        if !job.is_finished() {
            warn!(
                "job {} produced {} of {} captures",
                job.id,
                job.filepaths.len(),
                job.request.number_captures
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOptions;
    use wiggle_cam::VirtualCameraBackend;
    use wiggle_config::{VirtualCameraConfig, VirtualIoConfig};
    use wiggle_io::VirtualIoBackend;

    fn queue() -> Arc<JobQueue> {
        let io = Arc::new(VirtualIoBackend::new(VirtualIoConfig {
            fps_nominal: 10,
            enable_clock: false,
        }));
        let camera = Arc::new(VirtualCameraBackend::new(VirtualCameraConfig::default()));
        let engine = AcquisitionEngine::new(
            io,
            camera,
            EngineOptions {
                primary: true,
                standalone_dir: None,
            },
        );
        let dir = tempfile::tempdir().unwrap();
        JobQueue::new(engine, dir.path()).unwrap()
    }

    #[test]
    fn second_setup_fails_until_reset() {
        let queue = queue();
        let first = queue
            .setup_job_request(JobRequest { number_captures: 2 })
            .unwrap();
        assert!(matches!(
            queue.setup_job_request(JobRequest::default()),
            Err(Error::JobAlreadyActive)
        ));
        queue.reset_job();
        let second = queue.setup_job_request(JobRequest::default()).unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(queue.list().len(), 2);
    }

    #[test]
    fn catalog_lookup_by_id() {
        let queue = queue();
        let job = queue.setup_job_request(JobRequest::default()).unwrap();
        assert_eq!(queue.get(job.id).unwrap().id, job.id);
        assert!(queue.get(Uuid::new_v4()).is_none());
    }
}
