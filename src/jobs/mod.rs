//! Job manager: admission control, lifecycle tracking, progress fan-out
//! and retention-window eviction for extraction jobs.
//!
//! At most `max_concurrent` jobs extract at once; the rest wait in a
//! FIFO queue and are admitted as running jobs finish. All shared state
//! lives in one mutex-guarded registry behind a cheaply clonable
//! handle, so tests construct isolated instances instead of touching
//! ambient globals.

pub mod types;

pub use types::{
    Credentials, Job, JobId, JobStatus, ProgressEvent, ScrapeOutput, ScrapeUpdate,
};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::JobConfig;
use crate::scraper::ExtractionPipeline;

/// Buffered progress events per subscriber before lagging.
const CHANNEL_CAPACITY: usize = 64;

struct Registry {
    jobs: HashMap<JobId, Job>,
    artifacts: HashMap<JobId, Arc<Vec<u8>>>,
    channels: HashMap<JobId, broadcast::Sender<ProgressEvent>>,
    /// Jobs handed to `start` already, running or queued.
    started: HashSet<JobId>,
    active: usize,
    queue: VecDeque<(JobId, Credentials)>,
}

struct Core {
    pipeline: Arc<dyn ExtractionPipeline>,
    config: JobConfig,
    registry: Mutex<Registry>,
}

/// Handle to the shared job state; clones refer to the same manager.
#[derive(Clone)]
pub struct JobManager {
    core: Arc<Core>,
}

impl JobManager {
    pub fn new(pipeline: Arc<dyn ExtractionPipeline>, config: JobConfig) -> Self {
        Self {
            core: Arc::new(Core {
                pipeline,
                config,
                registry: Mutex::new(Registry {
                    jobs: HashMap::new(),
                    artifacts: HashMap::new(),
                    channels: HashMap::new(),
                    started: HashSet::new(),
                    active: 0,
                    queue: VecDeque::new(),
                }),
            }),
        }
    }

    /// Register a new job in `queued` state. No side effects beyond
    /// registration; `start` begins the work.
    pub fn create_job(&self, url: &str) -> Job {
        let job = Job::new(url.to_string());
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);

        let mut registry = self.core.registry.lock().unwrap();
        registry.channels.insert(job.id, tx);
        registry.jobs.insert(job.id, job.clone());
        job
    }

    /// Begin a job, or queue it when the concurrency ceiling is
    /// reached. Fire and forget: returns immediately either way.
    pub fn start(&self, job_id: JobId, credentials: Credentials) {
        let mut registry = self.core.registry.lock().unwrap();
        if !registry.jobs.contains_key(&job_id) || !registry.started.insert(job_id) {
            warn!("Ignoring start for unknown or already-started job {}", job_id);
            return;
        }

        if registry.active < self.core.config.max_concurrent {
            registry.active += 1;
            drop(registry);
            self.spawn_run(job_id, credentials);
        } else {
            debug!("Job {} queued behind {} waiting", job_id, registry.queue.len());
            registry.queue.push_back((job_id, credentials));
        }
    }

    pub fn job(&self, job_id: JobId) -> Option<Job> {
        self.core.registry.lock().unwrap().jobs.get(&job_id).cloned()
    }

    /// Stored artifact for a finished job, if still retained.
    pub fn artifact(&self, job_id: JobId) -> Option<Arc<Vec<u8>>> {
        self.core
            .registry
            .lock()
            .unwrap()
            .artifacts
            .get(&job_id)
            .cloned()
    }

    /// Job snapshot paired with a live receiver, taken under one
    /// registry lock: every event broadcast after the snapshot reaches
    /// the receiver, including a terminal event landing right away.
    /// Multiple subscribers per job fan out; the receiver is `None`
    /// once the channel has been evicted.
    pub fn watch(
        &self,
        job_id: JobId,
    ) -> Option<(Job, Option<broadcast::Receiver<ProgressEvent>>)> {
        let registry = self.core.registry.lock().unwrap();
        let job = registry.jobs.get(&job_id)?.clone();
        let receiver = registry.channels.get(&job_id).map(|tx| tx.subscribe());
        Some((job, receiver))
    }

    fn spawn_run(&self, job_id: JobId, credentials: Credentials) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_job(job_id, credentials).await;
            manager.release_slot();
        });
    }

    async fn run_job(&self, job_id: JobId, credentials: Credentials) {
        let url = match self.job(job_id) {
            Some(job) => job.url,
            None => return,
        };

        self.apply_update(
            job_id,
            ScrapeUpdate {
                status: JobStatus::Scraping,
                current_page: 0,
                total_pages: 0,
                document_title: None,
            },
        );

        let progress_manager = self.clone();
        let result = self
            .core
            .pipeline
            .run(&url, &credentials, &move |update| {
                progress_manager.apply_update(job_id, update)
            })
            .await;

        match result {
            Ok(output) => self.finish_success(job_id, output),
            Err(e) => self.finish_error(job_id, &e.to_string()),
        }
        self.schedule_eviction(job_id);
    }

    /// Fold a pipeline update into the job and broadcast the snapshot.
    fn apply_update(&self, job_id: JobId, update: ScrapeUpdate) {
        let (event, tx) = {
            let mut registry = self.core.registry.lock().unwrap();
            let Some(job) = registry.jobs.get_mut(&job_id) else {
                return;
            };
            job.apply(&update);
            let event = job.progress_event();
            (event, registry.channels.get(&job_id).cloned())
        };
        if let Some(tx) = tx {
            let _ = tx.send(event);
        }
    }

    fn finish_success(&self, job_id: JobId, output: ScrapeOutput) {
        info!(
            "Job {} done: {} pages, {} bytes",
            job_id,
            output.total_pages,
            output.pdf.len()
        );
        let (event, tx) = {
            let mut registry = self.core.registry.lock().unwrap();
            let Some(job) = registry.jobs.get_mut(&job_id) else {
                return;
            };
            job.status = JobStatus::Done;
            job.total_pages = output.total_pages;
            job.current_page = output.total_pages;
            job.document_title = Some(output.document_title);
            let event = job.progress_event();
            registry.artifacts.insert(job_id, Arc::new(output.pdf));
            (event, registry.channels.get(&job_id).cloned())
        };
        if let Some(tx) = tx {
            let _ = tx.send(event);
        }
    }

    fn finish_error(&self, job_id: JobId, message: &str) {
        warn!("Job {} failed: {}", job_id, message);
        let (event, tx) = {
            let mut registry = self.core.registry.lock().unwrap();
            let has_artifact = registry.artifacts.contains_key(&job_id);
            let Some(job) = registry.jobs.get_mut(&job_id) else {
                return;
            };
            // No partial artifact for a failed job, ever.
            debug_assert!(!has_artifact);
            job.status = JobStatus::Error;
            job.error = Some(message.to_string());
            let event = job.progress_event();
            (event, registry.channels.get(&job_id).cloned())
        };
        if let Some(tx) = tx {
            let _ = tx.send(event);
        }
    }

    /// Free a concurrency slot and admit the next queued job, FIFO.
    fn release_slot(&self) {
        let next = {
            let mut registry = self.core.registry.lock().unwrap();
            registry.active -= 1;
            if let Some((job_id, credentials)) = registry.queue.pop_front() {
                registry.active += 1;
                Some((job_id, credentials))
            } else {
                None
            }
        };
        if let Some((job_id, credentials)) = next {
            self.spawn_run(job_id, credentials);
        }
    }

    /// Two-step cleanup after a terminal state: the artifact and the
    /// subscriber channel go together at the retention deadline
    /// (closing any live event streams); the job record lingers one
    /// further window so retrieval can answer "expired" instead of
    /// "unknown", then is swept.
    fn schedule_eviction(&self, job_id: JobId) {
        let manager = self.clone();
        let retention = std::time::Duration::from_secs(self.core.config.retention_secs);
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            {
                let mut registry = manager.core.registry.lock().unwrap();
                registry.artifacts.remove(&job_id);
                registry.channels.remove(&job_id);
            }
            debug!("Job {} artifact evicted", job_id);

            tokio::time::sleep(retention).await;
            {
                let mut registry = manager.core.registry.lock().unwrap();
                registry.jobs.remove(&job_id);
                registry.started.remove(&job_id);
            }
            debug!("Job {} record swept", job_id);
        });
    }
}
