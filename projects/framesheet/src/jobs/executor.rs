// Execution strategies. Every strategy accepts a submission, hands back a
// handle, and can later report what the backend knows about that handle.

use super::model::{ExecutionHandle, JobError, JobResult, Observation};
use super::store::JobStore;
use crate::matting::{Matter, SharedMatter};
use crate::pipeline::error::PipelineError;
use crate::pipeline::orchestrator::{Pipeline, PipelineObserver};
use crate::pipeline::params::JobParams;
use crate::storage::Storage;
use anyhow::{Context, Result};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Everything needed to run one job, independent of who runs it.
#[derive(Debug, Clone)]
pub struct JobSubmission {
    pub job_id: String,
    pub video_path: PathBuf,
    pub params: JobParams,
}

pub trait JobExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start (or schedule) the job. An error means this strategy could not accept it.
    fn submit(&self, submission: &JobSubmission) -> Result<ExecutionHandle>;

    /// Current backend view of a job, or None when the executor pushes
    /// updates into the store itself.
    fn observe(&self, handle: &ExecutionHandle) -> Result<Option<Observation>>;

    /// Ask a running job to stop at its next frame boundary.
    fn cancel(&self, handle: &ExecutionHandle) -> Result<()>;
}

/// Resolves storage locations and runs the pipeline for one submission.
pub struct JobRunner {
    pipeline: Pipeline,
    storage: Storage,
}

impl JobRunner {
    pub fn new(pipeline: Pipeline, storage: Storage) -> Self {
        Self { pipeline, storage }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn run(
        &self,
        submission: &JobSubmission,
        matter: &mut dyn Matter,
        observer: &dyn PipelineObserver,
    ) -> Result<JobResult, PipelineError> {
        // Workers may mount the upload volume elsewhere than the API did.
        let video = if submission.video_path.is_file() {
            submission.video_path.clone()
        } else {
            self.storage
                .find_video(&submission.job_id)
                .unwrap_or_else(|| submission.video_path.clone())
        };
        let paths = self.storage.job_paths(&submission.job_id, video);
        let output = self.pipeline.run(
            &submission.job_id,
            &paths,
            &submission.params,
            matter,
            observer,
        )?;
        Ok(JobResult::from_output(&submission.job_id, &output))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Writes progress straight into the job store and reads the cancel flag.
struct StoreObserver {
    store: Arc<dyn JobStore>,
    job_id: String,
    cancel: Arc<AtomicBool>,
}

impl PipelineObserver for StoreObserver {
    fn on_progress(&self, percent: u8) {
        self.store.update(&self.job_id, &mut |record| {
            let _ = record.set_progress(percent);
        });
    }

    fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Runs the pipeline on a background thread inside this process and
/// updates the record directly.
pub struct InlineExecutor {
    store: Arc<dyn JobStore>,
    runner: Arc<JobRunner>,
    matter: SharedMatter,
}

impl InlineExecutor {
    pub fn new(store: Arc<dyn JobStore>, runner: Arc<JobRunner>, matter: SharedMatter) -> Self {
        Self {
            store,
            runner,
            matter,
        }
    }
}

impl JobExecutor for InlineExecutor {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn submit(&self, submission: &JobSubmission) -> Result<ExecutionHandle> {
        let cancel = Arc::new(AtomicBool::new(false));
        let observer = StoreObserver {
            store: self.store.clone(),
            job_id: submission.job_id.clone(),
            cancel: cancel.clone(),
        };
        let store = self.store.clone();
        let runner = self.runner.clone();
        let mut matter = self.matter.clone();
        let submission = submission.clone();

        thread::Builder::new()
            .name(format!("inline-{}", &submission.job_id))
            .spawn(move || {
                let job_id = submission.job_id.clone();
                store.update(&job_id, &mut |record| {
                    let _ = record.mark_processing();
                });

                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    runner.run(&submission, &mut matter, &observer)
                }))
                .map_err(|payload| {
                    let message = panic_message(payload.as_ref());
                    tracing::error!("Job {}: pipeline panicked: {}", job_id, message);
                    JobError::new("PROCESSING_ERROR", format!("pipeline panicked: {}", message))
                });

                let updated = store.update(&job_id, &mut |record| {
                    let applied = match &outcome {
                        Ok(Ok(result)) => record.complete(result.clone()),
                        Ok(Err(PipelineError::Canceled)) => record.cancel(),
                        Ok(Err(e)) => record.fail(JobError::from(e)),
                        Err(error) => record.fail(error.clone()),
                    };
                    if let Err(e) = applied {
                        tracing::debug!("Job {}: outcome not applied: {}", record.id, e);
                    }
                });
                if updated.is_none() {
                    tracing::debug!("Job {}: record removed before completion", job_id);
                }
            })
            .context("Failed to spawn inline job thread")?;

        Ok(ExecutionHandle::Inline { cancel })
    }

    fn observe(&self, _handle: &ExecutionHandle) -> Result<Option<Observation>> {
        Ok(None)
    }

    fn cancel(&self, handle: &ExecutionHandle) -> Result<()> {
        if let ExecutionHandle::Inline { cancel } = handle {
            cancel.store(true, Ordering::Relaxed);
        }
        Ok(())
    }
}
