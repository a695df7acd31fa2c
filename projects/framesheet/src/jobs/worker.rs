// Queue worker: pops tasks, runs the pipeline under the task's wall-clock
// budget and writes the outcome back to the queue backend.

use super::executor::JobRunner;
use super::model::JobError;
use super::queue::{QueueBackend, TaskOutcome, TaskPayload};
use crate::matting::{Matter, MattingProvider};
use crate::pipeline::error::PipelineError;
use crate::pipeline::orchestrator::PipelineObserver;
use anyhow::{Context, Result};
use crossbeam::channel::{self, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How long a timed-out run gets to reach a frame boundary and stop.
const TIMEOUT_GRACE: Duration = Duration::from_secs(30);

/// Reports progress to the backend and stops on a local or remote cancel.
struct QueueObserver {
    backend: Arc<dyn QueueBackend>,
    task_id: String,
    cancel: Arc<AtomicBool>,
}

impl PipelineObserver for QueueObserver {
    fn on_progress(&self, percent: u8) {
        if let Err(e) = self.backend.report_progress(&self.task_id, percent) {
            tracing::debug!("Task {}: progress not recorded: {:#}", self.task_id, e);
        }
    }

    fn is_canceled(&self) -> bool {
        if self.cancel.load(Ordering::Relaxed) {
            return true;
        }
        match self.backend.is_cancel_requested(&self.task_id) {
            Ok(requested) => requested,
            Err(e) => {
                tracing::debug!("Task {}: cancel check failed: {:#}", self.task_id, e);
                false
            }
        }
    }
}

pub struct QueueWorker {
    backend: Arc<dyn QueueBackend>,
    runner: Arc<JobRunner>,
    provider: Arc<dyn MattingProvider>,
    poll_wait: Duration,
}

impl QueueWorker {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        runner: Arc<JobRunner>,
        provider: Arc<dyn MattingProvider>,
        poll_wait: Duration,
    ) -> Self {
        Self {
            backend,
            runner,
            provider,
            poll_wait,
        }
    }

    /// Run `concurrency` worker threads until `shutdown` is raised.
    pub fn run(self: Arc<Self>, concurrency: usize, shutdown: Arc<AtomicBool>) -> Result<()> {
        self.runner.storage().ensure_dirs()?;

        let mut handles = Vec::new();
        for index in 0..concurrency.max(1) {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{}", index))
                .spawn(move || worker.thread_main(index, &shutdown))
                .context("Failed to spawn worker thread")?;
            handles.push(handle);
        }

        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("Worker thread stopped: {:#}", e),
                Err(_) => tracing::error!("Worker thread panicked"),
            }
        }
        Ok(())
    }

    fn thread_main(&self, index: usize, shutdown: &AtomicBool) -> Result<()> {
        // One matting session per thread, created before the first task.
        let mut session = Some(
            self.provider
                .create_session()
                .context("Failed to create matting session")?,
        );
        tracing::info!("Worker {}: ready", index);

        while !shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.process_next(&mut session) {
                tracing::warn!("Worker {}: {:#}", index, e);
                thread::sleep(self.poll_wait);
            }
        }

        tracing::info!("Worker {}: shutting down", index);
        Ok(())
    }

    /// Pop and handle at most one task. Returns false when the queue was empty.
    pub fn process_next(&self, session: &mut Option<Box<dyn Matter>>) -> Result<bool> {
        let Some(task_id) = self.backend.dequeue(self.poll_wait)? else {
            return Ok(false);
        };

        // The id is off the list now; nothing else will ever finish it.
        if let Err(e) = self.handle(&task_id, session) {
            tracing::warn!("Task {}: {:#}", task_id, e);
            let error = JobError::new("PROCESSING_ERROR", format!("{:#}", e));
            self.backend
                .finish(&task_id, &TaskOutcome::Failed(error))
                .with_context(|| format!("Task {} left unfinished", task_id))?;
        }
        Ok(true)
    }

    fn handle(&self, task_id: &str, session: &mut Option<Box<dyn Matter>>) -> Result<()> {
        if self.backend.is_cancel_requested(task_id)? {
            tracing::info!("Task {}: canceled before start", task_id);
            return self.backend.finish(task_id, &TaskOutcome::Canceled);
        }

        let payload = self.backend.load_payload(task_id)?;
        self.backend.mark_started(task_id)?;
        tracing::info!("Task {}: started", task_id);

        let matter = match session.take() {
            Some(matter) => matter,
            None => match self.provider.create_session() {
                Ok(matter) => matter,
                Err(e) => {
                    let error = JobError::from(&PipelineError::Matting(e));
                    return self.backend.finish(task_id, &TaskOutcome::Failed(error));
                }
            },
        };

        let outcome = self.execute(task_id, &payload, matter, session);
        match &outcome {
            TaskOutcome::Finished(result) => {
                tracing::info!("Task {}: finished with {} frames", task_id, result.frame_count)
            }
            TaskOutcome::Failed(error) => {
                tracing::error!("Task {}: failed [{}] {}", task_id, error.code, error.message)
            }
            TaskOutcome::Canceled => tracing::info!("Task {}: canceled", task_id),
        }
        self.backend.finish(task_id, &outcome)
    }

    /// Run the pipeline on its own thread so the wall-clock budget can be
    /// enforced. The matting session travels with the run and is handed back.
    fn execute(
        &self,
        task_id: &str,
        payload: &TaskPayload,
        mut matter: Box<dyn Matter>,
        session: &mut Option<Box<dyn Matter>>,
    ) -> TaskOutcome {
        let cancel = Arc::new(AtomicBool::new(false));
        let observer = QueueObserver {
            backend: self.backend.clone(),
            task_id: task_id.to_string(),
            cancel: cancel.clone(),
        };
        let runner = self.runner.clone();
        let submission = payload.submission();
        let (tx, rx) = channel::bounded(1);

        let spawned = thread::Builder::new()
            .name(format!("task-{}", task_id))
            .spawn(move || {
                let result = runner.run(&submission, matter.as_mut(), &observer);
                let _ = tx.send((matter, result));
            });
        if let Err(e) = spawned {
            return TaskOutcome::Failed(JobError::new(
                "PROCESSING_ERROR",
                format!("Failed to spawn task thread: {}", e),
            ));
        }

        let timeout = Duration::from_secs(payload.timeout_secs.max(1));
        let (matter, result) = match rx.recv_timeout(timeout) {
            Ok(done) => done,
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!("Task {}: exceeded {}s, stopping", task_id, timeout.as_secs());
                cancel.store(true, Ordering::Relaxed);
                // The run stops at its next frame boundary; take the session back.
                // A run stuck inside one frame keeps it, and the next task makes a new one.
                match rx.recv_timeout(TIMEOUT_GRACE) {
                    Ok((matter, _)) => *session = Some(matter),
                    Err(_) => tracing::warn!("Task {}: run did not stop, session dropped", task_id),
                }
                return TaskOutcome::Failed(JobError::from(&PipelineError::Timeout(
                    timeout.as_secs(),
                )));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return TaskOutcome::Failed(JobError::new(
                    "PROCESSING_ERROR",
                    "task thread exited without a result",
                ));
            }
        };

        *session = Some(matter);
        match result {
            Ok(result) => TaskOutcome::Finished(result),
            Err(PipelineError::Canceled) => TaskOutcome::Canceled,
            Err(e) => TaskOutcome::Failed(JobError::from(&e)),
        }
    }
}
