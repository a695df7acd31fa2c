// Job service: the one entry point the transport layer talks to.
//
// Submission tries each executor in order and records which one accepted
// the job. Status reads reconcile live records against that executor.

use super::executor::{JobExecutor, JobSubmission};
use super::model::{Execution, JobRecord};
use super::store::JobStore;
use crate::pipeline::params::JobParams;
use crate::storage::Storage;
use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::sync::Arc;

pub struct JobService {
    store: Arc<dyn JobStore>,
    /// In preference order; the first that accepts a job owns it.
    executors: Vec<Arc<dyn JobExecutor>>,
    storage: Storage,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        executors: Vec<Arc<dyn JobExecutor>>,
        storage: Storage,
    ) -> Self {
        Self {
            store,
            executors,
            storage,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    fn executor_named(&self, name: &str) -> Option<&Arc<dyn JobExecutor>> {
        self.executors.iter().find(|e| e.name() == name)
    }

    /// Create the record and hand the job to the first executor that takes it.
    pub fn submit(&self, job_id: &str, video_path: PathBuf, params: JobParams) -> Result<JobRecord> {
        self.store.put(JobRecord::new(job_id, params.clone()));
        let submission = JobSubmission {
            job_id: job_id.to_string(),
            video_path,
            params,
        };

        for executor in &self.executors {
            match executor.submit(&submission) {
                Ok(handle) => {
                    let execution = Execution {
                        executor: executor.name(),
                        handle,
                    };
                    tracing::info!("Job {}: accepted by {} executor", job_id, executor.name());
                    return self
                        .store
                        .update(job_id, &mut |record| {
                            record.execution = Some(execution.clone());
                        })
                        .ok_or_else(|| anyhow!("Job {} vanished during submission", job_id));
                }
                Err(e) => {
                    tracing::warn!(
                        "Job {}: {} executor unavailable, falling back: {:#}",
                        job_id,
                        executor.name(),
                        e
                    );
                }
            }
        }

        self.store.remove(job_id);
        Err(anyhow!("No executor accepted job {}", job_id))
    }

    /// Current view of a job, reconciled from its executor when still live.
    /// Backend errors are logged and the last known state is returned.
    pub fn observe(&self, job_id: &str) -> Option<JobRecord> {
        let record = self.store.get(job_id)?;
        if record.status.is_terminal() {
            return Some(record);
        }
        let Some(execution) = record.execution.as_ref() else {
            return Some(record);
        };
        let Some(executor) = self.executor_named(execution.executor) else {
            return Some(record);
        };

        match executor.observe(&execution.handle) {
            Ok(Some(observation)) => {
                let updated = self.store.update(job_id, &mut |r| {
                    if let Err(e) = r.apply_observation(observation.clone()) {
                        tracing::debug!("Job {}: observation ignored: {}", job_id, e);
                    }
                });
                updated.or(Some(record))
            }
            Ok(None) => Some(record),
            Err(e) => {
                tracing::warn!(
                    "Job {}: status backend unreachable, keeping last known state: {:#}",
                    job_id,
                    e
                );
                Some(record)
            }
        }
    }

    /// Cancel a job and drop every trace of it. Returns false if unknown.
    pub fn delete(&self, job_id: &str) -> Result<bool> {
        let Some(record) = self.store.get(job_id) else {
            return Ok(false);
        };

        if let Some(execution) = &record.execution {
            if let Some(executor) = self.executor_named(execution.executor) {
                if let Err(e) = executor.cancel(&execution.handle) {
                    tracing::warn!("Job {}: cancel not delivered: {:#}", job_id, e);
                }
            }
        }
        self.store.update(job_id, &mut |r| {
            let _ = r.cancel();
        });
        self.store.remove(job_id);
        self.storage.remove_job(job_id)?;

        tracing::info!("Job {}: deleted", job_id);
        Ok(true)
    }
}
