// Job state machine: queued -> processing -> {completed, failed}, with
// canceled reachable from either live state. Terminal states are final.

use super::model::{JobError, JobRecord, JobResult, JobStatus, Observation};
use chrono::Utc;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("job is {from}, cannot move to {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Translate a queue backend status word into a job status.
pub fn map_backend_status(status: &str) -> Option<JobStatus> {
    match status {
        "queued" | "deferred" | "scheduled" => Some(JobStatus::Queued),
        "started" => Some(JobStatus::Processing),
        "finished" => Some(JobStatus::Completed),
        "failed" | "stopped" => Some(JobStatus::Failed),
        "canceled" => Some(JobStatus::Canceled),
        _ => None,
    }
}

impl JobRecord {
    fn guard(&self, to: JobStatus) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        Ok(())
    }

    pub fn mark_processing(&mut self) -> Result<(), TransitionError> {
        self.guard(JobStatus::Processing)?;
        if self.status == JobStatus::Queued {
            self.status = JobStatus::Processing;
            self.started_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Progress never moves backwards and stays below 100 until completion.
    pub fn set_progress(&mut self, progress: u8) -> Result<(), TransitionError> {
        self.guard(self.status)?;
        self.progress = self.progress.max(progress.min(99));
        Ok(())
    }

    pub fn complete(&mut self, result: JobResult) -> Result<(), TransitionError> {
        self.guard(JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.result = Some(result);
        self.error = None;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, error: JobError) -> Result<(), TransitionError> {
        self.guard(JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.result = None;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.guard(JobStatus::Canceled)?;
        self.status = JobStatus::Canceled;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// One-directional sync from a backend observation into the record.
    pub fn apply_observation(&mut self, obs: Observation) -> Result<(), TransitionError> {
        match obs.status {
            // A backend lagging behind never downgrades a started job.
            JobStatus::Queued => self.guard(JobStatus::Queued)?,
            JobStatus::Processing => self.mark_processing()?,
            JobStatus::Completed => match obs.result {
                Some(result) => return self.complete(result),
                None => {
                    return self.fail(JobError::new(
                        "PROCESSING_ERROR",
                        "backend reported success without a result",
                    ))
                }
            },
            JobStatus::Failed => {
                let error = obs.error.unwrap_or_else(|| {
                    JobError::new("PROCESSING_ERROR", "job failed in the queue backend")
                });
                return self.fail(error);
            }
            JobStatus::Canceled => return self.cancel(),
        }

        if let Some(progress) = obs.progress {
            self.set_progress(progress)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::params::JobParams;

    fn record() -> JobRecord {
        JobRecord::new("job", JobParams::default())
    }

    fn result() -> JobResult {
        JobResult {
            frame_count: 1,
            width: 8,
            height: 8,
            sprite_sheet_url: "/jobs/job/result?format=png".into(),
            json_index_url: "/jobs/job/index".into(),
        }
    }

    fn observe(status: JobStatus, progress: Option<u8>) -> Observation {
        Observation {
            status,
            progress,
            result: None,
            error: None,
        }
    }

    #[test]
    fn test_happy_path() {
        let mut r = record();
        r.mark_processing().unwrap();
        assert_eq!(r.status, JobStatus::Processing);
        assert!(r.started_at.is_some());
        r.set_progress(40).unwrap();
        r.set_progress(20).unwrap();
        assert_eq!(r.progress, 40);
        r.complete(result()).unwrap();
        assert_eq!(r.status, JobStatus::Completed);
        assert_eq!(r.progress, 100);
        assert!(r.finished_at.is_some());
    }

    #[test]
    fn test_progress_capped_below_completion() {
        let mut r = record();
        r.set_progress(100).unwrap();
        assert_eq!(r.progress, 99);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut done = record();
        done.complete(result()).unwrap();
        assert!(done.fail(JobError::new("X", "y")).is_err());
        assert!(done.cancel().is_err());
        assert!(done.mark_processing().is_err());
        assert!(done.set_progress(10).is_err());
        assert_eq!(done.status, JobStatus::Completed);

        let mut failed = record();
        failed.fail(JobError::new("NO_FRAMES", "none")).unwrap();
        let err = failed.complete(result()).unwrap_err();
        assert_eq!(
            err,
            TransitionError {
                from: JobStatus::Failed,
                to: JobStatus::Completed
            }
        );

        let mut canceled = record();
        canceled.cancel().unwrap();
        assert!(canceled
            .apply_observation(observe(JobStatus::Processing, Some(50)))
            .is_err());
        assert_eq!(canceled.status, JobStatus::Canceled);
    }

    #[test]
    fn test_cancel_from_live_states() {
        let mut queued = record();
        queued.cancel().unwrap();
        assert_eq!(queued.status, JobStatus::Canceled);

        let mut running = record();
        running.mark_processing().unwrap();
        running.cancel().unwrap();
        assert_eq!(running.status, JobStatus::Canceled);
    }

    #[test]
    fn test_backend_status_mapping() {
        assert_eq!(map_backend_status("queued"), Some(JobStatus::Queued));
        assert_eq!(map_backend_status("started"), Some(JobStatus::Processing));
        assert_eq!(map_backend_status("finished"), Some(JobStatus::Completed));
        assert_eq!(map_backend_status("failed"), Some(JobStatus::Failed));
        assert_eq!(map_backend_status("deferred"), Some(JobStatus::Queued));
        assert_eq!(map_backend_status("canceled"), Some(JobStatus::Canceled));
        assert_eq!(map_backend_status("bogus"), None);
    }

    #[test]
    fn test_observation_never_downgrades() {
        let mut r = record();
        r.apply_observation(observe(JobStatus::Processing, Some(30)))
            .unwrap();
        r.apply_observation(observe(JobStatus::Queued, None)).unwrap();
        assert_eq!(r.status, JobStatus::Processing);
        assert_eq!(r.progress, 30);
    }

    #[test]
    fn test_observation_completion_and_failure() {
        let mut r = record();
        let mut obs = observe(JobStatus::Completed, Some(100));
        obs.result = Some(result());
        r.apply_observation(obs).unwrap();
        assert_eq!(r.status, JobStatus::Completed);
        assert_eq!(r.result.as_ref().map(|x| x.frame_count), Some(1));

        let mut r = record();
        r.apply_observation(observe(JobStatus::Failed, None)).unwrap();
        assert_eq!(r.status, JobStatus::Failed);
        assert_eq!(r.error.as_ref().map(|e| e.code.as_str()), Some("PROCESSING_ERROR"));

        let mut r = record();
        r.apply_observation(observe(JobStatus::Completed, None)).unwrap();
        assert_eq!(r.status, JobStatus::Failed);
    }
}
