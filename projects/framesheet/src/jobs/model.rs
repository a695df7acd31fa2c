// Job record definitions
//
// A JobRecord is the public view of one submission. It is owned by the job
// store; executors and the reconciliation path mutate it only through the
// transition methods in `state.rs`.

use crate::pipeline::error::PipelineError;
use crate::pipeline::orchestrator::PipelineOutput;
use crate::pipeline::params::JobParams;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable category code plus one diagnostic line.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    pub code: String,
    pub message: String,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&PipelineError> for JobError {
    fn from(err: &PipelineError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

/// Result summary with asset locations.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub frame_count: usize,
    pub width: u32,
    pub height: u32,
    pub sprite_sheet_url: String,
    pub json_index_url: String,
}

impl JobResult {
    pub fn from_output(job_id: &str, output: &PipelineOutput) -> Self {
        Self {
            frame_count: output.frame_count,
            width: output.width,
            height: output.height,
            sprite_sheet_url: format!("/jobs/{}/result?format=png", job_id),
            json_index_url: format!("/jobs/{}/index", job_id),
        }
    }
}

/// How a record is being executed; never serialized.
#[derive(Debug, Clone)]
pub enum ExecutionHandle {
    /// Task living in the queue backend.
    Queued { task_id: String },
    /// Background thread in this process, stopped through the flag.
    Inline { cancel: Arc<AtomicBool> },
}

#[derive(Debug, Clone)]
pub struct Execution {
    /// Name of the executor that accepted the job.
    pub executor: &'static str,
    pub handle: ExecutionHandle,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub params: JobParams,
    pub result: Option<JobResult>,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub execution: Option<Execution>,
}

impl JobRecord {
    /// A fresh submission: queued, no progress.
    pub fn new(id: impl Into<String>, params: JobParams) -> Self {
        Self {
            id: id.into(),
            status: JobStatus::Queued,
            progress: 0,
            params,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            execution: None,
        }
    }
}

/// Authoritative state as reported by an execution backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub status: JobStatus,
    pub progress: Option<u8>,
    pub result: Option<JobResult>,
    pub error: Option<JobError>,
}

/// Opaque, collision-resistant job id.
pub fn generate_job_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
