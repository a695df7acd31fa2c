// Queue backend and the executor that uses it.
//
// Tasks live in Redis: a list per queue holding task ids and one hash per
// task with its payload, status and outcome. Workers pop ids, the API
// process reads the hashes back when a client asks for a job.

use super::executor::{JobExecutor, JobSubmission};
use super::model::{ExecutionHandle, JobError, JobResult, Observation};
use super::state::map_backend_status;
use crate::pipeline::params::JobParams;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Wall-clock budget of a queued job.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Finished task hashes are kept this long for status queries.
const RESULT_TTL_SECS: u64 = 24 * 60 * 60;

const KEY_PREFIX: &str = "framesheet";
/// One per worker thread plus the API process's occasional reads.
const MAX_IDLE_CONNECTIONS: usize = 8;

/// What a worker needs to run a task.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskPayload {
    pub job_id: String,
    pub video_path: PathBuf,
    pub params: JobParams,
    pub timeout_secs: u64,
}

impl TaskPayload {
    pub fn submission(&self) -> JobSubmission {
        JobSubmission {
            job_id: self.job_id.clone(),
            video_path: self.video_path.clone(),
            params: self.params.clone(),
        }
    }
}

/// Backend view of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    /// queued | started | finished | failed | deferred | canceled
    pub status: String,
    pub progress: Option<u8>,
    pub result: Option<JobResult>,
    pub error: Option<JobError>,
}

impl TaskSnapshot {
    pub fn into_observation(self) -> Result<Observation> {
        let status = map_backend_status(&self.status)
            .ok_or_else(|| anyhow!("Unknown backend status '{}'", self.status))?;
        Ok(Observation {
            status,
            progress: self.progress,
            result: self.result,
            error: self.error,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Finished(JobResult),
    Failed(JobError),
    Canceled,
}

/// Enqueue/poll on the submitting side, dequeue/report on the worker side.
pub trait QueueBackend: Send + Sync {
    /// Returns the task id.
    fn enqueue(&self, payload: &TaskPayload) -> Result<String>;
    fn fetch(&self, task_id: &str) -> Result<Option<TaskSnapshot>>;
    fn request_cancel(&self, task_id: &str) -> Result<()>;

    /// Block up to `wait` for the next task id. A popped id is no longer in
    /// the queue, so the caller must bring it to a final state.
    fn dequeue(&self, wait: Duration) -> Result<Option<String>>;
    fn load_payload(&self, task_id: &str) -> Result<TaskPayload>;
    fn mark_started(&self, task_id: &str) -> Result<()>;
    fn report_progress(&self, task_id: &str, progress: u8) -> Result<()>;
    fn is_cancel_requested(&self, task_id: &str) -> Result<bool>;
    fn finish(&self, task_id: &str, outcome: &TaskOutcome) -> Result<()>;
}

/// Idle connections kept for reuse. A connection whose last command failed
/// is dropped instead of returned.
struct ConnectionPool<C> {
    idle: Mutex<Vec<C>>,
    max_idle: usize,
}

impl<C> ConnectionPool<C> {
    fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    fn idle(&self) -> MutexGuard<'_, Vec<C>> {
        self.idle.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn with<T>(
        &self,
        connect: impl FnOnce() -> Result<C>,
        op: impl FnOnce(&mut C) -> redis::RedisResult<T>,
    ) -> Result<T> {
        let reused = self.idle().pop();
        let mut conn = match reused {
            Some(conn) => conn,
            None => connect()?,
        };
        let value = op(&mut conn)?;

        let mut idle = self.idle();
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
        Ok(value)
    }
}

pub struct RedisQueue {
    client: redis::Client,
    queue_key: String,
    connect_timeout: Duration,
    pool: ConnectionPool<redis::Connection>,
}

impl RedisQueue {
    pub fn new(url: &str, queue_name: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("Invalid Redis URL '{}'", url))?;
        Ok(Self {
            client,
            queue_key: format!("{}:queue:{}", KEY_PREFIX, queue_name),
            connect_timeout: Duration::from_secs(1),
            pool: ConnectionPool::new(MAX_IDLE_CONNECTIONS),
        })
    }

    fn task_key(task_id: &str) -> String {
        format!("{}:task:{}", KEY_PREFIX, task_id)
    }

    fn with_conn<T>(&self, op: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>) -> Result<T> {
        self.pool.with(
            || {
                self.client
                    .get_connection_with_timeout(self.connect_timeout)
                    .context("Failed to connect to Redis")
            },
            op,
        )
    }

    /// Connect once, so callers learn about an unreachable backend up front.
    pub fn ping(&self) -> Result<()> {
        self.with_conn(|conn| redis::cmd("PING").query::<String>(conn))
            .context("Redis PING failed")?;
        Ok(())
    }

    /// Field writes plus the expiry, applied as one transaction.
    fn set_fields(&self, task_id: &str, fields: &[(&str, String)], expire: bool) -> Result<()> {
        let key = Self::task_key(task_id);
        let mut pipe = redis::pipe();
        pipe.atomic().hset_multiple(&key, fields).ignore();
        if expire {
            pipe.expire(&key, RESULT_TTL_SECS as i64).ignore();
        }
        self.with_conn(|conn| pipe.query::<()>(conn))
            .with_context(|| format!("Failed to update task {}", task_id))
    }
}

impl QueueBackend for RedisQueue {
    fn enqueue(&self, payload: &TaskPayload) -> Result<String> {
        let task_id = payload.job_id.clone();
        let body = serde_json::to_string(payload)?;

        self.with_conn(|conn| {
            redis::pipe()
                .atomic()
                .cmd("HSET")
                .arg(Self::task_key(&task_id))
                .arg("status")
                .arg("queued")
                .arg("payload")
                .arg(&body)
                .arg("progress")
                .arg(0)
                .arg("cancel")
                .arg(0)
                .ignore()
                .cmd("LPUSH")
                .arg(&self.queue_key)
                .arg(&task_id)
                .ignore()
                .query::<()>(conn)
        })
        .context("Failed to enqueue task")?;

        Ok(task_id)
    }

    fn fetch(&self, task_id: &str) -> Result<Option<TaskSnapshot>> {
        let fields: HashMap<String, String> = self
            .with_conn(|conn| redis::cmd("HGETALL").arg(Self::task_key(task_id)).query(conn))
            .with_context(|| format!("Failed to read task {}", task_id))?;
        if fields.is_empty() {
            return Ok(None);
        }

        let status = fields
            .get("status")
            .cloned()
            .unwrap_or_else(|| "queued".to_string());
        let progress = fields.get("progress").and_then(|p| p.parse::<u8>().ok());
        let result = match fields.get("result") {
            Some(raw) if !raw.is_empty() => Some(
                serde_json::from_str(raw)
                    .with_context(|| format!("Malformed result for task {}", task_id))?,
            ),
            _ => None,
        };
        let error = fields.get("error_code").map(|code| {
            JobError::new(
                code.clone(),
                fields.get("error_message").cloned().unwrap_or_default(),
            )
        });

        Ok(Some(TaskSnapshot {
            status,
            progress,
            result,
            error,
        }))
    }

    fn request_cancel(&self, task_id: &str) -> Result<()> {
        let key = Self::task_key(task_id);
        self.with_conn(|conn| {
            // Still waiting in the list: pull it out so no worker ever sees it.
            let removed: i64 = redis::cmd("LREM")
                .arg(&self.queue_key)
                .arg(0)
                .arg(task_id)
                .query(conn)?;

            let mut pipe = redis::pipe();
            pipe.atomic().hset(&key, "cancel", 1).ignore();
            if removed > 0 {
                pipe.hset(&key, "status", "canceled").ignore();
            }
            pipe.expire(&key, RESULT_TTL_SECS as i64)
                .ignore()
                .query::<()>(conn)
        })
        .with_context(|| format!("Failed to flag task {} for cancel", task_id))
    }

    fn dequeue(&self, wait: Duration) -> Result<Option<String>> {
        let popped: Option<(String, String)> = self
            .with_conn(|conn| {
                redis::cmd("BRPOP")
                    .arg(&self.queue_key)
                    .arg(wait.as_secs().max(1))
                    .query(conn)
            })
            .context("Failed to pop from queue")?;
        Ok(popped.map(|(_, task_id)| task_id))
    }

    fn load_payload(&self, task_id: &str) -> Result<TaskPayload> {
        let body: Option<String> = self
            .with_conn(|conn| {
                redis::cmd("HGET")
                    .arg(Self::task_key(task_id))
                    .arg("payload")
                    .query(conn)
            })
            .with_context(|| format!("Failed to read payload of task {}", task_id))?;
        let body = body.ok_or_else(|| anyhow!("Task {} has no payload", task_id))?;
        serde_json::from_str(&body)
            .with_context(|| format!("Malformed payload for task {}", task_id))
    }

    fn mark_started(&self, task_id: &str) -> Result<()> {
        self.set_fields(
            task_id,
            &[
                ("status", "started".to_string()),
                ("started_at", chrono::Utc::now().to_rfc3339()),
            ],
            false,
        )
    }

    fn report_progress(&self, task_id: &str, progress: u8) -> Result<()> {
        self.set_fields(task_id, &[("progress", progress.to_string())], false)
    }

    fn is_cancel_requested(&self, task_id: &str) -> Result<bool> {
        let flag: Option<String> = self
            .with_conn(|conn| {
                redis::cmd("HGET")
                    .arg(Self::task_key(task_id))
                    .arg("cancel")
                    .query(conn)
            })
            .with_context(|| format!("Failed to read cancel flag of task {}", task_id))?;
        Ok(flag.as_deref() == Some("1"))
    }

    fn finish(&self, task_id: &str, outcome: &TaskOutcome) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let fields = match outcome {
            TaskOutcome::Finished(result) => vec![
                ("status", "finished".to_string()),
                ("progress", "100".to_string()),
                ("result", serde_json::to_string(result)?),
                ("finished_at", now),
            ],
            TaskOutcome::Failed(error) => vec![
                ("status", "failed".to_string()),
                ("error_code", error.code.clone()),
                ("error_message", error.message.clone()),
                ("finished_at", now),
            ],
            TaskOutcome::Canceled => vec![
                ("status", "canceled".to_string()),
                ("finished_at", now),
            ],
        };
        self.set_fields(task_id, &fields, true)
    }
}

/// Hands jobs to a queue backend; a separate worker process runs them.
pub struct QueuedExecutor {
    backend: Arc<dyn QueueBackend>,
    timeout: Duration,
}

impl QueuedExecutor {
    pub fn new(backend: Arc<dyn QueueBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }
}

impl JobExecutor for QueuedExecutor {
    fn name(&self) -> &'static str {
        "queued"
    }

    fn submit(&self, submission: &JobSubmission) -> Result<ExecutionHandle> {
        let payload = TaskPayload {
            job_id: submission.job_id.clone(),
            video_path: submission.video_path.clone(),
            params: submission.params.clone(),
            timeout_secs: self.timeout.as_secs(),
        };
        let task_id = self.backend.enqueue(&payload)?;
        Ok(ExecutionHandle::Queued { task_id })
    }

    fn observe(&self, handle: &ExecutionHandle) -> Result<Option<Observation>> {
        let ExecutionHandle::Queued { task_id } = handle else {
            return Ok(None);
        };
        match self.backend.fetch(task_id)? {
            Some(snapshot) => Ok(Some(snapshot.into_observation()?)),
            None => Ok(None),
        }
    }

    fn cancel(&self, handle: &ExecutionHandle) -> Result<()> {
        if let ExecutionHandle::Queued { task_id } = handle {
            self.backend.request_cancel(task_id)?;
        }
        Ok(())
    }
}
