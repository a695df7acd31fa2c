// Test doubles for the video, matting and queue collaborators.

use crate::jobs::model::JobRecord;
use crate::jobs::queue::{QueueBackend, TaskOutcome, TaskPayload, TaskSnapshot};
use crate::jobs::store::JobStore;
use crate::matting::{MatteSettings, Matter, MattingProvider};
use crate::pipeline::orchestrator::PipelineObserver;
use crate::video::{FrameSource, VideoOpener, VideoProbe};
use anyhow::{anyhow, bail, Result};
use image::{Rgba, RgbaImage};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
const RED: Rgba<u8> = Rgba([220, 20, 20, 255]);

/// White frames with a red square that drifts right over time.
#[derive(Debug, Clone)]
pub struct SyntheticOpener {
    duration_sec: f64,
    width: u32,
    height: u32,
    delay: Option<Duration>,
    fail_from: Option<f64>,
}

impl SyntheticOpener {
    pub fn new(duration_sec: f64) -> Self {
        Self {
            duration_sec,
            width: 64,
            height: 48,
            delay: None,
            fail_from: None,
        }
    }

    /// Sleep this long on every extraction.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every extraction at or after `timestamp_sec`.
    pub fn failing_at(mut self, timestamp_sec: f64) -> Self {
        self.fail_from = Some(timestamp_sec);
        self
    }
}

impl VideoOpener for SyntheticOpener {
    fn open(&self, _path: &Path) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(self.clone()))
    }
}

impl FrameSource for SyntheticOpener {
    fn probe(&self) -> Result<VideoProbe> {
        Ok(VideoProbe {
            duration_sec: self.duration_sec,
            width: self.width,
            height: self.height,
            fps: 30.0,
        })
    }

    fn extract(&mut self, timestamp_sec: f64) -> Result<RgbaImage> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if let Some(limit) = self.fail_from {
            if timestamp_sec >= limit {
                bail!("decoder error at {:.3}s", timestamp_sec);
            }
        }
        let offset = ((timestamp_sec * 20.0) as u32) % (self.width - 8);
        let top = self.height / 2 - 4;
        Ok(RgbaImage::from_fn(self.width, self.height, |x, y| {
            if x >= offset && x < offset + 8 && y >= top && y < top + 8 {
                RED
            } else {
                WHITE
            }
        }))
    }
}

/// Treats near-white pixels as background.
pub struct KeyWhiteMatter;

impl Matter for KeyWhiteMatter {
    fn matte(&mut self, frame: &RgbaImage, _settings: &MatteSettings) -> Result<RgbaImage> {
        let mut out = frame.clone();
        for px in out.pixels_mut() {
            if px[0] >= 250 && px[1] >= 250 && px[2] >= 250 {
                px[3] = 0;
            }
        }
        Ok(out)
    }
}

#[derive(Default)]
pub struct KeyWhiteProvider {
    pub created: AtomicUsize,
}

impl MattingProvider for KeyWhiteProvider {
    fn create_session(&self) -> Result<Box<dyn Matter>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(KeyWhiteMatter))
    }
}

/// Matter whose calls always panic.
pub struct PanickingMatter;

impl Matter for PanickingMatter {
    fn matte(&mut self, _frame: &RgbaImage, _settings: &MatteSettings) -> Result<RgbaImage> {
        panic!("matting model crashed");
    }
}

/// The first session it hands out panics; later ones key out white.
#[derive(Default)]
pub struct PanicOnceProvider {
    pub created: AtomicUsize,
}

impl MattingProvider for PanicOnceProvider {
    fn create_session(&self) -> Result<Box<dyn Matter>> {
        if self.created.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(Box::new(PanickingMatter))
        } else {
            Ok(Box::new(KeyWhiteMatter))
        }
    }
}

pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

#[derive(Default)]
pub struct RecordingObserver {
    progress: Mutex<Vec<u8>>,
}

impl RecordingObserver {
    pub fn progress(&self) -> Vec<u8> {
        self.progress.lock().unwrap().clone()
    }
}

impl PipelineObserver for RecordingObserver {
    fn on_progress(&self, percent: u8) {
        self.progress.lock().unwrap().push(percent);
    }
}

/// Reports a cancel once it has been asked more than `limit` times.
pub struct CancelAfter {
    checks: AtomicUsize,
    limit: usize,
}

impl CancelAfter {
    pub fn new(limit: usize) -> Self {
        Self {
            checks: AtomicUsize::new(0),
            limit,
        }
    }
}

impl PipelineObserver for CancelAfter {
    fn is_canceled(&self) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst) >= self.limit
    }
}

struct MemoryTask {
    payload: TaskPayload,
    snapshot: TaskSnapshot,
    cancel: bool,
}

/// In-process queue backend with switches to simulate an unreachable server.
#[derive(Default)]
pub struct MemoryQueue {
    pub fail_enqueue: AtomicBool,
    pub fail_fetch: AtomicBool,
    /// The next `mark_started` call fails once.
    pub fail_next_start: AtomicBool,
    pending: Mutex<VecDeque<String>>,
    tasks: Mutex<HashMap<String, MemoryTask>>,
}

impl MemoryQueue {
    pub fn snapshot(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.tasks
            .lock()
            .unwrap()
            .get(task_id)
            .map(|t| t.snapshot.clone())
    }

    pub fn set_status(&self, task_id: &str, status: &str) {
        if let Some(task) = self.tasks.lock().unwrap().get_mut(task_id) {
            task.snapshot.status = status.to_string();
        }
    }

    /// Raise the cancel flag without pulling the task from the pending list.
    pub fn flag_cancel(&self, task_id: &str) {
        if let Some(task) = self.tasks.lock().unwrap().get_mut(task_id) {
            task.cancel = true;
        }
    }

    fn with_task<T>(&self, task_id: &str, f: impl FnOnce(&mut MemoryTask) -> T) -> Result<T> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| anyhow!("unknown task {}", task_id))?;
        Ok(f(task))
    }
}

impl QueueBackend for MemoryQueue {
    fn enqueue(&self, payload: &TaskPayload) -> Result<String> {
        if self.fail_enqueue.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        let task_id = payload.job_id.clone();
        self.tasks.lock().unwrap().insert(
            task_id.clone(),
            MemoryTask {
                payload: payload.clone(),
                snapshot: TaskSnapshot {
                    status: "queued".to_string(),
                    progress: Some(0),
                    result: None,
                    error: None,
                },
                cancel: false,
            },
        );
        self.pending.lock().unwrap().push_back(task_id.clone());
        Ok(task_id)
    }

    fn fetch(&self, task_id: &str) -> Result<Option<TaskSnapshot>> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        Ok(self.snapshot(task_id))
    }

    fn request_cancel(&self, task_id: &str) -> Result<()> {
        let mut pending = self.pending.lock().unwrap();
        let was_pending = pending.iter().any(|id| id == task_id);
        pending.retain(|id| id != task_id);
        self.with_task(task_id, |task| {
            task.cancel = true;
            if was_pending {
                task.snapshot.status = "canceled".to_string();
            }
        })
    }

    fn dequeue(&self, _wait: Duration) -> Result<Option<String>> {
        Ok(self.pending.lock().unwrap().pop_front())
    }

    fn load_payload(&self, task_id: &str) -> Result<TaskPayload> {
        self.with_task(task_id, |task| task.payload.clone())
    }

    fn mark_started(&self, task_id: &str) -> Result<()> {
        if self.fail_next_start.swap(false, Ordering::SeqCst) {
            bail!("connection reset");
        }
        self.with_task(task_id, |task| task.snapshot.status = "started".to_string())
    }

    fn report_progress(&self, task_id: &str, progress: u8) -> Result<()> {
        self.with_task(task_id, |task| task.snapshot.progress = Some(progress))
    }

    fn is_cancel_requested(&self, task_id: &str) -> Result<bool> {
        self.with_task(task_id, |task| task.cancel)
    }

    fn finish(&self, task_id: &str, outcome: &TaskOutcome) -> Result<()> {
        self.with_task(task_id, |task| match outcome {
            TaskOutcome::Finished(result) => {
                task.snapshot.status = "finished".to_string();
                task.snapshot.progress = Some(100);
                task.snapshot.result = Some(result.clone());
            }
            TaskOutcome::Failed(error) => {
                task.snapshot.status = "failed".to_string();
                task.snapshot.error = Some(error.clone());
            }
            TaskOutcome::Canceled => task.snapshot.status = "canceled".to_string(),
        })
    }
}

/// Poll the store until the record reaches a terminal state.
pub fn wait_for_terminal(store: &dyn JobStore, job_id: &str) -> JobRecord {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let record = store
            .get(job_id)
            .unwrap_or_else(|| panic!("job {job_id} disappeared"));
        if record.status.is_terminal() {
            return record;
        }
        assert!(Instant::now() < deadline, "job {job_id} never finished");
        std::thread::sleep(Duration::from_millis(10));
    }
}
