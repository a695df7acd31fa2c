// Pipeline orchestrator: runs one job from source video to sprite sheet
//
// Sequences sampling, frame extraction, matting, normalization, layout and
// composition. Intermediate frames live under the job's temp directory,
// which is removed whatever the outcome.

use crate::artifacts::{INDEX_FILE, SPRITE_FILE};
use crate::matting::{MatteSettings, Matter};
use crate::pipeline::atlas;
use crate::pipeline::error::PipelineError;
use crate::pipeline::layout::LayoutPlan;
use crate::pipeline::normalize::FrameNormalizer;
use crate::pipeline::params::JobParams;
use crate::pipeline::sampler::{FrameSample, TimeSampler};
use crate::video::VideoOpener;
use anyhow::Context;
use image::{ImageFormat, RgbaImage};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const FRAMES_DIR: &str = "frames";
const PROCESSED_DIR: &str = "processed";

/// Progress bands per stage, in percent.
const EXTRACT_BAND: (u8, u8) = (0, 40);
const MATTE_BAND: (u8, u8) = (40, 90);
const COMPOSE_BAND: (u8, u8) = (90, 99);

/// Concrete locations handed to the pipeline for one job.
#[derive(Debug, Clone)]
pub struct JobPaths {
    pub video: PathBuf,
    pub temp_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl JobPaths {
    pub fn sprite_path(&self) -> PathBuf {
        self.output_dir.join(SPRITE_FILE)
    }

    pub fn index_path(&self) -> PathBuf {
        self.output_dir.join(INDEX_FILE)
    }
}

/// Receives progress and answers cancellation checks at frame boundaries.
pub trait PipelineObserver: Send + Sync {
    fn on_progress(&self, _percent: u8) {}

    fn is_canceled(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineLimits {
    pub max_video_duration_sec: u32,
    pub max_sheet_edge: u32,
}

impl Default for PipelineLimits {
    fn default() -> Self {
        Self {
            max_video_duration_sec: 300,
            max_sheet_edge: 16384,
        }
    }
}

/// Summary of a finished run; the artifacts are on disk under `JobPaths::output_dir`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOutput {
    pub frame_count: usize,
    pub width: u32,
    pub height: u32,
}

/// Percentage reached after `done` of `total` items inside a band.
fn band_progress(band: (u8, u8), done: usize, total: usize) -> u8 {
    let (start, end) = band;
    if total == 0 {
        return end;
    }
    let span = (end - start) as usize;
    start + (span * done.min(total) / total) as u8
}

fn frame_file(dir: &Path, prefix: &str, index: usize) -> PathBuf {
    dir.join(format!("{}_{:05}.png", prefix, index))
}

fn load_png(path: &Path) -> anyhow::Result<RgbaImage> {
    let img = image::open(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(img.to_rgba8())
}

fn save_png(img: &RgbaImage, path: &Path) -> anyhow::Result<()> {
    img.save_with_format(path, ImageFormat::Png)
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Removes the job's temp dir on drop, including while unwinding.
struct TempCleanup<'a> {
    job_id: &'a str,
    dir: &'a Path,
}

impl Drop for TempCleanup<'_> {
    fn drop(&mut self) {
        if !self.dir.exists() {
            return;
        }
        if let Err(e) = fs::remove_dir_all(self.dir) {
            tracing::warn!(
                "Job {}: failed to remove temp dir {}: {}",
                self.job_id,
                self.dir.display(),
                e
            );
        }
    }
}

pub struct Pipeline {
    opener: Arc<dyn VideoOpener>,
    limits: PipelineLimits,
}

impl Pipeline {
    pub fn new(opener: Arc<dyn VideoOpener>, limits: PipelineLimits) -> Self {
        Self { opener, limits }
    }

    /// Run one job to completion, failure or cancellation.
    pub fn run(
        &self,
        job_id: &str,
        paths: &JobPaths,
        params: &JobParams,
        matter: &mut dyn Matter,
        observer: &dyn PipelineObserver,
    ) -> Result<PipelineOutput, PipelineError> {
        tracing::info!("Job {}: pipeline started for {}", job_id, paths.video.display());

        let result = {
            let _cleanup = TempCleanup {
                job_id,
                dir: &paths.temp_dir,
            };
            self.run_stages(job_id, paths, params, matter, observer)
        };

        match &result {
            Ok(output) => tracing::info!(
                "Job {}: pipeline finished, {} frames on a {}x{} sheet",
                job_id,
                output.frame_count,
                output.width,
                output.height
            ),
            Err(PipelineError::Canceled) => tracing::info!("Job {}: pipeline canceled", job_id),
            Err(e) => tracing::error!("Job {}: pipeline failed [{}]: {}", job_id, e.code(), e),
        }

        result
    }

    fn run_stages(
        &self,
        job_id: &str,
        paths: &JobPaths,
        params: &JobParams,
        matter: &mut dyn Matter,
        observer: &dyn PipelineObserver,
    ) -> Result<PipelineOutput, PipelineError> {
        // 1. Open and probe the source
        if !paths.video.is_file() {
            return Err(PipelineError::VideoNotFound(
                paths.video.display().to_string(),
            ));
        }
        let mut source = self
            .opener
            .open(&paths.video)
            .map_err(PipelineError::Extraction)?;
        let probe = source.probe().map_err(PipelineError::Extraction)?;
        tracing::debug!(
            "Job {}: source {}x{} at {:.2}fps, {:.2}s",
            job_id,
            probe.width,
            probe.height,
            probe.fps,
            probe.duration_sec
        );

        if probe.duration_sec > self.limits.max_video_duration_sec as f64 {
            return Err(PipelineError::VideoTooLong {
                duration: probe.duration_sec,
                limit: self.limits.max_video_duration_sec,
            });
        }

        // 2. Sample timestamps
        let sampler = TimeSampler::new(
            params.fps,
            params.frame_range.start_sec,
            params.frame_range.end_sec,
            params.max_frames,
            probe.duration_sec,
        );
        let samples: Vec<FrameSample> = sampler.collect();
        if samples.is_empty() {
            return Err(PipelineError::NoFrames);
        }

        // 3. Plan the grid up front so an impossible sheet fails before any decoding
        let layout = LayoutPlan::plan(
            samples.len(),
            params.target_size.w,
            params.target_size.h,
            params.spacing,
            params.layout_mode,
            params.fixed_columns(),
        );
        if layout.sheet_width > self.limits.max_sheet_edge
            || layout.sheet_height > self.limits.max_sheet_edge
        {
            return Err(PipelineError::Layout(format!(
                "{}x{} sheet exceeds the {}px edge limit",
                layout.sheet_width, layout.sheet_height, self.limits.max_sheet_edge
            )));
        }

        let frames_dir = paths.temp_dir.join(FRAMES_DIR);
        let processed_dir = paths.temp_dir.join(PROCESSED_DIR);
        fs::create_dir_all(&frames_dir)
            .and_then(|_| fs::create_dir_all(&processed_dir))
            .with_context(|| format!("Failed to create {}", paths.temp_dir.display()))?;

        // 4. Extract every sampled frame
        let total = samples.len();
        for sample in &samples {
            if observer.is_canceled() {
                return Err(PipelineError::Canceled);
            }
            let frame = source
                .extract(sample.timestamp_sec)
                .with_context(|| {
                    format!(
                        "frame {} at {:.3}s",
                        sample.index, sample.timestamp_sec
                    )
                })
                .map_err(PipelineError::Extraction)?;
            save_png(&frame, &frame_file(&frames_dir, "frame", sample.index))?;
            observer.on_progress(band_progress(EXTRACT_BAND, sample.index + 1, total));
        }
        drop(source);

        // 5. Matte and normalize, strictly in sample order
        let settings = MatteSettings::from_strength(params.matte_strength);
        let normalizer = FrameNormalizer::new(params);
        for sample in &samples {
            if observer.is_canceled() {
                return Err(PipelineError::Canceled);
            }
            let raw = load_png(&frame_file(&frames_dir, "frame", sample.index))?;
            let matted = matter
                .matte(&raw, &settings)
                .with_context(|| format!("frame {}", sample.index))
                .map_err(PipelineError::Matting)?;
            let tile = normalizer.normalize(&matted);
            save_png(&tile, &frame_file(&processed_dir, "out", sample.index))?;
            tracing::debug!("Job {}: frame {} normalized", job_id, sample.index);
            observer.on_progress(band_progress(MATTE_BAND, sample.index + 1, total));
        }

        if observer.is_canceled() {
            return Err(PipelineError::Canceled);
        }

        // 6. Compose the sheet from the processed tiles
        let timestamps: Vec<f64> = samples.iter().map(|s| s.timestamp_sec).collect();
        let tiles = samples
            .iter()
            .map(|s| load_png(&frame_file(&processed_dir, "out", s.index)));
        let sheet = atlas::compose(tiles, &timestamps, &layout)?;
        observer.on_progress(band_progress(COMPOSE_BAND, 1, 2));

        // 7. Persist the artifacts
        fs::create_dir_all(&paths.output_dir)
            .with_context(|| format!("Failed to create {}", paths.output_dir.display()))?;
        save_png(&sheet.image, &paths.sprite_path())?;
        sheet.index.write_to(&paths.index_path())?;
        observer.on_progress(COMPOSE_BAND.1);

        Ok(PipelineOutput {
            frame_count: sheet.index.frames.len(),
            width: layout.sheet_width,
            height: layout.sheet_height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::SpriteIndex;
    use crate::pipeline::params::{FrameRange, LayoutMode, TargetSize};
    use crate::testing::{
        CancelAfter, KeyWhiteMatter, NoopObserver, RecordingObserver, SyntheticOpener,
    };
    use tempfile::TempDir;

    fn setup(dir: &TempDir, name: &str) -> JobPaths {
        let video = dir.path().join("input.mp4");
        fs::write(&video, b"synthetic").unwrap();
        JobPaths {
            video,
            temp_dir: dir.path().join("temp").join(name),
            output_dir: dir.path().join("outputs").join(name),
        }
    }

    fn small_params() -> JobParams {
        JobParams {
            fps: 12,
            frame_range: FrameRange {
                start_sec: 0.0,
                end_sec: Some(1.0),
            },
            target_size: TargetSize { w: 32, h: 32 },
            padding: 2,
            spacing: 4,
            layout_mode: LayoutMode::FixedColumns,
            columns: 4,
            ..JobParams::default()
        }
    }

    fn pipeline(duration_sec: f64) -> Pipeline {
        Pipeline::new(
            Arc::new(SyntheticOpener::new(duration_sec)),
            PipelineLimits::default(),
        )
    }

    #[test]
    fn test_band_progress() {
        assert_eq!(band_progress(EXTRACT_BAND, 0, 10), 0);
        assert_eq!(band_progress(EXTRACT_BAND, 5, 10), 20);
        assert_eq!(band_progress(MATTE_BAND, 10, 10), 90);
        assert_eq!(band_progress(COMPOSE_BAND, 1, 2), 94);
        assert_eq!(band_progress(MATTE_BAND, 3, 0), 90);
    }

    #[test]
    fn test_full_run_writes_artifacts_and_cleans_temp() {
        let dir = tempfile::tempdir().unwrap();
        let paths = setup(&dir, "job1");
        let observer = RecordingObserver::default();

        let output = pipeline(3.0)
            .run("job1", &paths, &small_params(), &mut KeyWhiteMatter, &observer)
            .unwrap();

        assert_eq!(output.frame_count, 12);
        assert_eq!((output.width, output.height), (4 * 36 - 4, 3 * 36 - 4));
        assert!(paths.sprite_path().is_file());
        assert!(!paths.temp_dir.exists());

        let index = SpriteIndex::read_from(&paths.index_path()).unwrap();
        assert_eq!(index.frames.len(), 12);
        assert_eq!(index.frames[11].t, 0.917);
        assert_eq!((index.frames[5].x, index.frames[5].y), (36, 36));

        let sheet = image::open(paths.sprite_path()).unwrap();
        assert_eq!(sheet.width(), output.width);
        assert_eq!(sheet.height(), output.height);

        let progress = observer.progress();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.last().copied(), Some(99));
    }

    #[test]
    fn test_rerun_produces_identical_index() {
        let dir = tempfile::tempdir().unwrap();
        let first = setup(&dir, "a");
        let second = setup(&dir, "b");
        let p = pipeline(2.0);

        p.run("a", &first, &small_params(), &mut KeyWhiteMatter, &NoopObserver)
            .unwrap();
        p.run("b", &second, &small_params(), &mut KeyWhiteMatter, &NoopObserver)
            .unwrap();

        let a = fs::read_to_string(first.index_path()).unwrap();
        let b = fs::read_to_string(second.index_path()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_frames_fails_with_no_frames() {
        let dir = tempfile::tempdir().unwrap();
        let paths = setup(&dir, "empty");
        let mut params = small_params();
        params.frame_range = FrameRange {
            start_sec: 1.5,
            end_sec: Some(1.5),
        };

        let err = pipeline(3.0)
            .run("empty", &paths, &params, &mut KeyWhiteMatter, &NoopObserver)
            .err()
            .unwrap();
        assert_eq!(err.code(), "NO_FRAMES");
        assert!(!paths.output_dir.exists());
    }

    #[test]
    fn test_missing_video() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = setup(&dir, "missing");
        paths.video = dir.path().join("nope.mp4");

        let err = pipeline(3.0)
            .run("missing", &paths, &small_params(), &mut KeyWhiteMatter, &NoopObserver)
            .err()
            .unwrap();
        assert_eq!(err.code(), "VIDEO_NOT_FOUND");
    }

    #[test]
    fn test_duration_limit() {
        let dir = tempfile::tempdir().unwrap();
        let paths = setup(&dir, "long");

        let err = pipeline(301.0)
            .run("long", &paths, &small_params(), &mut KeyWhiteMatter, &NoopObserver)
            .err()
            .unwrap();
        assert_eq!(err.code(), "VIDEO_TOO_LONG");
    }

    #[test]
    fn test_sheet_edge_limit() {
        let dir = tempfile::tempdir().unwrap();
        let paths = setup(&dir, "wide");
        let p = Pipeline::new(
            Arc::new(SyntheticOpener::new(3.0)),
            PipelineLimits {
                max_video_duration_sec: 300,
                max_sheet_edge: 100,
            },
        );

        let err = p
            .run("wide", &paths, &small_params(), &mut KeyWhiteMatter, &NoopObserver)
            .err()
            .unwrap();
        assert_eq!(err.code(), "LAYOUT_ERROR");
        assert!(!paths.temp_dir.exists());
    }

    #[test]
    fn test_extraction_failure_still_cleans_temp() {
        let dir = tempfile::tempdir().unwrap();
        let paths = setup(&dir, "broken");
        let p = Pipeline::new(
            Arc::new(SyntheticOpener::new(3.0).failing_at(0.5)),
            PipelineLimits::default(),
        );

        let err = p
            .run("broken", &paths, &small_params(), &mut KeyWhiteMatter, &NoopObserver)
            .err()
            .unwrap();
        assert_eq!(err.code(), "EXTRACTION_ERROR");
        assert!(!paths.temp_dir.exists());
    }

    #[test]
    fn test_cancel_checked_between_frames() {
        let dir = tempfile::tempdir().unwrap();
        let paths = setup(&dir, "cancel");
        let observer = CancelAfter::new(5);

        let err = pipeline(3.0)
            .run("cancel", &paths, &small_params(), &mut KeyWhiteMatter, &observer)
            .err()
            .unwrap();
        assert_eq!(err.code(), "CANCELED");
        assert!(!paths.temp_dir.exists());
        assert!(!paths.sprite_path().exists());
    }
}
