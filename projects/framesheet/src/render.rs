// Local one-shot rendering: the job pipeline without the HTTP service or queue.

use crate::cli::RenderArgs;
use crate::jobs::model::generate_job_id;
use crate::matting::MattingProvider;
use crate::pipeline::orchestrator::{JobPaths, Pipeline, PipelineObserver, PipelineOutput};
use crate::pipeline::params::JobParams;
use crate::video::ffmpeg_reader::FfmpegOpener;
use crate::video::VideoOpener;
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::Path;
use std::sync::Arc;

struct BarObserver {
    pb: ProgressBar,
}

impl PipelineObserver for BarObserver {
    fn on_progress(&self, percent: u8) {
        self.pb.set_position(percent as u64);
    }
}

fn load_params(path: Option<&Path>) -> Result<JobParams> {
    let Some(path) = path else {
        return Ok(JobParams::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read params file {}", path.display()))?;
    JobParams::from_json(&raw).with_context(|| format!("Invalid params in {}", path.display()))
}

pub fn render(args: &RenderArgs) -> Result<PipelineOutput> {
    let params = load_params(args.params.as_deref())?;
    render_with(
        Arc::new(FfmpegOpener),
        &args.matting.provider(),
        args,
        &params,
    )
}

fn render_with(
    opener: Arc<dyn VideoOpener>,
    provider: &dyn MattingProvider,
    args: &RenderArgs,
    params: &JobParams,
) -> Result<PipelineOutput> {
    let job_id = generate_job_id();
    let paths = JobPaths {
        video: args.video.clone(),
        temp_dir: std::env::temp_dir().join(format!("framesheet-{}", job_id)),
        output_dir: args.out.clone(),
    };

    let mut matter = provider
        .create_session()
        .context("Failed to create matting session")?;
    let pipeline = Pipeline::new(opener, args.limits.pipeline_limits());

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% ({eta})")?
            .progress_chars("#>-"),
    );
    let observer = BarObserver { pb: pb.clone() };

    let result = pipeline.run(&job_id, &paths, params, matter.as_mut(), &observer);
    match &result {
        Ok(_) => pb.finish_with_message("Done"),
        Err(_) => pb.abandon(),
    }
    let output = result.with_context(|| format!("Failed to render {}", args.video.display()))?;

    tracing::info!(
        "Wrote {} frames to {} ({}x{})",
        output.frame_count,
        paths.sprite_path().display(),
        output.width,
        output.height
    );
    Ok(output)
}
