mod artifacts;
mod cli;
mod jobs;
mod matting;
mod pipeline;
mod render;
mod storage;
#[cfg(test)]
mod testing;
mod video;
mod web;

use anyhow::{Context, Result};
use cli::{Args, Command, WorkerArgs};
use jobs::executor::JobRunner;
use jobs::queue::RedisQueue;
use jobs::worker::QueueWorker;
use pipeline::orchestrator::Pipeline;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use video::ffmpeg_reader::FfmpegOpener;
use web::server::run_server;

/// How long a worker blocks on an empty queue before checking for shutdown.
const WORKER_POLL_WAIT: Duration = Duration::from_secs(1);

async fn run_worker(args: WorkerArgs) -> Result<()> {
    let queue = RedisQueue::new(&args.queue.redis_url, &args.queue.queue_name)?;
    queue
        .ping()
        .with_context(|| format!("Queue backend unreachable at {}", args.queue.redis_url))?;

    let runner = Arc::new(JobRunner::new(
        Pipeline::new(Arc::new(FfmpegOpener), args.limits.pipeline_limits()),
        args.storage.storage(),
    ));
    let worker = Arc::new(QueueWorker::new(
        Arc::new(queue),
        runner,
        Arc::new(args.matting.provider()),
        WORKER_POLL_WAIT,
    ));

    let shutdown = Arc::new(AtomicBool::new(false));
    let signal_flag = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, finishing current tasks");
            signal_flag.store(true, Ordering::Relaxed);
        }
    });

    tracing::info!(
        "Worker listening on queue '{}' with {} thread(s)",
        args.queue.queue_name,
        args.concurrency
    );
    let concurrency = args.concurrency;
    tokio::task::spawn_blocking(move || worker.run(concurrency, shutdown)).await??;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing, RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse_args();

    match args.command {
        Command::Serve(serve) => run_server(serve).await?,
        Command::Worker(worker) => run_worker(worker).await?,
        Command::Render(render) => {
            tokio::task::spawn_blocking(move || render::render(&render)).await??;
        }
    }

    Ok(())
}
