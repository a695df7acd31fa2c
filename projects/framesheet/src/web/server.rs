use crate::cli::ServeArgs;
use crate::jobs::executor::{InlineExecutor, JobExecutor, JobRunner};
use crate::jobs::queue::{QueuedExecutor, RedisQueue, DEFAULT_JOB_TIMEOUT};
use crate::jobs::service::JobService;
use crate::jobs::store::{JobStore, MemoryJobStore};
use crate::matting::SharedMatter;
use crate::pipeline::orchestrator::Pipeline;
use crate::video::ffmpeg_reader::FfmpegOpener;
use crate::web::api::{create_job, delete_job, get_index, get_job, get_result};
use crate::web::events::job_events;
use crate::web::AppState;
use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub fn router(state: AppState) -> Router {
    // Leave headroom for the multipart framing and the params field.
    let body_limit = state.max_upload_bytes as usize + 1024 * 1024;

    Router::new()
        .route("/jobs", post(create_job))
        .route("/jobs/:job_id", get(get_job).delete(delete_job))
        .route("/jobs/:job_id/result", get(get_result))
        .route("/jobs/:job_id/index", get(get_index))
        .route("/jobs/:job_id/events", get(job_events))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn build_state(args: &ServeArgs) -> Result<AppState> {
    let storage = args.storage.storage();
    storage.ensure_dirs()?;

    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let runner = Arc::new(JobRunner::new(
        Pipeline::new(Arc::new(FfmpegOpener), args.limits.pipeline_limits()),
        storage.clone(),
    ));
    let matter = SharedMatter::new(Arc::new(args.matting.provider()));

    let mut executors: Vec<Arc<dyn JobExecutor>> = Vec::new();
    if args.no_queue {
        info!("Queue disabled, jobs run in-process");
        if let Err(e) = matter.ensure_ready() {
            warn!("Matting session not ready, retrying on first job: {:#}", e);
        }
    } else {
        match RedisQueue::new(&args.queue.redis_url, &args.queue.queue_name) {
            Ok(queue) => {
                if let Err(e) = queue.ping() {
                    warn!(
                        "Queue backend unreachable at startup, jobs run in-process until it returns: {:#}",
                        e
                    );
                }
                executors.push(Arc::new(QueuedExecutor::new(
                    Arc::new(queue),
                    DEFAULT_JOB_TIMEOUT,
                )));
            }
            Err(e) => warn!("Queue backend disabled: {:#}", e),
        }
    }
    executors.push(Arc::new(InlineExecutor::new(store.clone(), runner, matter)));

    Ok(AppState {
        service: Arc::new(JobService::new(store, executors, storage)),
        max_upload_bytes: args.limits.max_upload_size_mb * 1024 * 1024,
    })
}

/// Bind exactly the requested address. A busy port is an error.
async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))
}

pub async fn run_server(args: ServeArgs) -> Result<()> {
    let state = build_state(&args)?;
    let listener = bind(SocketAddr::new(args.host, args.port)).await?;
    let app = router(state);

    info!("Framesheet server started on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
