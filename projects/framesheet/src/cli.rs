use crate::matting::rembg::RembgProvider;
use crate::pipeline::orchestrator::PipelineLimits;
use crate::storage::Storage;
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP API
    Serve(ServeArgs),
    /// Run queue workers
    Worker(WorkerArgs),
    /// Render one video to a sprite sheet locally
    Render(RenderArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct StorageArgs {
    /// Uploaded videos, one directory per job
    #[arg(long, env = "UPLOAD_DIR", default_value = "./data/uploads")]
    pub upload_dir: PathBuf,

    /// Sprite sheets and indexes, one directory per job
    #[arg(long, env = "OUTPUT_DIR", default_value = "./data/outputs")]
    pub output_dir: PathBuf,

    /// Scratch frames, removed after each job
    #[arg(long, env = "TEMP_DIR", default_value = "./data/temp")]
    pub temp_dir: PathBuf,
}

impl StorageArgs {
    pub fn storage(&self) -> Storage {
        Storage::new(&self.upload_dir, &self.output_dir, &self.temp_dir)
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct QueueArgs {
    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379/0")]
    pub redis_url: String,

    #[arg(long, env = "QUEUE_NAME", default_value = "pixelwork")]
    pub queue_name: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct MattingArgs {
    /// rembg executable
    #[arg(long, env = "REMBG_BIN", default_value = "rembg")]
    pub rembg_bin: String,

    #[arg(long, env = "REMBG_MODEL", default_value = "u2net")]
    pub rembg_model: String,
}

impl MattingArgs {
    pub fn provider(&self) -> RembgProvider {
        RembgProvider::new(&self.rembg_bin, &self.rembg_model)
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct LimitArgs {
    #[arg(long, env = "MAX_UPLOAD_SIZE_MB", default_value_t = 200)]
    pub max_upload_size_mb: u64,

    #[arg(long, env = "MAX_VIDEO_DURATION_SEC", default_value_t = 300)]
    pub max_video_duration_sec: u32,

    /// Largest sprite sheet edge in pixels
    #[arg(long, env = "MAX_SHEET_EDGE", default_value_t = 16384)]
    pub max_sheet_edge: u32,
}

impl LimitArgs {
    pub fn pipeline_limits(&self) -> PipelineLimits {
        PipelineLimits {
            max_video_duration_sec: self.max_video_duration_sec,
            max_sheet_edge: self.max_sheet_edge,
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port to bind to
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// Run every job in-process instead of through the queue
    #[arg(long, env = "NO_QUEUE")]
    pub no_queue: bool,

    #[command(flatten)]
    pub storage: StorageArgs,

    #[command(flatten)]
    pub queue: QueueArgs,

    #[command(flatten)]
    pub matting: MattingArgs,

    #[command(flatten)]
    pub limits: LimitArgs,
}

#[derive(clap::Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Worker threads, each with its own matting session
    #[arg(long, env = "WORKER_CONCURRENCY", default_value_t = 1)]
    pub concurrency: usize,

    #[command(flatten)]
    pub storage: StorageArgs,

    #[command(flatten)]
    pub queue: QueueArgs,

    #[command(flatten)]
    pub matting: MattingArgs,

    #[command(flatten)]
    pub limits: LimitArgs,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RenderArgs {
    /// Source video
    #[arg(long)]
    pub video: PathBuf,

    /// JSON file with job parameters; defaults apply when omitted
    #[arg(long)]
    pub params: Option<PathBuf>,

    /// Directory receiving sprite.png and index.json
    #[arg(long)]
    pub out: PathBuf,

    #[command(flatten)]
    pub matting: MattingArgs,

    #[command(flatten)]
    pub limits: LimitArgs,
}
