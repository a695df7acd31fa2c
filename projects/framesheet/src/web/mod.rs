// HTTP surface over the job service

pub mod api;
pub mod events;
pub mod server;

use crate::jobs::service::JobService;
use std::sync::Arc;

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<JobService>,
    pub max_upload_bytes: u64,
}
