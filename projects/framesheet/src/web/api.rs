use crate::artifacts::SpriteIndex;
use crate::jobs::model::{generate_job_id, JobRecord, JobStatus};
use crate::pipeline::error::ValidationError;
use crate::pipeline::params::JobParams;
use crate::storage::{is_allowed_video, is_safe_job_id, ALLOWED_EXTENSIONS};
use crate::web::AppState;
use axum::{
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Handler error rendered as `{"detail": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(e) => {
                tracing::error!("Request failed: {:#}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

fn job_not_found() -> ApiError {
    ApiError::NotFound("Job not found".to_string())
}

/// Run blocking service work (file I/O, queue round-trips) off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("Worker task failed: {}", e)))
}

pub(crate) async fn load_record(state: &AppState, job_id: &str) -> Result<JobRecord, ApiError> {
    if !is_safe_job_id(job_id) {
        return Err(job_not_found());
    }
    let service = state.service.clone();
    let id = job_id.to_string();
    blocking(move || service.observe(&id))
        .await?
        .ok_or_else(job_not_found)
}

fn require_completed(record: &JobRecord) -> Result<(), ApiError> {
    if record.status != JobStatus::Completed {
        return Err(ApiError::BadRequest(format!(
            "Job not completed (status: {})",
            record.status
        )));
    }
    Ok(())
}

#[derive(Serialize)]
pub struct CreateJobResponse {
    pub job_id: String,
}

/// Validated upload, before anything touches the disk.
struct Upload {
    filename: String,
    bytes: axum::body::Bytes,
    params: JobParams,
}

fn validate_upload(
    filename: Option<String>,
    bytes: Option<axum::body::Bytes>,
    params: Option<String>,
    max_bytes: u64,
) -> Result<Upload, ValidationError> {
    let (filename, bytes) = match (filename, bytes) {
        (Some(f), Some(b)) if !f.is_empty() => (f, b),
        _ => return Err(ValidationError::MissingFile),
    };
    if !is_allowed_video(&filename) {
        return Err(ValidationError::UnsupportedFormat(ALLOWED_EXTENSIONS.join(", ")));
    }
    if bytes.len() as u64 > max_bytes {
        return Err(ValidationError::TooLarge(max_bytes / (1024 * 1024)));
    }
    let params = JobParams::from_json(params.as_deref().unwrap_or(""))?;
    Ok(Upload {
        filename,
        bytes,
        params,
    })
}

pub async fn create_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<CreateJobResponse>, ApiError> {
    let mut filename = None;
    let mut bytes = None;
    let mut params = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                filename = field.file_name().map(str::to_string);
                bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::BadRequest(e.body_text()))?,
                );
            }
            "params" => {
                params = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::BadRequest(e.body_text()))?,
                );
            }
            _ => {}
        }
    }

    let upload = validate_upload(filename, bytes, params, state.max_upload_bytes)?;
    let job_id = generate_job_id();

    let service = state.service.clone();
    let id = job_id.clone();
    let record = blocking(move || -> anyhow::Result<JobRecord> {
        let video = service
            .storage()
            .save_upload(&id, &upload.filename, &upload.bytes)?;
        match service.submit(&id, video, upload.params) {
            Ok(record) => Ok(record),
            Err(e) => {
                let _ = service.storage().remove_job(&id);
                Err(e)
            }
        }
    })
    .await??;

    tracing::info!("Job {}: created ({})", record.id, record.status);
    Ok(Json(CreateJobResponse { job_id }))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    Ok(Json(load_record(&state, &job_id).await?))
}

#[derive(Deserialize)]
pub struct ResultQuery {
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_format() -> String {
    "png".to_string()
}

pub async fn get_result(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<ResultQuery>,
) -> Result<Response, ApiError> {
    let record = load_record(&state, &job_id).await?;
    require_completed(&record)?;

    let service = state.service.clone();
    let id = job_id.clone();
    let (bytes, content_type, filename) = match query.format.as_str() {
        "png" => {
            let path = service.storage().sprite_path(&id);
            let bytes = blocking(move || std::fs::read(path))
                .await?
                .map_err(|_| ApiError::NotFound("Result file not found".to_string()))?;
            (bytes, "image/png", format!("sprite_{}.png", job_id))
        }
        "zip" => {
            let bytes = blocking(move || service.storage().bundle_zip(&id)).await??;
            (bytes, "application/zip", format!("sprite_{}.zip", job_id))
        }
        other => {
            return Err(ApiError::BadRequest(format!(
                "Unknown format '{}', expected png or zip",
                other
            )))
        }
    };

    Ok(Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        )
        .body(Body::from(bytes))
        .map_err(|e| ApiError::Internal(e.into()))?)
}

pub async fn get_index(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<SpriteIndex>, ApiError> {
    let record = load_record(&state, &job_id).await?;
    require_completed(&record)?;

    let path = state.service.storage().index_path(&job_id);
    if !path.is_file() {
        return Err(ApiError::NotFound("Index file not found".to_string()));
    }
    let index = blocking(move || SpriteIndex::read_from(&path)).await??;
    Ok(Json(index))
}

pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !is_safe_job_id(&job_id) {
        return Err(job_not_found());
    }
    let service = state.service.clone();
    let id = job_id.clone();
    if !blocking(move || service.delete(&id)).await?? {
        return Err(job_not_found());
    }
    Ok(Json(json!({ "ok": true })))
}
