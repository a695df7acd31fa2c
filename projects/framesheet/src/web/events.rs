// Server-sent job status: one event per change until the job is terminal.

use crate::web::api::{load_record, ApiError};
use crate::web::AppState;
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use std::convert::Infallible;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub async fn job_events(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // 404 up front rather than an empty stream
    load_record(&state, &job_id).await?;

    let stream = async_stream::stream! {
        let mut last_sent: Option<String> = None;
        loop {
            let record = match load_record(&state, &job_id).await {
                Ok(record) => record,
                Err(_) => {
                    yield Ok(Event::default().event("deleted").data(job_id.clone()));
                    break;
                }
            };

            let payload = match serde_json::to_string(&record) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!("Job {}: failed to encode status event: {}", job_id, e);
                    break;
                }
            };
            if last_sent.as_deref() != Some(payload.as_str()) {
                yield Ok(Event::default().event("status").data(payload.clone()));
                last_sent = Some(payload);
            }

            if record.status.is_terminal() {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
