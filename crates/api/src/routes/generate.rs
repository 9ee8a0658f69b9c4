use axum::extract::State;
use axum::Json;
use serde::Serialize;

use dream_core::request::GenerationRequest;
use dream_engine::Job;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// Response payload for a submitted generation request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    /// Identifier used to correlate events for this job.
    pub request_id: String,
}

/// Response payload for a cancellation request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    /// The job that was asked to stop, if one was running.
    pub request_id: Option<String>,
}

/// Parse, validate, and enqueue a generation request.
///
/// Used by both the HTTP handler and the WebSocket `generate` message.
/// Returns the assigned request ID on admission.
pub(crate) fn submit_generation(state: &AppState, body: &serde_json::Value) -> AppResult<String> {
    let request = GenerationRequest::from_json(body, state.face_restore_available)?;
    let job = Job::assign(request, state.seed_cell.get());
    let request_id = job.id.clone();

    state.queue.enqueue(job)?;
    tracing::info!(request_id = %request_id, "Generation request admitted");
    Ok(request_id)
}

/// POST /generate -- admit a generation request into the queue.
pub async fn submit(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> AppResult<Json<DataResponse<SubmitResponse>>> {
    let request_id = submit_generation(&state, &body)?;
    Ok(Json(DataResponse {
        data: SubmitResponse { request_id },
    }))
}

/// POST /cancel -- signal the currently running job to stop.
///
/// A no-op when the worker is idle; queued jobs are unaffected either way.
pub async fn cancel(State(state): State<AppState>) -> Json<DataResponse<CancelResponse>> {
    let request_id = state.queue.current_job_id();
    state.queue.cancel_current();
    Json(DataResponse {
        data: CancelResponse { request_id },
    })
}
