//! Management route handlers: agents, campaigns, calls, health and the
//! SSE event stream.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use serde::Serialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use callflow_core::types::{Agent, Call, Campaign, ScriptDefinition, TranscriptEntry};
use callflow_engine::{CampaignStats, DispatchReport, NewAgent, NewCampaign, ScriptGraph};

use crate::error::ApiError;
use crate::state::AppState;

// =============================================================================
// Response types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub active_sessions: usize,
}

#[derive(Debug, Serialize)]
pub struct ValidationResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of nodes in the script as submitted.
    pub nodes: usize,
}

#[derive(Debug, Serialize)]
pub struct TranscriptResponse {
    pub call_id: Uuid,
    pub entries: Vec<TranscriptEntry>,
}

// =============================================================================
// Health and events
// =============================================================================

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        active_sessions: state.tracker.active_sessions(),
    })
}

/// GET /stream - domain events as server-sent events, named by event type.
pub async fn stream(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>> + Send> {
    let rx = state.event_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => {
            let data = serde_json::to_string(&event).unwrap_or_default();
            Some(Ok(Event::default().event(event.event_name()).data(data)))
        }
        // Lagged receivers skip what they missed.
        Err(_) => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

// =============================================================================
// Agents and scripts
// =============================================================================

/// POST /agents
pub async fn create_agent(
    State(state): State<AppState>,
    Json(body): Json<NewAgent>,
) -> Result<(StatusCode, Json<Agent>), ApiError> {
    let agent = state.campaigns.create_agent(body)?;
    Ok((StatusCode::CREATED, Json(agent)))
}

/// GET /agents/{id}
pub async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Agent>, ApiError> {
    Ok(Json(state.campaigns.get_agent(id)?))
}

/// PUT /agents/{id}/script - new script version for future campaigns.
pub async fn update_agent_script(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(script): Json<ScriptDefinition>,
) -> Result<Json<Agent>, ApiError> {
    Ok(Json(state.campaigns.update_agent_script(id, script)?))
}

/// POST /scripts/validate
///
/// Always 200: an invalid script is a normal answer here, not a failure.
pub async fn validate_script(Json(script): Json<ScriptDefinition>) -> Json<ValidationResponse> {
    let nodes = script.nodes.len();
    let error = ScriptGraph::build(&script).err().map(|e| e.to_string());
    Json(ValidationResponse {
        valid: error.is_none(),
        error,
        nodes,
    })
}

// =============================================================================
// Campaigns
// =============================================================================

/// POST /campaigns
pub async fn create_campaign(
    State(state): State<AppState>,
    Json(body): Json<NewCampaign>,
) -> Result<(StatusCode, Json<Campaign>), ApiError> {
    let campaign = state.campaigns.create_campaign(body)?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

/// GET /campaigns/{id}
pub async fn get_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Campaign>, ApiError> {
    Ok(Json(state.campaigns.get_campaign(id)?))
}

/// POST /campaigns/{id}/start
pub async fn start_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DispatchReport>, ApiError> {
    Ok(Json(state.campaigns.start(id).await?))
}

/// POST /campaigns/{id}/pause
pub async fn pause_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Campaign>, ApiError> {
    Ok(Json(state.campaigns.pause(id)?))
}

/// POST /campaigns/{id}/resume
pub async fn resume_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DispatchReport>, ApiError> {
    Ok(Json(state.campaigns.resume(id).await?))
}

/// POST /campaigns/{id}/dispatch - run one dispatch pass now.
pub async fn dispatch_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DispatchReport>, ApiError> {
    Ok(Json(state.campaigns.dispatch(id).await?))
}

/// GET /campaigns/{id}/stats
pub async fn campaign_stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CampaignStats>, ApiError> {
    Ok(Json(state.campaigns.stats(id)?))
}

// =============================================================================
// Calls
// =============================================================================

/// GET /calls/{id}
pub async fn get_call(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Call>, ApiError> {
    let call = state
        .store
        .get_call(id)?
        .ok_or_else(|| ApiError::NotFound(format!("Call not found: {}", id)))?;
    Ok(Json(call))
}

/// GET /calls/{id}/transcript
pub async fn call_transcript(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TranscriptResponse>, ApiError> {
    if state.store.get_call(id)?.is_none() {
        return Err(ApiError::NotFound(format!("Call not found: {}", id)));
    }
    let entries = state.store.transcript(id)?;
    Ok(Json(TranscriptResponse { call_id: id, entries }))
}
