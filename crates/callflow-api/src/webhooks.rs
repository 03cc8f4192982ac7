//! Telephony provider callbacks.
//!
//! Bodies are provider-agnostic JSON; Twilio field names are accepted as
//! aliases. Providers retry anything that is not 2xx, so these handlers
//! always acknowledge and log failures instead of surfacing them.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use uuid::Uuid;

use callflow_engine::{SpokenReply, StatusEvent, TrackerError, TranscriptionEvent, VoiceEvent};

use crate::state::AppState;

const IDEMPOTENCY_HEADER: &str = "idempotency-key";

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceWebhook {
    #[serde(default, alias = "CallSid", alias = "provider_call_id")]
    pub provider_call_id: Option<String>,
    #[serde(default, alias = "CallStatus")]
    pub status: Option<String>,
    #[serde(default, alias = "SpeechResult")]
    pub utterance: Option<String>,
    #[serde(default, alias = "SequenceNumber", deserialize_with = "lenient_number")]
    pub sequence: Option<u64>,
    #[serde(default, alias = "EventId", alias = "event_id")]
    pub event_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusWebhook {
    #[serde(alias = "CallStatus")]
    pub status: String,
    #[serde(
        default,
        alias = "CallDuration",
        alias = "duration_secs",
        deserialize_with = "lenient_number"
    )]
    pub duration: Option<u32>,
    #[serde(default, alias = "RecordingUrl", alias = "recording_url")]
    pub recording_url: Option<String>,
    #[serde(default, alias = "RecordingSid", alias = "recording_sid")]
    pub recording_sid: Option<String>,
    #[serde(default, alias = "CallSid", alias = "provider_call_id")]
    pub provider_call_id: Option<String>,
    #[serde(default, alias = "EventId", alias = "event_id")]
    pub event_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionWebhook {
    #[serde(default, alias = "TranscriptionText", alias = "text", alias = "transcript_text")]
    pub transcript_text: String,
    #[serde(alias = "TranscriptionStatus")]
    pub status: String,
    #[serde(default, alias = "EventId", alias = "event_id")]
    pub event_id: Option<String>,
}

/// Accept a non-negative integer given either as a JSON number or as a
/// string, which is how form-style providers send it. Fractions are rounded.
/// An unreadable value becomes `None` so the rest of the event still applies.
fn lenient_number<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    use serde_json::Value;

    let value = match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => return Ok(None),
        Some(value) => value,
    };
    let parsed = match &value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().and_then(whole)),
        Value::String(s) if s.trim().is_empty() => return Ok(None),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<u64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(whole))
        }
        _ => None,
    };
    match parsed.and_then(|n| T::try_from(n).ok()) {
        Some(n) => Ok(Some(n)),
        None => {
            tracing::warn!(value = %value, "Ignoring unreadable numeric webhook field");
            Ok(None)
        }
    }
}

fn whole(f: f64) -> Option<u64> {
    (f.is_finite() && f >= 0.0 && f <= u64::MAX as f64).then(|| f.round() as u64)
}

fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, serde_json::Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
}

fn event_id(headers: &HeaderMap, body_id: Option<String>) -> Option<String> {
    headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or(body_id)
}

fn parse_call_id(raw: &str) -> Option<Uuid> {
    match Uuid::parse_str(raw) {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::warn!(call_id = %raw, error = %e, "Webhook for malformed call id");
            None
        }
    }
}

fn acknowledged() -> Response {
    Json(serde_json::json!({ "acknowledged": true })).into_response()
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /webhooks/voice/{call_id} - next thing to say on a live call.
///
/// Returns 204 when there is nothing to say. Processing failures answer
/// with the configured fallback prompt so the caller is not left in silence.
pub async fn voice(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let session = &state.config.session;
    let hang_up = || {
        Json(SpokenReply {
            say: session.goodbye_message.clone(),
            audio_url: None,
            listen: false,
            hangup: true,
        })
        .into_response()
    };
    let retry = || {
        Json(SpokenReply {
            say: session.fallback_prompt.clone(),
            audio_url: None,
            listen: true,
            hangup: false,
        })
        .into_response()
    };

    let Some(call_id) = parse_call_id(&call_id) else {
        return hang_up();
    };
    let payload: VoiceWebhook = match parse_body(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(call_id = %call_id, error = %e, "Malformed voice webhook");
            return retry();
        }
    };

    let event = VoiceEvent {
        provider_call_id: payload.provider_call_id,
        status: payload.status,
        utterance: payload.utterance,
        sequence: payload.sequence,
        event_id: event_id(&headers, payload.event_id),
    };
    match state.tracker.handle_voice(call_id, event).await {
        Ok(Some(reply)) => Json(reply).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(TrackerError::CallNotFound(_)) => {
            tracing::warn!(call_id = %call_id, "Voice webhook for unknown call");
            hang_up()
        }
        Err(e) => {
            tracing::error!(call_id = %call_id, error = %e, "Voice webhook failed");
            retry()
        }
    }
}

/// POST /webhooks/status/{call_id} - provider call status change.
pub async fn status(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(call_id) = parse_call_id(&call_id) else {
        return acknowledged();
    };
    let payload: StatusWebhook = match parse_body(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(call_id = %call_id, error = %e, "Malformed status webhook");
            return acknowledged();
        }
    };

    let event = StatusEvent {
        status: payload.status,
        duration_secs: payload.duration,
        recording_url: payload.recording_url,
        recording_sid: payload.recording_sid,
        provider_call_id: payload.provider_call_id,
        event_id: event_id(&headers, payload.event_id),
    };
    if let Err(e) = state.tracker.handle_status(call_id, event).await {
        match e {
            TrackerError::CallNotFound(_) | TrackerError::UnknownStatus(_) => {
                tracing::warn!(call_id = %call_id, error = %e, "Status webhook ignored")
            }
            _ => tracing::error!(call_id = %call_id, error = %e, "Status webhook failed"),
        }
    }
    acknowledged()
}

/// POST /webhooks/transcription/{call_id} - post-call transcription.
pub async fn transcription(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(call_id) = parse_call_id(&call_id) else {
        return acknowledged();
    };
    let payload: TranscriptionWebhook = match parse_body(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(call_id = %call_id, error = %e, "Malformed transcription webhook");
            return acknowledged();
        }
    };

    let event = TranscriptionEvent {
        text: payload.transcript_text,
        status: payload.status,
        event_id: event_id(&headers, payload.event_id),
    };
    if let Err(e) = state.tracker.handle_transcription(call_id, event).await {
        tracing::warn!(call_id = %call_id, error = %e, "Transcription webhook failed");
    }
    acknowledged()
}
