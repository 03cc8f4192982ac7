use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{CallStatus, CampaignStatus, ContactStatus, SessionOutcome};

/// Domain events emitted by the call-flow engine.
///
/// Published on the broadcast channel that backs the `/stream` SSE endpoint
/// and logged for audit.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DomainEvent {
    // =========================================================================
    // Campaign Events
    // =========================================================================
    /// A campaign moved between lifecycle states.
    CampaignStatusChanged {
        campaign_id: Uuid,
        from: CampaignStatus,
        to: CampaignStatus,
        timestamp: DateTime<Utc>,
    },

    /// A scheduling batch finished.
    BatchDispatched {
        campaign_id: Uuid,
        dispatched: usize,
        failed: usize,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Call Events
    // =========================================================================
    /// A call was handed to the telephony provider.
    CallPlaced {
        call_id: Uuid,
        campaign_id: Uuid,
        contact_id: String,
        timestamp: DateTime<Utc>,
    },

    /// The provider rejected a placement request.
    CallPlacementFailed {
        call_id: Uuid,
        campaign_id: Uuid,
        contact_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The provider reported a non-terminal status change.
    CallStatusChanged {
        call_id: Uuid,
        status: CallStatus,
        timestamp: DateTime<Utc>,
    },

    /// A call reached a terminal status and the contact was settled.
    CallFinished {
        call_id: Uuid,
        campaign_id: Uuid,
        status: CallStatus,
        contact_status: ContactStatus,
        duration_secs: Option<u32>,
        timestamp: DateTime<Utc>,
    },

    /// Post-call transcription was attached.
    TranscriptionSaved {
        call_id: Uuid,
        text_length: usize,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Session Events
    // =========================================================================
    /// A conversation session began for a call.
    SessionStarted {
        call_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// A conversation session ended.
    SessionEnded {
        call_id: Uuid,
        outcome: SessionOutcome,
        turns: usize,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::CampaignStatusChanged { timestamp, .. }
            | DomainEvent::BatchDispatched { timestamp, .. }
            | DomainEvent::CallPlaced { timestamp, .. }
            | DomainEvent::CallPlacementFailed { timestamp, .. }
            | DomainEvent::CallStatusChanged { timestamp, .. }
            | DomainEvent::CallFinished { timestamp, .. }
            | DomainEvent::TranscriptionSaved { timestamp, .. }
            | DomainEvent::SessionStarted { timestamp, .. }
            | DomainEvent::SessionEnded { timestamp, .. } => *timestamp,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            DomainEvent::CampaignStatusChanged { .. } => "campaign_status_changed",
            DomainEvent::BatchDispatched { .. } => "batch_dispatched",
            DomainEvent::CallPlaced { .. } => "call_placed",
            DomainEvent::CallPlacementFailed { .. } => "call_placement_failed",
            DomainEvent::CallStatusChanged { .. } => "call_status_changed",
            DomainEvent::CallFinished { .. } => "call_finished",
            DomainEvent::TranscriptionSaved { .. } => "transcription_saved",
            DomainEvent::SessionStarted { .. } => "session_started",
            DomainEvent::SessionEnded { .. } => "session_ended",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name_and_timestamp() {
        let now = Utc::now();
        let event = DomainEvent::SessionEnded {
            call_id: Uuid::new_v4(),
            outcome: SessionOutcome::Completed,
            turns: 3,
            timestamp: now,
        };
        assert_eq!(event.event_name(), "session_ended");
        assert_eq!(event.timestamp(), now);
    }

    #[test]
    fn test_event_serializes_with_variant_tag() {
        let event = DomainEvent::CallStatusChanged {
            call_id: Uuid::nil(),
            status: CallStatus::Ringing,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["CallStatusChanged"]["status"], "ringing");
    }
}
