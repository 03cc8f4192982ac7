//! Persistence boundary for the call-flow engine.
//!
//! Every status change goes through a compare-and-swap method that returns
//! `false` when the row was not in an expected state. Callers treat a lost
//! swap as "someone else already did it" and carry on.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::types::{
    Agent, Analysis, Call, CallOutcome, CallStats, CallStatus, Campaign, CampaignContact,
    CampaignStatus, ContactCounts, ContactEnrollment, ContactStatus, EventClaim, SessionOutcome,
    TranscriptEntry,
};

pub trait CallflowStore: Send + Sync {
    // Agents
    fn save_agent(&self, agent: &Agent) -> Result<()>;
    fn get_agent(&self, id: Uuid) -> Result<Option<Agent>>;

    // Campaigns
    /// Insert a campaign and enroll its contacts atomically, in order.
    fn create_campaign(&self, campaign: &Campaign, contacts: &[ContactEnrollment]) -> Result<()>;
    fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>>;
    fn list_campaigns(&self, status: CampaignStatus) -> Result<Vec<Campaign>>;
    /// Move a campaign to `to` if its current status is one of `from`.
    fn transition_campaign(
        &self,
        id: Uuid,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<bool>;

    // Contacts
    /// Up to `limit` pending contacts in enrollment order.
    fn pending_contacts(&self, campaign_id: Uuid, limit: usize) -> Result<Vec<CampaignContact>>;
    fn get_contact(&self, campaign_id: Uuid, contact_id: &str)
        -> Result<Option<CampaignContact>>;
    /// Compare-and-swap on contact status.
    fn transition_contact(
        &self,
        campaign_id: Uuid,
        contact_id: &str,
        from: ContactStatus,
        to: ContactStatus,
        reason: Option<&str>,
    ) -> Result<bool>;
    fn contact_counts(&self, campaign_id: Uuid) -> Result<ContactCounts>;

    // Calls
    fn insert_call(&self, call: &Call) -> Result<()>;
    fn get_call(&self, id: Uuid) -> Result<Option<Call>>;
    fn set_provider_call_id(&self, id: Uuid, provider_call_id: &str) -> Result<()>;
    /// Calls created since `since` that have not reached a terminal status.
    fn count_in_flight_since(&self, campaign_id: Uuid, since: DateTime<Utc>) -> Result<u32>;
    /// All calls created since `since`, whatever their status.
    fn count_calls_since(&self, campaign_id: Uuid, since: DateTime<Utc>) -> Result<u32>;
    /// Move a non-terminal call forward to a later non-terminal status.
    fn advance_call_status(&self, id: Uuid, to: CallStatus, at: DateTime<Utc>) -> Result<bool>;
    /// Move a non-terminal call to a terminal status, recording its outcome.
    /// Succeeds at most once per call.
    fn finalize_call(
        &self,
        id: Uuid,
        status: CallStatus,
        outcome: &CallOutcome,
        at: DateTime<Utc>,
    ) -> Result<bool>;
    fn set_session_outcome(&self, id: Uuid, outcome: SessionOutcome) -> Result<()>;
    /// Queued calls with no provider id created before `cutoff`.
    fn stale_dispatches(&self, cutoff: DateTime<Utc>) -> Result<Vec<Call>>;
    fn call_stats(&self, campaign_id: Uuid) -> Result<CallStats>;

    // Transcripts
    fn append_transcript(&self, call_id: Uuid, entries: &[TranscriptEntry]) -> Result<()>;
    fn transcript(&self, call_id: Uuid) -> Result<Vec<TranscriptEntry>>;
    /// Attach post-call transcription. Returns `false` if the call is unknown.
    fn save_transcription(
        &self,
        call_id: Uuid,
        text: &str,
        analysis: Option<&Analysis>,
    ) -> Result<bool>;

    // Webhook dedupe
    fn claim_event(&self, key: &str, at: DateTime<Utc>) -> Result<EventClaim>;
    fn record_event_response(&self, key: &str, response: &serde_json::Value) -> Result<()>;
    /// Forget events received before `cutoff`. Returns the number removed.
    fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}
