use std::fmt;

use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::CallflowError;

/// Reserved `next_node` value that ends the conversation.
pub const END_NODE: &str = "END";

// =============================================================================
// Enums - Lifecycle
// =============================================================================

/// Campaign lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    /// Created, not yet started.
    Scheduled,
    /// Dispatching calls.
    Active,
    /// Dispatch suspended; in-flight calls continue.
    Paused,
    /// No pending or in-progress contacts remain.
    Completed,
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CampaignStatus::Scheduled => write!(f, "scheduled"),
            CampaignStatus::Active => write!(f, "active"),
            CampaignStatus::Paused => write!(f, "paused"),
            CampaignStatus::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "active" => Ok(CampaignStatus::Active),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            _ => Err(format!("Unknown campaign status: {}", s)),
        }
    }
}

/// Per-contact progress within a campaign.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ContactStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContactStatus::Completed | ContactStatus::Failed)
    }
}

impl fmt::Display for ContactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContactStatus::Pending => write!(f, "pending"),
            ContactStatus::InProgress => write!(f, "in_progress"),
            ContactStatus::Completed => write!(f, "completed"),
            ContactStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for ContactStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ContactStatus::Pending),
            "in_progress" => Ok(ContactStatus::InProgress),
            "completed" => Ok(ContactStatus::Completed),
            "failed" => Ok(ContactStatus::Failed),
            _ => Err(format!("Unknown contact status: {}", s)),
        }
    }
}

/// Telephony call status.
///
/// Progresses `queued -> ringing -> answered -> terminal`. Terminal statuses
/// are `completed`, `failed`, `no_answer` and `busy`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Queued,
    Ringing,
    Answered,
    Completed,
    Failed,
    NoAnswer,
    Busy,
}

impl CallStatus {
    pub const ALL: [CallStatus; 7] = [
        CallStatus::Queued,
        CallStatus::Ringing,
        CallStatus::Answered,
        CallStatus::Completed,
        CallStatus::Failed,
        CallStatus::NoAnswer,
        CallStatus::Busy,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Completed | CallStatus::Failed | CallStatus::NoAnswer | CallStatus::Busy
        )
    }

    /// Position in the forward progression. All terminal statuses share a rank.
    pub fn rank(&self) -> u8 {
        match self {
            CallStatus::Queued => 0,
            CallStatus::Ringing => 1,
            CallStatus::Answered => 2,
            _ => 3,
        }
    }

    /// Statuses from which a move to `self` is a forward step.
    pub fn predecessors(&self) -> Vec<CallStatus> {
        CallStatus::ALL
            .iter()
            .copied()
            .filter(|s| !s.is_terminal() && s.rank() < self.rank())
            .collect()
    }

    /// Contact status implied by a terminal call status.
    pub fn contact_outcome(&self) -> ContactStatus {
        match self {
            CallStatus::Completed => ContactStatus::Completed,
            _ => ContactStatus::Failed,
        }
    }

    /// Parse a provider-reported status string.
    ///
    /// Accepts both hyphenated provider spellings (`no-answer`,
    /// `in-progress`) and the snake_case names used internally.
    pub fn from_provider(s: &str) -> Option<CallStatus> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" | "initiated" => Some(CallStatus::Queued),
            "ringing" => Some(CallStatus::Ringing),
            "answered" | "in-progress" | "in_progress" => Some(CallStatus::Answered),
            "completed" => Some(CallStatus::Completed),
            "failed" | "canceled" | "cancelled" => Some(CallStatus::Failed),
            "no-answer" | "no_answer" => Some(CallStatus::NoAnswer),
            "busy" => Some(CallStatus::Busy),
            _ => None,
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallStatus::Queued => write!(f, "queued"),
            CallStatus::Ringing => write!(f, "ringing"),
            CallStatus::Answered => write!(f, "answered"),
            CallStatus::Completed => write!(f, "completed"),
            CallStatus::Failed => write!(f, "failed"),
            CallStatus::NoAnswer => write!(f, "no_answer"),
            CallStatus::Busy => write!(f, "busy"),
        }
    }
}

impl std::str::FromStr for CallStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(CallStatus::Queued),
            "ringing" => Ok(CallStatus::Ringing),
            "answered" => Ok(CallStatus::Answered),
            "completed" => Ok(CallStatus::Completed),
            "failed" => Ok(CallStatus::Failed),
            "no_answer" => Ok(CallStatus::NoAnswer),
            "busy" => Ok(CallStatus::Busy),
            _ => Err(format!("Unknown call status: {}", s)),
        }
    }
}

/// Who produced a transcript line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Agent,
    Caller,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::Agent => write!(f, "agent"),
            Speaker::Caller => write!(f, "caller"),
        }
    }
}

impl std::str::FromStr for Speaker {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(Speaker::Agent),
            "caller" => Ok(Speaker::Caller),
            _ => Err(format!("Unknown speaker: {}", s)),
        }
    }
}

/// How a conversation session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// The script reached `END`.
    Completed,
    /// Too many consecutive unmatched utterances.
    NoMatchExhausted,
    /// The caller stayed silent past the configured timeout.
    Timeout,
    /// The provider reported the call ended while the session was live.
    Hangup,
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Completed => write!(f, "completed"),
            SessionOutcome::NoMatchExhausted => write!(f, "no_match_exhausted"),
            SessionOutcome::Timeout => write!(f, "timeout"),
            SessionOutcome::Hangup => write!(f, "hangup"),
        }
    }
}

impl std::str::FromStr for SessionOutcome {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(SessionOutcome::Completed),
            "no_match_exhausted" => Ok(SessionOutcome::NoMatchExhausted),
            "timeout" => Ok(SessionOutcome::Timeout),
            "hangup" => Ok(SessionOutcome::Hangup),
            _ => Err(format!("Unknown session outcome: {}", s)),
        }
    }
}

// =============================================================================
// Campaign settings
// =============================================================================

/// Daily dispatch window in campaign-local time.
///
/// `start == end` means always open. `start > end` wraps past midnight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// A window that never closes.
    pub fn always_open() -> Self {
        Self {
            start: NaiveTime::MIN,
            end: NaiveTime::MIN,
        }
    }

    /// Parse a window from two `HH:MM` strings.
    pub fn parse(start: &str, end: &str) -> Result<Self, CallflowError> {
        Ok(Self {
            start: hhmm::parse(start).map_err(CallflowError::Validation)?,
            end: hhmm::parse(end).map_err(CallflowError::Validation)?,
        })
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start == self.end {
            true
        } else if self.start < self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }

    /// Next moment at or after `now` when the window opens.
    ///
    /// Returns `now` unchanged if the window is already open.
    pub fn next_open(&self, now: NaiveDateTime) -> NaiveDateTime {
        if self.contains(now.time()) {
            return now;
        }
        let today = now.date().and_time(self.start);
        if now.time() < self.start {
            today
        } else {
            today + Duration::days(1)
        }
    }
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self {
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(17, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

/// `HH:MM` (de)serialization for `NaiveTime`.
pub mod hhmm {
    use super::*;

    pub fn parse(s: &str) -> Result<NaiveTime, String> {
        NaiveTime::parse_from_str(s, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
            .map_err(|e| format!("invalid time '{}': {}", s, e))
    }

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Throughput and timing settings for a campaign.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CampaignSettings {
    pub calls_per_day: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calls_per_hour: Option<u32>,
    #[serde(default)]
    pub time_window: TimeWindow,
}

impl CampaignSettings {
    pub fn validate(&self) -> Result<(), CallflowError> {
        if self.calls_per_day == 0 {
            return Err(CallflowError::Validation(
                "calls_per_day must be at least 1".to_string(),
            ));
        }
        if self.calls_per_hour == Some(0) {
            return Err(CallflowError::Validation(
                "calls_per_hour must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            calls_per_day: 50,
            calls_per_hour: None,
            time_window: TimeWindow::default(),
        }
    }
}

// =============================================================================
// Script definition (authored form)
// =============================================================================

/// A conversation script as authored, before validation. Keys are read in
/// either snake_case or camelCase and written as snake_case.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptDefinition {
    #[serde(default, alias = "initialGreeting")]
    pub initial_greeting: String,
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    pub message: String,
    #[serde(default)]
    pub responses: Vec<ResponseDefinition>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseDefinition {
    pub pattern: String,
    #[serde(alias = "nextNode")]
    pub next_node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<RuleAction>,
}

/// Side effect attached to a response rule.
///
/// Serialized as `{"say": "..."}` or `{"invoke": "..."}`. A bare string is
/// read as an `invoke` of that name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "RawRuleAction")]
pub enum RuleAction {
    /// Spoken before the next node's message, or as the closing line on `END`.
    Say(String),
    /// Named business callout, run without blocking the call.
    Invoke(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRuleAction {
    Name(String),
    Tagged(TaggedRuleAction),
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum TaggedRuleAction {
    Say(String),
    Invoke(String),
}

impl From<RawRuleAction> for RuleAction {
    fn from(raw: RawRuleAction) -> Self {
        match raw {
            RawRuleAction::Name(name) => RuleAction::Invoke(name),
            RawRuleAction::Tagged(TaggedRuleAction::Say(text)) => RuleAction::Say(text),
            RawRuleAction::Tagged(TaggedRuleAction::Invoke(name)) => RuleAction::Invoke(name),
        }
    }
}

// =============================================================================
// Entities
// =============================================================================

/// An authored agent: voice plus script.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    pub voice_id: String,
    pub script: ScriptDefinition,
    /// Incremented on every save.
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A campaign with its own snapshot of the agent's script and voice.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub user_id: String,
    pub agent_id: Uuid,
    /// Agent version the script was snapshotted from.
    pub agent_version: u32,
    pub name: String,
    pub status: CampaignStatus,
    pub settings: CampaignSettings,
    pub voice_id: String,
    pub script: ScriptDefinition,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A contact to enroll into a campaign.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactEnrollment {
    pub contact_id: String,
    pub destination: String,
}

/// A contact's progress within one campaign.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CampaignContact {
    pub campaign_id: Uuid,
    pub contact_id: String,
    pub destination: String,
    pub status: ContactStatus,
    pub failure_reason: Option<String>,
    /// Enrollment order within the campaign.
    pub position: i64,
    pub updated_at: DateTime<Utc>,
}

/// One outbound call attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Call {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub contact_id: String,
    pub destination: String,
    pub provider_call_id: Option<String>,
    pub status: CallStatus,
    pub duration_secs: Option<u32>,
    pub recording_url: Option<String>,
    pub recording_sid: Option<String>,
    pub failure_reason: Option<String>,
    pub transcription: Option<String>,
    pub analysis: Option<Analysis>,
    pub session_outcome: Option<SessionOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Call {
    /// A freshly dispatched call in `queued` state.
    pub fn queued(contact: &CampaignContact, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id: contact.campaign_id,
            contact_id: contact.contact_id.clone(),
            destination: contact.destination.clone(),
            provider_call_id: None,
            status: CallStatus::Queued,
            duration_secs: None,
            recording_url: None,
            recording_sid: None,
            failure_reason: None,
            transcription: None,
            analysis: None,
            session_outcome: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        }
    }
}

/// Terminal details persisted exactly once when a call ends.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CallOutcome {
    pub duration_secs: Option<u32>,
    pub recording_url: Option<String>,
    pub recording_sid: Option<String>,
    pub failure_reason: Option<String>,
}

/// One line of a call transcript.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of analyzing an utterance or transcription.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub matched_intent: Option<String>,
    pub sentiment: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

// =============================================================================
// Aggregates
// =============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactCounts {
    pub pending: u32,
    pub in_progress: u32,
    pub completed: u32,
    pub failed: u32,
}

impl ContactCounts {
    pub fn total(&self) -> u32 {
        self.pending + self.in_progress + self.completed + self.failed
    }

    /// True when nothing is left to dial or waiting on a provider.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CallStats {
    pub total: u32,
    pub in_flight: u32,
    pub completed: u32,
    pub failed: u32,
    pub no_answer: u32,
    pub busy: u32,
    pub avg_duration_secs: Option<f64>,
}

/// Outcome of trying to claim a webhook event key.
#[derive(Clone, Debug, PartialEq)]
pub enum EventClaim {
    /// First delivery; the caller should process it.
    Claimed,
    /// Seen before. Carries the recorded response if processing finished.
    Duplicate(Option<serde_json::Value>),
}
