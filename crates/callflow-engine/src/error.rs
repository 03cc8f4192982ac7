//! Error types for the call-flow engine.

use callflow_core::error::CallflowError;
use callflow_core::types::{CampaignStatus, SessionOutcome};
use uuid::Uuid;

/// Authoring-time script validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("Script has no initial greeting")]
    MissingGreeting,
    #[error("Script has no nodes")]
    EmptyScript,
    #[error("Node '{node_id}' response '{pattern}' points to unknown node '{next_node}'")]
    DanglingReference {
        node_id: String,
        pattern: String,
        next_node: String,
    },
    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),
    #[error("Node '{node_id}' has invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        node_id: String,
        pattern: String,
        reason: String,
    },
}

/// Misuse of a conversation session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session has not spoken its greeting yet")]
    NotStarted,
    #[error("Session already started")]
    AlreadyStarted,
    #[error("Session already terminated: {0}")]
    Terminated(SessionOutcome),
    #[error("Session positioned on unknown node index {0}")]
    UnknownNode(usize),
}

/// The telephony provider refused or failed to place a call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    #[error("Call rejected by provider: {0}")]
    Rejected(String),
    #[error("Telephony provider unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SynthesisError {
    #[error("Speech synthesis not supported by this backend")]
    Unsupported,
    #[error("Speech synthesis failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalysisError {
    #[error("Utterance analysis failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CreditError {
    #[error("Insufficient credits for {feature} (user {user_id})")]
    Insufficient { user_id: String, feature: String },
    #[error("Credit service unavailable: {0}")]
    Unavailable(String),
}

/// Failures from a rule's `invoke` callout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error("Unknown action: {0}")]
    Unknown(String),
    #[error("Action failed: {0}")]
    Failed(String),
}

/// Errors from the campaign scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Campaign not found: {0}")]
    CampaignNotFound(Uuid),
    #[error("Storage error: {0}")]
    Storage(#[from] CallflowError),
}

/// Errors from provider event handling.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Call not found: {0}")]
    CallNotFound(Uuid),
    #[error("Campaign not found: {0}")]
    CampaignNotFound(Uuid),
    #[error("Unknown call status: {0}")]
    UnknownStatus(String),
    #[error("Invalid script snapshot: {0}")]
    Script(#[from] ScriptError),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("Storage error: {0}")]
    Storage(#[from] CallflowError),
}

/// Errors from agent and campaign management.
#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    #[error("Campaign not found: {0}")]
    NotFound(Uuid),
    #[error("Agent not found: {0}")]
    AgentNotFound(Uuid),
    #[error("Invalid script: {0}")]
    InvalidScript(#[from] ScriptError),
    #[error("Invalid campaign transition: {0} -> {1}")]
    InvalidTransition(CampaignStatus, CampaignStatus),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Campaign {0} changed concurrently")]
    Conflict(Uuid),
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("Storage error: {0}")]
    Storage(#[from] CallflowError),
}
