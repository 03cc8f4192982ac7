//! Call-flow engine.
//!
//! Validates conversation scripts, drives per-call conversation sessions,
//! schedules outbound dialing for campaigns, and reconciles provider
//! callbacks with stored call state.

pub mod campaign;
pub mod collaborators;
pub mod error;
pub mod lifecycle;
pub mod scheduler;
pub mod script;
pub mod session;
pub mod tracker;

pub use campaign::{CampaignService, CampaignStats, NewAgent, NewCampaign};
pub use collaborators::{
    ActionSink, AudioHandle, Collaborators, CreditGate, DryRunTelephony, KeywordAnalyzer,
    PlacementRequest, Synthesizer, Telephony, TextOnlySynthesizer, UtteranceAnalyzer,
};
pub use error::{
    ActionError, AnalysisError, CampaignError, CreditError, PlacementError, SchedulerError,
    ScriptError, SessionError, SynthesisError, TrackerError,
};
pub use scheduler::{AttemptOutcome, CallAttempt, DispatchReport, Scheduler, SkipReason};
pub use script::{Pattern, ScriptGraph, Transition};
pub use session::{ConversationSession, Reply, SessionRegistry, SessionSettings, SessionState};
pub use tracker::{CallTracker, SpokenReply, StatusEvent, TranscriptionEvent, VoiceEvent};
