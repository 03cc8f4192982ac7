//! External collaborators consumed by the engine.
//!
//! Each concern is an async trait so any telephony, speech or billing SDK
//! can be substituted. The defaults here let the service run without any
//! external accounts: calls are logged instead of dialed, replies are text
//! only, and credits are unlimited.

pub mod analyzer;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use callflow_core::types::Analysis;

use crate::error::{ActionError, AnalysisError, CreditError, PlacementError, SynthesisError};

pub use analyzer::KeywordAnalyzer;

/// Feature name charged for each dispatched call.
pub const CALL_FEATURE: &str = "calls";

/// Everything the provider needs to dial one contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRequest {
    pub call_id: Uuid,
    pub destination: String,
    /// Base URL for voice, status and transcription callbacks.
    pub callback_base_url: String,
}

impl PlacementRequest {
    pub fn voice_url(&self) -> String {
        format!("{}/webhooks/voice/{}", self.callback_base_url, self.call_id)
    }

    pub fn status_url(&self) -> String {
        format!("{}/webhooks/status/{}", self.callback_base_url, self.call_id)
    }

    pub fn transcription_url(&self) -> String {
        format!(
            "{}/webhooks/transcription/{}",
            self.callback_base_url, self.call_id
        )
    }
}

/// Reference to synthesized audio the provider can play.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioHandle {
    pub url: String,
}

/// Context handed to a rule's `invoke` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionContext {
    pub call_id: Uuid,
    pub node_id: String,
    pub utterance: String,
}

#[async_trait]
pub trait Telephony: Send + Sync {
    /// Ask the provider to dial. Returns the provider's call id.
    async fn place_call(&self, request: &PlacementRequest) -> Result<String, PlacementError>;
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, voice_id: &str, text: &str) -> Result<AudioHandle, SynthesisError>;
}

#[async_trait]
pub trait UtteranceAnalyzer: Send + Sync {
    async fn analyze(&self, text: &str) -> Result<Analysis, AnalysisError>;
}

#[async_trait]
pub trait CreditGate: Send + Sync {
    /// Check the user can afford `feature` and debit it.
    async fn check_and_debit(&self, user_id: &str, feature: &str) -> Result<(), CreditError>;

    /// Give back a debit for a `feature` that was never delivered.
    async fn refund(&self, _user_id: &str, _feature: &str) -> Result<(), CreditError> {
        Ok(())
    }
}

#[async_trait]
pub trait ActionSink: Send + Sync {
    async fn invoke(&self, context: &ActionContext, action: &str) -> Result<(), ActionError>;
}

/// The full set of collaborators, injected into the scheduler, tracker and
/// sessions at construction.
#[derive(Clone)]
pub struct Collaborators {
    pub telephony: Arc<dyn Telephony>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub analyzer: Arc<dyn UtteranceAnalyzer>,
    pub credits: Arc<dyn CreditGate>,
    pub actions: Arc<dyn ActionSink>,
}

impl Collaborators {
    /// Stand-alone defaults: dry-run dialing, text-only speech, keyword
    /// analysis, unlimited credits, logged actions.
    pub fn offline() -> Self {
        Self {
            telephony: Arc::new(DryRunTelephony),
            synthesizer: Arc::new(TextOnlySynthesizer),
            analyzer: Arc::new(KeywordAnalyzer::new()),
            credits: Arc::new(UnlimitedCredits),
            actions: Arc::new(LoggingActionSink),
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Logs placement requests and returns a synthetic provider id.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunTelephony;

#[async_trait]
impl Telephony for DryRunTelephony {
    async fn place_call(&self, request: &PlacementRequest) -> Result<String, PlacementError> {
        if request.destination.trim().is_empty() {
            return Err(PlacementError::Rejected("empty destination".to_string()));
        }
        tracing::info!(
            call_id = %request.call_id,
            destination = %request.destination,
            voice_url = %request.voice_url(),
            "Dry-run call placed"
        );
        Ok(format!("dry-{}", request.call_id.simple()))
    }
}

/// Leaves speech to the provider's own text-to-speech.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextOnlySynthesizer;

#[async_trait]
impl Synthesizer for TextOnlySynthesizer {
    async fn synthesize(&self, _voice_id: &str, _text: &str) -> Result<AudioHandle, SynthesisError> {
        Err(SynthesisError::Unsupported)
    }
}

/// Never refuses a debit.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedCredits;

#[async_trait]
impl CreditGate for UnlimitedCredits {
    async fn check_and_debit(&self, _user_id: &str, _feature: &str) -> Result<(), CreditError> {
        Ok(())
    }
}

/// Records invoked actions in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingActionSink;

#[async_trait]
impl ActionSink for LoggingActionSink {
    async fn invoke(&self, context: &ActionContext, action: &str) -> Result<(), ActionError> {
        if action.trim().is_empty() {
            return Err(ActionError::Unknown(action.to_string()));
        }
        tracing::info!(
            call_id = %context.call_id,
            node_id = %context.node_id,
            action = %action,
            "Script action invoked"
        );
        Ok(())
    }
}
