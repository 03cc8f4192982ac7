//! Per-call conversation state machine.
//!
//! States: `AwaitingGreeting -> AwaitingUserInput(position) -> Terminated`.
//! The first caller utterance after the greeting moves unconditionally to the
//! script's first node. From then on each utterance is matched against the
//! current node's rules in declared order and the first match wins.

pub mod registry;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use callflow_core::config::SessionConfig;
use callflow_core::types::{Analysis, RuleAction, SessionOutcome, Speaker, TranscriptEntry};

use crate::collaborators::{ActionContext, AudioHandle, Collaborators};
use crate::error::{SessionError, SynthesisError};
use crate::script::{ScriptGraph, Transition};

pub use registry::SessionRegistry;

/// Where in the script the session is waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// After the greeting, before the first node.
    Entry,
    /// Index into the script's nodes.
    Node(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingGreeting,
    AwaitingUserInput(Position),
    Terminated(SessionOutcome),
}

/// What to say back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub text: String,
    /// Synthesized audio, when the synthesizer produced any.
    pub audio: Option<AudioHandle>,
    /// True when the call should end after this reply.
    pub hangup: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub max_fallbacks: u32,
    pub goodbye_message: String,
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            max_fallbacks: config.max_fallbacks,
            goodbye_message: config.goodbye_message.clone(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

pub struct ConversationSession {
    call_id: Uuid,
    voice_id: String,
    graph: Arc<ScriptGraph>,
    collaborators: Collaborators,
    settings: SessionSettings,
    state: SessionState,
    history: Vec<TranscriptEntry>,
    persisted: usize,
    fallbacks: u32,
    pending: Option<Reply>,
    last_activity: DateTime<Utc>,
}

impl ConversationSession {
    pub fn new(
        call_id: Uuid,
        voice_id: impl Into<String>,
        graph: Arc<ScriptGraph>,
        collaborators: Collaborators,
        settings: SessionSettings,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            call_id,
            voice_id: voice_id.into(),
            graph,
            collaborators,
            settings,
            state: SessionState::AwaitingGreeting,
            history: Vec::new(),
            persisted: 0,
            fallbacks: 0,
            pending: None,
            last_activity: now,
        }
    }

    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        match self.state {
            SessionState::Terminated(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.outcome().is_some()
    }

    /// Id of the node the session is waiting on, if any.
    pub fn current_node_id(&self) -> Option<&str> {
        match self.state {
            SessionState::AwaitingUserInput(Position::Node(i)) => {
                self.graph.node(i).map(|n| n.id.as_str())
            }
            _ => None,
        }
    }

    pub fn history(&self) -> &[TranscriptEntry] {
        &self.history
    }

    pub fn fallbacks(&self) -> u32 {
        self.fallbacks
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    /// Number of caller turns processed.
    pub fn turns(&self) -> usize {
        self.history
            .iter()
            .filter(|e| e.speaker == Speaker::Caller)
            .count()
    }

    /// Speak the greeting and wait for the caller.
    pub async fn start(&mut self, now: DateTime<Utc>) -> Result<Reply, SessionError> {
        if self.state != SessionState::AwaitingGreeting {
            return Err(SessionError::AlreadyStarted);
        }
        let greeting = self.graph.greeting().to_string();
        self.record(Speaker::Agent, &greeting, now);
        self.state = SessionState::AwaitingUserInput(Position::Entry);
        self.last_activity = now;

        let reply = self.speak(greeting, false).await;
        self.pending = Some(reply.clone());
        Ok(reply)
    }

    /// The greeting reply if it has not been delivered yet.
    pub fn take_pending_reply(&mut self) -> Option<Reply> {
        self.pending.take()
    }

    /// Repeat the last thing the agent said, text only. Not recorded in
    /// history. `None` once terminated.
    pub fn reprompt(&self) -> Option<Reply> {
        if self.is_terminated() {
            return None;
        }
        self.history
            .iter()
            .rev()
            .find(|e| e.speaker == Speaker::Agent)
            .map(|e| Reply {
                text: e.text.clone(),
                audio: None,
                hangup: false,
            })
    }

    /// Advance the conversation with one caller utterance.
    pub async fn handle_utterance(
        &mut self,
        utterance: &str,
        now: DateTime<Utc>,
    ) -> Result<Reply, SessionError> {
        let position = match self.state {
            SessionState::AwaitingGreeting => return Err(SessionError::NotStarted),
            SessionState::Terminated(outcome) => return Err(SessionError::Terminated(outcome)),
            SessionState::AwaitingUserInput(position) => position,
        };

        self.pending = None;
        self.last_activity = now;
        self.record(Speaker::Caller, utterance, now);

        let index = match position {
            Position::Entry => return self.enter_node(self.graph.first(), None, now).await,
            Position::Node(index) => index,
        };

        let graph = Arc::clone(&self.graph);
        let node = graph.node(index).ok_or(SessionError::UnknownNode(index))?;
        let analysis = self.analyze(utterance).await;

        let matched = node
            .rules
            .iter()
            .find(|rule| rule.pattern.matches(utterance, analysis.as_ref()));

        let Some(rule) = matched else {
            return Ok(self.fallback(&node.message, now).await);
        };

        debug!(
            call_id = %self.call_id,
            node_id = %node.id,
            pattern = %rule.pattern.source(),
            "Response matched"
        );

        let say = match &rule.action {
            Some(RuleAction::Say(text)) => Some(text.clone()),
            Some(RuleAction::Invoke(name)) => {
                self.invoke(name, &node.id, utterance);
                None
            }
            None => None,
        };

        match rule.next {
            Transition::End => {
                let closing = say.unwrap_or_else(|| self.settings.goodbye_message.clone());
                Ok(self.finish(SessionOutcome::Completed, closing, now).await)
            }
            Transition::Node(next) => self.enter_node(next, say, now).await,
        }
    }

    /// End the session from outside the script (timeout, provider hangup).
    /// Has no effect once terminated.
    pub fn terminate(&mut self, outcome: SessionOutcome) -> bool {
        if self.is_terminated() {
            return false;
        }
        self.state = SessionState::Terminated(outcome);
        self.pending = None;
        true
    }

    /// History entries not yet handed out for persistence.
    pub fn take_unpersisted(&mut self) -> Vec<TranscriptEntry> {
        let fresh = self.history[self.persisted..].to_vec();
        self.persisted = self.history.len();
        fresh
    }

    async fn enter_node(
        &mut self,
        index: usize,
        preamble: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Reply, SessionError> {
        let node = self
            .graph
            .node(index)
            .ok_or(SessionError::UnknownNode(index))?;
        let text = match preamble {
            Some(say) => format!("{} {}", say, node.message),
            None => node.message.clone(),
        };

        self.fallbacks = 0;
        self.state = SessionState::AwaitingUserInput(Position::Node(index));
        self.record(Speaker::Agent, &text, now);
        Ok(self.speak(text, false).await)
    }

    async fn fallback(&mut self, message: &str, now: DateTime<Utc>) -> Reply {
        self.fallbacks += 1;
        if self.fallbacks > self.settings.max_fallbacks {
            let goodbye = self.settings.goodbye_message.clone();
            return self
                .finish(SessionOutcome::NoMatchExhausted, goodbye, now)
                .await;
        }
        debug!(
            call_id = %self.call_id,
            fallbacks = self.fallbacks,
            "No response matched, replaying prompt"
        );
        self.record(Speaker::Agent, message, now);
        self.speak(message.to_string(), false).await
    }

    async fn finish(&mut self, outcome: SessionOutcome, text: String, now: DateTime<Utc>) -> Reply {
        self.record(Speaker::Agent, &text, now);
        self.state = SessionState::Terminated(outcome);
        self.speak(text, true).await
    }

    async fn analyze(&self, utterance: &str) -> Option<Analysis> {
        match self.collaborators.analyzer.analyze(utterance).await {
            Ok(analysis) => Some(analysis),
            Err(e) => {
                warn!(call_id = %self.call_id, error = %e, "Analysis failed, matching on text only");
                None
            }
        }
    }

    async fn speak(&self, text: String, hangup: bool) -> Reply {
        let audio = match self
            .collaborators
            .synthesizer
            .synthesize(&self.voice_id, &text)
            .await
        {
            Ok(audio) => Some(audio),
            Err(SynthesisError::Unsupported) => None,
            Err(e) => {
                warn!(call_id = %self.call_id, error = %e, "Synthesis failed, replying with text");
                None
            }
        };
        Reply {
            text,
            audio,
            hangup,
        }
    }

    fn invoke(&self, action: &str, node_id: &str, utterance: &str) {
        let sink = Arc::clone(&self.collaborators.actions);
        let action = action.to_string();
        let context = ActionContext {
            call_id: self.call_id,
            node_id: node_id.to_string(),
            utterance: utterance.to_string(),
        };
        tokio::spawn(async move {
            if let Err(e) = sink.invoke(&context, &action).await {
                warn!(
                    call_id = %context.call_id,
                    action = %action,
                    error = %e,
                    "Script action failed"
                );
            }
        });
    }

    /// Append to history with a timestamp strictly after the previous entry.
    fn record(&mut self, speaker: Speaker, text: &str, now: DateTime<Utc>) {
        let timestamp = match self.history.last() {
            Some(last) if now <= last.timestamp => last.timestamp + Duration::microseconds(1),
            _ => now,
        };
        self.history.push(TranscriptEntry {
            speaker,
            text: text.to_string(),
            timestamp,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use callflow_core::types::{NodeDefinition, ResponseDefinition, ScriptDefinition};

    use crate::collaborators::{ActionSink, Synthesizer, UtteranceAnalyzer};
    use crate::error::{ActionError, AnalysisError};

    struct FailingSynthesizer;

    #[async_trait]
    impl Synthesizer for FailingSynthesizer {
        async fn synthesize(&self, _: &str, _: &str) -> Result<AudioHandle, SynthesisError> {
            Err(SynthesisError::Failed("tts down".into()))
        }
    }

    struct UrlSynthesizer;

    #[async_trait]
    impl Synthesizer for UrlSynthesizer {
        async fn synthesize(&self, voice: &str, text: &str) -> Result<AudioHandle, SynthesisError> {
            Ok(AudioHandle {
                url: format!("https://audio.example/{}/{}", voice, text.len()),
            })
        }
    }

    struct FailingAnalyzer;

    #[async_trait]
    impl UtteranceAnalyzer for FailingAnalyzer {
        async fn analyze(&self, _: &str) -> Result<Analysis, AnalysisError> {
            Err(AnalysisError::Failed("nlp down".into()))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        invoked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ActionSink for RecordingSink {
        async fn invoke(&self, _: &ActionContext, action: &str) -> Result<(), ActionError> {
            self.invoked.lock().unwrap().push(action.to_string());
            Err(ActionError::Failed("crm offline".into()))
        }
    }

    fn rule(pattern: &str, next: &str, action: Option<RuleAction>) -> ResponseDefinition {
        ResponseDefinition {
            pattern: pattern.into(),
            next_node: next.into(),
            action,
        }
    }

    fn graph() -> Arc<ScriptGraph> {
        let def = ScriptDefinition {
            initial_greeting: "Hi, this is Ava from Acme.".into(),
            nodes: vec![
                NodeDefinition {
                    id: "N1".into(),
                    message: "Are you interested in a demo?".into(),
                    responses: vec![rule("yes", "N2", None), rule("no", "END", None)],
                },
                NodeDefinition {
                    id: "N2".into(),
                    message: "Great, what day works?".into(),
                    responses: vec![rule(
                        "monday|tuesday",
                        "END",
                        Some(RuleAction::Say("Booked. Talk soon!".into())),
                    )],
                },
            ],
        };
        Arc::new(ScriptGraph::build(&def).unwrap())
    }

    fn session_with(collaborators: Collaborators) -> ConversationSession {
        ConversationSession::new(
            Uuid::new_v4(),
            "voice-1",
            graph(),
            collaborators,
            SessionSettings {
                max_fallbacks: 2,
                goodbye_message: "Goodbye.".into(),
            },
            Utc::now(),
        )
    }

    fn session() -> ConversationSession {
        session_with(Collaborators::offline())
    }

    async fn started() -> ConversationSession {
        let mut s = session();
        s.start(Utc::now()).await.unwrap();
        s
    }

    #[tokio::test]
    async fn test_start_speaks_greeting() {
        let mut s = session();
        let reply = s.start(Utc::now()).await.unwrap();
        assert_eq!(reply.text, "Hi, this is Ava from Acme.");
        assert!(!reply.hangup);
        assert_eq!(s.state(), SessionState::AwaitingUserInput(Position::Entry));
        assert_eq!(s.take_pending_reply(), Some(reply));
        assert_eq!(s.take_pending_reply(), None);
        assert_eq!(s.start(Utc::now()).await, Err(SessionError::AlreadyStarted));
    }

    #[tokio::test]
    async fn test_utterance_before_start_rejected() {
        let mut s = session();
        assert_eq!(
            s.handle_utterance("hello", Utc::now()).await,
            Err(SessionError::NotStarted)
        );
    }

    #[tokio::test]
    async fn test_first_utterance_enters_first_node_unconditionally() {
        let mut s = started().await;
        let reply = s.handle_utterance("uh, who is this", Utc::now()).await.unwrap();
        assert_eq!(reply.text, "Are you interested in a demo?");
        assert_eq!(s.current_node_id(), Some("N1"));
        assert_eq!(s.fallbacks(), 0);
    }

    #[tokio::test]
    async fn test_no_ends_without_visiting_n2() {
        let mut s = started().await;
        s.handle_utterance("hello", Utc::now()).await.unwrap();
        let reply = s.handle_utterance("no", Utc::now()).await.unwrap();

        assert!(reply.hangup);
        assert_eq!(reply.text, "Goodbye.");
        assert_eq!(s.outcome(), Some(SessionOutcome::Completed));
        assert!(s
            .history()
            .iter()
            .all(|e| e.text != "Great, what day works?"));
    }

    #[tokio::test]
    async fn test_first_match_wins_in_declared_order() {
        let mut s = started().await;
        s.handle_utterance("hello", Utc::now()).await.unwrap();
        // Both "yes" and "no" appear; "yes" is declared first.
        let reply = s.handle_utterance("yes, no wait", Utc::now()).await.unwrap();
        assert_eq!(reply.text, "Great, what day works?");
        assert_eq!(s.current_node_id(), Some("N2"));
    }

    #[tokio::test]
    async fn test_closing_say_action_on_end() {
        let mut s = started().await;
        s.handle_utterance("hello", Utc::now()).await.unwrap();
        s.handle_utterance("yes", Utc::now()).await.unwrap();
        let reply = s.handle_utterance("Monday please", Utc::now()).await.unwrap();
        assert_eq!(reply.text, "Booked. Talk soon!");
        assert!(reply.hangup);
        assert_eq!(s.outcome(), Some(SessionOutcome::Completed));
    }

    #[tokio::test]
    async fn test_fallback_replays_verbatim_then_exhausts() {
        let mut s = started().await;
        s.handle_utterance("hello", Utc::now()).await.unwrap();

        for expected in 1..=2 {
            let reply = s.handle_utterance("purple", Utc::now()).await.unwrap();
            assert_eq!(reply.text, "Are you interested in a demo?");
            assert!(!reply.hangup);
            assert_eq!(s.fallbacks(), expected);
            assert_eq!(s.current_node_id(), Some("N1"));
        }

        let reply = s.handle_utterance("purple", Utc::now()).await.unwrap();
        assert!(reply.hangup);
        assert_eq!(s.outcome(), Some(SessionOutcome::NoMatchExhausted));
        assert_eq!(
            s.handle_utterance("yes", Utc::now()).await,
            Err(SessionError::Terminated(SessionOutcome::NoMatchExhausted))
        );
    }

    #[tokio::test]
    async fn test_fallback_counter_resets_on_advance() {
        let mut s = started().await;
        s.handle_utterance("hello", Utc::now()).await.unwrap();
        s.handle_utterance("purple", Utc::now()).await.unwrap();
        assert_eq!(s.fallbacks(), 1);
        s.handle_utterance("yes", Utc::now()).await.unwrap();
        assert_eq!(s.fallbacks(), 0);
    }

    #[tokio::test]
    async fn test_history_strictly_increasing_and_alternating() {
        let mut s = started().await;
        let frozen = Utc::now();
        for u in ["hello", "purple", "yes", "tuesday"] {
            s.handle_utterance(u, frozen).await.unwrap();
        }

        let history = s.history();
        assert_eq!(history.len(), 9);
        for pair in history.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
            assert_ne!(pair[0].speaker, pair[1].speaker);
        }
        assert_eq!(history[0].speaker, Speaker::Agent);
        assert_eq!(s.turns(), 4);
    }

    #[tokio::test]
    async fn test_take_unpersisted_hands_out_each_entry_once() {
        let mut s = started().await;
        assert_eq!(s.take_unpersisted().len(), 1);
        s.handle_utterance("hello", Utc::now()).await.unwrap();
        let fresh = s.take_unpersisted();
        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh[0].speaker, Speaker::Caller);
        assert!(s.take_unpersisted().is_empty());
    }

    #[tokio::test]
    async fn test_synthesis_failure_degrades_to_text() {
        let mut collaborators = Collaborators::offline();
        collaborators.synthesizer = Arc::new(FailingSynthesizer);
        let mut s = session_with(collaborators);
        let reply = s.start(Utc::now()).await.unwrap();
        assert_eq!(reply.audio, None);
        assert_eq!(reply.text, "Hi, this is Ava from Acme.");
    }

    #[tokio::test]
    async fn test_synthesized_audio_attached() {
        let mut collaborators = Collaborators::offline();
        collaborators.synthesizer = Arc::new(UrlSynthesizer);
        let mut s = session_with(collaborators);
        let reply = s.start(Utc::now()).await.unwrap();
        assert!(reply.audio.unwrap().url.starts_with("https://audio.example/voice-1/"));
    }

    #[tokio::test]
    async fn test_analysis_failure_still_matches_text() {
        let mut collaborators = Collaborators::offline();
        collaborators.analyzer = Arc::new(FailingAnalyzer);
        let mut s = session_with(collaborators);
        s.start(Utc::now()).await.unwrap();
        s.handle_utterance("hello", Utc::now()).await.unwrap();
        let reply = s.handle_utterance("yes", Utc::now()).await.unwrap();
        assert_eq!(reply.text, "Great, what day works?");
    }

    #[tokio::test]
    async fn test_failed_invoke_action_does_not_break_call() {
        let def = ScriptDefinition {
            initial_greeting: "Hello".into(),
            nodes: vec![
                NodeDefinition {
                    id: "ask".into(),
                    message: "Shall I sync you to our CRM?".into(),
                    responses: vec![rule(
                        "yes",
                        "thanks",
                        Some(RuleAction::Invoke("crm_sync".into())),
                    )],
                },
                NodeDefinition {
                    id: "thanks".into(),
                    message: "Done, anything else?".into(),
                    responses: vec![],
                },
            ],
        };
        let sink = Arc::new(RecordingSink::default());
        let mut collaborators = Collaborators::offline();
        collaborators.actions = sink.clone();
        let mut s = ConversationSession::new(
            Uuid::new_v4(),
            "voice-1",
            Arc::new(ScriptGraph::build(&def).unwrap()),
            collaborators,
            SessionSettings::default(),
            Utc::now(),
        );

        s.start(Utc::now()).await.unwrap();
        s.handle_utterance("hi", Utc::now()).await.unwrap();
        let reply = s.handle_utterance("yes", Utc::now()).await.unwrap();
        assert_eq!(reply.text, "Done, anything else?");

        for _ in 0..50 {
            if !sink.invoked.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(sink.invoked.lock().unwrap().as_slice(), ["crm_sync"]);
    }

    #[tokio::test]
    async fn test_reprompt_repeats_last_agent_line() {
        let mut s = session();
        assert_eq!(s.reprompt(), None);
        s.start(Utc::now()).await.unwrap();
        s.handle_utterance("hello", Utc::now()).await.unwrap();
        let reply = s.reprompt().unwrap();
        assert_eq!(reply.text, "Are you interested in a demo?");
        assert_eq!(s.history().len(), 3);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let mut s = started().await;
        assert!(s.terminate(SessionOutcome::Timeout));
        assert!(!s.terminate(SessionOutcome::Hangup));
        assert_eq!(s.outcome(), Some(SessionOutcome::Timeout));
    }
}
