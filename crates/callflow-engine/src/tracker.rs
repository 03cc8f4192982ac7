//! Call lifecycle tracker.
//!
//! Reconciles provider callbacks (voice turns, status changes and
//! transcriptions) with stored call state. Each call has its own async lock,
//! so events for one call are processed one at a time while different calls
//! proceed in parallel. Every event is claimed in the dedupe table first;
//! a redelivered voice event gets back the reply computed the first time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex as AsyncMutex, Notify, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use callflow_core::config::{SessionConfig, WebhookConfig};
use callflow_core::error::CallflowError;
use callflow_core::types::{
    Call, CallOutcome, CallStatus, Campaign, ContactStatus, EventClaim, SessionOutcome,
};
use callflow_core::{CallflowStore, Clock, DomainEvent};

use crate::collaborators::Collaborators;
use crate::error::TrackerError;
use crate::scheduler::Scheduler;
use crate::script::ScriptGraph;
use crate::session::registry::SharedSession;
use crate::session::{ConversationSession, Reply, SessionRegistry, SessionSettings};

/// A voice webhook: the provider wants to know what to say next.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VoiceEvent {
    pub provider_call_id: Option<String>,
    /// Call status reported alongside the turn, if any.
    pub status: Option<String>,
    /// Recognized caller speech. Absent on the first request after answer.
    pub utterance: Option<String>,
    /// Per-call turn counter, used for dedupe when no event id is given.
    pub sequence: Option<u64>,
    pub event_id: Option<String>,
}

impl VoiceEvent {
    fn dedupe_key(&self, call_id: Uuid) -> Option<String> {
        match (&self.event_id, self.sequence) {
            (Some(id), _) => Some(format!("voice:{}", id)),
            (None, Some(seq)) => Some(format!("voice:{}:{}", call_id, seq)),
            (None, None) => None,
        }
    }

    /// Reported status, if present and recognized.
    fn reported_status(&self, call_id: Uuid) -> Option<CallStatus> {
        let raw = self.status.as_deref()?;
        let status = CallStatus::from_provider(raw);
        if status.is_none() {
            warn!(call_id = %call_id, status = %raw, "Unknown status on voice event, ignoring it");
        }
        status
    }

    fn utterance(&self) -> Option<&str> {
        self.utterance
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }
}

/// Instructions for the provider after a voice webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpokenReply {
    pub say: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    /// Gather caller speech after speaking.
    pub listen: bool,
    pub hangup: bool,
}

impl From<Reply> for SpokenReply {
    fn from(reply: Reply) -> Self {
        Self {
            say: reply.text,
            audio_url: reply.audio.map(|a| a.url),
            listen: !reply.hangup,
            hangup: reply.hangup,
        }
    }
}

/// A provider status callback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StatusEvent {
    pub status: String,
    pub duration_secs: Option<u32>,
    pub recording_url: Option<String>,
    pub recording_sid: Option<String>,
    pub provider_call_id: Option<String>,
    pub event_id: Option<String>,
}

/// Post-call transcription delivered by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TranscriptionEvent {
    pub text: String,
    pub status: String,
    pub event_id: Option<String>,
}

type CallLocks = Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>;

/// Exclusive hold on one call. The map entry goes away with the last holder.
struct CallLockGuard<'a> {
    locks: &'a CallLocks,
    call_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for CallLockGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        drop(self.guard.take());
        if locks
            .get(&self.call_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.call_id);
        }
    }
}

pub struct CallTracker {
    store: Arc<dyn CallflowStore>,
    scheduler: Arc<Scheduler>,
    registry: SessionRegistry,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
    session_config: SessionConfig,
    webhook_config: WebhookConfig,
    graphs: Mutex<HashMap<Uuid, Arc<ScriptGraph>>>,
    call_locks: CallLocks,
    events: broadcast::Sender<DomainEvent>,
    shutdown: Arc<Notify>,
}

impl CallTracker {
    pub fn new(
        store: Arc<dyn CallflowStore>,
        scheduler: Arc<Scheduler>,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        session_config: SessionConfig,
        webhook_config: WebhookConfig,
    ) -> Self {
        let events = scheduler.events();
        Self {
            store,
            scheduler,
            registry: SessionRegistry::new(),
            collaborators,
            clock,
            session_config,
            webhook_config,
            graphs: Mutex::new(HashMap::new()),
            call_locks: Mutex::new(HashMap::new()),
            events,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    // =========================================================================
    // Voice
    // =========================================================================

    /// Process one voice turn. Returns `None` when there is nothing to say,
    /// e.g. the call already ended.
    ///
    /// A terminal status carried on the voice event settles the call the
    /// same way a status callback would, and nothing is said.
    pub async fn handle_voice(
        &self,
        call_id: Uuid,
        event: VoiceEvent,
    ) -> Result<Option<SpokenReply>, TrackerError> {
        let reported = event.reported_status(call_id);

        let (reply, finished) = {
            let _held = self.lock_call(call_id).await;

            let call = self
                .store
                .get_call(call_id)?
                .ok_or(TrackerError::CallNotFound(call_id))?;

            let key = event.dedupe_key(call_id);
            if let Some(key) = &key {
                match self.store.claim_event(key, self.clock.now())? {
                    EventClaim::Claimed => {}
                    EventClaim::Duplicate(Some(response)) => {
                        debug!(call_id = %call_id, key = %key, "Replaying voice reply for duplicate event");
                        return serde_json::from_value(response)
                            .map_err(|e| TrackerError::Storage(CallflowError::from(e)));
                    }
                    EventClaim::Duplicate(None) => {
                        debug!(call_id = %call_id, key = %key, "Duplicate voice event still unanswered");
                        return Ok(None);
                    }
                }
            }

            let (reply, finished) = match reported {
                Some(status) if status.is_terminal() => {
                    self.note_provider_id(&call, event.provider_call_id.as_deref())?;
                    let ended = StatusEvent {
                        status: status.to_string(),
                        provider_call_id: event.provider_call_id.clone(),
                        ..StatusEvent::default()
                    };
                    (None, self.finish_call(&call, status, &ended).await?)
                }
                _ => (self.voice_turn(call, &event).await?, None),
            };

            if let Some(key) = &key {
                let response = serde_json::to_value(&reply).map_err(CallflowError::from)?;
                self.store.record_event_response(key, &response)?;
            }
            (reply, finished)
        };

        if let Some(campaign_id) = finished {
            self.backfill(campaign_id).await;
        }
        Ok(reply)
    }

    async fn voice_turn(
        &self,
        call: Call,
        event: &VoiceEvent,
    ) -> Result<Option<SpokenReply>, TrackerError> {
        if call.status.is_terminal() || call.session_outcome.is_some() {
            debug!(call_id = %call.id, status = %call.status, "Voice event for finished conversation");
            return Ok(None);
        }

        self.note_provider_id(&call, event.provider_call_id.as_deref())?;
        if call.status != CallStatus::Answered
            && self
                .store
                .advance_call_status(call.id, CallStatus::Answered, self.clock.now())?
        {
            self.emit(DomainEvent::CallStatusChanged {
                call_id: call.id,
                status: CallStatus::Answered,
                timestamp: self.clock.now(),
            });
        }

        let shared = self.ensure_session(&call).await?;
        let mut session = shared.lock().await;
        if session.is_terminated() {
            return Ok(None);
        }

        let reply = match event.utterance() {
            Some(utterance) => Some(
                session
                    .handle_utterance(utterance, self.clock.now())
                    .await?,
            ),
            None => session
                .take_pending_reply()
                .or_else(|| session.reprompt()),
        };

        self.persist_transcript(&mut session)?;
        if let Some(outcome) = session.outcome() {
            self.store.set_session_outcome(call.id, outcome)?;
            self.registry.remove(call.id);
            info!(call_id = %call.id, outcome = %outcome, turns = session.turns(), "Conversation ended");
            self.emit(DomainEvent::SessionEnded {
                call_id: call.id,
                outcome,
                turns: session.turns(),
                timestamp: self.clock.now(),
            });
        }

        Ok(reply.map(SpokenReply::from))
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Apply a provider status callback.
    ///
    /// Non-terminal statuses only move a call forward. The first terminal
    /// status wins: it settles the contact and triggers a backfill dispatch
    /// for the campaign. Later terminal events are no-ops.
    pub async fn handle_status(&self, call_id: Uuid, event: StatusEvent) -> Result<(), TrackerError> {
        let status = CallStatus::from_provider(&event.status)
            .ok_or_else(|| TrackerError::UnknownStatus(event.status.clone()))?;

        let finished = {
            let _held = self.lock_call(call_id).await;

            let call = self
                .store
                .get_call(call_id)?
                .ok_or(TrackerError::CallNotFound(call_id))?;

            let key = match &event.event_id {
                Some(id) => format!("status:{}", id),
                None => format!("status:{}:{}", call_id, status),
            };
            if let EventClaim::Duplicate(_) = self.store.claim_event(&key, self.clock.now())? {
                debug!(call_id = %call_id, key = %key, "Duplicate status event ignored");
                return Ok(());
            }

            self.note_provider_id(&call, event.provider_call_id.as_deref())?;
            let finished = if status.is_terminal() {
                self.finish_call(&call, status, &event).await?
            } else {
                self.advance(&call, status).await?;
                None
            };

            self.store
                .record_event_response(&key, &serde_json::json!({ "acknowledged": true }))?;
            finished
        };

        if let Some(campaign_id) = finished {
            self.backfill(campaign_id).await;
        }
        Ok(())
    }

    /// Fill the slot a finished call freed. Runs outside the call lock.
    async fn backfill(&self, campaign_id: Uuid) {
        if let Err(e) = self.scheduler.dispatch_next_batch(campaign_id).await {
            error!(campaign_id = %campaign_id, error = %e, "Backfill dispatch failed");
        }
    }

    async fn advance(&self, call: &Call, status: CallStatus) -> Result<(), TrackerError> {
        if self
            .store
            .advance_call_status(call.id, status, self.clock.now())?
        {
            debug!(call_id = %call.id, status = %status, "Call status advanced");
            self.emit(DomainEvent::CallStatusChanged {
                call_id: call.id,
                status,
                timestamp: self.clock.now(),
            });
        } else {
            debug!(call_id = %call.id, current = %call.status, reported = %status, "Stale status ignored");
        }

        if status == CallStatus::Answered && call.session_outcome.is_none() {
            let shared = self.ensure_session(call).await?;
            let mut session = shared.lock().await;
            self.persist_transcript(&mut session)?;
        }
        Ok(())
    }

    /// Settle a call at its terminal status. Returns the campaign id if this
    /// event was the one that finalized the call.
    async fn finish_call(
        &self,
        call: &Call,
        status: CallStatus,
        event: &StatusEvent,
    ) -> Result<Option<Uuid>, TrackerError> {
        let outcome = CallOutcome {
            duration_secs: event.duration_secs,
            recording_url: event.recording_url.clone(),
            recording_sid: event.recording_sid.clone(),
            failure_reason: (status != CallStatus::Completed).then(|| status.to_string()),
        };
        if !self
            .store
            .finalize_call(call.id, status, &outcome, self.clock.now())?
        {
            debug!(call_id = %call.id, status = %status, "Call already finalized");
            return Ok(None);
        }

        self.detach_session(call.id, SessionOutcome::Hangup).await?;

        let contact_status = status.contact_outcome();
        let reason = (contact_status == ContactStatus::Failed).then(|| status.to_string());
        let settled = self.store.transition_contact(
            call.campaign_id,
            &call.contact_id,
            ContactStatus::InProgress,
            contact_status,
            reason.as_deref(),
        )?;
        if !settled {
            warn!(call_id = %call.id, contact_id = %call.contact_id, "Contact was not in progress when its call ended");
        }

        self.scheduler.complete_if_drained(call.campaign_id)?;

        info!(
            call_id = %call.id,
            campaign_id = %call.campaign_id,
            status = %status,
            duration_secs = ?event.duration_secs,
            "Call finished"
        );
        self.emit(DomainEvent::CallFinished {
            call_id: call.id,
            campaign_id: call.campaign_id,
            status,
            contact_status,
            duration_secs: event.duration_secs,
            timestamp: self.clock.now(),
        });
        Ok(Some(call.campaign_id))
    }

    // =========================================================================
    // Transcription
    // =========================================================================

    /// Attach post-call transcription text and its analysis. Only
    /// `completed` transcriptions are stored; sessions are never touched.
    pub async fn handle_transcription(
        &self,
        call_id: Uuid,
        event: TranscriptionEvent,
    ) -> Result<(), TrackerError> {
        let _held = self.lock_call(call_id).await;

        if self.store.get_call(call_id)?.is_none() {
            return Err(TrackerError::CallNotFound(call_id));
        }

        let status = event.status.trim().to_ascii_lowercase();
        let key = match &event.event_id {
            Some(id) => format!("transcription:{}", id),
            None => format!("transcription:{}:{}", call_id, status),
        };
        if let EventClaim::Duplicate(_) = self.store.claim_event(&key, self.clock.now())? {
            debug!(call_id = %call_id, key = %key, "Duplicate transcription ignored");
            return Ok(());
        }

        if status == "completed" {
            let analysis = match self.collaborators.analyzer.analyze(&event.text).await {
                Ok(analysis) => Some(analysis),
                Err(e) => {
                    warn!(call_id = %call_id, error = %e, "Transcription analysis failed");
                    None
                }
            };
            self.store
                .save_transcription(call_id, &event.text, analysis.as_ref())?;
            info!(call_id = %call_id, text_length = event.text.len(), "Transcription saved");
            self.emit(DomainEvent::TranscriptionSaved {
                call_id,
                text_length: event.text.len(),
                timestamp: self.clock.now(),
            });
        } else {
            debug!(call_id = %call_id, status = %status, "Transcription not completed, ignoring");
        }

        self.store
            .record_event_response(&key, &serde_json::json!({ "acknowledged": true }))?;
        Ok(())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// End sessions that have been silent longer than the configured
    /// timeout. Call status is left for the provider to report.
    pub async fn sweep_idle_sessions(&self) -> Result<usize, TrackerError> {
        let cutoff =
            self.clock.now() - Duration::seconds(self.session_config.silence_timeout_secs as i64);
        let mut ended = 0;
        for call_id in self.registry.idle_since(cutoff) {
            let _held = self.lock_call(call_id).await;
            if self.detach_session(call_id, SessionOutcome::Timeout).await? {
                info!(call_id = %call_id, "Session timed out");
                ended += 1;
            }
        }
        Ok(ended)
    }

    /// Forget dedupe records older than the retention period.
    pub fn purge_dedupe_records(&self) -> Result<usize, TrackerError> {
        let cutoff =
            self.clock.now() - Duration::hours(self.webhook_config.dedupe_retention_hours as i64);
        Ok(self.store.purge_events_before(cutoff)?)
    }

    /// Background loop for the silence sweep and dedupe purge. Returns on
    /// shutdown signal.
    pub async fn run_maintenance(&self) {
        let sweep_every = std::time::Duration::from_secs(self.session_config.sweep_interval_secs.max(1));
        let purge_every = std::time::Duration::from_secs(self.webhook_config.purge_interval_secs.max(1));
        let mut last_purge = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(sweep_every) => {}
                _ = self.shutdown.notified() => return,
            }

            if let Err(e) = self.sweep_idle_sessions().await {
                error!(error = %e, "Silence sweep failed");
            }

            if last_purge.elapsed() >= purge_every {
                match self.purge_dedupe_records() {
                    Ok(0) => {}
                    Ok(n) => debug!(count = n, "Purged webhook dedupe records"),
                    Err(e) => error!(error = %e, "Dedupe purge failed"),
                }
                last_purge = tokio::time::Instant::now();
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn ensure_session(&self, call: &Call) -> Result<SharedSession, TrackerError> {
        if let Some(existing) = self.registry.get(call.id) {
            return Ok(existing);
        }

        let campaign = self
            .store
            .get_campaign(call.campaign_id)?
            .ok_or(TrackerError::CampaignNotFound(call.campaign_id))?;
        let graph = self.graph_for(&campaign)?;
        let now = self.clock.now();

        let mut session = ConversationSession::new(
            call.id,
            campaign.voice_id.clone(),
            graph,
            self.collaborators.clone(),
            SessionSettings::from(&self.session_config),
            now,
        );
        session.start(now).await?;
        info!(call_id = %call.id, campaign_id = %campaign.id, "Conversation started");
        self.emit(DomainEvent::SessionStarted {
            call_id: call.id,
            timestamp: now,
        });
        Ok(self.registry.insert(session))
    }

    /// Remove a live session, ending it with `outcome` if the script has not
    /// already ended it. Returns true if a session was detached.
    async fn detach_session(
        &self,
        call_id: Uuid,
        outcome: SessionOutcome,
    ) -> Result<bool, TrackerError> {
        let Some(shared) = self.registry.remove(call_id) else {
            return Ok(false);
        };
        let mut session = shared.lock().await;
        session.terminate(outcome);
        self.persist_transcript(&mut session)?;

        let final_outcome = session.outcome().unwrap_or(outcome);
        self.store.set_session_outcome(call_id, final_outcome)?;
        self.emit(DomainEvent::SessionEnded {
            call_id,
            outcome: final_outcome,
            turns: session.turns(),
            timestamp: self.clock.now(),
        });
        Ok(true)
    }

    fn persist_transcript(&self, session: &mut ConversationSession) -> Result<(), TrackerError> {
        let fresh = session.take_unpersisted();
        if !fresh.is_empty() {
            self.store.append_transcript(session.call_id(), &fresh)?;
        }
        Ok(())
    }

    fn note_provider_id(&self, call: &Call, provider_call_id: Option<&str>) -> Result<(), TrackerError> {
        if let (None, Some(id)) = (&call.provider_call_id, provider_call_id) {
            if !id.is_empty() {
                self.store.set_provider_call_id(call.id, id)?;
            }
        }
        Ok(())
    }

    /// Compiled script for a campaign. Snapshots never change, so each is
    /// built once.
    fn graph_for(&self, campaign: &Campaign) -> Result<Arc<ScriptGraph>, TrackerError> {
        let mut graphs = self
            .graphs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(graph) = graphs.get(&campaign.id) {
            return Ok(Arc::clone(graph));
        }
        let graph = Arc::new(ScriptGraph::build(&campaign.script)?);
        graphs.insert(campaign.id, Arc::clone(&graph));
        Ok(graph)
    }

    async fn lock_call(&self, call_id: Uuid) -> CallLockGuard<'_> {
        let mut held = CallLockGuard {
            locks: &self.call_locks,
            call_id,
            guard: None,
        };
        let lock = {
            let mut locks = self
                .call_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(call_id).or_default())
        };
        held.guard = Some(lock.lock_owned().await);
        held
    }

    fn emit(&self, event: DomainEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callflow_core::config::SchedulerConfig;
    use callflow_core::types::{
        CampaignSettings, CampaignStatus, ContactEnrollment, NodeDefinition, ResponseDefinition,
        ScriptDefinition, Speaker, TimeWindow,
    };
    use callflow_core::ManualClock;
    use callflow_storage::SqliteStore;
    use chrono::{TimeZone, Utc};

    struct Fixture {
        store: Arc<SqliteStore>,
        clock: Arc<ManualClock>,
        tracker: CallTracker,
        campaign_id: Uuid,
    }

    fn script() -> ScriptDefinition {
        ScriptDefinition {
            initial_greeting: "Hi, this is Ava.".into(),
            nodes: vec![NodeDefinition {
                id: "N1".into(),
                message: "Want a demo?".into(),
                responses: vec![
                    ResponseDefinition {
                        pattern: "yes".into(),
                        next_node: "END".into(),
                        action: None,
                    },
                    ResponseDefinition {
                        pattern: "no".into(),
                        next_node: "END".into(),
                        action: None,
                    },
                ],
            }],
        }
    }

    fn fixture(contacts: usize, per_day: u32) -> Fixture {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap(),
        ));
        let (tx, _) = broadcast::channel(64);
        let collaborators = Collaborators::offline();
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            &collaborators,
            clock.clone(),
            SchedulerConfig::default(),
            "https://hooks.example",
            tx,
        ));
        let tracker = CallTracker::new(
            store.clone(),
            scheduler,
            collaborators,
            clock.clone(),
            SessionConfig::default(),
            WebhookConfig::default(),
        );

        let now = clock.now();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            user_id: "user-1".into(),
            agent_id: Uuid::new_v4(),
            agent_version: 1,
            name: "Demo".into(),
            status: CampaignStatus::Active,
            settings: CampaignSettings {
                calls_per_day: per_day,
                calls_per_hour: None,
                time_window: TimeWindow::always_open(),
            },
            voice_id: "voice-1".into(),
            script: script(),
            created_at: now,
            updated_at: now,
        };
        let enrollments: Vec<ContactEnrollment> = (0..contacts)
            .map(|i| ContactEnrollment {
                contact_id: format!("c{}", i + 1),
                destination: format!("+1555020{}", i),
            })
            .collect();
        store.create_campaign(&campaign, &enrollments).unwrap();

        Fixture {
            store,
            clock,
            tracker,
            campaign_id: campaign.id,
        }
    }

    async fn dispatch_one(f: &Fixture) -> Uuid {
        let report = f
            .tracker
            .scheduler
            .dispatch_next_batch(f.campaign_id)
            .await
            .unwrap();
        report.attempts[0].call_id
    }

    fn status(s: &str) -> StatusEvent {
        StatusEvent {
            status: s.into(),
            ..StatusEvent::default()
        }
    }

    fn said(text: &str, seq: u64) -> VoiceEvent {
        VoiceEvent {
            utterance: Some(text.into()),
            sequence: Some(seq),
            ..VoiceEvent::default()
        }
    }

    #[tokio::test]
    async fn test_first_voice_webhook_greets_and_answers() {
        let f = fixture(1, 5);
        let call_id = dispatch_one(&f).await;

        let reply = f
            .tracker
            .handle_voice(call_id, VoiceEvent::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.say, "Hi, this is Ava.");
        assert!(reply.listen);
        assert_eq!(f.tracker.active_sessions(), 1);

        let call = f.store.get_call(call_id).unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Answered);
        assert_eq!(f.store.transcript(call_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conversation_to_end_records_outcome() {
        let f = fixture(1, 5);
        let call_id = dispatch_one(&f).await;
        f.tracker.handle_voice(call_id, VoiceEvent::default()).await.unwrap();
        f.tracker.handle_voice(call_id, said("hello?", 1)).await.unwrap();
        let reply = f
            .tracker
            .handle_voice(call_id, said("no thanks", 2))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.hangup);
        assert!(!reply.listen);

        let call = f.store.get_call(call_id).unwrap().unwrap();
        assert_eq!(call.session_outcome, Some(SessionOutcome::Completed));
        assert_eq!(f.tracker.active_sessions(), 0);

        let transcript = f.store.transcript(call_id).unwrap();
        assert_eq!(transcript.len(), 5);
        assert_eq!(transcript[1].speaker, Speaker::Caller);

        // Later voice webhooks have nothing to say.
        assert_eq!(
            f.tracker.handle_voice(call_id, said("wait", 3)).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_duplicate_voice_event_replays_reply() {
        let f = fixture(1, 5);
        let call_id = dispatch_one(&f).await;
        f.tracker.handle_voice(call_id, VoiceEvent::default()).await.unwrap();

        let first = f.tracker.handle_voice(call_id, said("hi", 1)).await.unwrap();
        let again = f.tracker.handle_voice(call_id, said("hi", 1)).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(f.store.transcript(call_id).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_status_never_moves_backwards() {
        let f = fixture(1, 5);
        let call_id = dispatch_one(&f).await;
        f.tracker.handle_status(call_id, status("in-progress")).await.unwrap();
        f.tracker.handle_status(call_id, status("ringing")).await.unwrap();
        let call = f.store.get_call(call_id).unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Answered);
        assert_eq!(f.tracker.active_sessions(), 1);
    }

    #[tokio::test]
    async fn test_terminal_status_settles_contact_and_detaches_session() {
        let f = fixture(1, 5);
        let call_id = dispatch_one(&f).await;
        f.tracker.handle_voice(call_id, VoiceEvent::default()).await.unwrap();

        let event = StatusEvent {
            status: "completed".into(),
            duration_secs: Some(42),
            recording_url: Some("https://rec.example/1".into()),
            ..StatusEvent::default()
        };
        f.tracker.handle_status(call_id, event).await.unwrap();

        let call = f.store.get_call(call_id).unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Completed);
        assert_eq!(call.duration_secs, Some(42));
        assert_eq!(call.session_outcome, Some(SessionOutcome::Hangup));
        assert_eq!(f.tracker.active_sessions(), 0);

        let contact = f.store.get_contact(f.campaign_id, "c1").unwrap().unwrap();
        assert_eq!(contact.status, ContactStatus::Completed);
        assert_eq!(
            f.store.get_campaign(f.campaign_id).unwrap().unwrap().status,
            CampaignStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_no_answer_fails_contact() {
        let f = fixture(1, 5);
        let call_id = dispatch_one(&f).await;
        f.tracker.handle_status(call_id, status("no-answer")).await.unwrap();
        let contact = f.store.get_contact(f.campaign_id, "c1").unwrap().unwrap();
        assert_eq!(contact.status, ContactStatus::Failed);
        assert_eq!(contact.failure_reason.as_deref(), Some("no_answer"));
    }

    #[tokio::test]
    async fn test_duplicate_terminal_event_backfills_once() {
        let f = fixture(3, 1);
        let call_id = dispatch_one(&f).await;

        f.tracker.handle_status(call_id, status("completed")).await.unwrap();
        f.tracker.handle_status(call_id, status("completed")).await.unwrap();
        // A different terminal status after the fact loses the race too.
        f.tracker.handle_status(call_id, status("busy")).await.unwrap();

        let stats = f.store.call_stats(f.campaign_id).unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.completed, 1);
        let counts = f.store.contact_counts(f.campaign_id).unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.in_progress, 1);
        assert_eq!(counts.pending, 1);
    }

    #[tokio::test]
    async fn test_unknown_status_and_call() {
        let f = fixture(1, 5);
        let call_id = dispatch_one(&f).await;
        assert!(matches!(
            f.tracker.handle_status(call_id, status("exploded")).await,
            Err(TrackerError::UnknownStatus(_))
        ));
        assert!(matches!(
            f.tracker.handle_status(Uuid::new_v4(), status("completed")).await,
            Err(TrackerError::CallNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_transcription_attached_after_call() {
        let f = fixture(1, 5);
        let call_id = dispatch_one(&f).await;
        f.tracker.handle_status(call_id, status("completed")).await.unwrap();

        let pending = TranscriptionEvent {
            text: String::new(),
            status: "in-progress".into(),
            event_id: None,
        };
        f.tracker.handle_transcription(call_id, pending).await.unwrap();
        assert!(f.store.get_call(call_id).unwrap().unwrap().transcription.is_none());

        let done = TranscriptionEvent {
            text: "Yes, sounds good".into(),
            status: "completed".into(),
            event_id: Some("TR1".into()),
        };
        f.tracker.handle_transcription(call_id, done).await.unwrap();

        let call = f.store.get_call(call_id).unwrap().unwrap();
        assert_eq!(call.transcription.as_deref(), Some("Yes, sounds good"));
        assert_eq!(
            call.analysis.unwrap().matched_intent.as_deref(),
            Some("affirmative")
        );
        assert_eq!(f.tracker.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_silence_sweep_times_out_session() {
        let f = fixture(1, 5);
        let call_id = dispatch_one(&f).await;
        f.tracker.handle_voice(call_id, VoiceEvent::default()).await.unwrap();

        assert_eq!(f.tracker.sweep_idle_sessions().await.unwrap(), 0);
        f.clock.advance(Duration::seconds(31));
        assert_eq!(f.tracker.sweep_idle_sessions().await.unwrap(), 1);

        let call = f.store.get_call(call_id).unwrap().unwrap();
        assert_eq!(call.session_outcome, Some(SessionOutcome::Timeout));
        assert_eq!(call.status, CallStatus::Answered);
    }

    #[tokio::test]
    async fn test_voice_event_with_terminal_status_settles_call() {
        let f = fixture(2, 1);
        let call_id = dispatch_one(&f).await;

        let event = VoiceEvent {
            status: Some("busy".into()),
            provider_call_id: Some("CA9".into()),
            ..VoiceEvent::default()
        };
        assert_eq!(f.tracker.handle_voice(call_id, event).await.unwrap(), None);

        let call = f.store.get_call(call_id).unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Busy);
        assert_eq!(f.tracker.active_sessions(), 0);
        assert!(f.store.transcript(call_id).unwrap().is_empty());

        let contact = f.store.get_contact(f.campaign_id, "c1").unwrap().unwrap();
        assert_eq!(contact.status, ContactStatus::Failed);
        assert_eq!(contact.failure_reason.as_deref(), Some("busy"));

        // The freed slot goes to the next contact.
        let counts = f.store.contact_counts(f.campaign_id).unwrap();
        assert_eq!(counts.in_progress, 1);
        assert_eq!(counts.pending, 0);
    }

    #[tokio::test]
    async fn test_voice_event_with_live_or_unknown_status_converses() {
        let f = fixture(1, 5);
        let call_id = dispatch_one(&f).await;

        let answered = VoiceEvent {
            status: Some("in-progress".into()),
            ..VoiceEvent::default()
        };
        let reply = f
            .tracker
            .handle_voice(call_id, answered)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.say, "Hi, this is Ava.");

        let garbled = VoiceEvent {
            status: Some("exploded".into()),
            utterance: Some("hello?".into()),
            sequence: Some(1),
            ..VoiceEvent::default()
        };
        let reply = f
            .tracker
            .handle_voice(call_id, garbled)
            .await
            .unwrap()
            .unwrap();
        assert!(reply.listen);

        let call = f.store.get_call(call_id).unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Answered);
        assert_eq!(f.tracker.active_sessions(), 1);
    }

    #[tokio::test]
    async fn test_call_locks_released_after_late_events() {
        let f = fixture(2, 5);
        let report = f
            .tracker
            .scheduler
            .dispatch_next_batch(f.campaign_id)
            .await
            .unwrap();
        let (done, silent) = (report.attempts[0].call_id, report.attempts[1].call_id);

        f.tracker.handle_voice(done, VoiceEvent::default()).await.unwrap();
        f.tracker.handle_status(done, status("completed")).await.unwrap();
        let transcription = TranscriptionEvent {
            text: "Yes".into(),
            status: "completed".into(),
            event_id: None,
        };
        f.tracker.handle_transcription(done, transcription).await.unwrap();
        f.tracker.handle_voice(done, said("hello?", 9)).await.unwrap();

        f.tracker.handle_voice(silent, VoiceEvent::default()).await.unwrap();
        f.clock.advance(Duration::seconds(31));
        assert_eq!(f.tracker.sweep_idle_sessions().await.unwrap(), 1);

        assert!(f.tracker.call_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_call_lock_kept_while_contended() {
        let f = fixture(1, 5);
        let call_id = dispatch_one(&f).await;

        let first = f.tracker.lock_call(call_id).await;
        let waiting = f.tracker.lock_call(call_id);
        tokio::pin!(waiting);
        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(20), waiting.as_mut()).await;
        assert!(blocked.is_err());

        drop(first);
        assert_eq!(f.tracker.call_locks.lock().unwrap().len(), 1);
        let second = waiting.await;
        drop(second);
        assert!(f.tracker.call_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_dedupe_records() {
        let f = fixture(1, 5);
        let call_id = dispatch_one(&f).await;
        f.tracker.handle_status(call_id, status("ringing")).await.unwrap();

        assert_eq!(f.tracker.purge_dedupe_records().unwrap(), 0);
        f.clock.advance(Duration::hours(25));
        assert_eq!(f.tracker.purge_dedupe_records().unwrap(), 1);
    }
}
