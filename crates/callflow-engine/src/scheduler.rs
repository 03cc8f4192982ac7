//! Campaign scheduler: turns pending contacts into placed calls.
//!
//! A batch honours the campaign's time window, its daily and hourly caps and
//! the credit gate. Contacts are claimed by compare-and-swap before the
//! provider is asked to dial, so a contact is never dialed twice even when
//! two schedulers race on the same campaign.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex as AsyncMutex, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use callflow_core::config::SchedulerConfig;
use callflow_core::types::{
    Call, CallOutcome, CallStatus, Campaign, CampaignStatus, ContactStatus,
};
use callflow_core::{CallflowStore, Clock, DomainEvent};

use crate::collaborators::{Collaborators, CreditGate, PlacementRequest, Telephony, CALL_FEATURE};
use crate::error::{CreditError, SchedulerError};

/// Failure reason recorded when a call row could not be written.
pub const DISPATCH_ERROR: &str = "dispatch_error";
/// Failure reason for calls that never got a provider id.
pub const ORPHANED_DISPATCH: &str = "orphaned_dispatch";

/// What one `dispatch_next_batch` call did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReport {
    pub campaign_id: Uuid,
    pub attempts: Vec<CallAttempt>,
    /// Why the batch stopped short, if it did.
    pub skipped: Option<SkipReason>,
    /// Set when the batch was skipped because the window is closed.
    pub next_window_opens: Option<DateTime<Utc>>,
}

impl DispatchReport {
    fn new(campaign_id: Uuid) -> Self {
        Self {
            campaign_id,
            attempts: Vec::new(),
            skipped: None,
            next_window_opens: None,
        }
    }

    fn skip(mut self, reason: SkipReason) -> Self {
        self.skipped = Some(reason);
        self
    }

    pub fn placed(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| matches!(a.outcome, AttemptOutcome::Placed { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.attempts.len() - self.placed()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallAttempt {
    pub call_id: Uuid,
    pub contact_id: String,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Placed { provider_call_id: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotActive,
    OutsideWindow,
    CapacityExhausted,
    InsufficientCredits,
    CreditsUnavailable,
    NoPendingContacts,
}

pub struct Scheduler {
    store: Arc<dyn CallflowStore>,
    telephony: Arc<dyn Telephony>,
    credits: Arc<dyn CreditGate>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    callback_base_url: String,
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
    events: broadcast::Sender<DomainEvent>,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn CallflowStore>,
        collaborators: &Collaborators,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
        callback_base_url: impl Into<String>,
        events: broadcast::Sender<DomainEvent>,
    ) -> Self {
        Self {
            store,
            telephony: Arc::clone(&collaborators.telephony),
            credits: Arc::clone(&collaborators.credits),
            clock,
            config,
            callback_base_url: callback_base_url.into().trim_end_matches('/').to_string(),
            locks: Mutex::new(HashMap::new()),
            events,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Dispatch as many pending contacts as the campaign currently allows.
    ///
    /// Concurrent calls for the same campaign are serialized.
    pub async fn dispatch_next_batch(
        &self,
        campaign_id: Uuid,
    ) -> Result<DispatchReport, SchedulerError> {
        let lock = self.campaign_lock(campaign_id);
        let _guard = lock.lock().await;

        let campaign = self
            .store
            .get_campaign(campaign_id)?
            .ok_or(SchedulerError::CampaignNotFound(campaign_id))?;
        let report = DispatchReport::new(campaign_id);

        if campaign.status != CampaignStatus::Active {
            debug!(campaign_id = %campaign_id, status = %campaign.status, "Campaign not active, skipping dispatch");
            return Ok(report.skip(SkipReason::NotActive));
        }

        let now = self.clock.now();
        let local = self.local_time(now);
        let window = campaign.settings.time_window;
        if !window.contains(local.time()) {
            let opens = self.to_utc(window.next_open(local));
            debug!(campaign_id = %campaign_id, next_open = %opens, "Outside calling window");
            let mut report = report.skip(SkipReason::OutsideWindow);
            report.next_window_opens = Some(opens);
            return Ok(report);
        }

        let capacity = self.capacity(&campaign, now, local)?;
        if capacity == 0 {
            debug!(campaign_id = %campaign_id, "No dispatch capacity left");
            return Ok(report.skip(SkipReason::CapacityExhausted));
        }

        let contacts = self.store.pending_contacts(campaign_id, capacity as usize)?;
        if contacts.is_empty() {
            self.complete_if_drained(campaign_id)?;
            return Ok(report.skip(SkipReason::NoPendingContacts));
        }

        let mut report = report;
        for contact in contacts {
            let claimed = self.store.transition_contact(
                campaign_id,
                &contact.contact_id,
                ContactStatus::Pending,
                ContactStatus::InProgress,
                None,
            )?;
            if !claimed {
                debug!(campaign_id = %campaign_id, contact_id = %contact.contact_id, "Contact already claimed");
                continue;
            }

            // Only a claimed contact is charged; a refused debit hands it back.
            if let Err(e) = self
                .credits
                .check_and_debit(&campaign.user_id, CALL_FEATURE)
                .await
            {
                warn!(campaign_id = %campaign_id, user_id = %campaign.user_id, error = %e, "Credit check failed, stopping batch");
                self.store.transition_contact(
                    campaign_id,
                    &contact.contact_id,
                    ContactStatus::InProgress,
                    ContactStatus::Pending,
                    None,
                )?;
                report.skipped = Some(match e {
                    CreditError::Insufficient { .. } => SkipReason::InsufficientCredits,
                    CreditError::Unavailable(_) => SkipReason::CreditsUnavailable,
                });
                break;
            }

            let call = Call::queued(&contact, now);
            if let Err(e) = self.store.insert_call(&call) {
                error!(campaign_id = %campaign_id, contact_id = %contact.contact_id, error = %e, "Failed to record call");
                self.refund(&campaign, call.id).await;
                self.store.transition_contact(
                    campaign_id,
                    &contact.contact_id,
                    ContactStatus::InProgress,
                    ContactStatus::Failed,
                    Some(DISPATCH_ERROR),
                )?;
                report.attempts.push(CallAttempt {
                    call_id: call.id,
                    contact_id: contact.contact_id,
                    outcome: AttemptOutcome::Failed {
                        reason: DISPATCH_ERROR.to_string(),
                    },
                });
                continue;
            }

            let request = PlacementRequest {
                call_id: call.id,
                destination: contact.destination.clone(),
                callback_base_url: self.callback_base_url.clone(),
            };
            let outcome = match self.telephony.place_call(&request).await {
                Ok(provider_call_id) => {
                    self.store.set_provider_call_id(call.id, &provider_call_id)?;
                    info!(call_id = %call.id, contact_id = %contact.contact_id, provider_call_id = %provider_call_id, "Call placed");
                    self.emit(DomainEvent::CallPlaced {
                        call_id: call.id,
                        campaign_id,
                        contact_id: contact.contact_id.clone(),
                        timestamp: self.clock.now(),
                    });
                    AttemptOutcome::Placed { provider_call_id }
                }
                Err(e) => {
                    let reason = e.to_string();
                    warn!(call_id = %call.id, contact_id = %contact.contact_id, error = %e, "Call placement failed");
                    self.refund(&campaign, call.id).await;
                    self.fail_call(&call, &reason)?;
                    self.emit(DomainEvent::CallPlacementFailed {
                        call_id: call.id,
                        campaign_id,
                        contact_id: contact.contact_id.clone(),
                        reason: reason.clone(),
                        timestamp: self.clock.now(),
                    });
                    AttemptOutcome::Failed { reason }
                }
            };
            report.attempts.push(CallAttempt {
                call_id: call.id,
                contact_id: contact.contact_id,
                outcome,
            });
        }

        self.complete_if_drained(campaign_id)?;

        info!(
            campaign_id = %campaign_id,
            placed = report.placed(),
            failed = report.failed(),
            "Batch dispatched"
        );
        self.emit(DomainEvent::BatchDispatched {
            campaign_id,
            dispatched: report.placed(),
            failed: report.failed(),
            timestamp: self.clock.now(),
        });
        Ok(report)
    }

    /// Return the credit debited for a call that was never placed.
    async fn refund(&self, campaign: &Campaign, call_id: Uuid) {
        if let Err(e) = self.credits.refund(&campaign.user_id, CALL_FEATURE).await {
            warn!(call_id = %call_id, user_id = %campaign.user_id, error = %e, "Credit refund failed");
        }
    }

    /// Mark the campaign completed when no contact is pending or in progress.
    /// Returns true if this call made the transition.
    pub fn complete_if_drained(&self, campaign_id: Uuid) -> Result<bool, SchedulerError> {
        let counts = self.store.contact_counts(campaign_id)?;
        if !counts.is_drained() {
            return Ok(false);
        }
        let Some(campaign) = self.store.get_campaign(campaign_id)? else {
            return Err(SchedulerError::CampaignNotFound(campaign_id));
        };
        let from = campaign.status;
        let moved = self.store.transition_campaign(
            campaign_id,
            &[CampaignStatus::Active, CampaignStatus::Paused],
            CampaignStatus::Completed,
        )?;
        if moved {
            info!(campaign_id = %campaign_id, completed = counts.completed, failed = counts.failed, "Campaign completed");
            self.emit(DomainEvent::CampaignStatusChanged {
                campaign_id,
                from,
                to: CampaignStatus::Completed,
                timestamp: self.clock.now(),
            });
        }
        Ok(moved)
    }

    /// Fail calls that were recorded but never acknowledged by the provider.
    /// Returns the number of calls failed.
    pub fn reconcile_stale(&self) -> Result<usize, SchedulerError> {
        let now = self.clock.now();
        let cutoff = now - Duration::seconds(self.config.reconcile_after_secs as i64);
        let mut failed = 0;
        for call in self.store.stale_dispatches(cutoff)? {
            if self.fail_call(&call, ORPHANED_DISPATCH)? {
                warn!(call_id = %call.id, contact_id = %call.contact_id, "Orphaned dispatch failed");
                self.emit(DomainEvent::CallFinished {
                    call_id: call.id,
                    campaign_id: call.campaign_id,
                    status: CallStatus::Failed,
                    contact_status: ContactStatus::Failed,
                    duration_secs: None,
                    timestamp: now,
                });
                self.complete_if_drained(call.campaign_id)?;
                failed += 1;
            }
        }
        Ok(failed)
    }

    /// Run one scheduling pass over every active campaign.
    pub async fn tick(&self) {
        match self.reconcile_stale() {
            Ok(0) => {}
            Ok(n) => info!(count = n, "Reconciled orphaned dispatches"),
            Err(e) => error!(error = %e, "Reconciliation sweep failed"),
        }

        let campaigns = match self.store.list_campaigns(CampaignStatus::Active) {
            Ok(campaigns) => campaigns,
            Err(e) => {
                error!(error = %e, "Failed to list active campaigns");
                return;
            }
        };
        for campaign in campaigns {
            if let Err(e) = self.dispatch_next_batch(campaign.id).await {
                error!(campaign_id = %campaign.id, error = %e, "Scheduled dispatch failed");
            }
        }
    }

    /// Start the scheduler background loop. Returns on shutdown signal.
    pub async fn run(&self) {
        let interval = std::time::Duration::from_secs(self.config.tick_secs.max(1));
        loop {
            self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shutdown.notified() => return,
            }
        }
    }

    /// Signal the scheduler loop to shut down gracefully.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    pub fn events(&self) -> broadcast::Sender<DomainEvent> {
        self.events.clone()
    }

    /// Remaining dispatch capacity: the daily cap less calls still in
    /// flight from today, further bounded by the hourly cap when set.
    fn capacity(
        &self,
        campaign: &Campaign,
        now: DateTime<Utc>,
        local: NaiveDateTime,
    ) -> Result<u32, SchedulerError> {
        let day_start = self.to_utc(local.date().and_time(chrono::NaiveTime::MIN));
        let in_flight = self.store.count_in_flight_since(campaign.id, day_start)?;
        let mut capacity = campaign.settings.calls_per_day.saturating_sub(in_flight);

        if let Some(per_hour) = campaign.settings.calls_per_hour {
            let last_hour = self
                .store
                .count_calls_since(campaign.id, now - Duration::hours(1))?;
            capacity = capacity.min(per_hour.saturating_sub(last_hour));
        }
        Ok(capacity)
    }

    /// Finalize a call as failed and fail its contact. Returns false if the
    /// call had already reached a terminal status.
    fn fail_call(&self, call: &Call, reason: &str) -> Result<bool, SchedulerError> {
        let outcome = CallOutcome {
            failure_reason: Some(reason.to_string()),
            ..CallOutcome::default()
        };
        if !self
            .store
            .finalize_call(call.id, CallStatus::Failed, &outcome, self.clock.now())?
        {
            return Ok(false);
        }
        self.store.transition_contact(
            call.campaign_id,
            &call.contact_id,
            ContactStatus::InProgress,
            ContactStatus::Failed,
            Some(reason),
        )?;
        Ok(true)
    }

    fn campaign_lock(&self, campaign_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(campaign_id).or_default())
    }

    fn offset(&self) -> Duration {
        Duration::minutes(self.config.utc_offset_minutes as i64)
    }

    fn local_time(&self, now: DateTime<Utc>) -> NaiveDateTime {
        (now + self.offset()).naive_utc()
    }

    fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        Utc.from_utc_datetime(&(local - self.offset()))
    }

    fn emit(&self, event: DomainEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use callflow_core::types::{
        CampaignSettings, ContactEnrollment, NodeDefinition, ScriptDefinition, TimeWindow,
    };
    use callflow_core::ManualClock;
    use callflow_storage::SqliteStore;
    use chrono::NaiveTime;

    use crate::error::PlacementError;

    struct RejectingTelephony;

    #[async_trait]
    impl Telephony for RejectingTelephony {
        async fn place_call(&self, _: &PlacementRequest) -> Result<String, PlacementError> {
            Err(PlacementError::Rejected("invalid number".into()))
        }
    }

    struct CountedCredits {
        remaining: AtomicUsize,
        refunded: AtomicUsize,
    }

    impl CountedCredits {
        fn new(remaining: usize) -> Self {
            Self {
                remaining: AtomicUsize::new(remaining),
                refunded: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CreditGate for CountedCredits {
        async fn check_and_debit(&self, user_id: &str, feature: &str) -> Result<(), CreditError> {
            let left = self.remaining.load(Ordering::SeqCst);
            if left == 0 {
                return Err(CreditError::Insufficient {
                    user_id: user_id.into(),
                    feature: feature.into(),
                });
            }
            self.remaining.store(left - 1, Ordering::SeqCst);
            Ok(())
        }

        async fn refund(&self, _user_id: &str, _feature: &str) -> Result<(), CreditError> {
            self.remaining.fetch_add(1, Ordering::SeqCst);
            self.refunded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<SqliteStore>,
        clock: Arc<ManualClock>,
        scheduler: Scheduler,
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    fn fixture_with(collaborators: Collaborators, config: SchedulerConfig) -> Fixture {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(noon()));
        let (tx, _) = broadcast::channel(64);
        let scheduler = Scheduler::new(
            store.clone(),
            &collaborators,
            clock.clone(),
            config,
            "https://hooks.example/",
            tx,
        );
        Fixture {
            store,
            clock,
            scheduler,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Collaborators::offline(), SchedulerConfig::default())
    }

    fn seed(store: &SqliteStore, settings: CampaignSettings, contacts: usize, status: CampaignStatus) -> Uuid {
        let now = noon();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            user_id: "user-1".into(),
            agent_id: Uuid::new_v4(),
            agent_version: 1,
            name: "Spring outreach".into(),
            status,
            settings,
            voice_id: "voice-1".into(),
            script: ScriptDefinition {
                initial_greeting: "Hello".into(),
                nodes: vec![NodeDefinition {
                    id: "n1".into(),
                    message: "Interested?".into(),
                    responses: vec![],
                }],
            },
            created_at: now,
            updated_at: now,
        };
        let enrollments: Vec<ContactEnrollment> = (0..contacts)
            .map(|i| ContactEnrollment {
                contact_id: format!("c{}", i + 1),
                destination: format!("+1555010{}", i),
            })
            .collect();
        store.create_campaign(&campaign, &enrollments).unwrap();
        campaign.id
    }

    fn open_settings(per_day: u32) -> CampaignSettings {
        CampaignSettings {
            calls_per_day: per_day,
            calls_per_hour: None,
            time_window: TimeWindow::always_open(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_respects_daily_cap_fifo() {
        let f = fixture();
        let id = seed(&f.store, open_settings(2), 3, CampaignStatus::Active);

        let report = f.scheduler.dispatch_next_batch(id).await.unwrap();
        let contacts: Vec<&str> = report.attempts.iter().map(|a| a.contact_id.as_str()).collect();
        assert_eq!(contacts, vec!["c1", "c2"]);
        assert_eq!(report.placed(), 2);

        let again = f.scheduler.dispatch_next_batch(id).await.unwrap();
        assert!(again.attempts.is_empty());
        assert_eq!(again.skipped, Some(SkipReason::CapacityExhausted));
    }

    #[tokio::test]
    async fn test_inactive_campaign_dispatches_nothing() {
        let f = fixture();
        for status in [CampaignStatus::Scheduled, CampaignStatus::Paused] {
            let id = seed(&f.store, open_settings(5), 2, status);
            let report = f.scheduler.dispatch_next_batch(id).await.unwrap();
            assert!(report.attempts.is_empty());
            assert_eq!(report.skipped, Some(SkipReason::NotActive));
        }
    }

    #[tokio::test]
    async fn test_unknown_campaign() {
        let f = fixture();
        assert!(matches!(
            f.scheduler.dispatch_next_batch(Uuid::new_v4()).await,
            Err(SchedulerError::CampaignNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_outside_window_reports_next_opening() {
        let f = fixture();
        let settings = CampaignSettings {
            calls_per_day: 5,
            calls_per_hour: None,
            time_window: TimeWindow::new(
                NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            ),
        };
        let id = seed(&f.store, settings, 1, CampaignStatus::Active);

        let report = f.scheduler.dispatch_next_batch(id).await.unwrap();
        assert_eq!(report.skipped, Some(SkipReason::OutsideWindow));
        assert_eq!(
            report.next_window_opens,
            Some(Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0).unwrap())
        );

        f.clock.set(Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).unwrap());
        let report = f.scheduler.dispatch_next_batch(id).await.unwrap();
        assert_eq!(report.placed(), 1);
    }

    #[tokio::test]
    async fn test_window_uses_configured_offset() {
        // 12:00 UTC is 14:00 at +02:00, inside a 13:00-15:00 window.
        let config = SchedulerConfig {
            utc_offset_minutes: 120,
            ..SchedulerConfig::default()
        };
        let f = fixture_with(Collaborators::offline(), config);
        let settings = CampaignSettings {
            calls_per_day: 5,
            calls_per_hour: None,
            time_window: TimeWindow::new(
                NaiveTime::from_hms_opt(13, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(15, 0, 0).unwrap(),
            ),
        };
        let id = seed(&f.store, settings, 1, CampaignStatus::Active);
        let report = f.scheduler.dispatch_next_batch(id).await.unwrap();
        assert_eq!(report.placed(), 1);
    }

    #[tokio::test]
    async fn test_hourly_cap() {
        let f = fixture();
        let settings = CampaignSettings {
            calls_per_hour: Some(1),
            ..open_settings(10)
        };
        let id = seed(&f.store, settings, 3, CampaignStatus::Active);

        assert_eq!(f.scheduler.dispatch_next_batch(id).await.unwrap().placed(), 1);
        let blocked = f.scheduler.dispatch_next_batch(id).await.unwrap();
        assert_eq!(blocked.skipped, Some(SkipReason::CapacityExhausted));

        f.clock.advance(Duration::minutes(61));
        assert_eq!(f.scheduler.dispatch_next_batch(id).await.unwrap().placed(), 1);
    }

    #[tokio::test]
    async fn test_placement_failure_fails_contact_and_call() {
        let mut collaborators = Collaborators::offline();
        collaborators.telephony = Arc::new(RejectingTelephony);
        let f = fixture_with(collaborators, SchedulerConfig::default());
        let id = seed(&f.store, open_settings(5), 2, CampaignStatus::Active);

        let report = f.scheduler.dispatch_next_batch(id).await.unwrap();
        assert_eq!(report.failed(), 2);

        let contact = f.store.get_contact(id, "c1").unwrap().unwrap();
        assert_eq!(contact.status, ContactStatus::Failed);
        assert!(contact.failure_reason.unwrap().contains("invalid number"));

        let call = f.store.get_call(report.attempts[0].call_id).unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Failed);

        let campaign = f.store.get_campaign(id).unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);
    }

    #[tokio::test]
    async fn test_insufficient_credits_stops_batch() {
        let mut collaborators = Collaborators::offline();
        collaborators.credits = Arc::new(CountedCredits::new(1));
        let f = fixture_with(collaborators, SchedulerConfig::default());
        let id = seed(&f.store, open_settings(5), 3, CampaignStatus::Active);

        let report = f.scheduler.dispatch_next_batch(id).await.unwrap();
        assert_eq!(report.placed(), 1);
        assert_eq!(report.skipped, Some(SkipReason::InsufficientCredits));

        // The contact refused a debit goes back to the queue, still first in line.
        let counts = f.store.contact_counts(id).unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.in_progress, 1);
        let next = f.store.pending_contacts(id, 1).unwrap();
        assert_eq!(next[0].contact_id, "c2");
    }

    #[tokio::test]
    async fn test_failed_placement_refunds_credit() {
        let credits = Arc::new(CountedCredits::new(2));
        let mut collaborators = Collaborators::offline();
        collaborators.telephony = Arc::new(RejectingTelephony);
        collaborators.credits = credits.clone();
        let f = fixture_with(collaborators, SchedulerConfig::default());
        let id = seed(&f.store, open_settings(5), 2, CampaignStatus::Active);

        let report = f.scheduler.dispatch_next_batch(id).await.unwrap();
        assert_eq!(report.failed(), 2);
        assert_eq!(report.skipped, None);
        assert_eq!(credits.refunded.load(Ordering::SeqCst), 2);
        assert_eq!(credits.remaining.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_claims_each_contact_once() {
        let f = fixture();
        let id = seed(&f.store, open_settings(10), 4, CampaignStatus::Active);
        let scheduler = Arc::new(f.scheduler);

        let a = tokio::spawn({
            let s = Arc::clone(&scheduler);
            async move { s.dispatch_next_batch(id).await.unwrap() }
        });
        let b = tokio::spawn({
            let s = Arc::clone(&scheduler);
            async move { s.dispatch_next_batch(id).await.unwrap() }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        let mut contacts: Vec<String> = a
            .attempts
            .iter()
            .chain(b.attempts.iter())
            .map(|x| x.contact_id.clone())
            .collect();
        contacts.sort();
        assert_eq!(contacts, vec!["c1", "c2", "c3", "c4"]);
        assert_eq!(f.store.call_stats(id).unwrap().total, 4);
    }

    #[tokio::test]
    async fn test_reconcile_fails_orphaned_dispatch() {
        let f = fixture();
        let id = seed(&f.store, open_settings(5), 1, CampaignStatus::Active);

        // Simulate a crash between recording the call and placing it.
        let contact = f.store.pending_contacts(id, 1).unwrap().remove(0);
        f.store
            .transition_contact(id, "c1", ContactStatus::Pending, ContactStatus::InProgress, None)
            .unwrap();
        let call = Call::queued(&contact, noon());
        f.store.insert_call(&call).unwrap();

        assert_eq!(f.scheduler.reconcile_stale().unwrap(), 0);
        f.clock.advance(Duration::seconds(301));
        assert_eq!(f.scheduler.reconcile_stale().unwrap(), 1);
        assert_eq!(f.scheduler.reconcile_stale().unwrap(), 0);

        let contact = f.store.get_contact(id, "c1").unwrap().unwrap();
        assert_eq!(contact.status, ContactStatus::Failed);
        assert_eq!(contact.failure_reason.as_deref(), Some(ORPHANED_DISPATCH));
        assert_eq!(
            f.store.get_campaign(id).unwrap().unwrap().status,
            CampaignStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_empty_campaign_completes() {
        let f = fixture();
        let id = seed(&f.store, open_settings(5), 0, CampaignStatus::Active);
        let report = f.scheduler.dispatch_next_batch(id).await.unwrap();
        assert_eq!(report.skipped, Some(SkipReason::NoPendingContacts));
        assert_eq!(
            f.store.get_campaign(id).unwrap().unwrap().status,
            CampaignStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_scheduler_shutdown() {
        let f = fixture();
        f.scheduler.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(2), f.scheduler.run())
            .await
            .expect("Scheduler should shut down within timeout");
    }
}
