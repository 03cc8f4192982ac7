//! Application state shared across all route handlers.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;

use callflow_core::{CallflowConfig, CallflowStore, Clock, DomainEvent};
use callflow_engine::{CallTracker, CampaignError, CampaignService, Collaborators, Scheduler};

use crate::auth::generate_token;

/// Shared application state.
///
/// All fields use `Arc` for cheap cloning across handler tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<CallflowConfig>,
    pub store: Arc<dyn CallflowStore>,
    pub scheduler: Arc<Scheduler>,
    pub tracker: Arc<CallTracker>,
    pub campaigns: Arc<CampaignService>,
    /// Broadcast sender for SSE events.
    pub event_tx: broadcast::Sender<DomainEvent>,
    /// Bearer token required on management routes.
    pub api_token: String,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Wire the engine together over `store`. A fresh random API token is
    /// generated; callers persisting a token overwrite `api_token`.
    pub fn new(
        config: CallflowConfig,
        store: Arc<dyn CallflowStore>,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CampaignError> {
        let (event_tx, _) = broadcast::channel(256);
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            &collaborators,
            Arc::clone(&clock),
            config.scheduler.clone(),
            config.general.public_base_url.clone(),
            event_tx.clone(),
        ));
        let tracker = Arc::new(CallTracker::new(
            Arc::clone(&store),
            Arc::clone(&scheduler),
            collaborators,
            Arc::clone(&clock),
            config.session.clone(),
            config.webhooks.clone(),
        ));
        let campaigns = Arc::new(CampaignService::new(
            Arc::clone(&store),
            Arc::clone(&scheduler),
            clock,
            &config.scheduler,
        )?);

        Ok(Self {
            config: Arc::new(config),
            store,
            scheduler,
            tracker,
            campaigns,
            event_tx,
            api_token: generate_token(),
            start_time: Instant::now(),
        })
    }
}
