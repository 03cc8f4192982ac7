//! Agent and campaign management.
//!
//! Creating a campaign snapshots the agent's script and voice; later agent
//! edits bump the agent's version but never reach campaigns already created.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use callflow_core::config::SchedulerConfig;
use callflow_core::types::{
    Agent, CallStats, Campaign, CampaignSettings, CampaignStatus, ContactCounts,
    ContactEnrollment, ScriptDefinition,
};
use callflow_core::{CallflowStore, Clock, DomainEvent};

use crate::error::CampaignError;
use crate::lifecycle::validate_campaign_transition;
use crate::scheduler::{DispatchReport, Scheduler};
use crate::script::ScriptGraph;

#[derive(Debug, Clone, Deserialize)]
pub struct NewAgent {
    pub user_id: String,
    pub name: String,
    pub voice_id: String,
    pub script: ScriptDefinition,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewCampaign {
    pub user_id: String,
    pub agent_id: Uuid,
    pub name: String,
    /// Falls back to the configured scheduler defaults.
    #[serde(default)]
    pub settings: Option<CampaignSettings>,
    #[serde(default)]
    pub contacts: Vec<ContactEnrollment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignStats {
    pub campaign: Campaign,
    pub contacts: ContactCounts,
    pub calls: CallStats,
}

pub struct CampaignService {
    store: Arc<dyn CallflowStore>,
    scheduler: Arc<Scheduler>,
    clock: Arc<dyn Clock>,
    default_settings: CampaignSettings,
    events: broadcast::Sender<DomainEvent>,
}

impl CampaignService {
    pub fn new(
        store: Arc<dyn CallflowStore>,
        scheduler: Arc<Scheduler>,
        clock: Arc<dyn Clock>,
        config: &SchedulerConfig,
    ) -> Result<Self, CampaignError> {
        let events = scheduler.events();
        Ok(Self {
            store,
            scheduler,
            clock,
            default_settings: config.default_settings()?,
            events,
        })
    }

    // =========================================================================
    // Agents
    // =========================================================================

    pub fn create_agent(&self, new: NewAgent) -> Result<Agent, CampaignError> {
        require("name", &new.name)?;
        require("user_id", &new.user_id)?;
        ScriptGraph::build(&new.script)?;

        let now = self.clock.now();
        let agent = Agent {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            name: new.name.trim().to_string(),
            voice_id: new.voice_id,
            script: new.script,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        self.store.save_agent(&agent)?;
        info!(agent_id = %agent.id, name = %agent.name, "Agent created");
        Ok(agent)
    }

    /// Replace an agent's script. Campaigns keep the snapshot they took.
    pub fn update_agent_script(
        &self,
        agent_id: Uuid,
        script: ScriptDefinition,
    ) -> Result<Agent, CampaignError> {
        ScriptGraph::build(&script)?;
        let mut agent = self.get_agent(agent_id)?;
        agent.script = script;
        agent.version += 1;
        agent.updated_at = self.clock.now();
        self.store.save_agent(&agent)?;
        info!(agent_id = %agent.id, version = agent.version, "Agent script updated");
        Ok(agent)
    }

    pub fn get_agent(&self, agent_id: Uuid) -> Result<Agent, CampaignError> {
        self.store
            .get_agent(agent_id)?
            .ok_or(CampaignError::AgentNotFound(agent_id))
    }

    // =========================================================================
    // Campaigns
    // =========================================================================

    pub fn create_campaign(&self, new: NewCampaign) -> Result<Campaign, CampaignError> {
        require("name", &new.name)?;
        let agent = self.get_agent(new.agent_id)?;
        if agent.user_id != new.user_id {
            return Err(CampaignError::Validation(format!(
                "agent {} does not belong to user {}",
                agent.id, new.user_id
            )));
        }
        ScriptGraph::build(&agent.script)?;

        let settings = new.settings.unwrap_or_else(|| self.default_settings.clone());
        settings
            .validate()
            .map_err(|e| CampaignError::Validation(e.to_string()))?;
        validate_contacts(&new.contacts)?;

        let now = self.clock.now();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            agent_id: agent.id,
            agent_version: agent.version,
            name: new.name.trim().to_string(),
            status: CampaignStatus::Scheduled,
            settings,
            voice_id: agent.voice_id,
            script: agent.script,
            created_at: now,
            updated_at: now,
        };
        self.store.create_campaign(&campaign, &new.contacts)?;
        info!(
            campaign_id = %campaign.id,
            agent_id = %campaign.agent_id,
            contacts = new.contacts.len(),
            "Campaign created"
        );
        Ok(campaign)
    }

    pub fn get_campaign(&self, id: Uuid) -> Result<Campaign, CampaignError> {
        self.store
            .get_campaign(id)?
            .ok_or(CampaignError::NotFound(id))
    }

    /// Activate a scheduled campaign and dispatch its first batch.
    pub async fn start(&self, id: Uuid) -> Result<DispatchReport, CampaignError> {
        self.transition(id, CampaignStatus::Active, &[CampaignStatus::Scheduled])?;
        Ok(self.scheduler.dispatch_next_batch(id).await?)
    }

    /// Stop dispatching. Calls already in flight are left alone.
    pub fn pause(&self, id: Uuid) -> Result<Campaign, CampaignError> {
        self.transition(id, CampaignStatus::Paused, &[CampaignStatus::Active])
    }

    pub async fn resume(&self, id: Uuid) -> Result<DispatchReport, CampaignError> {
        self.transition(id, CampaignStatus::Active, &[CampaignStatus::Paused])?;
        Ok(self.scheduler.dispatch_next_batch(id).await?)
    }

    /// Run a dispatch batch outside the scheduler's own cadence.
    pub async fn dispatch(&self, id: Uuid) -> Result<DispatchReport, CampaignError> {
        self.get_campaign(id)?;
        Ok(self.scheduler.dispatch_next_batch(id).await?)
    }

    pub fn stats(&self, id: Uuid) -> Result<CampaignStats, CampaignError> {
        let campaign = self.get_campaign(id)?;
        Ok(CampaignStats {
            contacts: self.store.contact_counts(id)?,
            calls: self.store.call_stats(id)?,
            campaign,
        })
    }

    fn transition(
        &self,
        id: Uuid,
        to: CampaignStatus,
        allowed_from: &[CampaignStatus],
    ) -> Result<Campaign, CampaignError> {
        let campaign = self.get_campaign(id)?;
        let from = campaign.status;
        if !allowed_from.contains(&from) {
            return Err(CampaignError::InvalidTransition(from, to));
        }
        validate_campaign_transition(from, to)?;

        if !self.store.transition_campaign(id, &[from], to)? {
            return Err(CampaignError::Conflict(id));
        }
        info!(campaign_id = %id, from = %from, to = %to, "Campaign status changed");
        let _ = self.events.send(DomainEvent::CampaignStatusChanged {
            campaign_id: id,
            from,
            to,
            timestamp: self.clock.now(),
        });
        self.get_campaign(id)
    }
}

fn require(field: &str, value: &str) -> Result<(), CampaignError> {
    if value.trim().is_empty() {
        return Err(CampaignError::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn validate_contacts(contacts: &[ContactEnrollment]) -> Result<(), CampaignError> {
    let mut seen = HashSet::with_capacity(contacts.len());
    for contact in contacts {
        require("contact_id", &contact.contact_id)?;
        if contact.destination.trim().is_empty() {
            return Err(CampaignError::Validation(format!(
                "contact {} has no destination",
                contact.contact_id
            )));
        }
        if !seen.insert(contact.contact_id.as_str()) {
            return Err(CampaignError::Validation(format!(
                "duplicate contact id: {}",
                contact.contact_id
            )));
        }
    }
    Ok(())
}
