//! Campaign state machine with validated transitions.
//!
//! Scheduled -> Active <-> Paused, Active/Paused -> Completed. Contact
//! statuses only move forward through compare-and-swap in the store.

use callflow_core::types::CampaignStatus;

use crate::error::CampaignError;

/// Validate that a campaign status transition is allowed.
pub fn validate_campaign_transition(
    from: CampaignStatus,
    to: CampaignStatus,
) -> Result<(), CampaignError> {
    let valid = matches!(
        (from, to),
        (CampaignStatus::Scheduled, CampaignStatus::Active)
            | (CampaignStatus::Active, CampaignStatus::Paused)
            | (CampaignStatus::Paused, CampaignStatus::Active)
            | (CampaignStatus::Active, CampaignStatus::Completed)
            | (CampaignStatus::Paused, CampaignStatus::Completed)
    );

    if valid {
        Ok(())
    } else {
        Err(CampaignError::InvalidTransition(from, to))
    }
}
