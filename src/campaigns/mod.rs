//! Campaigns — batch send jobs and their per-recipient records.

pub mod export;
pub mod model;

pub use export::write_outcomes_csv;
pub use model::{
    AttemptOutcome, Attachment, Campaign, CampaignReport, CampaignSettings, CampaignStatus,
    Outcome, OutcomeCounts, RateLimit, RecipientOutcome, SendAttempt, SendWindow,
};
