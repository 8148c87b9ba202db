//! `Database` trait — single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::campaigns::{Campaign, CampaignStatus, RecipientOutcome, SendAttempt};
use crate::error::DatabaseError;
use crate::leads::{Lead, LeadSelector, LeadStatus};
use crate::pipeline::suppression::SuppressionEntry;

/// Tenant-wide counters for the dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AnalyticsSummary {
    pub lead_count: u64,
    pub campaign_count: u64,
    /// Recipient outcome rows across all campaigns.
    pub total_emails: u64,
    pub sent: u64,
    pub opened: u64,
    pub clicked: u64,
}

/// Backend-agnostic database trait covering leads, campaigns, delivery
/// tracking and suppressions.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Leads ───────────────────────────────────────────────────────

    /// Insert a lead. Returns `false` if the tenant already has this address.
    async fn insert_lead(&self, lead: &Lead) -> Result<bool, DatabaseError>;

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError>;

    /// Leads of a tenant matching the selector, oldest first.
    async fn list_leads(
        &self,
        tenant_id: &str,
        selector: &LeadSelector,
    ) -> Result<Vec<Lead>, DatabaseError>;

    async fn update_lead_status(&self, id: Uuid, status: LeadStatus) -> Result<(), DatabaseError>;

    // ── Campaigns ───────────────────────────────────────────────────

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), DatabaseError>;

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, DatabaseError>;

    /// Campaigns of a tenant, newest first.
    async fn list_campaigns(&self, tenant_id: &str) -> Result<Vec<Campaign>, DatabaseError>;

    /// Move a campaign from `expected` to `target`.
    ///
    /// Returns `false` (and changes nothing) if the stored status is not
    /// `expected`. Entering `Sending` stamps `started_at`; entering a terminal
    /// status stamps `finished_at`.
    async fn transition_campaign(
        &self,
        id: Uuid,
        expected: CampaignStatus,
        target: CampaignStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Campaigns of every tenant currently in `status`.
    async fn list_campaigns_in_status(
        &self,
        status: CampaignStatus,
    ) -> Result<Vec<Campaign>, DatabaseError>;

    /// Scheduled campaigns whose `send_at` is at or before `now`.
    async fn list_due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>, DatabaseError>;

    // ── Delivery tracking ───────────────────────────────────────────

    /// Append one dispatch try. Attempts are never updated.
    async fn append_send_attempt(&self, attempt: &SendAttempt) -> Result<(), DatabaseError>;

    /// Attempts of a campaign in insertion order.
    async fn list_send_attempts(&self, campaign_id: Uuid) -> Result<Vec<SendAttempt>, DatabaseError>;

    /// Insert or replace the terminal outcome for (campaign, lead).
    ///
    /// Open and click tracking columns survive a replace.
    async fn upsert_recipient_outcome(&self, outcome: &RecipientOutcome) -> Result<(), DatabaseError>;

    async fn list_recipient_outcomes(
        &self,
        campaign_id: Uuid,
    ) -> Result<Vec<RecipientOutcome>, DatabaseError>;

    /// Mark the outcome behind a tracking token as opened.
    /// Returns the campaign id, or `None` for an unknown token.
    async fn record_open(&self, token: &str, at: DateTime<Utc>) -> Result<Option<Uuid>, DatabaseError>;

    /// Count a click (which implies an open).
    async fn record_click(&self, token: &str, at: DateTime<Utc>) -> Result<Option<Uuid>, DatabaseError>;

    // ── Suppressions ────────────────────────────────────────────────

    /// Insert or replace a suppression entry.
    async fn add_suppression(&self, entry: &SuppressionEntry) -> Result<(), DatabaseError>;

    /// Returns `false` if the pattern was not present.
    async fn remove_suppression(&self, tenant_id: &str, pattern: &str) -> Result<bool, DatabaseError>;

    async fn list_suppressions(&self, tenant_id: &str) -> Result<Vec<SuppressionEntry>, DatabaseError>;

    /// Suppression entries of every tenant, ordered by tenant.
    async fn list_all_suppressions(&self) -> Result<Vec<SuppressionEntry>, DatabaseError>;

    // ── Analytics ───────────────────────────────────────────────────

    async fn analytics(&self, tenant_id: &str) -> Result<AnalyticsSummary, DatabaseError>;
}
