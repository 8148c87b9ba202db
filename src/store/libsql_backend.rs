//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! RFC 3339 with microseconds and a `Z` suffix so string comparison orders them.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::campaigns::{
    AttemptOutcome, Campaign, CampaignStatus, Outcome, RecipientOutcome, SendAttempt,
};
use crate::error::{DatabaseError, ErrorClass};
use crate::leads::{Lead, LeadSelector, LeadStatus};
use crate::pipeline::suppression::SuppressionEntry;
use crate::store::migrations;
use crate::store::traits::{AnalyticsSummary, Database};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn count(&self, op: &str, sql: &str, tenant_id: &str) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params![tenant_id])
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let n: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
                Ok(n.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }

    /// Campaign id of the outcome holding `token`.
    async fn campaign_for_token(&self, op: &str, token: &str) -> Result<Option<Uuid>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT campaign_id FROM recipient_outcomes WHERE tracking_token = ?1",
                params![token],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let id: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
                Ok(Some(parse_uuid(&id)?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format for timestamps.
fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s}: {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: &Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_ts(dt)),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize>(op: &str, value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(format!("{op}: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(op: &str, s: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(format!("{op}: {e}")))
}

fn row_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op} row parse: {e}"))
}

const LEAD_COLUMNS: &str =
    "id, tenant_id, email, name, company, category, status, score, attributes, created_at, updated_at";

/// Column order matches LEAD_COLUMNS.
fn row_to_lead(row: &libsql::Row) -> Result<Lead, DatabaseError> {
    let err = row_err("lead");
    let id: String = row.get(0).map_err(&err)?;
    let status: String = row.get(6).map_err(&err)?;
    let attributes: String = row.get(8).map_err(&err)?;
    let created: String = row.get(9).map_err(&err)?;
    let updated: String = row.get(10).map_err(&err)?;

    Ok(Lead {
        id: parse_uuid(&id)?,
        tenant_id: row.get(1).map_err(&err)?,
        email: row.get(2).map_err(&err)?,
        name: row.get(3).map_err(&err)?,
        company: row.get(4).map_err(&err)?,
        category: row.get(5).map_err(&err)?,
        status: status.parse::<LeadStatus>().unwrap_or_default(),
        score: row.get(7).map_err(&err)?,
        attributes: from_json("lead attributes", &attributes)?,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

const CAMPAIGN_COLUMNS: &str = "id, tenant_id, name, subject, body, selector, settings, profile_id, dry_run, send_at, status, created_at, updated_at, started_at, finished_at";

/// Column order matches CAMPAIGN_COLUMNS.
fn row_to_campaign(row: &libsql::Row) -> Result<Campaign, DatabaseError> {
    let err = row_err("campaign");
    let id: String = row.get(0).map_err(&err)?;
    let selector: String = row.get(5).map_err(&err)?;
    let settings: String = row.get(6).map_err(&err)?;
    let dry_run: i64 = row.get(8).map_err(&err)?;
    let send_at: Option<String> = row.get(9).ok();
    let status: String = row.get(10).map_err(&err)?;
    let created: String = row.get(11).map_err(&err)?;
    let updated: String = row.get(12).map_err(&err)?;
    let started: Option<String> = row.get(13).ok();
    let finished: Option<String> = row.get(14).ok();

    Ok(Campaign {
        id: parse_uuid(&id)?,
        tenant_id: row.get(1).map_err(&err)?,
        name: row.get(2).map_err(&err)?,
        subject: row.get(3).map_err(&err)?,
        body: row.get(4).map_err(&err)?,
        selector: from_json("campaign selector", &selector)?,
        settings: from_json("campaign settings", &settings)?,
        profile_id: row.get(7).ok(),
        dry_run: dry_run != 0,
        send_at: parse_optional_datetime(&send_at),
        status: status
            .parse::<CampaignStatus>()
            .map_err(DatabaseError::Serialization)?,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
        started_at: parse_optional_datetime(&started),
        finished_at: parse_optional_datetime(&finished),
    })
}

const ATTEMPT_COLUMNS: &str = "id, campaign_id, lead_id, attempt, attempted_at, outcome, error_class, error_message, provider_message_id";

fn row_to_attempt(row: &libsql::Row) -> Result<SendAttempt, DatabaseError> {
    let err = row_err("send_attempt");
    let id: String = row.get(0).map_err(&err)?;
    let campaign_id: String = row.get(1).map_err(&err)?;
    let lead_id: String = row.get(2).map_err(&err)?;
    let attempt: i64 = row.get(3).map_err(&err)?;
    let attempted: String = row.get(4).map_err(&err)?;
    let outcome: String = row.get(5).map_err(&err)?;
    let error_class: Option<String> = row.get(6).ok();

    Ok(SendAttempt {
        id: parse_uuid(&id)?,
        campaign_id: parse_uuid(&campaign_id)?,
        lead_id: parse_uuid(&lead_id)?,
        attempt: attempt.max(0) as u32,
        attempted_at: parse_datetime(&attempted),
        outcome: outcome
            .parse::<AttemptOutcome>()
            .map_err(DatabaseError::Serialization)?,
        error_class: error_class.and_then(|c| c.parse::<ErrorClass>().ok()),
        error_message: row.get(7).ok(),
        provider_message_id: row.get(8).ok(),
    })
}

const OUTCOME_COLUMNS: &str = "campaign_id, lead_id, email, outcome, attempts, error_class, detail, provider_message_id, tracking_token, completed_at, opened_at, clicked_at, click_count";

fn row_to_outcome(row: &libsql::Row) -> Result<RecipientOutcome, DatabaseError> {
    let err = row_err("recipient_outcome");
    let campaign_id: String = row.get(0).map_err(&err)?;
    let lead_id: String = row.get(1).map_err(&err)?;
    let outcome: String = row.get(3).map_err(&err)?;
    let attempts: i64 = row.get(4).map_err(&err)?;
    let error_class: Option<String> = row.get(5).ok();
    let completed: String = row.get(9).map_err(&err)?;
    let opened: Option<String> = row.get(10).ok();
    let clicked: Option<String> = row.get(11).ok();
    let click_count: i64 = row.get(12).map_err(&err)?;

    Ok(RecipientOutcome {
        campaign_id: parse_uuid(&campaign_id)?,
        lead_id: parse_uuid(&lead_id)?,
        email: row.get(2).map_err(&err)?,
        outcome: outcome.parse::<Outcome>().map_err(DatabaseError::Serialization)?,
        attempts: attempts.max(0) as u32,
        error_class: error_class.and_then(|c| c.parse::<ErrorClass>().ok()),
        detail: row.get(6).ok(),
        provider_message_id: row.get(7).ok(),
        tracking_token: row.get(8).ok(),
        completed_at: parse_datetime(&completed),
        opened_at: parse_optional_datetime(&opened),
        clicked_at: parse_optional_datetime(&clicked),
        click_count: click_count.max(0) as u32,
    })
}

fn row_to_suppression(row: &libsql::Row) -> Result<SuppressionEntry, DatabaseError> {
    let err = row_err("suppression");
    let created: String = row.get(3).map_err(&err)?;
    Ok(SuppressionEntry {
        tenant_id: row.get(0).map_err(&err)?,
        pattern: row.get(1).map_err(&err)?,
        reason: row.get(2).map_err(&err)?,
        created_at: parse_datetime(&created),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &Lead) -> Result<bool, DatabaseError> {
        let attributes = to_json("insert_lead", &lead.attributes)?;
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO leads (id, tenant_id, email, email_key, name, company, category, status, score, attributes, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    lead.id.to_string(),
                    lead.tenant_id.clone(),
                    lead.email.clone(),
                    lead.address_key(),
                    lead.name.clone(),
                    lead.company.clone(),
                    lead.category.clone(),
                    lead.status.as_str(),
                    lead.score,
                    attributes,
                    fmt_ts(&lead.created_at),
                    fmt_ts(&lead.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_lead: {e}")))?;

        Ok(inserted > 0)
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_lead: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_lead(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_lead: {e}"))),
        }
    }

    async fn list_leads(
        &self,
        tenant_id: &str,
        selector: &LeadSelector,
    ) -> Result<Vec<Lead>, DatabaseError> {
        let conn = self.conn();
        let mut rows = match selector {
            LeadSelector::All => conn
                .query(
                    &format!(
                        "SELECT {LEAD_COLUMNS} FROM leads WHERE tenant_id = ?1 ORDER BY created_at ASC, rowid ASC"
                    ),
                    params![tenant_id],
                )
                .await,
            LeadSelector::Category { category } => conn
                .query(
                    &format!(
                        "SELECT {LEAD_COLUMNS} FROM leads WHERE tenant_id = ?1 AND lower(category) = lower(?2) ORDER BY created_at ASC, rowid ASC"
                    ),
                    params![tenant_id, category.clone()],
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("list_leads: {e}")))?;

        let mut leads = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            leads.push(row_to_lead(&row)?);
        }
        Ok(leads)
    }

    async fn update_lead_status(&self, id: Uuid, status: LeadStatus) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE leads SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), fmt_ts(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_lead_status: {e}")))?;

        debug!(lead_id = %id, status = %status, "Lead status updated");
        Ok(())
    }

    // ── Campaigns ───────────────────────────────────────────────────

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), DatabaseError> {
        let selector = to_json("insert_campaign", &campaign.selector)?;
        let settings = to_json("insert_campaign", &campaign.settings)?;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO campaigns ({CAMPAIGN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    campaign.id.to_string(),
                    campaign.tenant_id.clone(),
                    campaign.name.clone(),
                    campaign.subject.clone(),
                    campaign.body.clone(),
                    selector,
                    settings,
                    opt_text(campaign.profile_id.as_deref()),
                    campaign.dry_run as i64,
                    opt_ts(&campaign.send_at),
                    campaign.status.as_str(),
                    fmt_ts(&campaign.created_at),
                    fmt_ts(&campaign.updated_at),
                    opt_ts(&campaign.started_at),
                    opt_ts(&campaign.finished_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_campaign: {e}")))?;

        debug!(campaign_id = %campaign.id, status = %campaign.status, "Campaign inserted");
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_campaign: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_campaign(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_campaign: {e}"))),
        }
    }

    async fn list_campaigns(&self, tenant_id: &str) -> Result<Vec<Campaign>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE tenant_id = ?1 ORDER BY created_at DESC"
                ),
                params![tenant_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_campaigns: {e}")))?;

        let mut campaigns = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            campaigns.push(row_to_campaign(&row)?);
        }
        Ok(campaigns)
    }

    async fn transition_campaign(
        &self,
        id: Uuid,
        expected: CampaignStatus,
        target: CampaignStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let at = fmt_ts(&at);
        let sql = if target == CampaignStatus::Sending {
            "UPDATE campaigns SET status = ?1, updated_at = ?2, started_at = ?2, finished_at = NULL WHERE id = ?3 AND status = ?4"
        } else if target.is_terminal() {
            "UPDATE campaigns SET status = ?1, updated_at = ?2, finished_at = ?2 WHERE id = ?3 AND status = ?4"
        } else {
            "UPDATE campaigns SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4"
        };

        let changed = self
            .conn()
            .execute(
                sql,
                params![target.as_str(), at, id.to_string(), expected.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("transition_campaign: {e}")))?;

        debug!(campaign_id = %id, from = %expected, to = %target, changed, "Campaign transition");
        Ok(changed > 0)
    }

    async fn list_campaigns_in_status(
        &self,
        status: CampaignStatus,
    ) -> Result<Vec<Campaign>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE status = ?1 ORDER BY created_at ASC"
                ),
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_campaigns_in_status: {e}")))?;

        let mut campaigns = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            campaigns.push(row_to_campaign(&row)?);
        }
        Ok(campaigns)
    }

    async fn list_due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE status = 'scheduled' AND send_at IS NOT NULL AND send_at <= ?1 ORDER BY send_at ASC"
                ),
                params![fmt_ts(&now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_due_campaigns: {e}")))?;

        let mut campaigns = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            campaigns.push(row_to_campaign(&row)?);
        }
        Ok(campaigns)
    }

    // ── Delivery tracking ───────────────────────────────────────────

    async fn append_send_attempt(&self, attempt: &SendAttempt) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO send_attempts ({ATTEMPT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    attempt.id.to_string(),
                    attempt.campaign_id.to_string(),
                    attempt.lead_id.to_string(),
                    attempt.attempt as i64,
                    fmt_ts(&attempt.attempted_at),
                    attempt.outcome.as_str(),
                    opt_text(attempt.error_class.map(|c| c.as_str())),
                    opt_text(attempt.error_message.as_deref()),
                    opt_text(attempt.provider_message_id.as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_send_attempt: {e}")))?;
        Ok(())
    }

    async fn list_send_attempts(&self, campaign_id: Uuid) -> Result<Vec<SendAttempt>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM send_attempts WHERE campaign_id = ?1 ORDER BY rowid ASC"
                ),
                params![campaign_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_send_attempts: {e}")))?;

        let mut attempts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            attempts.push(row_to_attempt(&row)?);
        }
        Ok(attempts)
    }

    async fn upsert_recipient_outcome(&self, outcome: &RecipientOutcome) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO recipient_outcomes (campaign_id, lead_id, email, outcome, attempts, error_class, detail, provider_message_id, tracking_token, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(campaign_id, lead_id) DO UPDATE SET
                    email = excluded.email,
                    outcome = excluded.outcome,
                    attempts = excluded.attempts,
                    error_class = excluded.error_class,
                    detail = excluded.detail,
                    provider_message_id = excluded.provider_message_id,
                    tracking_token = excluded.tracking_token,
                    completed_at = excluded.completed_at",
                params![
                    outcome.campaign_id.to_string(),
                    outcome.lead_id.to_string(),
                    outcome.email.clone(),
                    outcome.outcome.as_str(),
                    outcome.attempts as i64,
                    opt_text(outcome.error_class.map(|c| c.as_str())),
                    opt_text(outcome.detail.as_deref()),
                    opt_text(outcome.provider_message_id.as_deref()),
                    opt_text(outcome.tracking_token.as_deref()),
                    fmt_ts(&outcome.completed_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_recipient_outcome: {e}")))?;
        Ok(())
    }

    async fn list_recipient_outcomes(
        &self,
        campaign_id: Uuid,
    ) -> Result<Vec<RecipientOutcome>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {OUTCOME_COLUMNS} FROM recipient_outcomes WHERE campaign_id = ?1 ORDER BY completed_at ASC, rowid ASC"
                ),
                params![campaign_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_recipient_outcomes: {e}")))?;

        let mut outcomes = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            outcomes.push(row_to_outcome(&row)?);
        }
        Ok(outcomes)
    }

    async fn record_open(&self, token: &str, at: DateTime<Utc>) -> Result<Option<Uuid>, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE recipient_outcomes SET opened_at = COALESCE(opened_at, ?2) WHERE tracking_token = ?1",
                params![token, fmt_ts(&at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_open: {e}")))?;

        if changed == 0 {
            return Ok(None);
        }
        self.campaign_for_token("record_open", token).await
    }

    async fn record_click(&self, token: &str, at: DateTime<Utc>) -> Result<Option<Uuid>, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE recipient_outcomes SET
                    opened_at = COALESCE(opened_at, ?2),
                    clicked_at = COALESCE(clicked_at, ?2),
                    click_count = click_count + 1
                 WHERE tracking_token = ?1",
                params![token, fmt_ts(&at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_click: {e}")))?;

        if changed == 0 {
            return Ok(None);
        }
        self.campaign_for_token("record_click", token).await
    }

    // ── Suppressions ────────────────────────────────────────────────

    async fn add_suppression(&self, entry: &SuppressionEntry) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO suppressions (tenant_id, pattern, reason, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(tenant_id, pattern) DO UPDATE SET reason = excluded.reason",
                params![
                    entry.tenant_id.clone(),
                    entry.pattern.clone(),
                    entry.reason.clone(),
                    fmt_ts(&entry.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_suppression: {e}")))?;
        Ok(())
    }

    async fn remove_suppression(&self, tenant_id: &str, pattern: &str) -> Result<bool, DatabaseError> {
        let removed = self
            .conn()
            .execute(
                "DELETE FROM suppressions WHERE tenant_id = ?1 AND pattern = ?2",
                params![tenant_id, pattern],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("remove_suppression: {e}")))?;
        Ok(removed > 0)
    }

    async fn list_suppressions(&self, tenant_id: &str) -> Result<Vec<SuppressionEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT tenant_id, pattern, reason, created_at FROM suppressions WHERE tenant_id = ?1 ORDER BY pattern ASC",
                params![tenant_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_suppressions: {e}")))?;

        let mut entries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            entries.push(row_to_suppression(&row)?);
        }
        Ok(entries)
    }

    async fn list_all_suppressions(&self) -> Result<Vec<SuppressionEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT tenant_id, pattern, reason, created_at FROM suppressions ORDER BY tenant_id ASC, pattern ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_all_suppressions: {e}")))?;

        let mut entries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            entries.push(row_to_suppression(&row)?);
        }
        Ok(entries)
    }

    // ── Analytics ───────────────────────────────────────────────────

    async fn analytics(&self, tenant_id: &str) -> Result<AnalyticsSummary, DatabaseError> {
        const OUTCOMES: &str = "FROM recipient_outcomes o JOIN campaigns c ON c.id = o.campaign_id WHERE c.tenant_id = ?1";

        Ok(AnalyticsSummary {
            lead_count: self
                .count("analytics leads", "SELECT COUNT(*) FROM leads WHERE tenant_id = ?1", tenant_id)
                .await?,
            campaign_count: self
                .count(
                    "analytics campaigns",
                    "SELECT COUNT(*) FROM campaigns WHERE tenant_id = ?1",
                    tenant_id,
                )
                .await?,
            total_emails: self
                .count("analytics total", &format!("SELECT COUNT(*) {OUTCOMES}"), tenant_id)
                .await?,
            sent: self
                .count(
                    "analytics sent",
                    &format!("SELECT COUNT(*) {OUTCOMES} AND o.outcome = 'sent'"),
                    tenant_id,
                )
                .await?,
            opened: self
                .count(
                    "analytics opened",
                    &format!("SELECT COUNT(*) {OUTCOMES} AND o.opened_at IS NOT NULL"),
                    tenant_id,
                )
                .await?,
            clicked: self
                .count(
                    "analytics clicked",
                    &format!("SELECT COUNT(*) {OUTCOMES} AND o.clicked_at IS NOT NULL"),
                    tenant_id,
                )
                .await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::campaigns::CampaignSettings;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_campaign(tenant: &str) -> Campaign {
        Campaign::new(tenant, "Launch", "Hello {name}", "<p>Hi {name}</p>")
    }

    fn make_outcome(campaign: &Campaign, lead: &Lead, outcome: Outcome, token: &str) -> RecipientOutcome {
        let mut o = RecipientOutcome::new(campaign.id, lead.id, lead.email.clone(), outcome);
        o.attempts = 1;
        o.tracking_token = Some(token.to_string());
        o
    }

    // ── Lead tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_lead_dedupes_by_normalized_address() {
        let db = test_db().await;
        let a = Lead::new("t1", "Alice@Acme.com", "Alice", "Acme");
        let b = Lead::new("t1", "  alice@acme.COM ", "Alice B", "Acme");
        assert!(db.insert_lead(&a).await.unwrap());
        assert!(!db.insert_lead(&b).await.unwrap());

        let c = Lead::new("t2", "alice@acme.com", "Alice", "Acme");
        assert!(db.insert_lead(&c).await.unwrap());
    }

    #[tokio::test]
    async fn lead_roundtrip_keeps_attributes() {
        let db = test_db().await;
        let lead = Lead::new("t1", "bob@globex.com", "Bob", "Globex")
            .with_category("Retail")
            .with_score(72)
            .with_attribute("title", "CFO");
        db.insert_lead(&lead).await.unwrap();

        let fetched = db.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(fetched.email, "bob@globex.com");
        assert_eq!(fetched.category, "Retail");
        assert_eq!(fetched.score, 72);
        assert_eq!(fetched.attribute("title"), Some("CFO"));
        assert!(db.get_lead(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_leads_filters_by_category() {
        let db = test_db().await;
        db.insert_lead(&Lead::new("t1", "a@x.com", "A", "X").with_category("SaaS"))
            .await
            .unwrap();
        db.insert_lead(&Lead::new("t1", "b@x.com", "B", "X").with_category("Retail"))
            .await
            .unwrap();
        db.insert_lead(&Lead::new("t2", "c@x.com", "C", "X").with_category("SaaS"))
            .await
            .unwrap();

        let all = db.list_leads("t1", &LeadSelector::All).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].email, "a@x.com");

        let saas = db
            .list_leads("t1", &LeadSelector::Category { category: "saas".into() })
            .await
            .unwrap();
        assert_eq!(saas.len(), 1);
        assert_eq!(saas[0].email, "a@x.com");
    }

    #[tokio::test]
    async fn update_lead_status_persists() {
        let db = test_db().await;
        let lead = Lead::new("t1", "a@x.com", "A", "X");
        db.insert_lead(&lead).await.unwrap();
        db.update_lead_status(lead.id, LeadStatus::Bounced).await.unwrap();
        let fetched = db.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, LeadStatus::Bounced);
    }

    // ── Campaign tests ──────────────────────────────────────────────

    #[tokio::test]
    async fn campaign_roundtrip_keeps_settings() {
        let db = test_db().await;
        let mut settings = CampaignSettings::default();
        settings.max_recipients = Some(10);
        settings.exclude_domains = vec!["competitor.com".into()];
        let campaign = make_campaign("t1")
            .with_selector(LeadSelector::Category { category: "SaaS".into() })
            .with_settings(settings.clone())
            .with_profile("primary")
            .with_dry_run(true);
        db.insert_campaign(&campaign).await.unwrap();

        let fetched = db.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(fetched.settings, settings);
        assert_eq!(fetched.profile_id.as_deref(), Some("primary"));
        assert!(fetched.dry_run);
        assert_eq!(fetched.status, CampaignStatus::Draft);
        assert!(fetched.send_at.is_none());
    }

    #[tokio::test]
    async fn transition_is_conditional_and_stamps_times() {
        let db = test_db().await;
        let campaign = make_campaign("t1");
        db.insert_campaign(&campaign).await.unwrap();
        let now = Utc::now();

        assert!(
            db.transition_campaign(campaign.id, CampaignStatus::Draft, CampaignStatus::Sending, now)
                .await
                .unwrap()
        );
        // Second start loses the race.
        assert!(
            !db.transition_campaign(campaign.id, CampaignStatus::Draft, CampaignStatus::Sending, now)
                .await
                .unwrap()
        );

        let sending = db.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(sending.status, CampaignStatus::Sending);
        assert!(sending.started_at.is_some());
        assert!(sending.finished_at.is_none());

        db.transition_campaign(campaign.id, CampaignStatus::Sending, CampaignStatus::Completed, now)
            .await
            .unwrap();
        let done = db.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(done.status, CampaignStatus::Completed);
        assert!(done.finished_at.is_some());
    }

    #[tokio::test]
    async fn due_campaigns_only_scheduled_in_the_past() {
        let db = test_db().await;
        let now = Utc::now();
        let due = make_campaign("t1").scheduled_at(now - Duration::minutes(5));
        let later = make_campaign("t1").scheduled_at(now + Duration::hours(1));
        let draft = make_campaign("t1");
        for c in [&due, &later, &draft] {
            db.insert_campaign(c).await.unwrap();
        }

        let found = db.list_due_campaigns(now).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
    }

    #[tokio::test]
    async fn campaigns_in_status_span_tenants() {
        let db = test_db().await;
        let a = make_campaign("t1");
        let b = make_campaign("t2");
        let idle = make_campaign("t2");
        for c in [&a, &b, &idle] {
            db.insert_campaign(c).await.unwrap();
        }
        let now = Utc::now();
        for id in [a.id, b.id] {
            db.transition_campaign(id, CampaignStatus::Draft, CampaignStatus::Sending, now)
                .await
                .unwrap();
        }

        let sending = db.list_campaigns_in_status(CampaignStatus::Sending).await.unwrap();
        let mut ids: Vec<Uuid> = sending.iter().map(|c| c.id).collect();
        ids.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(ids, expected);
        assert_eq!(db.list_campaigns_in_status(CampaignStatus::Draft).await.unwrap().len(), 1);
    }

    // ── Delivery tracking tests ─────────────────────────────────────

    #[tokio::test]
    async fn send_attempts_append_in_order() {
        let db = test_db().await;
        let campaign = make_campaign("t1");
        db.insert_campaign(&campaign).await.unwrap();
        let lead_id = Uuid::new_v4();

        for (n, outcome, class) in [
            (1, AttemptOutcome::Retrying, Some(ErrorClass::TransientRejection)),
            (2, AttemptOutcome::Sent, None),
        ] {
            db.append_send_attempt(&SendAttempt {
                id: Uuid::new_v4(),
                campaign_id: campaign.id,
                lead_id,
                attempt: n,
                attempted_at: Utc::now(),
                outcome,
                error_class: class,
                error_message: class.map(|_| "451 later".to_string()),
                provider_message_id: None,
            })
            .await
            .unwrap();
        }

        let attempts = db.list_send_attempts(campaign.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].attempt, 1);
        assert_eq!(attempts[0].error_class, Some(ErrorClass::TransientRejection));
        assert_eq!(attempts[1].outcome, AttemptOutcome::Sent);
        assert!(attempts[1].error_message.is_none());
    }

    #[tokio::test]
    async fn upsert_outcome_keeps_tracking_columns() {
        let db = test_db().await;
        let campaign = make_campaign("t1");
        db.insert_campaign(&campaign).await.unwrap();
        let lead = Lead::new("t1", "a@x.com", "A", "X");

        db.upsert_recipient_outcome(&make_outcome(&campaign, &lead, Outcome::Sent, "tok-1"))
            .await
            .unwrap();
        assert_eq!(db.record_open("tok-1", Utc::now()).await.unwrap(), Some(campaign.id));

        let mut replaced = make_outcome(&campaign, &lead, Outcome::Sent, "tok-1");
        replaced.attempts = 2;
        db.upsert_recipient_outcome(&replaced).await.unwrap();

        let outcomes = db.list_recipient_outcomes(campaign.id).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].attempts, 2);
        assert!(outcomes[0].opened_at.is_some());
    }

    #[tokio::test]
    async fn clicks_count_and_imply_open() {
        let db = test_db().await;
        let campaign = make_campaign("t1");
        db.insert_campaign(&campaign).await.unwrap();
        let lead = Lead::new("t1", "a@x.com", "A", "X");
        db.upsert_recipient_outcome(&make_outcome(&campaign, &lead, Outcome::Sent, "tok-2"))
            .await
            .unwrap();

        db.record_click("tok-2", Utc::now()).await.unwrap();
        db.record_click("tok-2", Utc::now()).await.unwrap();
        assert!(db.record_click("nope", Utc::now()).await.unwrap().is_none());

        let o = &db.list_recipient_outcomes(campaign.id).await.unwrap()[0];
        assert_eq!(o.click_count, 2);
        assert!(o.opened_at.is_some());
        assert!(o.clicked_at.is_some());
    }

    // ── Suppression tests ───────────────────────────────────────────

    #[tokio::test]
    async fn suppressions_add_list_remove() {
        let db = test_db().await;
        db.add_suppression(&SuppressionEntry::new("t1", "Bob@X.com", "unsubscribed"))
            .await
            .unwrap();
        db.add_suppression(&SuppressionEntry::new("t1", "@spam.example", "blocked"))
            .await
            .unwrap();
        // Re-adding replaces the reason.
        db.add_suppression(&SuppressionEntry::new("t1", "bob@x.com", "complaint"))
            .await
            .unwrap();

        let entries = db.list_suppressions("t1").await.unwrap();
        assert_eq!(entries.len(), 2);
        let bob = entries.iter().find(|e| e.pattern == "bob@x.com").unwrap();
        assert_eq!(bob.reason, "complaint");

        assert!(db.remove_suppression("t1", "bob@x.com").await.unwrap());
        assert!(!db.remove_suppression("t1", "bob@x.com").await.unwrap());
        assert!(db.list_suppressions("t2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn all_suppressions_cover_every_tenant() {
        let db = test_db().await;
        db.add_suppression(&SuppressionEntry::new("t2", "b@y.com", "complaint"))
            .await
            .unwrap();
        db.add_suppression(&SuppressionEntry::new("t1", "@spam.example", "blocked"))
            .await
            .unwrap();

        let all = db.list_all_suppressions().await.unwrap();
        let keys: Vec<(&str, &str)> = all
            .iter()
            .map(|e| (e.tenant_id.as_str(), e.pattern.as_str()))
            .collect();
        assert_eq!(keys, vec![("t1", "spam.example"), ("t2", "b@y.com")]);
    }

    // ── Analytics ───────────────────────────────────────────────────

    #[tokio::test]
    async fn analytics_counts_per_tenant() {
        let db = test_db().await;
        let a = Lead::new("t1", "a@x.com", "A", "X");
        let b = Lead::new("t1", "b@x.com", "B", "X");
        db.insert_lead(&a).await.unwrap();
        db.insert_lead(&b).await.unwrap();
        let campaign = make_campaign("t1");
        db.insert_campaign(&campaign).await.unwrap();
        db.insert_campaign(&make_campaign("t2")).await.unwrap();

        db.upsert_recipient_outcome(&make_outcome(&campaign, &a, Outcome::Sent, "ta"))
            .await
            .unwrap();
        db.upsert_recipient_outcome(&make_outcome(&campaign, &b, Outcome::Failed, "tb"))
            .await
            .unwrap();
        db.record_click("ta", Utc::now()).await.unwrap();

        let summary = db.analytics("t1").await.unwrap();
        assert_eq!(
            summary,
            AnalyticsSummary {
                lead_count: 2,
                campaign_count: 1,
                total_emails: 2,
                sent: 1,
                opened: 1,
                clicked: 1,
            }
        );
    }

    #[tokio::test]
    async fn local_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("leadai.db");

        let lead = Lead::new("t1", "ann@alpha.example", "Ann", "Alpha");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            assert!(db.insert_lead(&lead).await.unwrap());
        }

        // Reopening re-runs migrations without touching existing rows.
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let fetched = db.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(fetched.email, "ann@alpha.example");
        assert!(!db.insert_lead(&lead).await.unwrap());
    }
}
