//! Campaign, send-attempt and outcome types.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorClass;
use crate::leads::LeadSelector;

// ── Campaign ────────────────────────────────────────────────────────

/// Status of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    /// Created, not yet started or scheduled.
    Draft,
    /// Waiting for its `send_at` time.
    Scheduled,
    /// Recipients are being processed.
    Sending,
    /// Cancel requested; in-flight attempts are finishing.
    Cancelling,
    /// Every recipient reached a terminal outcome.
    Completed,
    /// Stopped by the user.
    Cancelled,
    /// Halted by a campaign-fatal transport error.
    Aborted,
}

impl CampaignStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: CampaignStatus) -> bool {
        use CampaignStatus::*;

        matches!(
            (self, target),
            (Draft, Scheduled) | (Draft, Sending) | (Draft, Cancelled) |
            (Scheduled, Sending) | (Scheduled, Cancelled) | (Scheduled, Draft) |
            (Sending, Cancelling) | (Sending, Completed) | (Sending, Aborted) |
            (Cancelling, Cancelled) | (Cancelling, Aborted) |
            // Resumption of recipients left aborted
            (Aborted, Sending) | (Cancelled, Sending)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Aborted)
    }

    /// Check if a run is in progress.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Sending | Self::Cancelling)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Sending => "sending",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "scheduled" => Ok(Self::Scheduled),
            "sending" => Ok(Self::Sending),
            "cancelling" => Ok(Self::Cancelling),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown campaign status: {other}")),
        }
    }
}

/// Maximum sends per interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_messages: u32,
    pub interval_secs: u64,
}

impl RateLimit {
    pub fn per_minute(max_messages: u32) -> Self {
        Self {
            max_messages,
            interval_secs: 60,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Time-of-day range during which sending is allowed.
///
/// `start` is inclusive, `end` exclusive, both in the fixed offset given by
/// `utc_offset_minutes`. When `start > end` the window spans midnight and the
/// part after midnight belongs to the previous day's weekday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub weekdays: Vec<Weekday>,
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl SendWindow {
    /// Monday–Friday between `start` and `end`, UTC.
    pub fn weekdays(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            start,
            end,
            weekdays: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            utc_offset_minutes: 0,
        }
    }

    /// Every day between `start` and `end`, UTC.
    pub fn daily(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            start,
            end,
            weekdays: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
                Weekday::Sat,
                Weekday::Sun,
            ],
            utc_offset_minutes: 0,
        }
    }

    pub fn with_offset_minutes(mut self, minutes: i32) -> Self {
        self.utc_offset_minutes = minutes;
        self
    }

    /// Reject windows that can never open.
    pub fn validate(&self) -> Result<(), String> {
        if self.weekdays.is_empty() {
            return Err("send window has no weekdays".into());
        }
        if self.start == self.end {
            return Err("send window start equals end".into());
        }
        if self.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(format!(
                "send window offset out of range: {} minutes",
                self.utc_offset_minutes
            ));
        }
        Ok(())
    }
}

/// A file attached to every message of a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Sending parameters that do not change the audience or content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignSettings {
    #[serde(default)]
    pub send_window: Option<SendWindow>,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    #[serde(default)]
    pub max_recipients: Option<usize>,
    /// Stop starting new sends this many seconds after the run began.
    #[serde(default)]
    pub stop_after_secs: Option<u64>,
    #[serde(default)]
    pub exclude_domains: Vec<String>,
    #[serde(default)]
    pub utm: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// A batch email send job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    /// Subject template.
    pub subject: String,
    /// HTML body template.
    pub body: String,
    pub selector: LeadSelector,
    #[serde(default)]
    pub settings: CampaignSettings,
    /// Transport profile; `None` uses the default profile.
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    /// `None` sends as soon as started.
    #[serde(default)]
    pub send_at: Option<DateTime<Utc>>,
    pub status: CampaignStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Campaign {
    pub fn new(
        tenant_id: impl Into<String>,
        name: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            subject: subject.into(),
            body: body.into(),
            selector: LeadSelector::All,
            settings: CampaignSettings::default(),
            profile_id: None,
            dry_run: false,
            send_at: None,
            status: CampaignStatus::Draft,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_selector(mut self, selector: LeadSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_settings(mut self, settings: CampaignSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_profile(mut self, profile_id: impl Into<String>) -> Self {
        self.profile_id = Some(profile_id.into());
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn scheduled_at(mut self, send_at: DateTime<Utc>) -> Self {
        self.send_at = Some(send_at);
        self.status = CampaignStatus::Scheduled;
        self
    }

    /// Validate content and settings before the campaign is stored.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("campaign name is empty".into());
        }
        if self.subject.trim().is_empty() {
            return Err("campaign subject is empty".into());
        }
        if self.body.trim().is_empty() {
            return Err("campaign body is empty".into());
        }
        if let Some(window) = &self.settings.send_window {
            window.validate()?;
        }
        if let Some(rate) = &self.settings.rate_limit
            && rate.max_messages == 0
        {
            return Err("rate limit must allow at least one message".into());
        }
        Ok(())
    }
}

// ── Send attempts ───────────────────────────────────────────────────

/// Result of a single dispatch try.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Sent,
    Failed,
    /// Failed, another attempt has been scheduled.
    Retrying,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }
}

impl FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            other => Err(format!("unknown attempt outcome: {other}")),
        }
    }
}

/// One dispatch try. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendAttempt {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub lead_id: Uuid,
    /// 1-based.
    pub attempt: u32,
    pub attempted_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub error_class: Option<ErrorClass>,
    pub error_message: Option<String>,
    pub provider_message_id: Option<String>,
}

// ── Recipient outcomes ──────────────────────────────────────────────

/// Terminal outcome for one recipient of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Sent,
    Failed,
    Suppressed,
    /// Dry run: rendered but never handed to the transport.
    Simulated,
    /// Never attempted because the campaign stopped.
    Aborted,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Suppressed => "suppressed",
            Self::Simulated => "simulated",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "suppressed" => Ok(Self::Suppressed),
            "simulated" => Ok(Self::Simulated),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown outcome: {other}")),
        }
    }
}

/// Terminal record for one (campaign, lead) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientOutcome {
    pub campaign_id: Uuid,
    pub lead_id: Uuid,
    pub email: String,
    pub outcome: Outcome,
    pub attempts: u32,
    pub error_class: Option<ErrorClass>,
    pub detail: Option<String>,
    pub provider_message_id: Option<String>,
    /// Opaque id used by open/click tracking links.
    pub tracking_token: Option<String>,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clicked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub click_count: u32,
}

impl RecipientOutcome {
    pub fn new(campaign_id: Uuid, lead_id: Uuid, email: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            campaign_id,
            lead_id,
            email: email.into(),
            outcome,
            attempts: 0,
            error_class: None,
            detail: None,
            provider_message_id: None,
            tracking_token: None,
            completed_at: Utc::now(),
            opened_at: None,
            clicked_at: None,
            click_count: 0,
        }
    }
}

/// Counts of terminal outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub sent: usize,
    pub failed: usize,
    pub suppressed: usize,
    pub simulated: usize,
    pub aborted: usize,
}

impl OutcomeCounts {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Sent => self.sent += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Suppressed => self.suppressed += 1,
            Outcome::Simulated => self.simulated += 1,
            Outcome::Aborted => self.aborted += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.sent + self.failed + self.suppressed + self.simulated + self.aborted
    }

    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a RecipientOutcome>) -> Self {
        let mut counts = Self::default();
        for o in outcomes {
            counts.record(o.outcome);
        }
        counts
    }
}

/// Summary of one campaign run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignReport {
    pub campaign_id: Uuid,
    pub status: CampaignStatus,
    /// Deduplicated, capped recipient count.
    pub recipients: usize,
    pub counts: OutcomeCounts,
    pub outcomes: Vec<RecipientOutcome>,
    /// Campaign-fatal error that halted the run.
    pub fatal_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions() {
        use CampaignStatus::*;
        assert!(Draft.can_transition_to(Sending));
        assert!(Sending.can_transition_to(Cancelling));
        assert!(Cancelling.can_transition_to(Cancelled));
        assert!(Aborted.can_transition_to(Sending));
        assert!(!Completed.can_transition_to(Sending));
        assert!(!Sending.can_transition_to(Draft));
        assert!(!Cancelling.can_transition_to(Sending));
    }

    #[test]
    fn status_roundtrip_through_str() {
        for s in [
            CampaignStatus::Draft,
            CampaignStatus::Scheduled,
            CampaignStatus::Sending,
            CampaignStatus::Cancelling,
            CampaignStatus::Completed,
            CampaignStatus::Cancelled,
            CampaignStatus::Aborted,
        ] {
            assert_eq!(s.as_str().parse::<CampaignStatus>().unwrap(), s);
        }
    }

    #[test]
    fn outcome_counts_partition() {
        let c = Uuid::new_v4();
        let outcomes = vec![
            RecipientOutcome::new(c, Uuid::new_v4(), "a@x.com", Outcome::Sent),
            RecipientOutcome::new(c, Uuid::new_v4(), "b@x.com", Outcome::Sent),
            RecipientOutcome::new(c, Uuid::new_v4(), "c@x.com", Outcome::Suppressed),
            RecipientOutcome::new(c, Uuid::new_v4(), "d@x.com", Outcome::Aborted),
        ];
        let counts = OutcomeCounts::from_outcomes(&outcomes);
        assert_eq!(counts.sent, 2);
        assert_eq!(counts.suppressed, 1);
        assert_eq!(counts.aborted, 1);
        assert_eq!(counts.total(), outcomes.len());
    }

    #[test]
    fn validate_rejects_empty_content_and_dead_windows() {
        let ok = Campaign::new("t", "Launch", "Hi {name}", "<p>Hello</p>");
        assert!(ok.validate().is_ok());

        let empty = Campaign::new("t", "Launch", " ", "<p>Hello</p>");
        assert!(empty.validate().is_err());

        let t = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let mut dead = SendWindow::daily(t, t);
        let c = ok.clone().with_settings(CampaignSettings {
            send_window: Some(dead.clone()),
            ..Default::default()
        });
        assert!(c.validate().is_err());

        dead.end = NaiveTime::from_hms_opt(17, 0, 0).unwrap();
        dead.weekdays.clear();
        assert!(dead.validate().is_err());
    }

    #[test]
    fn zero_rate_limit_is_invalid() {
        let c = Campaign::new("t", "n", "s", "b").with_settings(CampaignSettings {
            rate_limit: Some(RateLimit::per_minute(0)),
            ..Default::default()
        });
        assert!(c.validate().is_err());
    }

    #[test]
    fn settings_default_from_empty_json() {
        let settings: CampaignSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, CampaignSettings::default());
    }
}
