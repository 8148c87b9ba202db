//! CSV export of a campaign's per-recipient outcomes.

use std::io::Write;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use super::model::RecipientOutcome;
use crate::error::ExportError;

#[derive(Serialize)]
struct OutcomeRow<'a> {
    email: &'a str,
    outcome: &'static str,
    attempts: u32,
    error_class: Option<&'static str>,
    detail: Option<&'a str>,
    provider_message_id: Option<&'a str>,
    completed_at: String,
    opened_at: Option<String>,
    clicked_at: Option<String>,
    click_count: u32,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl<'a> From<&'a RecipientOutcome> for OutcomeRow<'a> {
    fn from(o: &'a RecipientOutcome) -> Self {
        Self {
            email: &o.email,
            outcome: o.outcome.as_str(),
            attempts: o.attempts,
            error_class: o.error_class.map(|c| c.as_str()),
            detail: o.detail.as_deref(),
            provider_message_id: o.provider_message_id.as_deref(),
            completed_at: timestamp(o.completed_at),
            opened_at: o.opened_at.map(timestamp),
            clicked_at: o.clicked_at.map(timestamp),
            click_count: o.click_count,
        }
    }
}

/// Write one row per recipient, header first. Tracking tokens are left out.
pub fn write_outcomes_csv<W: Write>(outcomes: &[RecipientOutcome], writer: W) -> Result<(), ExportError> {
    let mut wtr = csv::Writer::from_writer(writer);
    if outcomes.is_empty() {
        // serialize() only emits the header alongside the first row
        wtr.write_record([
            "email",
            "outcome",
            "attempts",
            "error_class",
            "detail",
            "provider_message_id",
            "completed_at",
            "opened_at",
            "clicked_at",
            "click_count",
        ])?;
    }
    for outcome in outcomes {
        wtr.serialize(OutcomeRow::from(outcome))?;
    }
    wtr.flush()?;
    Ok(())
}
