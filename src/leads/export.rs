//! CSV lead export.
//!
//! Fixed columns first (`name`, `email`, `company`, `category`, `status`,
//! `score`, `created_at`), then one column per attribute key seen in any
//! exported lead, sorted. The output re-imports with [`super::parse_leads`].

use std::collections::BTreeSet;
use std::io::Write;

use chrono::SecondsFormat;
use serde_json::Value;
use tracing::debug;

use super::model::Lead;
use crate::error::ExportError;

const FIXED_COLUMNS: [&str; 7] = [
    "name",
    "email",
    "company",
    "category",
    "status",
    "score",
    "created_at",
];

/// Write `leads` as CSV with a header row.
pub fn write_leads_csv<W: Write>(leads: &[Lead], writer: W) -> Result<(), ExportError> {
    let extra: BTreeSet<&str> = leads
        .iter()
        .flat_map(|l| l.attributes.keys().map(String::as_str))
        .filter(|k| !FIXED_COLUMNS.contains(k))
        .collect();

    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(FIXED_COLUMNS.iter().copied().chain(extra.iter().copied()))?;

    for lead in leads {
        let mut record = vec![
            lead.name.clone(),
            lead.email.clone(),
            lead.company.clone(),
            lead.category.clone(),
            lead.status.to_string(),
            lead.score.to_string(),
            lead.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        ];
        record.extend(extra.iter().map(|key| match lead.attributes.get(*key) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }));
        wtr.write_record(&record)?;
    }
    wtr.flush()?;

    debug!(rows = leads.len(), columns = FIXED_COLUMNS.len() + extra.len(), "Leads exported");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leads::{LeadStatus, parse_leads};

    fn export(leads: &[Lead]) -> String {
        let mut out = Vec::new();
        write_leads_csv(leads, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn header_has_fixed_then_sorted_attribute_columns() {
        let leads = vec![
            Lead::new("t1", "a@x.com", "Alice", "Acme").with_attribute("title", "CTO"),
            Lead::new("t1", "b@y.com", "Bob", "Globex").with_attribute("phone", "555"),
        ];
        let csv = export(&leads);
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "name,email,company,category,status,score,created_at,phone,title"
        );
        let alice = lines.next().unwrap();
        assert!(alice.starts_with("Alice,a@x.com,Acme,General,new,50,"));
        assert!(alice.ends_with(",,CTO"));
    }

    #[test]
    fn values_with_commas_are_quoted() {
        let leads = vec![Lead::new("t1", "a@x.com", "Doe, Jane", "Acme, Inc.")];
        let csv = export(&leads);
        assert!(csv.contains("\"Doe, Jane\",a@x.com,\"Acme, Inc.\""));
    }

    #[test]
    fn export_reimports_with_same_fields() {
        let leads = vec![
            Lead::new("t1", "a@x.com", "Alice", "Acme")
                .with_category("SaaS")
                .with_score(80)
                .with_status(LeadStatus::Contacted)
                .with_attribute("title", "CTO"),
        ];
        let csv = export(&leads);

        let parsed = parse_leads("t2", csv.as_bytes(), b',').unwrap();
        assert!(parsed.skipped.is_empty());
        let back = &parsed.leads[0];
        assert_eq!(back.email, "a@x.com");
        assert_eq!(back.category, "SaaS");
        assert_eq!(back.score, 80);
        assert_eq!(back.status, LeadStatus::Contacted);
        assert_eq!(back.attribute("title"), Some("CTO"));
    }

    #[test]
    fn empty_export_is_header_only() {
        assert_eq!(export(&[]), "name,email,company,category,status,score,created_at\n");
    }
}
