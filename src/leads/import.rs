//! CSV lead import.
//!
//! Requires a header row containing at least `name`, `email` and `company`
//! (case-insensitive). `category`, `status` and `score` map onto lead fields;
//! every other column is kept as an attribute. Bad rows are skipped and
//! counted; a batch never fails because of row content.

use std::collections::HashSet;
use std::io::Read;

use serde::Serialize;
use tracing::{debug, info};

use super::model::{Lead, LeadStatus, normalize_address};
use crate::error::ImportError;
use crate::store::Database;

const REQUIRED_COLUMNS: [&str; 3] = ["name", "email", "company"];

/// Why a row was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRow {
    pub line: u64,
    pub reason: String,
}

/// Result of parsing a CSV document (before touching the store).
#[derive(Debug, Default)]
pub struct ParsedLeads {
    pub leads: Vec<Lead>,
    pub skipped: Vec<SkippedRow>,
    /// Rows repeating an address already seen earlier in the same file.
    pub duplicates_in_file: usize,
}

/// Result of importing a CSV document into the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub skipped_rows: Vec<SkippedRow>,
}

/// Column positions resolved from the header row.
struct Columns {
    name: usize,
    email: usize,
    company: usize,
    category: Option<usize>,
    status: Option<usize>,
    score: Option<usize>,
    extra: Vec<(usize, String)>,
}

impl Columns {
    fn from_headers(headers: &csv::StringRecord) -> Result<Self, ImportError> {
        let normalized: Vec<String> = headers.iter().map(|h| h.trim().to_lowercase()).collect();
        let find = |name: &str| normalized.iter().position(|h| h == name);

        for required in REQUIRED_COLUMNS {
            if find(required).is_none() {
                return Err(ImportError::MissingColumn(required.to_string()));
            }
        }

        let known = ["name", "email", "company", "category", "status", "score"];
        let extra = normalized
            .iter()
            .enumerate()
            .filter(|(_, h)| !h.is_empty() && !known.contains(&h.as_str()))
            .map(|(i, h)| (i, h.clone()))
            .collect();

        Ok(Self {
            name: find("name").unwrap_or_default(),
            email: find("email").unwrap_or_default(),
            company: find("company").unwrap_or_default(),
            category: find("category"),
            status: find("status"),
            score: find("score"),
            extra,
        })
    }
}

/// Parse a delimited lead table.
pub fn parse_leads<R: Read>(
    tenant_id: &str,
    reader: R,
    delimiter: u8,
) -> Result<ParsedLeads, ImportError> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(false)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr
        .headers()
        .map_err(|e| ImportError::Header(e.to_string()))?
        .clone();
    let columns = Columns::from_headers(&headers)?;

    let mut parsed = ParsedLeads::default();
    let mut seen = HashSet::new();

    for (index, result) in rdr.records().enumerate() {
        // Header is line 1.
        let fallback_line = index as u64 + 2;
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                let line = e.position().map(|p| p.line()).unwrap_or(fallback_line);
                parsed.skipped.push(SkippedRow {
                    line,
                    reason: format!("malformed row: {e}"),
                });
                continue;
            }
        };
        let line = record.position().map(|p| p.line()).unwrap_or(fallback_line);

        match row_to_lead(tenant_id, &record, &columns) {
            Ok(lead) => {
                if seen.insert(lead.address_key()) {
                    parsed.leads.push(lead);
                } else {
                    parsed.duplicates_in_file += 1;
                }
            }
            Err(reason) => parsed.skipped.push(SkippedRow { line, reason }),
        }
    }

    debug!(
        parsed = parsed.leads.len(),
        skipped = parsed.skipped.len(),
        "Parsed lead CSV"
    );
    Ok(parsed)
}

fn row_to_lead(tenant_id: &str, record: &csv::StringRecord, columns: &Columns) -> Result<Lead, String> {
    let field = |i: usize| record.get(i).unwrap_or("").trim();

    let email = field(columns.email);
    if email.is_empty() {
        return Err("missing email".into());
    }
    if !is_valid_address(email) {
        return Err(format!("invalid email: {email}"));
    }

    let name = field(columns.name);
    if name.is_empty() {
        return Err("missing name".into());
    }

    let mut lead = Lead::new(tenant_id, email, name, field(columns.company));

    if let Some(i) = columns.category {
        let category = field(i);
        if !category.is_empty() {
            lead.category = category.to_string();
        }
    }
    if let Some(i) = columns.status {
        let status = field(i);
        if !status.is_empty() {
            lead.status = status.parse::<LeadStatus>()?;
        }
    }
    if let Some(i) = columns.score {
        let score = field(i);
        if !score.is_empty() {
            lead.score = score
                .parse::<i64>()
                .map_err(|_| format!("non-numeric score: {score}"))?;
        }
    }
    for (i, key) in &columns.extra {
        let value = field(*i);
        if !value.is_empty() {
            lead.attributes
                .insert(key.clone(), serde_json::Value::String(value.to_string()));
        }
    }

    Ok(lead)
}

/// Syntactic address check (RFC 5322 addr-spec as understood by lettre).
pub fn is_valid_address(address: &str) -> bool {
    address.trim().parse::<lettre::Address>().is_ok()
}

/// Parse and store a CSV document. Existing tenant addresses count as duplicates.
pub async fn import_leads<R: Read>(
    db: &dyn Database,
    tenant_id: &str,
    reader: R,
    delimiter: u8,
) -> Result<ImportReport, ImportError> {
    let parsed = parse_leads(tenant_id, reader, delimiter)?;

    let mut report = ImportReport {
        duplicates: parsed.duplicates_in_file,
        skipped: parsed.skipped.len(),
        skipped_rows: parsed.skipped,
        ..Default::default()
    };

    for lead in &parsed.leads {
        if db.insert_lead(lead).await? {
            report.imported += 1;
        } else {
            debug!(email = %normalize_address(&lead.email), "Lead already exists, skipping");
            report.duplicates += 1;
        }
    }

    info!(
        tenant = tenant_id,
        imported = report.imported,
        duplicates = report.duplicates,
        skipped = report.skipped,
        "Lead import complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    const CSV: &str = "\
name,email,company,category,score,title
Alice,alice@acme.com,Acme,SaaS,80,CTO
Bob,not-an-email,Globex,,,
Carol,carol@initech.com,Initech,,abc,
Dan,dan@umbrella.com,Umbrella,,,
Eve,ALICE@acme.com,Acme,,,
";

    #[test]
    fn parses_valid_rows_and_counts_bad_ones() {
        let parsed = parse_leads("t1", CSV.as_bytes(), b',').unwrap();
        assert_eq!(parsed.leads.len(), 2);
        assert_eq!(parsed.skipped.len(), 2);
        assert_eq!(parsed.duplicates_in_file, 1);

        let alice = &parsed.leads[0];
        assert_eq!(alice.category, "SaaS");
        assert_eq!(alice.score, 80);
        assert_eq!(alice.attribute("title"), Some("CTO"));

        let dan = &parsed.leads[1];
        assert_eq!(dan.category, "General");
        assert_eq!(dan.score, 50);
    }

    #[test]
    fn skipped_rows_carry_line_numbers() {
        let parsed = parse_leads("t1", CSV.as_bytes(), b',').unwrap();
        assert_eq!(parsed.skipped[0].line, 3);
        assert!(parsed.skipped[0].reason.contains("invalid email"));
        assert_eq!(parsed.skipped[1].line, 4);
        assert!(parsed.skipped[1].reason.contains("non-numeric score"));
    }

    #[test]
    fn missing_required_column_is_fatal() {
        let err = parse_leads("t1", "name,email\nA,a@x.com\n".as_bytes(), b',').unwrap_err();
        assert!(matches!(err, ImportError::MissingColumn(c) if c == "company"));
    }

    #[test]
    fn wrong_field_count_is_skipped() {
        let csv = "name,email,company\nA,a@x.com,X\nB,b@y.com\nC,c@z.com,Z\n";
        let parsed = parse_leads("t1", csv.as_bytes(), b',').unwrap();
        assert_eq!(parsed.leads.len(), 2);
        assert_eq!(parsed.skipped.len(), 1);
    }

    #[test]
    fn headers_are_case_insensitive_and_delimiter_configurable() {
        let csv = "Name;EMAIL;Company\nA;a@x.com;X\n";
        let parsed = parse_leads("t1", csv.as_bytes(), b';').unwrap();
        assert_eq!(parsed.leads.len(), 1);
        assert_eq!(parsed.leads[0].company, "X");
    }

    #[tokio::test]
    async fn import_counts_existing_addresses_as_duplicates() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let first = import_leads(&db, "t1", CSV.as_bytes(), b',').await.unwrap();
        assert_eq!(first.imported, 2);
        assert_eq!(first.duplicates, 1);
        assert_eq!(first.skipped, 2);

        let second = import_leads(&db, "t1", CSV.as_bytes(), b',').await.unwrap();
        assert_eq!(second.imported, 0);
        assert_eq!(second.duplicates, 3);

        // Another tenant may hold the same addresses.
        let other = import_leads(&db, "t2", CSV.as_bytes(), b',').await.unwrap();
        assert_eq!(other.imported, 2);
    }
}
