//! Lead types.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default category for leads imported without one.
pub const DEFAULT_CATEGORY: &str = "General";

/// Default score for leads imported without one.
pub const DEFAULT_SCORE: i64 = 50;

/// Lifecycle status of a lead. Leads are never deleted, only flagged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    #[default]
    New,
    Contacted,
    Replied,
    Converted,
    Unsubscribed,
    Bounced,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Contacted => "contacted",
            Self::Replied => "replied",
            Self::Converted => "converted",
            Self::Unsubscribed => "unsubscribed",
            Self::Bounced => "bounced",
        }
    }
}

impl std::fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "new" => Ok(Self::New),
            "contacted" => Ok(Self::Contacted),
            "replied" => Ok(Self::Replied),
            "converted" => Ok(Self::Converted),
            "unsubscribed" => Ok(Self::Unsubscribed),
            "bounced" => Ok(Self::Bounced),
            other => Err(format!("unknown lead status: {other}")),
        }
    }
}

/// A prospective contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub tenant_id: String,
    pub email: String,
    pub name: String,
    pub company: String,
    pub category: String,
    pub status: LeadStatus,
    pub score: i64,
    /// Free-form columns (phone, title, industry, ...).
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    /// Create a new lead with defaults for category, status and score.
    pub fn new(
        tenant_id: impl Into<String>,
        email: impl Into<String>,
        name: impl Into<String>,
        company: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            email: email.into().trim().to_string(),
            name: name.into().trim().to_string(),
            company: company.into().trim().to_string(),
            category: DEFAULT_CATEGORY.to_string(),
            status: LeadStatus::New,
            score: DEFAULT_SCORE,
            attributes: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_score(mut self, score: i64) -> Self {
        self.score = score;
        self
    }

    pub fn with_status(mut self, status: LeadStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes
            .insert(key.into(), serde_json::Value::String(value.into()));
        self
    }

    /// Deduplication key: trimmed, lower-cased address.
    pub fn address_key(&self) -> String {
        normalize_address(&self.email)
    }

    /// Look up an attribute as a string.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }
}

/// Normalise an address for comparisons.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Which leads a campaign targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LeadSelector {
    #[default]
    All,
    Category { category: String },
}

impl LeadSelector {
    pub fn matches(&self, lead: &Lead) -> bool {
        match self {
            Self::All => true,
            Self::Category { category } => lead.category.eq_ignore_ascii_case(category),
        }
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Category { .. } => "category",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_lead_defaults() {
        let lead = Lead::new("t1", "  Alice@Example.com ", "Alice", "Acme");
        assert_eq!(lead.email, "Alice@Example.com");
        assert_eq!(lead.category, DEFAULT_CATEGORY);
        assert_eq!(lead.score, DEFAULT_SCORE);
        assert_eq!(lead.status, LeadStatus::New);
        assert_eq!(lead.address_key(), "alice@example.com");
    }

    #[test]
    fn status_parse_is_case_insensitive() {
        assert_eq!("Contacted".parse::<LeadStatus>().unwrap(), LeadStatus::Contacted);
        assert_eq!(" NEW ".parse::<LeadStatus>().unwrap(), LeadStatus::New);
        assert!("lost".parse::<LeadStatus>().is_err());
    }

    #[test]
    fn selector_category_match() {
        let lead = Lead::new("t1", "a@x.com", "A", "X").with_category("SaaS");
        assert!(LeadSelector::All.matches(&lead));
        assert!(LeadSelector::Category { category: "saas".into() }.matches(&lead));
        assert!(!LeadSelector::Category { category: "retail".into() }.matches(&lead));
    }

    #[test]
    fn selector_serde_tagged() {
        let sel: LeadSelector =
            serde_json::from_str(r#"{"type":"category","category":"SaaS"}"#).unwrap();
        assert_eq!(sel, LeadSelector::Category { category: "SaaS".into() });
        let all: LeadSelector = serde_json::from_str(r#"{"type":"all"}"#).unwrap();
        assert_eq!(all, LeadSelector::All);
    }

    #[test]
    fn attributes_are_strings() {
        let lead = Lead::new("t1", "a@x.com", "A", "X").with_attribute("title", "CTO");
        assert_eq!(lead.attribute("title"), Some("CTO"));
        assert_eq!(lead.attribute("phone"), None);
    }
}
