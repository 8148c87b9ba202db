//! Suppression filter.
//!
//! A pattern is either an exact address (`bob@example.com`) or a domain
//! (`example.com`, written `@example.com` too). Domain patterns match the
//! domain itself and every subdomain, on label boundaries only:
//! `example.com` matches `x@mail.example.com` but not `x@badexample.com`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

/// Reason recorded for a campaign's own `exclude_domains`.
pub const EXCLUDED_DOMAIN_REASON: &str = "excluded domain";

/// A persisted suppression pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuppressionEntry {
    pub tenant_id: String,
    pub pattern: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl SuppressionEntry {
    pub fn new(
        tenant_id: impl Into<String>,
        pattern: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            pattern: normalize_pattern(pattern),
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }
}

/// Canonical form of a pattern: trimmed, lower-cased, domain patterns
/// without their leading `@`.
pub fn normalize_pattern(pattern: &str) -> String {
    let p = pattern.trim().to_lowercase();
    match p.strip_prefix('@') {
        Some(domain) => domain.to_string(),
        None => p,
    }
}

/// Result of checking one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuppressionDecision {
    Allow,
    Deny { pattern: String, reason: String },
}

impl SuppressionDecision {
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Deny { .. })
    }
}

/// Patterns of one tenant, split into exact addresses and domains.
#[derive(Debug, Clone, Default)]
pub struct SuppressionSet {
    addresses: HashMap<String, String>,
    domains: HashMap<String, String>,
}

impl SuppressionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Domains excluded by a campaign, all with the same reason.
    pub fn from_domains<'a>(domains: impl IntoIterator<Item = &'a String>) -> Self {
        let mut set = Self::new();
        for domain in domains {
            set.insert(domain, EXCLUDED_DOMAIN_REASON);
        }
        set
    }

    pub fn insert(&mut self, pattern: &str, reason: &str) {
        let pattern = normalize_pattern(pattern);
        if pattern.is_empty() {
            return;
        }
        if pattern.contains('@') {
            self.addresses.insert(pattern, reason.to_string());
        } else {
            self.domains.insert(pattern, reason.to_string());
        }
    }

    pub fn remove(&mut self, pattern: &str) -> bool {
        let pattern = normalize_pattern(pattern);
        self.addresses.remove(&pattern).is_some() || self.domains.remove(&pattern).is_some()
    }

    pub fn len(&self) -> usize {
        self.addresses.len() + self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exact address first, then the domain and each parent domain.
    pub fn check(&self, address: &str) -> SuppressionDecision {
        let address = address.trim().to_lowercase();

        if let Some(reason) = self.addresses.get(&address) {
            return SuppressionDecision::Deny {
                pattern: address,
                reason: reason.clone(),
            };
        }

        let Some((_, domain)) = address.rsplit_once('@') else {
            return SuppressionDecision::Allow;
        };

        let mut candidate = domain;
        loop {
            if let Some(reason) = self.domains.get(candidate) {
                return SuppressionDecision::Deny {
                    pattern: candidate.to_string(),
                    reason: reason.clone(),
                };
            }
            match candidate.split_once('.') {
                Some((_, parent)) if !parent.is_empty() => candidate = parent,
                _ => return SuppressionDecision::Allow,
            }
        }
    }
}

/// Shared, read-mostly suppression registry for all tenants.
#[derive(Debug, Default)]
pub struct SuppressionList {
    tenants: RwLock<HashMap<String, SuppressionSet>>,
}

impl SuppressionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every tenant's patterns with `entries` (start-up load).
    pub async fn load_all(&self, entries: &[SuppressionEntry]) {
        let mut tenants: HashMap<String, SuppressionSet> = HashMap::new();
        for entry in entries {
            tenants
                .entry(entry.tenant_id.clone())
                .or_default()
                .insert(&entry.pattern, &entry.reason);
        }
        debug!(tenants = tenants.len(), patterns = entries.len(), "Suppression lists loaded");
        *self.tenants.write().await = tenants;
    }

    pub async fn insert(&self, entry: &SuppressionEntry) {
        self.tenants
            .write()
            .await
            .entry(entry.tenant_id.clone())
            .or_default()
            .insert(&entry.pattern, &entry.reason);
    }

    pub async fn remove(&self, tenant_id: &str, pattern: &str) -> bool {
        match self.tenants.write().await.get_mut(tenant_id) {
            Some(set) => set.remove(pattern),
            None => false,
        }
    }

    pub async fn check(&self, tenant_id: &str, address: &str) -> SuppressionDecision {
        match self.tenants.read().await.get(tenant_id) {
            Some(set) => set.check(address),
            None => SuppressionDecision::Allow,
        }
    }
}
