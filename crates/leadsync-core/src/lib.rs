//! Core domain model for lead expiry reconciliation.

use std::collections::hash_map::{self, Entry};
use std::collections::HashMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "leadsync-core";

/// One row of the transactions table as delivered by the source store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TransactionRecord {
    pub identity_primary: Option<String>,
    pub identity_secondary: Option<String>,
    /// Raw value, possibly carrying a time component.
    pub expiration_date: Option<String>,
}

/// Lead row in the destination store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadRecord {
    pub identity_primary: Option<String>,
    pub identity_secondary: Option<String>,
    pub expiration_date: Option<NaiveDate>,
    pub status: String,
}

/// Merge key for transaction rows: the primary identifier when present, else the email.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum IdentityKey {
    Primary(String),
    Email(String),
}

impl IdentityKey {
    /// Blank strings count as missing. Emails are folded to lowercase.
    pub fn resolve(primary: Option<&str>, secondary: Option<&str>) -> Option<Self> {
        if let Some(id) = non_blank(primary) {
            return Some(Self::Primary(id.to_string()));
        }
        non_blank(secondary).map(|email| Self::Email(normalize_email(email)))
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary(id) => write!(f, "id:{id}"),
            Self::Email(email) => write!(f, "email:{email}"),
        }
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Trimmed value, or `None` when absent or blank.
pub fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Drops the time component (`T` or space separated) and parses the `YYYY-MM-DD` prefix.
pub fn normalize_expiration_date(raw: &str) -> Option<NaiveDate> {
    let date_part = raw
        .trim()
        .split(['T', ' '])
        .next()
        .unwrap_or_default();
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// Why a transaction row was left out of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingExpiration,
    MissingIdentity,
    InvalidExpiration,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::MissingExpiration => "missing expiration date",
            Self::MissingIdentity => "missing both identity fields",
            Self::InvalidExpiration => "unparsable expiration date",
        };
        f.write_str(text)
    }
}

/// Latest known expiration for one identity, with the identity fields of the row that carried it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestExpiration {
    pub expiration_date: NaiveDate,
    pub identity_primary: Option<String>,
    pub identity_secondary: Option<String>,
}

/// Per-run reduction of transaction rows to one latest expiration per identity.
///
/// Each entry holds the maximum expiration date seen for its key. On equal dates the first
/// row ingested is kept; callers must not depend on which of the tied rows survives.
#[derive(Debug, Clone, Default)]
pub struct LatestExpirationIndex {
    entries: HashMap<IdentityKey, LatestExpiration>,
}

impl LatestExpirationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one row into the index, returning the key it resolved to.
    pub fn ingest(&mut self, record: &TransactionRecord) -> Result<IdentityKey, SkipReason> {
        let raw_date =
            non_blank(record.expiration_date.as_deref()).ok_or(SkipReason::MissingExpiration)?;
        let primary = non_blank(record.identity_primary.as_deref());
        let secondary = non_blank(record.identity_secondary.as_deref());
        let key = IdentityKey::resolve(primary, secondary).ok_or(SkipReason::MissingIdentity)?;
        let expiration_date =
            normalize_expiration_date(raw_date).ok_or(SkipReason::InvalidExpiration)?;

        let candidate = LatestExpiration {
            expiration_date,
            identity_primary: primary.map(ToString::to_string),
            identity_secondary: secondary.map(ToString::to_string),
        };
        self.merge(key.clone(), candidate);
        Ok(key)
    }

    /// Keeps `candidate` only if its date is strictly later than the stored one.
    /// Returns whether the candidate was stored.
    pub fn merge(&mut self, key: IdentityKey, candidate: LatestExpiration) -> bool {
        match self.entries.entry(key) {
            Entry::Occupied(mut slot) => {
                if candidate.expiration_date > slot.get().expiration_date {
                    slot.insert(candidate);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(candidate);
                true
            }
        }
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&LatestExpiration> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, IdentityKey, LatestExpiration> {
        self.entries.iter()
    }
}

/// One way of locating lead rows for an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum MatchStrategy {
    ByPrimary(String),
    /// Compared case-insensitively by the store.
    ByEmail(String),
}

impl MatchStrategy {
    /// Strategies to try in order: primary identifier first, then email.
    pub fn ordered_for(entry: &LatestExpiration) -> Vec<MatchStrategy> {
        let mut strategies = Vec::with_capacity(2);
        if let Some(id) = non_blank(entry.identity_primary.as_deref()) {
            strategies.push(Self::ByPrimary(id.to_string()));
        }
        if let Some(email) = non_blank(entry.identity_secondary.as_deref()) {
            strategies.push(Self::ByEmail(email.to_string()));
        }
        strategies
    }
}

impl fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByPrimary(id) => write!(f, "primary id {id}"),
            Self::ByEmail(email) => write!(f, "email {email}"),
        }
    }
}

/// Guarded status change applied to expired leads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseTransition {
    /// Only rows currently in one of these statuses are paused.
    pub from_statuses: Vec<String>,
    pub to_status: String,
}

impl PauseTransition {
    pub fn applies_to(&self, status: &str) -> bool {
        self.from_statuses.iter().any(|s| s == status)
    }
}

impl Default for PauseTransition {
    fn default() -> Self {
        Self {
            from_statuses: vec!["active".to_string(), "in progress".to_string()],
            to_status: "paused".to_string(),
        }
    }
}

impl<'a> IntoIterator for &'a LatestExpirationIndex {
    type Item = (&'a IdentityKey, &'a LatestExpiration);
    type IntoIter = hash_map::Iter<'a, IdentityKey, LatestExpiration>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
