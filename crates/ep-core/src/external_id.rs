//! External ID type representing a domain.object_id pair
//!
//! The external ID is what automations and dashboards reference. It must stay
//! stable across internal identifier migrations: nothing in this crate mutates
//! one except a deliberate naming-pattern change applied through a plan.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for invalid external IDs
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExternalIdError {
    #[error("external_id must contain exactly one '.' separator")]
    InvalidFormat,

    #[error("domain cannot be empty")]
    EmptyDomain,

    #[error("object_id cannot be empty")]
    EmptyObjectId,

    #[error("domain contains invalid characters (lowercase alphanumeric and underscores, no leading/trailing underscore)")]
    InvalidDomainChars,

    #[error("object_id contains invalid characters (lowercase alphanumeric and underscores, no leading/trailing underscore)")]
    InvalidObjectIdChars,
}

/// An automation-visible identifier (e.g. "sensor.kitchen_outlets_power")
///
/// Both parts are lowercase alphanumeric with underscores. Ordered by the
/// full string form so disambiguation output is reproducible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExternalId {
    domain: String,
    object_id: String,
}

impl ExternalId {
    /// Create a new ExternalId from domain and object_id parts
    pub fn new(
        domain: impl Into<String>,
        object_id: impl Into<String>,
    ) -> Result<Self, ExternalIdError> {
        let domain = domain.into();
        let object_id = object_id.into();

        if domain.is_empty() {
            return Err(ExternalIdError::EmptyDomain);
        }
        if object_id.is_empty() {
            return Err(ExternalIdError::EmptyObjectId);
        }
        if !is_valid_part(&domain) {
            return Err(ExternalIdError::InvalidDomainChars);
        }
        if !is_valid_part(&object_id) {
            return Err(ExternalIdError::InvalidObjectIdChars);
        }

        Ok(Self { domain, object_id })
    }

    /// Get the domain part
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Get the object_id part
    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    /// Return a copy with `_{n}` appended to the object_id.
    ///
    /// Used by collision disambiguation; n starts at 2 to match the
    /// host platform's convention.
    pub fn with_suffix(&self, n: u32) -> Self {
        Self {
            domain: self.domain.clone(),
            object_id: format!("{}_{}", self.object_id, n),
        }
    }
}

fn is_valid_part(s: &str) -> bool {
    if s.starts_with('_') || s.ends_with('_') {
        return false;
    }
    s.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl FromStr for ExternalId {
    type Err = ExternalIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 2 {
            return Err(ExternalIdError::InvalidFormat);
        }
        Self::new(parts[0], parts[1])
    }
}

impl TryFrom<String> for ExternalId {
    type Error = ExternalIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ExternalId> for String {
    fn from(id: ExternalId) -> String {
        id.to_string()
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.domain, self.object_id)
    }
}

/// Slugify a display name into a valid object_id fragment.
///
/// Lowercases, maps runs of non-alphanumeric characters to a single
/// underscore, and trims leading/trailing underscores.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}
