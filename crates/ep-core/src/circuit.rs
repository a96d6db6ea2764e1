//! Circuit references and descriptors
//!
//! A circuit is one monitored branch of the panel. Its reference token is the
//! piece of an identifier that survives renames: a UUID-like token on legacy
//! firmware, a stable tab-derived token on current firmware, or one of the
//! panel-level meters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error for unparseable circuit tokens
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unrecognized circuit token: {0}")]
pub struct CircuitRefError(pub String);

/// Stable reference to one monitored branch of the panel
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CircuitRef {
    /// Whole-panel meter
    MainMeter,
    /// Feed-through (pass-through) meter
    Feedthrough,
    /// Current-generation stable tab-number reference
    Tab(u8),
    /// Legacy UUID-like token, copied verbatim from old identifiers
    Uuid(String),
}

impl CircuitRef {
    /// The identifier segment this reference contributes to a canonical id
    pub fn token(&self) -> String {
        match self {
            CircuitRef::MainMeter => "main_meter".to_string(),
            CircuitRef::Feedthrough => "feedthrough".to_string(),
            CircuitRef::Tab(n) => format!("circuit_{}", n),
            CircuitRef::Uuid(t) => t.clone(),
        }
    }

    /// True for the legacy UUID-shaped form
    pub fn is_legacy_token(&self) -> bool {
        matches!(self, CircuitRef::Uuid(_))
    }

    /// Check whether a segment looks like a legacy UUID-shaped token
    /// (lowercase hex, 4 to 32 chars, as the device emitted them)
    pub fn is_uuid_shaped(s: &str) -> bool {
        (4..=32).contains(&s.len()) && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    }
}

impl FromStr for CircuitRef {
    type Err = CircuitRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main_meter" => return Ok(CircuitRef::MainMeter),
            "feedthrough" => return Ok(CircuitRef::Feedthrough),
            _ => {}
        }
        if let Some(num) = s.strip_prefix("circuit_") {
            return num
                .parse::<u8>()
                .map(CircuitRef::Tab)
                .map_err(|_| CircuitRefError(s.to_string()));
        }
        if Self::is_uuid_shaped(s) {
            return Ok(CircuitRef::Uuid(s.to_string()));
        }
        Err(CircuitRefError(s.to_string()))
    }
}

impl TryFrom<String> for CircuitRef {
    type Error = CircuitRefError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CircuitRef> for String {
    fn from(r: CircuitRef) -> String {
        r.token()
    }
}

impl fmt::Display for CircuitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

/// Circuit metadata as discovered from device state each poll.
///
/// Identity persists across renames; `priority_hint` is copied verbatim from
/// the device and never interpreted (the device's own priority ordering is
/// known to be inconsistent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitDescriptor {
    /// Stable circuit reference
    pub circuit_ref: CircuitRef,
    /// Physical tab numbers backing this circuit (one or two)
    #[serde(default)]
    pub tab_numbers: Vec<u8>,
    /// True when the current display name differs from the device-reported one
    #[serde(default)]
    pub is_user_renamed: bool,
    /// Display name, user-chosen or device-reported
    pub display_name: String,
    /// Opaque pass-through of the device's priority field
    #[serde(default)]
    pub priority_hint: String,
}

impl CircuitDescriptor {
    /// Descriptor for a circuit as the device reported it (no user rename)
    pub fn device_reported(circuit_ref: CircuitRef, display_name: impl Into<String>) -> Self {
        Self {
            circuit_ref,
            tab_numbers: Vec::new(),
            is_user_renamed: false,
            display_name: display_name.into(),
            priority_hint: String::new(),
        }
    }
}
