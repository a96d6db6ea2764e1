//! Canonical identifier grammar
//!
//! Canonical ids are the internal stable keys:
//! `epanel_{serial}_{circuitRef}_{snake_case_description}`.
//! The serial and circuit segments are carried verbatim from whatever
//! generation produced them; only the descriptive suffix is ever rewritten
//! (by the migration normalizer, never here).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::circuit::CircuitRef;

/// Identifier prefix for every id this integration owns
pub const ID_PREFIX: &str = "epanel";

/// Errors for malformed canonical identifiers
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("identifier does not start with the '{ID_PREFIX}_' prefix: {0}")]
    MissingPrefix(String),

    #[error("identifier has no serial segment: {0}")]
    MissingSerial(String),

    #[error("serial segment contains invalid characters: {0}")]
    InvalidSerial(String),

    #[error("identifier has no recognizable circuit segment: {0}")]
    UnrecognizedCircuit(String),

    #[error("descriptive suffix is missing or not snake_case: {0}")]
    InvalidSuffix(String),
}

/// A parsed canonical identifier
///
/// Ordering is derived from (serial, circuit, suffix), which matches the
/// string form's sort order closely enough to give the transformer a stable,
/// input-order-independent processing sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanonicalId {
    serial: String,
    circuit: CircuitRef,
    suffix: String,
}

impl CanonicalId {
    /// Assemble a canonical id from validated parts
    pub fn new(
        serial: impl Into<String>,
        circuit: CircuitRef,
        suffix: impl Into<String>,
    ) -> Result<Self, IdentifierError> {
        let serial = serial.into();
        let suffix = suffix.into();

        if serial.is_empty() || !serial.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(IdentifierError::InvalidSerial(serial));
        }
        if !is_snake_suffix(&suffix) {
            return Err(IdentifierError::InvalidSuffix(suffix));
        }

        Ok(Self {
            serial,
            circuit,
            suffix,
        })
    }

    /// Device serial segment, verbatim
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Circuit reference segment
    pub fn circuit(&self) -> &CircuitRef {
        &self.circuit
    }

    /// Descriptive snake_case suffix
    pub fn suffix(&self) -> &str {
        &self.suffix
    }
}

fn is_snake_suffix(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('_')
        && !s.ends_with('_')
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl FromStr for CanonicalId {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(ID_PREFIX)
            .and_then(|r| r.strip_prefix('_'))
            .ok_or_else(|| IdentifierError::MissingPrefix(s.to_string()))?;

        let (serial, rest) = rest
            .split_once('_')
            .ok_or_else(|| IdentifierError::MissingSerial(s.to_string()))?;
        if serial.is_empty() || !serial.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(IdentifierError::InvalidSerial(serial.to_string()));
        }

        // Circuit tokens are matched longest-known-form first; the panel-level
        // meters and tab references contain underscores, legacy UUID tokens
        // never do.
        let (circuit, suffix) = if let Some(suffix) = rest.strip_prefix("main_meter_") {
            (CircuitRef::MainMeter, suffix)
        } else if let Some(suffix) = rest.strip_prefix("feedthrough_") {
            (CircuitRef::Feedthrough, suffix)
        } else if let Some(tail) = rest.strip_prefix("circuit_") {
            let (num, suffix) = tail
                .split_once('_')
                .ok_or_else(|| IdentifierError::InvalidSuffix(s.to_string()))?;
            let n = num
                .parse::<u8>()
                .map_err(|_| IdentifierError::UnrecognizedCircuit(s.to_string()))?;
            (CircuitRef::Tab(n), suffix)
        } else {
            let (token, suffix) = rest
                .split_once('_')
                .ok_or_else(|| IdentifierError::InvalidSuffix(s.to_string()))?;
            if !CircuitRef::is_uuid_shaped(token) {
                return Err(IdentifierError::UnrecognizedCircuit(s.to_string()));
            }
            (CircuitRef::Uuid(token.to_string()), suffix)
        };

        if !is_snake_suffix(suffix) {
            return Err(IdentifierError::InvalidSuffix(s.to_string()));
        }

        Ok(Self {
            serial: serial.to_string(),
            circuit,
            suffix: suffix.to_string(),
        })
    }
}

impl TryFrom<String> for CanonicalId {
    type Error = IdentifierError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CanonicalId> for String {
    fn from(id: CanonicalId) -> String {
        id.to_string()
    }
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            ID_PREFIX,
            self.serial,
            self.circuit.token(),
            self.suffix
        )
    }
}
