//! Schema generation detection
//!
//! Pure classification of an installation's stored identifier set by
//! structural markers: dotted-field suffixes, UUID-shaped circuit tokens,
//! and device-prefix segments. No record is mutated; inconsistent mixes are
//! surfaced, never guessed.

use std::collections::BTreeSet;
use std::str::FromStr;

use ep_core::{CanonicalId, CircuitRef, SchemaVersion, ID_PREFIX};

use crate::error::MigrationError;

/// Structural class of a single stored identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum IdClass {
    /// Dotted-field form (`epanel_S1_mainMeterEnergy.producedEnergyWh`)
    Legacy,
    /// Prefixed underscore form with a UUID circuit token
    /// (`epanel_S1_c8f2_instantPowerW`)
    V1VariantA,
    /// Unprefixed underscore form starting at the UUID circuit token
    /// (`c8f2_instantPowerW`)
    V1VariantB,
    /// Canonical snake_case form
    Current,
    /// Matches no known generation
    Unknown,
}

pub(crate) fn classify_id(id: &str) -> IdClass {
    if id.contains('.') {
        // Dotted-field suffix is the strongest legacy marker, but only the
        // device-prefixed form is known; anything else is foreign.
        return if id.starts_with(&format!("{}_", ID_PREFIX)) {
            IdClass::Legacy
        } else {
            IdClass::Unknown
        };
    }

    if CanonicalId::from_str(id).is_ok() {
        return IdClass::Current;
    }

    if let Some(rest) = id.strip_prefix(&format!("{}_", ID_PREFIX)) {
        let mut segments = rest.splitn(3, '_');
        let first = segments.next().unwrap_or("");
        let second = segments.next().unwrap_or("");
        let tail = segments.next().unwrap_or("");

        // A UUID-shaped token in the serial position followed by a
        // non-UUID segment means the serial was dropped from a v1 id
        // (serial repair handles it; the generation is still variant A).
        if CircuitRef::is_uuid_shaped(first) && !CircuitRef::is_uuid_shaped(second) {
            return IdClass::V1VariantA;
        }
        if !first.is_empty()
            && first.chars().all(|c| c.is_ascii_alphanumeric())
            && CircuitRef::is_uuid_shaped(second)
            && !tail.is_empty()
        {
            return IdClass::V1VariantA;
        }
        return IdClass::Unknown;
    }

    // No device prefix: variant B starts straight at the circuit token
    if let Some((token, suffix)) = id.split_once('_') {
        if CircuitRef::is_uuid_shaped(token) && !suffix.is_empty() {
            return IdClass::V1VariantB;
        }
    }
    IdClass::Unknown
}

/// Classify an installation's stored legacy ids into one schema generation.
///
/// An empty set is a fresh install and reports `Current`. Dotted ids may
/// coexist with prefixed UUID-token ids (the dotted generation wrote both
/// grammars); any other mix is ambiguous.
pub fn detect_version(ids: &[String]) -> Result<SchemaVersion, MigrationError> {
    if ids.is_empty() {
        return Ok(SchemaVersion::Current);
    }

    let mut classes = BTreeSet::new();
    for id in ids {
        let class = classify_id(id);
        if class == IdClass::Unknown {
            return Err(MigrationError::AmbiguousVersion(format!(
                "identifier matches no known generation: {}",
                id
            )));
        }
        classes.insert(class);
    }

    let has = |c: IdClass| classes.contains(&c);

    if has(IdClass::Legacy) {
        // The dotted generation's circuit ids are exactly the variant-A shape
        if has(IdClass::V1VariantB) || has(IdClass::Current) {
            return Err(MigrationError::AmbiguousVersion(
                "dotted legacy ids mixed with a later generation".to_string(),
            ));
        }
        return Ok(SchemaVersion::Legacy);
    }

    if classes.len() > 1 {
        return Err(MigrationError::AmbiguousVersion(format!(
            "identifier set mixes {} distinct generations",
            classes.len()
        )));
    }

    match classes.into_iter().next() {
        Some(IdClass::V1VariantA) => Ok(SchemaVersion::V1VariantA),
        Some(IdClass::V1VariantB) => Ok(SchemaVersion::V1VariantB),
        Some(IdClass::Current) => Ok(SchemaVersion::Current),
        _ => unreachable!("legacy and unknown handled above"),
    }
}
