//! Legacy identifier normalization
//!
//! Maps one legacy identifier string to its canonical form. Serial and
//! circuit-reference segments are copied verbatim; only the descriptive
//! suffix is rewritten, through static lookup tables, never heuristics.
//! `normalize` is idempotent and total over the known legacy grammars; an
//! unknown suffix is an error, not a pass-through.
//!
//! Normalization never touches external identifiers.

use std::collections::BTreeSet;
use std::str::FromStr;

use ep_core::{CanonicalId, CircuitRef, ID_PREFIX};

use crate::error::MigrationError;

/// Dotted metric groups and the panel-level circuit they describe
fn metric_group_circuit(group: &str) -> Option<CircuitRef> {
    match group {
        "mainMeterEnergy" => Some(CircuitRef::MainMeter),
        "feedthroughEnergy" => Some(CircuitRef::Feedthrough),
        _ => None,
    }
}

/// Dotted field names to canonical suffixes
const DOTTED_FIELDS: &[(&str, &str)] = &[
    ("producedEnergyWh", "produced_energy"),
    ("consumedEnergyWh", "consumed_energy"),
    ("importedEnergyWh", "imported_energy"),
    ("exportedEnergyWh", "exported_energy"),
];

/// Underscore-form verbNoun suffixes to canonical suffixes
const VERB_NOUN_SUFFIXES: &[(&str, &str)] = &[
    ("instantPowerW", "power"),
    ("producedEnergyWh", "produced_energy"),
    ("consumedEnergyWh", "consumed_energy"),
    ("importedEnergyWh", "imported_energy"),
    ("exportedEnergyWh", "exported_energy"),
    ("relayState", "relay"),
    ("circuitPriority", "priority"),
    ("doorState", "door_state"),
    ("mainRelayState", "main_relay"),
    ("dsmState", "demand_side_state"),
    ("currentRunConfig", "run_config"),
];

fn lookup(table: &'static [(&'static str, &'static str)], token: &str) -> Option<&'static str> {
    table.iter().find(|(k, _)| *k == token).map(|(_, v)| *v)
}

/// Normalize one legacy identifier to its canonical form.
///
/// Already-canonical input is returned unchanged, which makes the function
/// idempotent: `normalize(normalize(x)) == normalize(x)`.
pub fn normalize(legacy_id: &str) -> Result<CanonicalId, MigrationError> {
    if let Ok(canonical) = CanonicalId::from_str(legacy_id) {
        return Ok(canonical);
    }

    if let Some((left, field)) = legacy_id.split_once('.') {
        return normalize_dotted(legacy_id, left, field);
    }
    normalize_underscore(legacy_id)
}

/// `epanel_{serial}_{metricGroup}.{fieldName}`
fn normalize_dotted(
    legacy_id: &str,
    left: &str,
    field: &str,
) -> Result<CanonicalId, MigrationError> {
    let rest = strip_prefix(legacy_id, left)?;
    let (serial, group) =
        rest.split_once('_')
            .ok_or_else(|| MigrationError::UnrecognizedSchemaToken {
                id: legacy_id.to_string(),
                token: rest.to_string(),
            })?;

    let circuit =
        metric_group_circuit(group).ok_or_else(|| MigrationError::UnrecognizedSchemaToken {
            id: legacy_id.to_string(),
            token: group.to_string(),
        })?;
    let suffix =
        lookup(DOTTED_FIELDS, field).ok_or_else(|| MigrationError::UnrecognizedSchemaToken {
            id: legacy_id.to_string(),
            token: field.to_string(),
        })?;

    Ok(CanonicalId::new(serial, circuit, suffix)?)
}

/// `epanel_{serial}_{circuitToken}_{verbNoun}`
fn normalize_underscore(legacy_id: &str) -> Result<CanonicalId, MigrationError> {
    let rest = strip_prefix(legacy_id, legacy_id)?;
    let (serial, rest) =
        rest.split_once('_')
            .ok_or_else(|| MigrationError::UnrecognizedSchemaToken {
                id: legacy_id.to_string(),
                token: rest.to_string(),
            })?;
    let (token, verb_noun) =
        rest.split_once('_')
            .ok_or_else(|| MigrationError::UnrecognizedSchemaToken {
                id: legacy_id.to_string(),
                token: rest.to_string(),
            })?;

    if !CircuitRef::is_uuid_shaped(token) {
        return Err(MigrationError::UnrecognizedSchemaToken {
            id: legacy_id.to_string(),
            token: token.to_string(),
        });
    }
    let suffix = lookup(VERB_NOUN_SUFFIXES, verb_noun).ok_or_else(|| {
        MigrationError::UnrecognizedSchemaToken {
            id: legacy_id.to_string(),
            token: verb_noun.to_string(),
        }
    })?;

    Ok(CanonicalId::new(
        serial,
        CircuitRef::Uuid(token.to_string()),
        suffix,
    )?)
}

fn strip_prefix<'a>(legacy_id: &str, s: &'a str) -> Result<&'a str, MigrationError> {
    s.strip_prefix(ID_PREFIX)
        .and_then(|r| r.strip_prefix('_'))
        .ok_or_else(|| MigrationError::UnrecognizedSchemaToken {
            id: legacy_id.to_string(),
            token: s.split('_').next().unwrap_or_default().to_string(),
        })
}

/// Repair a malformed pre-migration identifier that dropped its device
/// serial (or the whole device prefix).
///
/// Only performed when exactly one serial is present across the record set;
/// with several devices the missing serial cannot be inferred and the repair
/// is refused for manual resolution. A well-formed id is returned unchanged.
pub fn repair_missing_serial(
    id: &str,
    serials: &BTreeSet<String>,
) -> Result<String, MigrationError> {
    let needs_repair = match id.strip_prefix(ID_PREFIX).and_then(|r| r.strip_prefix('_')) {
        Some(rest) => {
            // Serial position holding a UUID-shaped token followed by a
            // non-UUID segment means the serial was dropped.
            let mut segs = rest.splitn(3, '_');
            let first = segs.next().unwrap_or("");
            let second = segs.next().unwrap_or("");
            CircuitRef::is_uuid_shaped(first) && !CircuitRef::is_uuid_shaped(second)
        }
        // No device prefix at all (v1 variant B)
        None => true,
    };

    if !needs_repair {
        return Ok(id.to_string());
    }
    if serials.len() != 1 {
        return Err(MigrationError::AmbiguousSerialRepair {
            id: id.to_string(),
            candidates: serials.len(),
        });
    }
    let serial = serials.iter().next().map(String::as_str).unwrap_or("");

    match id.strip_prefix(ID_PREFIX).and_then(|r| r.strip_prefix('_')) {
        Some(rest) => Ok(format!("{}_{}_{}", ID_PREFIX, serial, rest)),
        None => Ok(format!("{}_{}_{}", ID_PREFIX, serial, id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_meter_example() {
        let got = normalize("epanel_S1_mainMeterEnergy.producedEnergyWh").unwrap();
        assert_eq!(got.to_string(), "epanel_S1_main_meter_produced_energy");
    }

    #[test]
    fn underscore_circuit_example() {
        let got = normalize("epanel_S1_c8f2_instantPowerW").unwrap();
        assert_eq!(got.to_string(), "epanel_S1_c8f2_power");
    }

    #[test]
    fn idempotent_over_all_known_forms() {
        let inputs = [
            "epanel_S1_mainMeterEnergy.producedEnergyWh",
            "epanel_S1_feedthroughEnergy.consumedEnergyWh",
            "epanel_S1_c8f2_instantPowerW",
            "epanel_S1_c8f2_relayState",
            "epanel_S1_circuit_15_power",
        ];
        for input in inputs {
            let once = normalize(input).unwrap();
            let twice = normalize(&once.to_string()).unwrap();
            assert_eq!(once, twice, "not idempotent for {input}");
        }
    }

    #[test]
    fn unknown_suffix_is_an_error_not_a_passthrough() {
        let err = normalize("epanel_S1_c8f2_futureMetricX").unwrap_err();
        assert!(matches!(
            err,
            MigrationError::UnrecognizedSchemaToken { ref token, .. } if token == "futureMetricX"
        ));

        let err = normalize("epanel_S1_mysteryGroup.producedEnergyWh").unwrap_err();
        assert!(matches!(
            err,
            MigrationError::UnrecognizedSchemaToken { ref token, .. } if token == "mysteryGroup"
        ));
    }

    #[test]
    fn repair_single_serial() {
        let serials: BTreeSet<String> = ["S1".to_string()].into();
        assert_eq!(
            repair_missing_serial("epanel_c8f2_instantPowerW", &serials).unwrap(),
            "epanel_S1_c8f2_instantPowerW"
        );
        assert_eq!(
            repair_missing_serial("c8f2_instantPowerW", &serials).unwrap(),
            "epanel_S1_c8f2_instantPowerW"
        );
        // Well-formed ids pass through untouched
        assert_eq!(
            repair_missing_serial("epanel_S1_c8f2_instantPowerW", &serials).unwrap(),
            "epanel_S1_c8f2_instantPowerW"
        );
    }

    #[test]
    fn repair_refused_with_multiple_serials() {
        let serials: BTreeSet<String> = ["S1".to_string(), "S2".to_string()].into();
        assert!(matches!(
            repair_missing_serial("epanel_c8f2_instantPowerW", &serials),
            Err(MigrationError::AmbiguousSerialRepair { candidates: 2, .. })
        ));
    }
}
