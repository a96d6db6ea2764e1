//! Identity records and installation-level enums

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::circuit::CircuitRef;
use crate::external_id::ExternalId;
use crate::identifier::CanonicalId;

/// Schema generation of an installation's stored identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaVersion {
    /// Dotted-field identifiers (`…_mainMeterEnergy.producedEnergyWh`)
    Legacy,
    /// Underscore identifiers with UUID circuit tokens and a device prefix
    V1VariantA,
    /// Underscore identifiers with UUID circuit tokens, no device prefix
    V1VariantB,
    /// Canonical snake_case identifiers
    Current,
}

impl SchemaVersion {
    /// True once no further identifier migration is needed
    pub fn is_current(&self) -> bool {
        matches!(self, SchemaVersion::Current)
    }
}

/// User-selected convention for constructing external identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NamingPattern {
    /// Built from the circuit's display name (`sensor.kitchen_outlets_power`)
    #[default]
    Descriptive,
    /// Built from the stable circuit/tab number (`sensor.epanel_s1_circuit_15_power`)
    StableNumber,
}

/// Host platform an identity is exposed through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformKind {
    Sensor,
    BinarySensor,
    Switch,
    Select,
}

impl PlatformKind {
    /// The external-id domain this platform produces
    pub fn domain(&self) -> &'static str {
        match self {
            PlatformKind::Sensor => "sensor",
            PlatformKind::BinarySensor => "binary_sensor",
            PlatformKind::Switch => "switch",
            PlatformKind::Select => "select",
        }
    }
}

/// One persisted identity: the link between a stored legacy id, its canonical
/// form, and the identifier automations actually reference.
///
/// Invariant: `external_id` never changes as a side effect of
/// canonicalization. Only a deliberate naming-pattern change, applied through
/// a migration plan, may rewrite it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Internal record id (ULID)
    pub id: String,
    /// Identifier string as originally persisted by an older generation
    pub legacy_id: String,
    /// Internal stable key after normalization
    pub canonical_id: CanonicalId,
    /// Automation-visible identifier
    pub external_id: ExternalId,
    /// Device serial this identity belongs to
    pub device_serial: String,
    /// Circuit this identity monitors
    pub circuit_ref: CircuitRef,
    /// Host platform kind
    pub platform_kind: PlatformKind,
    /// True when the user overrode the device-reported display name
    #[serde(default)]
    pub is_user_renamed: bool,
    /// Current display name, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Creation timestamp
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last modified timestamp
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl IdentityRecord {
    /// Create a record whose legacy id is already canonical
    pub fn new(
        canonical_id: CanonicalId,
        external_id: ExternalId,
        platform_kind: PlatformKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            legacy_id: canonical_id.to_string(),
            device_serial: canonical_id.serial().to_string(),
            circuit_ref: canonical_id.circuit().clone(),
            canonical_id,
            external_id,
            platform_kind,
            is_user_renamed: false,
            display_name: None,
            created_at: now,
            modified_at: now,
        }
    }
}
