//! Naming-pattern transformer
//!
//! Computes the desired external identifier for every canonical identity
//! under a chosen naming convention. The result is a pure function of
//! `(naming_pattern, circuit descriptor, canonical_id)`: deterministic,
//! replayable, and independent of input order. Display names are never
//! produced or modified here; a user rename is input, never output.

use std::collections::{BTreeMap, HashSet};

use ep_core::{
    slugify, CanonicalId, CircuitDescriptor, ExternalId, NamingPattern, PlatformKind, ID_PREFIX,
};
use tracing::debug;

use crate::error::MigrationError;

/// Upper bound on disambiguation attempts per base identifier. Exceeding it
/// indicates duplicate source data, not an unlucky name.
const MAX_SUFFIX_ATTEMPTS: u32 = 99;

/// One identity the transformer works from
#[derive(Debug, Clone)]
pub struct NamingInput {
    pub canonical_id: CanonicalId,
    pub descriptor: CircuitDescriptor,
    pub platform_kind: PlatformKind,
}

/// The base external identifier before collision disambiguation
fn base_external_id(pattern: NamingPattern, input: &NamingInput) -> ExternalId {
    let canonical = &input.canonical_id;
    let object_id = match pattern {
        NamingPattern::Descriptive => {
            let slug = slugify(&input.descriptor.display_name);
            if slug.is_empty() {
                // Unnameable circuit falls back to the stable form
                stable_object_id(canonical)
            } else {
                format!("{}_{}", slug, canonical.suffix())
            }
        }
        NamingPattern::StableNumber => stable_object_id(canonical),
    };

    // The parts are built from validated canonical segments and slugs, so
    // this cannot produce an invalid id; fall back to the stable form if a
    // pathological display name slips through.
    ExternalId::new(input.platform_kind.domain(), object_id).unwrap_or_else(|_| {
        ExternalId::new(input.platform_kind.domain(), stable_object_id(canonical))
            .expect("stable object_id is always valid")
    })
}

fn stable_object_id(canonical: &CanonicalId) -> String {
    format!(
        "{}_{}_{}_{}",
        ID_PREFIX,
        canonical.serial().to_ascii_lowercase(),
        canonical.circuit().token(),
        canonical.suffix()
    )
}

/// Compute the desired external identifier for each canonical identity.
///
/// Collisions are resolved with `_2`, `_3`… suffixes assigned in canonical-id
/// sort order, so the outcome does not depend on processing order. More than
/// [`MAX_SUFFIX_ATTEMPTS`] attempts for one base id aborts with
/// `MigrationError::Collision`.
pub fn compute_external_ids(
    pattern: NamingPattern,
    identities: &[NamingInput],
) -> Result<BTreeMap<CanonicalId, ExternalId>, MigrationError> {
    // Sort-keyed processing: BTreeMap iteration is canonical-id order
    let mut bases: BTreeMap<CanonicalId, ExternalId> = BTreeMap::new();
    for input in identities {
        bases.insert(input.canonical_id.clone(), base_external_id(pattern, input));
    }

    let mut used: HashSet<ExternalId> = HashSet::new();
    let mut out = BTreeMap::new();
    for (canonical_id, base) in bases {
        let mut candidate = base.clone();
        let mut n = 2;
        while used.contains(&candidate) {
            if n > MAX_SUFFIX_ATTEMPTS {
                return Err(MigrationError::Collision(base.to_string()));
            }
            candidate = base.with_suffix(n);
            n += 1;
        }
        if candidate != base {
            debug!("disambiguated {} -> {}", base, candidate);
        }
        used.insert(candidate.clone());
        out.insert(canonical_id, candidate);
    }
    Ok(out)
}
