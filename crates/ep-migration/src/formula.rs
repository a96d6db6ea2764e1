//! Formula reference rewriting
//!
//! User-defined synthetic sensors embed external identifiers as variable
//! references inside formula strings. When a migration plan renames external
//! ids, those references must follow. The formulas themselves are never
//! evaluated or parsed beyond whole-token matching; the expression grammar
//! belongs to an external collaborator.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use ep_core::ExternalId;

/// Maximal identifier-shaped tokens: the characters external ids are built
/// from, including the domain separator.
fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[0-9a-z_.]+").expect("token pattern is valid"))
}

/// Replace whole-token occurrences of renamed external ids in one formula.
///
/// Partial matches never rewrite: `sensor.garage_power_2` is untouched by a
/// rename of `sensor.garage_power`. Each token is mapped at most once, so
/// chained renames (a→b, b→c) cannot cascade within a single pass.
pub fn rewrite_references(formula: &str, renames: &BTreeMap<ExternalId, ExternalId>) -> String {
    if renames.is_empty() {
        return formula.to_string();
    }
    let table: BTreeMap<String, String> = renames
        .iter()
        .map(|(old, new)| (old.to_string(), new.to_string()))
        .collect();

    token_re()
        .replace_all(formula, |caps: &regex::Captures<'_>| {
            let token = &caps[0];
            table.get(token).cloned().unwrap_or_else(|| token.to_string())
        })
        .into_owned()
}
