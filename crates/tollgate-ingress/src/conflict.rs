//! Conflict detection over existing annotation text
//!
//! A small set of line predicates, not a parser: the snippets are only ever
//! appended and removed by marker, never round-tripped. Unrelated text that
//! happens to contain a signature is reported as a conflict too.

use tollgate_common::{Error, Result};

use crate::block::RuleSubtype;
use crate::dialect::{haproxy, nginx, Dialect, ProxyFamily};
use crate::matcher::RequestMatcher;

/// Message for a second delay rule on one ingress
pub const DELAY_EXISTS_MESSAGE: &str = "a delay rule already exists - cannot add another one";

/// Delay signatures of every dialect; a delay from either family blocks a new one
const DELAY_SIGNATURES: &[&str] = &[haproxy::DELAY_SIGNATURE, nginx::DELAY_SIGNATURE];

/// Reject a new rule that would collide with `existing` annotation text.
///
/// `ingress` is only used for the error message.
pub fn detect_conflicts(
    ingress: &str,
    dialect: Dialect,
    existing: &str,
    matcher: &RequestMatcher,
    subtype: RuleSubtype,
) -> Result<()> {
    if let Some(pattern) = &matcher.path_pattern {
        let signature = path_signature(dialect, pattern);
        if existing.lines().any(|line| contains_condition(line, &signature)) {
            return Err(Error::conflict(
                ingress,
                format!("a rule for path {} already exists", pattern),
            ));
        }
    }

    if subtype == RuleSubtype::Delay && has_delay_rule(existing) {
        return Err(Error::conflict(ingress, DELAY_EXISTS_MESSAGE));
    }

    Ok(())
}

/// Whether any line carries a delay signature
pub fn has_delay_rule(existing: &str) -> bool {
    existing
        .lines()
        .any(|line| DELAY_SIGNATURES.iter().any(|sig| line.contains(sig)))
}

fn path_signature(dialect: Dialect, pattern: &str) -> String {
    match dialect.family() {
        ProxyFamily::Haproxy => haproxy::path_condition(pattern),
        ProxyFamily::Nginx => nginx::path_condition(pattern),
    }
}

/// `needle` occurs in `line` and is not just the prefix of a longer pattern
fn contains_condition(line: &str, needle: &str) -> bool {
    line.match_indices(needle).any(|(idx, _)| {
        line[idx + needle.len()..]
            .chars()
            .next()
            .map_or(true, |c| c.is_whitespace() || c == ')')
    })
}
