//! Marker-delimited rule blocks inside a shared annotation
//!
//! Every active rule lives in the annotation as a contiguous run of lines:
//!
//! ```text
//! # BEGIN STEADYBIT - Delay - 6f1c...
//! <dialect body>
//! # END STEADYBIT - Delay - 6f1c...
//! ```
//!
//! Both proxy families use this one marker format, so generation and
//! removal always agree. Block boundaries are found by exact line match on
//! the markers; the body in between is opaque. Text outside the markers
//! belongs to other tooling and is carried through untouched.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use tollgate_common::Error;

const BEGIN_PREFIX: &str = "# BEGIN STEADYBIT - ";
const END_PREFIX: &str = "# END STEADYBIT - ";
const SEGMENT_SEPARATOR: &str = " - ";

/// Kind of perturbation a rule block applies
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleSubtype {
    /// Answer matching requests with a fixed status code
    Block,
    /// Hold matching requests for a fixed time
    Delay,
}

impl fmt::Display for RuleSubtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleSubtype::Block => write!(f, "Block"),
            RuleSubtype::Delay => write!(f, "Delay"),
        }
    }
}

impl FromStr for RuleSubtype {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(RuleSubtype::Block),
            "delay" => Ok(RuleSubtype::Delay),
            other => Err(Error::validation(format!(
                "unknown rule kind '{}', expected 'block' or 'delay'",
                other
            ))),
        }
    }
}

/// Identity of one action invocation
///
/// Namespaces both the block markers and every identifier generated inside
/// the block, so concurrent executions on one ingress never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    /// Fresh random execution id
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// Punctuation-stripped form for use inside ACL and variable names
    pub fn suffix(&self) -> String {
        self.0.simple().to_string()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for ExecutionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| Error::validation(format!("invalid execution id '{}': {}", s, e)))
    }
}

/// Start and end marker lines for one execution's block
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Markers {
    start: String,
    end: String,
}

impl Markers {
    /// Markers for a subtype and execution id
    pub fn new(subtype: RuleSubtype, execution_id: &ExecutionId) -> Self {
        Self {
            start: format!("{BEGIN_PREFIX}{subtype}{SEGMENT_SEPARATOR}{execution_id}"),
            end: format!("{END_PREFIX}{subtype}{SEGMENT_SEPARATOR}{execution_id}"),
        }
    }

    /// The opening marker line
    pub fn start(&self) -> &str {
        &self.start
    }

    /// The closing marker line
    pub fn end(&self) -> &str {
        &self.end
    }

    /// Wrap a body in these markers
    pub fn wrap(&self, body: &str) -> String {
        format!("{}\n{}\n{}", self.start, body, self.end)
    }
}

/// A rule block found in annotation text
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveRule {
    /// Kind of the rule
    pub subtype: RuleSubtype,
    /// Execution that owns it
    pub execution_id: ExecutionId,
}

/// Inclusive line range `(start, end)` of the block bounded by `markers`
fn find_block(lines: &[&str], markers: &Markers) -> Option<(usize, usize)> {
    let start = lines
        .iter()
        .position(|line| line.trim_end() == markers.start())?;
    match lines[start + 1..]
        .iter()
        .position(|line| line.trim_end() == markers.end())
    {
        Some(offset) => Some((start, start + 1 + offset)),
        None => {
            warn!(marker = markers.start(), "Rule block has no end marker, ignoring it");
            None
        }
    }
}

/// Return the block bounded by `markers`, markers included, byte-for-byte
pub fn extract_block(text: &str, markers: &Markers) -> Option<String> {
    let lines: Vec<&str> = text.split('\n').collect();
    let (start, end) = find_block(&lines, markers)?;
    Some(lines[start..=end].join("\n"))
}

/// Whether `text` holds the block bounded by `markers`
pub fn contains_block(text: &str, markers: &Markers) -> bool {
    let lines: Vec<&str> = text.split('\n').collect();
    find_block(&lines, markers).is_some()
}

/// Remove the block bounded by `markers`.
///
/// Returns `None` when there is no such block, so callers can skip the write.
/// All other lines keep their content and order.
pub fn remove_block(text: &str, markers: &Markers) -> Option<String> {
    let lines: Vec<&str> = text.split('\n').collect();
    let (start, end) = find_block(&lines, markers)?;
    let remaining: Vec<&str> = lines[..start]
        .iter()
        .chain(lines[end + 1..].iter())
        .copied()
        .collect();
    Some(remaining.join("\n"))
}

/// Put a fragment in front of the existing annotation text
pub fn insert_block(existing: &str, fragment: &str) -> String {
    if existing.is_empty() {
        fragment.to_string()
    } else {
        format!("{}\n{}", fragment, existing)
    }
}

/// All rule blocks whose start marker parses, in annotation order
pub fn active_rules(text: &str) -> Vec<ActiveRule> {
    text.split('\n')
        .filter_map(|line| line.trim_end().strip_prefix(BEGIN_PREFIX))
        .filter_map(|rest| {
            let (subtype, id) = rest.split_once(SEGMENT_SEPARATOR)?;
            match (subtype.parse::<RuleSubtype>(), id.parse::<ExecutionId>()) {
                (Ok(subtype), Ok(execution_id)) => Some(ActiveRule {
                    subtype,
                    execution_id,
                }),
                _ => {
                    debug!(marker = rest, "Skipping unrecognized rule marker");
                    None
                }
            }
        })
        .collect()
}
