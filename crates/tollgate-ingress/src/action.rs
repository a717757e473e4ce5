//! Action parameters: what happens to a matched request

use std::time::Duration;

use serde_json::{Map, Value};

use tollgate_common::{Error, Result};

use crate::block::RuleSubtype;

/// Parameter key for the block status code
pub const RESPONSE_STATUS_CODE: &str = "responseStatusCode";
/// Parameter key for the delay in milliseconds
pub const RESPONSE_DELAY: &str = "responseDelay";

/// Inclusive bounds accepted for a block status code
pub const STATUS_CODE_RANGE: std::ops::RangeInclusive<u16> = 100..=999;

/// Parameters of a single action, discriminated by kind
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionParameters {
    /// Respond with this status code instead of forwarding
    Block {
        /// HTTP status code returned to the client
        status_code: u16,
    },
    /// Hold the request before forwarding
    Delay {
        /// How long to hold the request
        delay: Duration,
    },
}

impl ActionParameters {
    /// The rule kind these parameters produce
    pub fn subtype(&self) -> RuleSubtype {
        match self {
            ActionParameters::Block { .. } => RuleSubtype::Block,
            ActionParameters::Delay { .. } => RuleSubtype::Delay,
        }
    }

    /// Parse the parameters for `subtype` out of the action parameter map
    pub fn parse(subtype: RuleSubtype, params: &Map<String, Value>) -> Result<Self> {
        match subtype {
            RuleSubtype::Block => {
                let code = integer_param(params, RESPONSE_STATUS_CODE)?;
                let status_code = u16::try_from(code)
                    .ok()
                    .filter(|c| STATUS_CODE_RANGE.contains(c))
                    .ok_or_else(|| {
                        Error::validation_for_field(
                            RESPONSE_STATUS_CODE,
                            format!("status code {} must be between 100 and 999", code),
                        )
                    })?;
                Ok(ActionParameters::Block { status_code })
            }
            RuleSubtype::Delay => {
                let millis = integer_param(params, RESPONSE_DELAY)?;
                let millis = u64::try_from(millis)
                    .ok()
                    .filter(|ms| *ms > 0)
                    .ok_or_else(|| {
                        Error::validation_for_field(
                            RESPONSE_DELAY,
                            format!("delay {}ms must be greater than zero", millis),
                        )
                    })?;
                Ok(ActionParameters::Delay {
                    delay: Duration::from_millis(millis),
                })
            }
        }
    }
}

/// Integer parameter given as a JSON number or a numeric string
fn integer_param(params: &Map<String, Value>, key: &str) -> Result<i64> {
    let value = params
        .get(key)
        .filter(|v| !v.is_null())
        .ok_or_else(|| Error::validation_for_field(key, format!("{} is required", key)))?;

    let parsed = match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };

    parsed.ok_or_else(|| {
        Error::validation_for_field(key, format!("{} must be an integer, got {}", key, value))
    })
}
