//! Request matcher parsing
//!
//! Turns the loosely-typed condition parameters handed over by the action
//! host into a [`RequestMatcher`]. This is the only place the
//! "at least one condition" invariant is enforced.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use tollgate_common::{Error, Result};

/// Parameter key for the path regex
pub const CONDITION_PATH_PATTERN: &str = "conditionPathPattern";
/// Parameter key for the HTTP method
pub const CONDITION_HTTP_METHOD: &str = "conditionHttpMethod";
/// Parameter key for the header name/regex pair
pub const CONDITION_HTTP_HEADER: &str = "conditionHttpHeader";

/// Message returned when every condition is empty
pub const MISSING_CONDITION_MESSAGE: &str =
    "at least one condition (path, method, or header) is required";

/// One header name with a regex its value must match
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMatch {
    /// Header name as the client sends it
    pub name: String,
    /// Regex the header value must match
    pub value: String,
}

impl HeaderMatch {
    /// Lower-cased name with `-` replaced by `_`, usable inside identifiers
    pub fn normalized_name(&self) -> String {
        self.name.to_ascii_lowercase().replace('-', "_")
    }
}

/// Conditions under which a perturbation applies
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMatcher {
    /// Regex over the request URI
    pub path_pattern: Option<String>,
    /// Upper-cased HTTP method; `None` matches any method
    pub http_method: Option<String>,
    /// Header condition
    pub http_header: Option<HeaderMatch>,
}

impl RequestMatcher {
    /// Whether no condition is set
    pub fn is_empty(&self) -> bool {
        self.path_pattern.is_none() && self.http_method.is_none() && self.http_header.is_none()
    }
}

/// Parse a matcher from action parameters.
///
/// `conditionHttpHeader` accepts a `{"Name": "regex"}` object, the same
/// object encoded as a JSON string, or a `[{"key": .., "value": ..}]` list.
/// It must carry at most one pair.
pub fn parse_request_matcher(params: &Map<String, Value>) -> Result<RequestMatcher> {
    let path_pattern = string_param(params, CONDITION_PATH_PATTERN)?;
    let http_method = string_param(params, CONDITION_HTTP_METHOD)?
        .filter(|m| m != "*")
        .map(|m| m.to_ascii_uppercase());
    let http_header = match params.get(CONDITION_HTTP_HEADER) {
        Some(value) => decode_header(value)?,
        None => None,
    };

    if let Some(method) = &http_method {
        if !method.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(Error::validation_for_field(
                CONDITION_HTTP_METHOD,
                format!("invalid HTTP method '{}'", method),
            ));
        }
    }
    if let Some(header) = &http_header {
        validate_header(header)?;
    }

    let matcher = RequestMatcher {
        path_pattern,
        http_method,
        http_header,
    };
    if matcher.is_empty() {
        return Err(Error::validation(MISSING_CONDITION_MESSAGE));
    }
    Ok(matcher)
}

/// Trimmed non-empty string parameter; rejects line breaks since every
/// generated directive must stay on its own line.
fn string_param(params: &Map<String, Value>, key: &str) -> Result<Option<String>> {
    let value = match params.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => s.trim(),
        Some(other) => {
            return Err(Error::validation_for_field(
                key,
                format!("expected a string, got {}", other),
            ))
        }
    };
    if value.is_empty() {
        return Ok(None);
    }
    reject_line_breaks(key, value)?;
    Ok(Some(value.to_string()))
}

fn reject_line_breaks(key: &str, value: &str) -> Result<()> {
    if value.contains(['\n', '\r']) {
        return Err(Error::validation_for_field(
            key,
            "must not contain line breaks",
        ));
    }
    Ok(())
}

fn decode_header(value: &Value) -> Result<Option<HeaderMatch>> {
    let pairs: Vec<(String, String)> = match value {
        Value::Null => return Ok(None),
        Value::String(s) if s.trim().is_empty() => return Ok(None),
        Value::String(s) => {
            let decoded: Value = serde_json::from_str(s).map_err(|e| {
                Error::validation_for_field(
                    CONDITION_HTTP_HEADER,
                    format!("failed to decode header condition: {}", e),
                )
            })?;
            if decoded.is_string() {
                return Err(header_shape_error());
            }
            return decode_header(&decoded);
        }
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), header_value(v)?)))
            .collect::<Result<_>>()?,
        Value::Array(items) => items
            .iter()
            .map(|item| {
                let key = item.get("key").and_then(Value::as_str);
                let value = item.get("value").map(header_value).transpose()?;
                match (key, value) {
                    (Some(k), Some(v)) => Ok((k.to_string(), v)),
                    (Some(k), None) => Ok((k.to_string(), String::new())),
                    _ => Err(header_shape_error()),
                }
            })
            .collect::<Result<_>>()?,
        _ => return Err(header_shape_error()),
    };

    let mut pairs: Vec<(String, String)> = pairs
        .into_iter()
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect();

    match pairs.len() {
        0 => Ok(None),
        1 => {
            let (name, value) = pairs.remove(0);
            Ok(Some(HeaderMatch { name, value }))
        }
        n => Err(Error::validation_for_field(
            CONDITION_HTTP_HEADER,
            format!("only one header condition is supported, got {}", n),
        )),
    }
}

fn header_value(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(header_shape_error()),
    }
}

fn header_shape_error() -> Error {
    Error::validation_for_field(
        CONDITION_HTTP_HEADER,
        "expected a header name/value pair",
    )
}

fn validate_header(header: &HeaderMatch) -> Result<()> {
    if !header
        .name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::validation_for_field(
            CONDITION_HTTP_HEADER,
            format!("invalid header name '{}'", header.name),
        ));
    }
    if header.value.is_empty() {
        return Err(Error::validation_for_field(
            CONDITION_HTTP_HEADER,
            format!("header '{}' needs a value pattern", header.name),
        ));
    }
    reject_line_breaks(CONDITION_HTTP_HEADER, &header.value)
}
