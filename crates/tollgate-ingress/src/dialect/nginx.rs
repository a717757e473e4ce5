//! NGINX snippets (variable dialect)
//!
//! NGINX has no boolean operators inside `if`, so a rule keeps a flag
//! variable that starts "on" and is switched off by one `if` per condition
//! that does not hold. The open source and enterprise controllers accept the
//! same body; only the annotation key differs.

use std::time::Duration;

use crate::block::{ExecutionId, RuleSubtype};
use crate::dialect::{quote_if_needed, RuleGenerator};
use crate::matcher::RequestMatcher;

/// Directive provided by the sleep module; only delay rules use it
pub const DELAY_SIGNATURE: &str = "steadybit_sleep_ms";

/// Dynamic module that provides [`DELAY_SIGNATURE`]
pub const SLEEP_MODULE: &str = "ngx_steadybit_sleep_module";

const SPECIALS: &[char] = &[';', '{', '}', '#'];

/// Negated path condition, as written inside `if (...)`
pub fn path_condition(pattern: &str) -> String {
    format!("$request_uri !~* {}", quote_if_needed(pattern, SPECIALS))
}

/// Conditions that are true when the request does NOT match
fn non_matching_conditions(matcher: &RequestMatcher) -> Vec<String> {
    let mut conditions = Vec::new();
    if let Some(pattern) = &matcher.path_pattern {
        conditions.push(path_condition(pattern));
    }
    if let Some(method) = &matcher.http_method {
        conditions.push(format!("$request_method != {}", method));
    }
    if let Some(header) = &matcher.http_header {
        conditions.push(format!(
            "$http_{} !~* {}",
            header.normalized_name(),
            quote_if_needed(&header.value, SPECIALS)
        ));
    }
    conditions
}

fn if_block(condition: &str, statement: &str) -> String {
    format!("if ({}) {{\n  {}\n}}", condition, statement)
}

/// `return <status>` when the flag survives every condition
#[derive(Debug, Clone, Copy)]
pub struct NginxBlock {
    /// Status code returned to the client
    pub status_code: u16,
}

impl RuleGenerator for NginxBlock {
    fn subtype(&self) -> RuleSubtype {
        RuleSubtype::Block
    }

    fn render(&self, matcher: &RequestMatcher, execution_id: &ExecutionId) -> String {
        let flag = format!("$steadybit_block_{}", execution_id.suffix());
        let mut parts = vec![format!("set {} \"true\";", flag)];
        for condition in non_matching_conditions(matcher) {
            parts.push(if_block(&condition, &format!("set {} \"false\";", flag)));
        }
        parts.push(if_block(
            &format!("{} = \"true\"", flag),
            &format!("return {};", self.status_code),
        ));
        parts.join("\n")
    }
}

/// Sleep for the configured time when the flag survives every condition
#[derive(Debug, Clone, Copy)]
pub struct NginxDelay {
    /// How long matching requests are held
    pub delay: Duration,
}

impl RuleGenerator for NginxDelay {
    fn subtype(&self) -> RuleSubtype {
        RuleSubtype::Delay
    }

    fn render(&self, matcher: &RequestMatcher, execution_id: &ExecutionId) -> String {
        let suffix = execution_id.suffix();
        let flag = format!("$steadybit_should_delay_{}", suffix);
        let duration = format!("$steadybit_delay_ms_{}", suffix);

        let mut parts = vec![format!("set {} 1;", flag)];
        for condition in non_matching_conditions(matcher) {
            parts.push(if_block(&condition, &format!("set {} 0;", flag)));
        }
        parts.push(format!("set {} 0;", duration));
        parts.push(if_block(
            &format!("{} = 1", flag),
            &format!("set {} {};", duration, self.delay.as_millis()),
        ));
        parts.push(format!("{} {};", DELAY_SIGNATURE, duration));
        parts.join("\n")
    }
}
