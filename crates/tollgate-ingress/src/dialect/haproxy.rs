//! HAProxy backend snippets (ACL dialect)

use std::time::Duration;

use crate::block::{ExecutionId, RuleSubtype};
use crate::dialect::{quote_if_needed, RuleGenerator};
use crate::matcher::RequestMatcher;

/// Literal that only appears in delay rules
pub const DELAY_SIGNATURE: &str = "tcp-request inspect-delay";

const SPECIALS: &[char] = &['#'];

/// A named ACL line
#[derive(Debug, Clone, PartialEq, Eq)]
struct Acl {
    name: String,
    criterion: String,
}

impl Acl {
    fn line(&self) -> String {
        format!("acl {} {}", self.name, self.criterion)
    }
}

/// Path criterion as it appears after the ACL name
pub fn path_condition(pattern: &str) -> String {
    format!("path_reg {}", quote_if_needed(pattern, SPECIALS))
}

/// One ACL per condition, names suffixed with the execution id
fn acls(matcher: &RequestMatcher, execution_id: &ExecutionId) -> Vec<Acl> {
    let suffix = execution_id.suffix();
    let mut acls = Vec::new();

    if let Some(pattern) = &matcher.path_pattern {
        acls.push(Acl {
            name: format!("steadybit_path_{}", suffix),
            criterion: path_condition(pattern),
        });
    }
    if let Some(method) = &matcher.http_method {
        acls.push(Acl {
            name: format!("steadybit_method_{}", suffix),
            criterion: format!("method {}", method),
        });
    }
    if let Some(header) = &matcher.http_header {
        acls.push(Acl {
            name: format!("steadybit_header_{}_{}", header.normalized_name(), suffix),
            criterion: format!(
                "req.hdr({}) -m reg {}",
                header.name,
                quote_if_needed(&header.value, SPECIALS)
            ),
        });
    }
    acls
}

/// Return a fixed status when every ACL matches
#[derive(Debug, Clone, Copy)]
pub struct HaproxyBlock {
    /// Status code returned to the client
    pub status_code: u16,
}

impl RuleGenerator for HaproxyBlock {
    fn subtype(&self) -> RuleSubtype {
        RuleSubtype::Block
    }

    fn render(&self, matcher: &RequestMatcher, execution_id: &ExecutionId) -> String {
        let acls = acls(matcher, execution_id);
        let mut lines: Vec<String> = acls.iter().map(Acl::line).collect();
        let names: Vec<&str> = acls.iter().map(|a| a.name.as_str()).collect();
        lines.push(format!(
            "http-request return status {} if {}",
            self.status_code,
            names.join(" ")
        ));
        lines.join("\n")
    }
}

/// Hold requests in the inspect buffer unless at least one ACL fails
#[derive(Debug, Clone, Copy)]
pub struct HaproxyDelay {
    /// How long matching requests are held
    pub delay: Duration,
}

impl RuleGenerator for HaproxyDelay {
    fn subtype(&self) -> RuleSubtype {
        RuleSubtype::Delay
    }

    fn render(&self, matcher: &RequestMatcher, execution_id: &ExecutionId) -> String {
        let acls = acls(matcher, execution_id);
        let mut lines: Vec<String> = acls.iter().map(Acl::line).collect();
        let negated: Vec<String> = acls.iter().map(|a| format!("!{}", a.name)).collect();
        lines.push(format!("{} {}ms", DELAY_SIGNATURE, self.delay.as_millis()));
        lines.push(format!(
            "tcp-request content accept if {}",
            negated.join(" || ")
        ));
        lines.push("tcp-request content accept if WAIT_END".to_string());
        lines.join("\n")
    }
}
