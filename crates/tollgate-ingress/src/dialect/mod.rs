//! Proxy dialects and the rule generators that compile into them
//!
//! Two proxy families model "conditional action" differently:
//!
//! - **HAProxy** is ACL-based: each condition becomes a named ACL and the
//!   action statement lists the ACLs it depends on.
//! - **NGINX** is variable-based: a flag variable is initialised and then
//!   flipped by `if` blocks for every condition that does *not* hold.
//!
//! Each (family x rule kind) pair has its own [`RuleGenerator`]. Within a
//! family the generators share the step that turns a [`RequestMatcher`]
//! into a predicate list and only differ in how predicates are combined:
//! block rules AND the conditions, delay rules let traffic pass unless
//! every condition holds.

pub mod haproxy;
pub mod nginx;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use tollgate_common::Error;

use crate::action::ActionParameters;
use crate::block::{ExecutionId, Markers, RuleSubtype};
use crate::matcher::RequestMatcher;

/// HAProxy ingress controller annotation holding backend configuration
pub const HAPROXY_ANNOTATION: &str = "haproxy.org/backend-config-snippet";
/// ingress-nginx (open source) annotation holding location configuration
pub const NGINX_OPEN_SOURCE_ANNOTATION: &str = "nginx.ingress.kubernetes.io/configuration-snippet";
/// NGINX Inc (enterprise) controller annotation holding server configuration
pub const NGINX_ENTERPRISE_ANNOTATION: &str = "nginx.org/server-snippets";

/// Proxy family an action targets, as chosen by the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyFamily {
    /// HAProxy ingress controller
    Haproxy,
    /// NGINX ingress controllers
    Nginx,
}

impl FromStr for ProxyFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "haproxy" => Ok(ProxyFamily::Haproxy),
            "nginx" => Ok(ProxyFamily::Nginx),
            other => Err(Error::validation(format!(
                "unknown proxy '{}', expected 'haproxy' or 'nginx'",
                other
            ))),
        }
    }
}

impl fmt::Display for ProxyFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyFamily::Haproxy => write!(f, "haproxy"),
            ProxyFamily::Nginx => write!(f, "nginx"),
        }
    }
}

/// Concrete configuration dialect, one per annotation key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dialect {
    /// HAProxy backend snippet
    HaProxy,
    /// ingress-nginx configuration snippet
    NginxOpenSource,
    /// NGINX Inc server snippet
    NginxEnterprise,
}

impl Dialect {
    /// Resolve the dialect for a family; only NGINX has an enterprise flavour
    pub fn for_family(family: ProxyFamily, enterprise: bool) -> Self {
        match (family, enterprise) {
            (ProxyFamily::Haproxy, _) => Dialect::HaProxy,
            (ProxyFamily::Nginx, false) => Dialect::NginxOpenSource,
            (ProxyFamily::Nginx, true) => Dialect::NginxEnterprise,
        }
    }

    /// Annotation that holds this dialect's configuration
    pub fn annotation_key(&self) -> &'static str {
        match self {
            Dialect::HaProxy => HAPROXY_ANNOTATION,
            Dialect::NginxOpenSource => NGINX_OPEN_SOURCE_ANNOTATION,
            Dialect::NginxEnterprise => NGINX_ENTERPRISE_ANNOTATION,
        }
    }

    /// Proxy family of this dialect
    pub fn family(&self) -> ProxyFamily {
        match self {
            Dialect::HaProxy => ProxyFamily::Haproxy,
            Dialect::NginxOpenSource | Dialect::NginxEnterprise => ProxyFamily::Nginx,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::HaProxy => write!(f, "haproxy"),
            Dialect::NginxOpenSource => write!(f, "nginx"),
            Dialect::NginxEnterprise => write!(f, "nginx-enterprise"),
        }
    }
}

/// Compiles a matcher into one dialect's configuration body for one rule kind
pub trait RuleGenerator: Send + Sync {
    /// Rule kind this generator produces
    fn subtype(&self) -> RuleSubtype;

    /// Configuration body, without markers
    fn render(&self, matcher: &RequestMatcher, execution_id: &ExecutionId) -> String;
}

/// Pick the generator for a dialect and action
pub fn generator_for(dialect: Dialect, params: &ActionParameters) -> Box<dyn RuleGenerator> {
    match (dialect.family(), *params) {
        (ProxyFamily::Haproxy, ActionParameters::Block { status_code }) => {
            Box::new(haproxy::HaproxyBlock { status_code })
        }
        (ProxyFamily::Haproxy, ActionParameters::Delay { delay }) => {
            Box::new(haproxy::HaproxyDelay { delay })
        }
        (ProxyFamily::Nginx, ActionParameters::Block { status_code }) => {
            Box::new(nginx::NginxBlock { status_code })
        }
        (ProxyFamily::Nginx, ActionParameters::Delay { delay }) => {
            Box::new(nginx::NginxDelay { delay })
        }
    }
}

/// The unit of mutation: one execution's generated configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleBlock {
    /// Execution that owns this block
    pub execution_id: ExecutionId,
    /// Rule kind
    pub subtype: RuleSubtype,
    /// Dialect the body is written in
    pub dialect: Dialect,
    /// Generated configuration, without markers
    pub body: String,
    /// Start and end marker lines
    pub markers: Markers,
}

impl RuleBlock {
    /// Markers plus body, as written into the annotation
    pub fn fragment(&self) -> String {
        self.markers.wrap(&self.body)
    }
}

/// Compile a matcher and action into a marker-wrapped rule block
pub fn generate_rule(
    dialect: Dialect,
    matcher: &RequestMatcher,
    params: &ActionParameters,
    execution_id: ExecutionId,
) -> RuleBlock {
    let generator = generator_for(dialect, params);
    let subtype = generator.subtype();
    RuleBlock {
        execution_id,
        subtype,
        dialect,
        body: generator.render(matcher, &execution_id),
        markers: Markers::new(subtype, &execution_id),
    }
}

/// Double-quote `value` if it contains any of `specials` or whitespace,
/// escaping backslashes and quotes. Both dialects share this quoting.
pub(crate) fn quote_if_needed(value: &str, specials: &[char]) -> String {
    let needs_quotes = value
        .chars()
        .any(|c| c.is_whitespace() || c == '"' || c == '\'' || specials.contains(&c));
    if !needs_quotes {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}
