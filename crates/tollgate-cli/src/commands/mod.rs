//! CLI commands

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use serde_json::{json, Map, Value};

use tollgate_common::kube_utils::create_client;
use tollgate_ingress::config::EngineConfig;
use tollgate_ingress::engine::IS_ENTERPRISE_NGINX;
use tollgate_ingress::matcher::{CONDITION_HTTP_HEADER, CONDITION_HTTP_METHOD, CONDITION_PATH_PATTERN};
use tollgate_ingress::target::{ATTR_INGRESS, ATTR_INGRESS_CLASS, ATTR_NAMESPACE};
use tollgate_ingress::{ProxyFamily, TargetAttributes, TrafficShaper};

use crate::{Error, Result};

pub mod clear;
pub mod inject;
pub mod list;
pub mod render;

/// Which ingress, and which controller annotation on it
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Namespace of the ingress
    #[arg(long, short = 'n')]
    pub namespace: String,

    /// Name of the ingress
    #[arg(long, short = 'i')]
    pub ingress: String,

    #[command(flatten)]
    pub proxy: ProxyArgs,

    /// Path to kubeconfig (defaults to in-cluster or ~/.kube/config)
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,
}

/// Proxy family and flavour
#[derive(Args, Debug, Clone)]
pub struct ProxyArgs {
    /// Ingress controller proxy: haproxy or nginx
    #[arg(long)]
    pub proxy: String,

    /// Use the NGINX Inc (enterprise) controller annotation
    #[arg(long)]
    pub enterprise: bool,
}

impl ProxyArgs {
    /// Parsed proxy family
    pub fn family(&self) -> Result<ProxyFamily> {
        Ok(self.proxy.parse()?)
    }
}

/// Request conditions; at least one is required
#[derive(Args, Debug, Clone, Default)]
pub struct ConditionArgs {
    /// Regular expression matched against the request path
    #[arg(long)]
    pub path: Option<String>,

    /// HTTP method to match, `*` for any
    #[arg(long)]
    pub method: Option<String>,

    /// Header to match, as Name=Regex
    #[arg(long)]
    pub header: Option<String>,
}

impl ConditionArgs {
    /// Condition entries of the action parameter map
    pub fn to_parameters(&self) -> Result<Map<String, Value>> {
        let mut params = Map::new();
        if let Some(path) = &self.path {
            params.insert(CONDITION_PATH_PATTERN.to_string(), json!(path));
        }
        if let Some(method) = &self.method {
            params.insert(CONDITION_HTTP_METHOD.to_string(), json!(method));
        }
        if let Some(header) = &self.header {
            let (name, value) = header.split_once('=').ok_or_else(|| {
                Error::validation(format!("invalid header '{}', expected Name=Regex", header))
            })?;
            let mut pair = Map::new();
            pair.insert(name.trim().to_string(), json!(value.trim()));
            params.insert(CONDITION_HTTP_HEADER.to_string(), Value::Object(pair));
        }
        Ok(params)
    }
}

/// Action parameters for a rule: conditions, the action value, and the enterprise flag
pub fn action_parameters(
    conditions: &ConditionArgs,
    proxy: &ProxyArgs,
    action: (&str, Value),
) -> Result<Map<String, Value>> {
    let mut params = conditions.to_parameters()?;
    params.insert(action.0.to_string(), action.1);
    if proxy.enterprise {
        params.insert(IS_ENTERPRISE_NGINX.to_string(), Value::Bool(true));
    }
    Ok(params)
}

/// Target attributes for an ingress given on the command line
pub fn target_attributes(target: &TargetArgs, class: Option<&str>) -> TargetAttributes {
    let mut attributes = TargetAttributes::new();
    attributes.insert(ATTR_NAMESPACE.to_string(), vec![target.namespace.clone()]);
    attributes.insert(ATTR_INGRESS.to_string(), vec![target.ingress.clone()]);
    if let Some(class) = class {
        attributes.insert(ATTR_INGRESS_CLASS.to_string(), vec![class.to_string()]);
    }
    attributes
}

/// Connect to the cluster and build the engine
pub async fn traffic_shaper(
    target: &TargetArgs,
    skip_module_verification: bool,
) -> Result<TrafficShaper> {
    let mut config = EngineConfig::from_env()?;
    config.skip_module_verification |= skip_module_verification;
    let client = create_client(target.kubeconfig.as_deref()).await?;
    Ok(TrafficShaper::from_client(client, config))
}

/// Parse a duration string like "1h", "30m", "90s" or raw seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let invalid = || {
        Error::validation(format!(
            "invalid duration '{}', expected e.g. 1h, 30m, 90s",
            s
        ))
    };
    let (digits, unit) = if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600)
    } else if let Some(minutes) = s.strip_suffix('m') {
        (minutes, 60)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1)
    } else {
        // Raw seconds
        (s, 1)
    };
    let n: u64 = digits.trim().parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(n.saturating_mul(unit)))
}
