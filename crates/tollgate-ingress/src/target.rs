//! Target ingress as described by discovery attributes

use std::collections::BTreeMap;

use tollgate_common::kube_utils::qualified_name;
use tollgate_common::{Error, Result};

/// Namespace of the target ingress
pub const ATTR_NAMESPACE: &str = "k8s.namespace";
/// Name of the target ingress
pub const ATTR_INGRESS: &str = "k8s.ingress";
/// Ingress class as seen at discovery time
pub const ATTR_INGRESS_CLASS: &str = "k8s.ingress.class";
/// Controller of the ingress class as seen at discovery time
pub const ATTR_INGRESS_CONTROLLER: &str = "k8s.ingress.controller";

/// Controller string of the NGINX Inc (enterprise) ingress controller
pub const NGINX_ENTERPRISE_CONTROLLER: &str = "nginx.org/ingress-controller";
/// Controller string of the community ingress-nginx controller
pub const NGINX_OPEN_SOURCE_CONTROLLER: &str = "k8s.io/ingress-nginx";

/// Attribute map handed over by discovery: every key may carry several values
pub type TargetAttributes = BTreeMap<String, Vec<String>>;

/// The ingress an action runs against
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngressTarget {
    /// Namespace of the ingress
    pub namespace: String,
    /// Name of the ingress
    pub name: String,
    /// Ingress class from discovery, if known
    pub class: Option<String>,
    /// Ingress controller from discovery, if known
    pub controller: Option<String>,
}

impl IngressTarget {
    /// Build a target from discovery attributes; namespace and name are required
    pub fn from_attributes(attributes: &TargetAttributes) -> Result<Self> {
        Ok(Self {
            namespace: required(attributes, ATTR_NAMESPACE)?,
            name: required(attributes, ATTR_INGRESS)?,
            class: first(attributes, ATTR_INGRESS_CLASS),
            controller: first(attributes, ATTR_INGRESS_CONTROLLER),
        })
    }

    /// `namespace/name`
    pub fn qualified_name(&self) -> String {
        qualified_name(&self.namespace, &self.name)
    }

    /// Whether discovery saw the enterprise NGINX controller behind this ingress
    pub fn is_enterprise_nginx(&self) -> bool {
        self.controller.as_deref() == Some(NGINX_ENTERPRISE_CONTROLLER)
    }
}

fn first(attributes: &TargetAttributes, key: &str) -> Option<String> {
    attributes
        .get(key)
        .and_then(|values| values.iter().map(|v| v.trim()).find(|v| !v.is_empty()))
        .map(str::to_string)
}

fn required(attributes: &TargetAttributes, key: &str) -> Result<String> {
    first(attributes, key).ok_or_else(|| {
        Error::validation_for_field(key, format!("target attribute {} is missing", key))
    })
}
