//! Sleep module verification for NGINX delay rules
//!
//! A delay rule uses the `steadybit_sleep_ms` directive. If the controller
//! does not load the module providing it, NGINX rejects the whole
//! configuration reload, so the check runs during Prepare before anything is
//! written.
//!
//! The check resolves the ingress class, makes sure an NGINX controller
//! owns it, discovers the controller pods (see [`discovery`]) and probes
//! them one by one (see [`probe`]) until one confirms the module.

pub mod discovery;
pub mod probe;

use k8s_openapi::api::networking::v1::Ingress;
use tracing::{debug, info, warn};

use tollgate_common::kube_utils::{annotation, qualified_name};
use tollgate_common::{Error, Result, LEGACY_INGRESS_CLASS_ANNOTATION};

use crate::client::{IngressApi, PodApi};
use crate::dialect::nginx::SLEEP_MODULE;
use crate::target::{IngressTarget, NGINX_ENTERPRISE_CONTROLLER, NGINX_OPEN_SOURCE_CONTROLLER};

pub use discovery::{DiscoveryStrategy, DEFAULT_STRATEGIES};
pub use probe::ModuleEvidence;

/// A controller pod that has the sleep module
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleConfirmation {
    /// Pod in `namespace/name` form
    pub pod: String,
    /// How the module was found
    pub evidence: ModuleEvidence,
}

/// Ingress class of `ingress`: `spec.ingressClassName`, then the legacy
/// annotation, then the class discovery reported for the target
pub fn resolve_class_name(ingress: &Ingress, target: &IngressTarget) -> Option<String> {
    ingress
        .spec
        .as_ref()
        .and_then(|s| s.ingress_class_name.clone())
        .or_else(|| annotation(&ingress.metadata, LEGACY_INGRESS_CLASS_ANNOTATION).map(str::to_string))
        .or_else(|| target.class.clone())
        .filter(|c| !c.is_empty())
}

/// Confirms the sleep module in the controller behind an ingress
pub struct ModuleVerifier<'a> {
    ingresses: &'a dyn IngressApi,
    pods: &'a dyn PodApi,
}

impl<'a> ModuleVerifier<'a> {
    /// Create a verifier using the default discovery strategies
    pub fn new(ingresses: &'a dyn IngressApi, pods: &'a dyn PodApi) -> Self {
        Self { ingresses, pods }
    }

    /// Confirm the sleep module for `ingress`, or fail with a verification error
    pub async fn verify(&self, ingress: &Ingress, target: &IngressTarget) -> Result<ModuleConfirmation> {
        let ingress_name = target.qualified_name();
        let fail = |message: String, pods_checked: Vec<String>| {
            Error::verification(ingress_name.clone(), message, pods_checked)
        };

        let class_name = resolve_class_name(ingress, target)
            .ok_or_else(|| fail("cannot determine the ingress class".to_string(), Vec::new()))?;

        let class = self
            .ingresses
            .get_ingress_class(&class_name)
            .await?
            .ok_or_else(|| fail(format!("ingress class {} not found", class_name), Vec::new()))?;

        let controller = class
            .spec
            .as_ref()
            .and_then(|s| s.controller.as_deref())
            .unwrap_or_default();
        if controller != NGINX_OPEN_SOURCE_CONTROLLER && controller != NGINX_ENTERPRISE_CONTROLLER {
            return Err(fail(
                format!(
                    "ingress class {} is handled by '{}', not an NGINX ingress controller",
                    class_name, controller
                ),
                Vec::new(),
            ));
        }

        let candidates =
            discovery::discover_controller_pods(self.pods, &class, &class_name, &DEFAULT_STRATEGIES)
                .await?;
        if candidates.is_empty() {
            return Err(fail(
                format!("no running controller pods found for ingress class {}", class_name),
                Vec::new(),
            ));
        }

        let mut pods_checked = Vec::with_capacity(candidates.len());
        let mut last_error = None;
        for pod in &candidates {
            let pod_name = qualified_name(
                pod.metadata.namespace.as_deref().unwrap_or_default(),
                pod.metadata.name.as_deref().unwrap_or_default(),
            );
            pods_checked.push(pod_name.clone());

            match probe::probe_pod(self.pods, pod).await {
                Ok(Some(evidence)) => {
                    info!(ingress = %ingress_name, pod = %pod_name, ?evidence, "Sleep module confirmed");
                    return Ok(ModuleConfirmation {
                        pod: pod_name,
                        evidence,
                    });
                }
                Ok(None) => {
                    debug!(pod = %pod_name, "Sleep module not found in pod");
                    last_error = Some(format!("{} not found in {}", SLEEP_MODULE, pod_name));
                }
                Err(e) => {
                    warn!(pod = %pod_name, error = %e, "Failed to probe controller pod");
                    last_error = Some(format!("{}: {}", pod_name, e));
                }
            }
        }

        Err(fail(
            format!(
                "{} is not available in any controller pod for ingress class {} (last error: {})",
                SLEEP_MODULE,
                class_name,
                last_error.unwrap_or_default()
            ),
            pods_checked,
        ))
    }
}
