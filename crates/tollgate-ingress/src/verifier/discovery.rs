//! Controller pod discovery
//!
//! Nothing in the Kubernetes API links an IngressClass to the pods serving
//! it, so discovery runs an ordered list of heuristics. Each strategy either
//! produces a search (namespace plus label selectors, or an argument scan)
//! or declines. A search that finds no running pods falls through to the
//! next strategy.

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::IngressClass;
use tracing::debug;

use tollgate_common::kube_utils::{annotation, is_pod_running, label};
use tollgate_common::Result;

use crate::client::PodApi;

/// Helm release that installed the IngressClass
pub const HELM_RELEASE_NAME_ANNOTATION: &str = "meta.helm.sh/release-name";
/// Namespace of that Helm release
pub const HELM_RELEASE_NAMESPACE_ANNOTATION: &str = "meta.helm.sh/release-namespace";
/// Argo CD resource tracking annotation, `<app>:<group>/<kind>:<ns>/<name>`
pub const ARGOCD_TRACKING_ANNOTATION: &str = "argocd.argoproj.io/tracking-id";
/// Argo CD legacy label tracking
pub const ARGOCD_INSTANCE_LABEL: &str = "argocd.argoproj.io/instance";

const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
const COMPONENT_CONTROLLER: &str = "app.kubernetes.io/component=controller";
const INGRESS_CLASS_FLAG: &str = "ingress-class";

/// One heuristic for locating the pods behind an IngressClass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryStrategy {
    /// Follow the Helm release annotations on the IngressClass
    HelmRelease,
    /// Follow Argo CD tracking metadata on the IngressClass
    ArgoCdTracking,
    /// Scan every running pod for an `--ingress-class` argument
    ArgumentScan,
}

/// Strategies in the order they are tried
pub const DEFAULT_STRATEGIES: [DiscoveryStrategy; 3] = [
    DiscoveryStrategy::HelmRelease,
    DiscoveryStrategy::ArgoCdTracking,
    DiscoveryStrategy::ArgumentScan,
];

/// How to look for controller pods
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodSearch {
    /// Try each label selector in turn, in one namespace or cluster-wide
    Selectors {
        /// Namespace to search, `None` for all namespaces
        namespace: Option<String>,
        /// Label selectors, most specific first
        selectors: Vec<String>,
    },
    /// List every pod and keep those started for this class
    Arguments {
        /// Ingress class the controller must be started for
        class_name: String,
    },
}

impl DiscoveryStrategy {
    /// The search this strategy suggests for `class`, `None` if it does not apply
    pub fn search(&self, class: &IngressClass, class_name: &str) -> Option<PodSearch> {
        match self {
            DiscoveryStrategy::HelmRelease => {
                let release = annotation(&class.metadata, HELM_RELEASE_NAME_ANNOTATION)?;
                let namespace = annotation(&class.metadata, HELM_RELEASE_NAMESPACE_ANNOTATION)?;
                Some(PodSearch::Selectors {
                    namespace: Some(namespace.to_string()),
                    selectors: vec![
                        format!("{}={},{}", INSTANCE_LABEL, release, COMPONENT_CONTROLLER),
                        format!("{}={}", INSTANCE_LABEL, release),
                        format!("app={}-nginx-ingress", release),
                    ],
                })
            }
            DiscoveryStrategy::ArgoCdTracking => {
                let app = annotation(&class.metadata, ARGOCD_TRACKING_ANNOTATION)
                    .and_then(argocd_application)
                    .or_else(|| label(&class.metadata, ARGOCD_INSTANCE_LABEL))?;
                Some(PodSearch::Selectors {
                    namespace: None,
                    selectors: vec![
                        format!("{}={},{}", INSTANCE_LABEL, app, COMPONENT_CONTROLLER),
                        format!("{}={}", INSTANCE_LABEL, app),
                    ],
                })
            }
            DiscoveryStrategy::ArgumentScan => Some(PodSearch::Arguments {
                class_name: class_name.to_string(),
            }),
        }
    }
}

/// Application name from an Argo CD tracking id
fn argocd_application(tracking_id: &str) -> Option<&str> {
    tracking_id
        .split_once(':')
        .map(|(app, _)| app.trim())
        .filter(|app| !app.is_empty())
}

/// Whether any container of `pod` was started for `class_name`
pub fn pod_serves_class(pod: &Pod, class_name: &str) -> bool {
    let Some(spec) = &pod.spec else {
        return false;
    };
    spec.containers.iter().any(|container| {
        let argv: Vec<&str> = container
            .command
            .iter()
            .flatten()
            .chain(container.args.iter().flatten())
            .map(String::as_str)
            .collect();
        argv_names_class(&argv, class_name)
    })
}

fn argv_names_class(argv: &[&str], class_name: &str) -> bool {
    argv.iter().enumerate().any(|(i, arg)| {
        let flag = arg.trim_start_matches('-');
        if flag.len() == arg.len() {
            return false;
        }
        match flag.split_once('=') {
            Some((name, value)) => name == INGRESS_CLASS_FLAG && value == class_name,
            None => flag == INGRESS_CLASS_FLAG && argv.get(i + 1) == Some(&class_name),
        }
    })
}

/// Find running controller pods for `class`, trying `strategies` in order
pub async fn discover_controller_pods(
    pods: &dyn PodApi,
    class: &IngressClass,
    class_name: &str,
    strategies: &[DiscoveryStrategy],
) -> Result<Vec<Pod>> {
    for strategy in strategies {
        let Some(search) = strategy.search(class, class_name) else {
            debug!(?strategy, class = class_name, "Discovery strategy does not apply");
            continue;
        };

        let found = run_search(pods, &search).await?;
        if !found.is_empty() {
            debug!(?strategy, class = class_name, count = found.len(), "Found controller pods");
            return Ok(found);
        }
        debug!(?strategy, class = class_name, "Discovery strategy found no running pods");
    }
    Ok(Vec::new())
}

async fn run_search(pods: &dyn PodApi, search: &PodSearch) -> Result<Vec<Pod>> {
    match search {
        PodSearch::Selectors {
            namespace,
            selectors,
        } => {
            for selector in selectors {
                let running: Vec<Pod> = pods
                    .list_pods(namespace.clone(), Some(selector.clone()))
                    .await?
                    .into_iter()
                    .filter(is_pod_running)
                    .collect();
                if !running.is_empty() {
                    return Ok(running);
                }
            }
            Ok(Vec::new())
        }
        PodSearch::Arguments { class_name } => Ok(pods
            .list_pods(None, None)
            .await?
            .into_iter()
            .filter(|pod| is_pod_running(pod) && pod_serves_class(pod, class_name))
            .collect()),
    }
}
