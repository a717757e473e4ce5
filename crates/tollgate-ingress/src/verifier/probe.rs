//! In-pod checks for the NGINX sleep module

use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use tollgate_common::{Error, Result};

use crate::client::{ExecOutput, PodApi};
use crate::dialect::nginx::SLEEP_MODULE;

/// Container name used by the common NGINX controller charts
pub const CONTROLLER_CONTAINER: &str = "controller";

/// Main configuration files, in the order they are read
pub const CONFIG_PATHS: &[&str] = &[
    "/etc/nginx/nginx.conf",
    "/usr/local/nginx/conf/nginx.conf",
    "/usr/local/etc/nginx/nginx.conf",
];

/// Directories that may hold the dynamic module
pub const MODULE_DIRS: &[&str] = &[
    "/etc/nginx/modules/",
    "/usr/lib/nginx/modules/",
    "/usr/local/nginx/modules/",
];

/// How the module was found
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModuleEvidence {
    /// A `load_module` directive in this configuration file
    LoadModule {
        /// Configuration file containing the directive
        config_path: String,
    },
    /// Compiled into the nginx binary
    StaticBuild,
    /// The shared object exists, though no directive loading it was seen
    ModuleFile {
        /// Path of the `.so` file
        path: String,
    },
}

/// Container to probe: `controller` if present, else the first one
pub fn probe_container(pod: &Pod) -> Option<&str> {
    let containers = &pod.spec.as_ref()?.containers;
    containers
        .iter()
        .find(|c| c.name == CONTROLLER_CONTAINER)
        .or_else(|| containers.first())
        .map(|c| c.name.as_str())
}

/// Whether nginx configuration text loads the sleep module
pub fn loads_sleep_module(config: &str) -> bool {
    config.lines().any(|line| {
        let line = line.trim_start();
        !line.starts_with('#') && line.starts_with("load_module") && line.contains(SLEEP_MODULE)
    })
}

/// Look for the sleep module in one pod.
///
/// A check whose exec fails is skipped and the remaining checks still run.
/// `Ok(None)` means at least one check ran and none found the module; the
/// last exec failure is returned only when no check could run at all.
pub async fn probe_pod(pods: &dyn PodApi, pod: &Pod) -> Result<Option<ModuleEvidence>> {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let name = pod
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::internal_with_context("probe_pod", "pod has no name"))?;
    let container = probe_container(pod).ok_or_else(|| {
        Error::internal_with_context("probe_pod", format!("pod {} has no containers", name))
    })?;

    let mut probe = PodProbe {
        pods,
        namespace,
        name,
        container,
        ran: false,
        last_error: None,
    };

    for path in CONFIG_PATHS.iter().copied() {
        let Some(output) = probe.run(&["cat", path]).await else {
            continue;
        };
        if output.success && loads_sleep_module(&output.stdout) {
            debug!(pod = name, config = path, "Sleep module loaded by configuration");
            return Ok(Some(ModuleEvidence::LoadModule {
                config_path: path.to_string(),
            }));
        }
    }

    if let Some(output) = probe.run(&["sh", "-c", "nginx -V 2>&1"]).await {
        if output.stdout.contains(SLEEP_MODULE) {
            debug!(pod = name, "Sleep module compiled into nginx");
            return Ok(Some(ModuleEvidence::StaticBuild));
        }
    }

    for dir in MODULE_DIRS {
        let path = format!("{}{}.so", dir, SLEEP_MODULE);
        let Some(output) = probe.run(&["test", "-f", path.as_str()]).await else {
            continue;
        };
        if output.success {
            debug!(pod = name, path = %path, "Sleep module file present");
            return Ok(Some(ModuleEvidence::ModuleFile { path }));
        }
    }

    match probe.last_error {
        Some(e) if !probe.ran => Err(e),
        _ => Ok(None),
    }
}

/// Exec runner for one container that keeps going past failed commands
struct PodProbe<'a> {
    pods: &'a dyn PodApi,
    namespace: &'a str,
    name: &'a str,
    container: &'a str,
    ran: bool,
    last_error: Option<Error>,
}

impl PodProbe<'_> {
    async fn run(&mut self, command: &[&str]) -> Option<ExecOutput> {
        match self
            .pods
            .exec(self.namespace, self.name, self.container, argv(command))
            .await
        {
            Ok(output) => {
                self.ran = true;
                Some(output)
            }
            Err(e) => {
                debug!(pod = self.name, command = %command.join(" "), error = %e, "Probe command failed");
                self.last_error = Some(e);
                None
            }
        }
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}
