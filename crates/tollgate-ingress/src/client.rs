//! Kubernetes access used by the engine
//!
//! Provides trait-based abstractions over the few API calls the engine
//! makes, allowing tests to substitute in-memory clusters while production
//! code uses kube-rs.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use kube::api::{Api, AttachParams, ListParams, Patch, PatchParams};
use kube::Client;
use tokio::io::AsyncReadExt;
use tracing::{debug, trace};

#[cfg(test)]
use mockall::automock;

use tollgate_common::kube_utils::annotation_patch;
use tollgate_common::{Error, FIELD_MANAGER};

/// Result of running a command inside a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Everything the command wrote to stdout
    pub stdout: String,
    /// Whether the command exited successfully
    pub success: bool,
}

/// Ingress reads and annotation writes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IngressApi: Send + Sync {
    /// Get an Ingress, `None` when it does not exist
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, Error>;

    /// Set (or with `None`, remove) one annotation on an Ingress
    ///
    /// With `resource_version` the write only succeeds if the object is
    /// unchanged since that version; otherwise the API answers 409.
    async fn patch_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: Option<String>,
        resource_version: Option<String>,
    ) -> Result<(), Error>;

    /// Get a cluster-scoped IngressClass, `None` when it does not exist
    async fn get_ingress_class(&self, name: &str) -> Result<Option<IngressClass>, Error>;
}

/// Pod listing and remote command execution
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodApi: Send + Sync {
    /// List pods, optionally restricted to a namespace and a label selector
    async fn list_pods(
        &self,
        namespace: Option<String>,
        label_selector: Option<String>,
    ) -> Result<Vec<Pod>, Error>;

    /// Run `command` in a container and collect its stdout
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, Error>;
}

/// kube-rs implementation of [`IngressApi`] and [`PodApi`]
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Create a new KubeClusterApi
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl IngressApi for KubeClusterApi {
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, Error> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: Option<String>,
        resource_version: Option<String>,
    ) -> Result<(), Error> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        let patch = annotation_patch(key, value.as_deref(), resource_version.as_deref());
        api.patch(name, &Self::patch_params(), &Patch::Merge(&patch))
            .await?;
        debug!(namespace, ingress = name, annotation = key, "Patched ingress annotation");
        Ok(())
    }

    async fn get_ingress_class(&self, name: &str) -> Result<Option<IngressClass>, Error> {
        let api: Api<IngressClass> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }
}

#[async_trait]
impl PodApi for KubeClusterApi {
    async fn list_pods(
        &self,
        namespace: Option<String>,
        label_selector: Option<String>,
    ) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = match namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let mut params = ListParams::default();
        if let Some(selector) = label_selector.as_deref() {
            params = params.labels(selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, Error> {
        trace!(namespace, pod, container, ?command, "Executing in pod");
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(false);

        let mut attached = api.exec(pod, command, &params).await?;

        let mut stdout = String::new();
        if let Some(mut reader) = attached.stdout() {
            reader.read_to_string(&mut stdout).await.map_err(|e| {
                Error::transport_with_context(
                    "pod-exec",
                    format!("failed to read stdout from {}/{}: {}", namespace, pod, e),
                )
            })?;
        }

        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        let success = status
            .as_ref()
            .and_then(|s| s.status.as_deref())
            .is_some_and(|s| s == "Success");

        Ok(ExecOutput { stdout, success })
    }
}
