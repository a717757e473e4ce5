//! Read-modify-write of the shared configuration annotation
//!
//! Several executions may touch one annotation at the same time. Each write
//! carries the `resourceVersion` it was computed from, so a write based on a
//! stale read is rejected by the API server with 409 and recomputed from a
//! fresh read. Blocks are owned by execution id: Start only adds its own
//! block and Stop only removes its own block.

use k8s_openapi::api::networking::v1::Ingress;
use tracing::{debug, info, warn};

use tollgate_common::kube_utils::{annotation, qualified_name};
use tollgate_common::retry::{retry_with_backoff_if, RetryConfig};
use tollgate_common::{Error, Result};

use crate::block::{self, ActiveRule, RuleSubtype};
use crate::client::IngressApi;
use crate::dialect::RuleBlock;

/// Annotation value together with the version it was read at
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnnotationSnapshot {
    /// Current text, empty when the annotation is absent
    pub value: String,
    /// `metadata.resourceVersion` of the ingress at read time
    pub resource_version: Option<String>,
}

impl AnnotationSnapshot {
    fn of(ingress: &Ingress, key: &str) -> Self {
        Self {
            value: annotation(&ingress.metadata, key).unwrap_or_default().to_string(),
            resource_version: ingress.metadata.resource_version.clone(),
        }
    }
}

/// Adds and removes rule blocks in one annotation of one ingress
pub struct AnnotationMutator<'a> {
    api: &'a dyn IngressApi,
    retry: RetryConfig,
}

impl<'a> AnnotationMutator<'a> {
    /// Create a mutator that retries conflicting writes per `retry`
    pub fn new(api: &'a dyn IngressApi, retry: RetryConfig) -> Self {
        Self { api, retry }
    }

    /// Read the annotation, `None` when the ingress does not exist
    pub async fn read(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<AnnotationSnapshot>> {
        Ok(self
            .api
            .get_ingress(namespace, name)
            .await?
            .map(|ingress| AnnotationSnapshot::of(&ingress, key)))
    }

    /// Rule blocks currently present in the annotation
    pub async fn active_rules(&self, namespace: &str, name: &str, key: &str) -> Result<Vec<ActiveRule>> {
        let snapshot = self
            .read(namespace, name, key)
            .await?
            .ok_or_else(|| missing_ingress(namespace, name))?;
        Ok(block::active_rules(&snapshot.value))
    }

    /// Put `rule` in front of the annotation text.
    ///
    /// Adding a block that is already present is a no-op. A block rule fails
    /// with a conflict after the write if a delay rule of another execution
    /// is present by then; the caller is expected to run Stop.
    pub async fn insert(&self, namespace: &str, name: &str, key: &str, rule: &RuleBlock) -> Result<()> {
        let ingress = qualified_name(namespace, name);

        self.with_retries("annotation-insert", &ingress, || {
            self.try_insert(namespace, name, key, rule)
        })
        .await?;

        info!(
            ingress = %ingress,
            execution_id = %rule.execution_id,
            subtype = %rule.subtype,
            dialect = %rule.dialect,
            "Rule block written"
        );

        if rule.subtype == RuleSubtype::Block {
            self.check_no_foreign_delay(namespace, name, key, rule).await?;
        }
        Ok(())
    }

    /// Remove the block owned by `rule`'s execution.
    ///
    /// Returns whether a block was removed. A missing block or ingress is not
    /// an error and causes no write. The annotation key is deleted when
    /// nothing else remains in it.
    pub async fn remove(&self, namespace: &str, name: &str, key: &str, rule: &RuleBlock) -> Result<bool> {
        let ingress = qualified_name(namespace, name);

        let removed = self
            .with_retries("annotation-remove", &ingress, || {
                self.try_remove(namespace, name, key, rule)
            })
            .await?;

        if removed {
            info!(ingress = %ingress, execution_id = %rule.execution_id, "Rule block removed");
        } else {
            debug!(ingress = %ingress, execution_id = %rule.execution_id, "No rule block to remove");
        }
        Ok(removed)
    }

    async fn try_insert(&self, namespace: &str, name: &str, key: &str, rule: &RuleBlock) -> Result<()> {
        let snapshot = self
            .read(namespace, name, key)
            .await?
            .ok_or_else(|| missing_ingress(namespace, name))?;

        if block::contains_block(&snapshot.value, &rule.markers) {
            debug!(execution_id = %rule.execution_id, "Rule block already present");
            return Ok(());
        }

        let updated = block::insert_block(&snapshot.value, &rule.fragment());
        self.api
            .patch_annotation(namespace, name, key, Some(updated), snapshot.resource_version)
            .await
    }

    async fn try_remove(&self, namespace: &str, name: &str, key: &str, rule: &RuleBlock) -> Result<bool> {
        let Some(snapshot) = self.read(namespace, name, key).await? else {
            warn!(
                ingress = %qualified_name(namespace, name),
                "Ingress no longer exists, nothing to remove"
            );
            return Ok(false);
        };

        let Some(remaining) = block::remove_block(&snapshot.value, &rule.markers) else {
            return Ok(false);
        };

        let value = (!remaining.is_empty()).then_some(remaining);
        match self
            .api
            .patch_annotation(namespace, name, key, value, snapshot.resource_version)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => {
                warn!(
                    ingress = %qualified_name(namespace, name),
                    "Ingress deleted before the rule block could be removed"
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn check_no_foreign_delay(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        rule: &RuleBlock,
    ) -> Result<()> {
        let Some(snapshot) = self.read(namespace, name, key).await? else {
            return Ok(());
        };
        let foreign_delay = block::active_rules(&snapshot.value).into_iter().any(|active| {
            active.subtype == RuleSubtype::Delay && active.execution_id != rule.execution_id
        });
        if foreign_delay {
            let ingress = qualified_name(namespace, name);
            return Err(Error::conflict(
                ingress.clone(),
                format!(
                    "cannot start action: both delay and block actions are already active on ingress {} - they would interfere with each other",
                    ingress
                ),
            ));
        }
        Ok(())
    }

    /// Run `op` until it stops losing write races, then report exhaustion as transport failure
    async fn with_retries<T, F, Fut>(&self, operation: &str, ingress: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        retry_with_backoff_if(&self.retry, operation, Error::is_write_conflict, op)
            .await
            .map_err(|e| {
                if e.is_write_conflict() {
                    Error::transport_with_context(
                        operation,
                        format!(
                            "annotation on {} kept changing concurrently, gave up after {} attempts",
                            ingress, self.retry.max_attempts
                        ),
                    )
                } else {
                    e
                }
            })
    }
}

fn missing_ingress(namespace: &str, name: &str) -> Error {
    Error::validation(format!("ingress {} not found", qualified_name(namespace, name)))
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory ingress store with resource versions

    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use tollgate_common::Error;

    use crate::client::IngressApi;

    #[derive(Default)]
    struct State {
        annotations: BTreeMap<String, String>,
        version: u64,
        exists: bool,
        writes: u32,
        /// Annotation edits made by "another writer" right before our next patches
        interlopers: Vec<(String, String)>,
        /// Patches that fail with 409 regardless of version
        forced_conflicts: u32,
        /// The ingress is deleted right before our next patch
        delete_before_patch: bool,
    }

    pub(crate) struct FakeIngressApi {
        state: Mutex<State>,
    }

    fn conflict() -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }))
    }

    fn not_found() -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "ingresses.networking.k8s.io \"frontend\" not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        }))
    }

    impl FakeIngressApi {
        pub(crate) fn new() -> Self {
            Self {
                state: Mutex::new(State {
                    exists: true,
                    version: 1,
                    ..Default::default()
                }),
            }
        }

        pub(crate) fn missing() -> Self {
            let fake = Self::new();
            fake.state.lock().unwrap().exists = false;
            fake
        }

        pub(crate) fn with_annotation(self, key: &str, value: &str) -> Self {
            self.state
                .lock()
                .unwrap()
                .annotations
                .insert(key.to_string(), value.to_string());
            self
        }

        pub(crate) fn annotation(&self, key: &str) -> Option<String> {
            self.state.lock().unwrap().annotations.get(key).cloned()
        }

        pub(crate) fn writes(&self) -> u32 {
            self.state.lock().unwrap().writes
        }

        /// Another writer replaces `key` with `value` just before our next patch
        pub(crate) fn interleave(&self, key: &str, value: &str) {
            self.state
                .lock()
                .unwrap()
                .interlopers
                .push((key.to_string(), value.to_string()));
        }

        pub(crate) fn fail_next_patches(&self, count: u32) {
            self.state.lock().unwrap().forced_conflicts = count;
        }

        /// The ingress disappears between our next read and write
        pub(crate) fn delete_before_next_patch(&self) {
            self.state.lock().unwrap().delete_before_patch = true;
        }
    }

    #[async_trait]
    impl IngressApi for FakeIngressApi {
        async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, Error> {
            let state = self.state.lock().unwrap();
            if !state.exists {
                return Ok(None);
            }
            Ok(Some(Ingress {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    resource_version: Some(state.version.to_string()),
                    annotations: Some(state.annotations.clone()),
                    ..Default::default()
                },
                ..Default::default()
            }))
        }

        async fn patch_annotation(
            &self,
            _namespace: &str,
            _name: &str,
            key: &str,
            value: Option<String>,
            resource_version: Option<String>,
        ) -> Result<(), Error> {
            let mut state = self.state.lock().unwrap();
            if std::mem::take(&mut state.delete_before_patch) {
                state.exists = false;
            }
            if !state.exists {
                return Err(not_found());
            }
            if !state.interlopers.is_empty() {
                let (k, v) = state.interlopers.remove(0);
                state.annotations.insert(k, v);
                state.version += 1;
            }
            if state.forced_conflicts > 0 {
                state.forced_conflicts -= 1;
                return Err(conflict());
            }
            if let Some(rv) = resource_version {
                if rv != state.version.to_string() {
                    return Err(conflict());
                }
            }
            match value {
                Some(v) => state.annotations.insert(key.to_string(), v),
                None => state.annotations.remove(key),
            };
            state.version += 1;
            state.writes += 1;
            Ok(())
        }

        async fn get_ingress_class(&self, _name: &str) -> Result<Option<IngressClass>, Error> {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeIngressApi;
    use super::*;
    use crate::action::ActionParameters;
    use crate::block::ExecutionId;
    use crate::dialect::{generate_rule, Dialect};
    use crate::matcher::RequestMatcher;
    use std::time::Duration;

    const NS: &str = "shop";
    const NAME: &str = "frontend";

    fn key() -> &'static str {
        Dialect::HaProxy.annotation_key()
    }

    fn fast_retry(attempts: u32) -> RetryConfig {
        RetryConfig::with_max_attempts(attempts).initial_delay(Duration::from_millis(1))
    }

    fn rule(path: &str, params: ActionParameters) -> RuleBlock {
        let matcher = RequestMatcher {
            path_pattern: Some(path.to_string()),
            ..Default::default()
        };
        generate_rule(Dialect::HaProxy, &matcher, &params, ExecutionId::new_v4())
    }

    fn block_rule(path: &str) -> RuleBlock {
        rule(path, ActionParameters::Block { status_code: 503 })
    }

    fn delay_rule(path: &str) -> RuleBlock {
        rule(
            path,
            ActionParameters::Delay {
                delay: Duration::from_millis(300),
            },
        )
    }

    #[tokio::test]
    async fn insert_then_remove_restores_original_text() {
        let api = FakeIngressApi::new().with_annotation(key(), "timeout server 5s");
        let mutator = AnnotationMutator::new(&api, fast_retry(3));
        let rule = block_rule("/api");

        mutator.insert(NS, NAME, key(), &rule).await.unwrap();
        assert_eq!(
            api.annotation(key()),
            Some(format!("{}\ntimeout server 5s", rule.fragment()))
        );

        assert!(mutator.remove(NS, NAME, key(), &rule).await.unwrap());
        assert_eq!(api.annotation(key()).as_deref(), Some("timeout server 5s"));
    }

    #[tokio::test]
    async fn removing_last_block_deletes_the_key() {
        let api = FakeIngressApi::new();
        let mutator = AnnotationMutator::new(&api, fast_retry(3));
        let rule = block_rule("/api");

        mutator.insert(NS, NAME, key(), &rule).await.unwrap();
        assert_eq!(api.annotation(key()), Some(rule.fragment()));

        mutator.remove(NS, NAME, key(), &rule).await.unwrap();
        assert_eq!(api.annotation(key()), None);
    }

    #[tokio::test]
    async fn second_stop_is_a_no_op_without_write() {
        let api = FakeIngressApi::new().with_annotation(key(), "option httplog");
        let mutator = AnnotationMutator::new(&api, fast_retry(3));
        let rule = block_rule("/api");

        mutator.insert(NS, NAME, key(), &rule).await.unwrap();
        assert!(mutator.remove(NS, NAME, key(), &rule).await.unwrap());
        let writes = api.writes();

        assert!(!mutator.remove(NS, NAME, key(), &rule).await.unwrap());
        assert_eq!(api.writes(), writes);
        assert_eq!(api.annotation(key()).as_deref(), Some("option httplog"));
    }

    #[tokio::test]
    async fn stop_without_start_and_on_missing_ingress_succeeds() {
        let api = FakeIngressApi::new();
        let mutator = AnnotationMutator::new(&api, fast_retry(3));
        assert!(!mutator.remove(NS, NAME, key(), &block_rule("/a")).await.unwrap());

        let gone = FakeIngressApi::missing();
        let mutator = AnnotationMutator::new(&gone, fast_retry(3));
        assert!(!mutator.remove(NS, NAME, key(), &block_rule("/a")).await.unwrap());
        assert_eq!(gone.writes(), 0);
    }

    #[tokio::test]
    async fn stop_tolerates_ingress_deleted_between_read_and_write() {
        let rule = block_rule("/a");
        let api = FakeIngressApi::new().with_annotation(key(), &rule.fragment());
        let mutator = AnnotationMutator::new(&api, fast_retry(3));
        api.delete_before_next_patch();

        assert!(!mutator.remove(NS, NAME, key(), &rule).await.unwrap());
        assert_eq!(api.writes(), 0);
    }

    #[tokio::test]
    async fn start_on_ingress_deleted_between_read_and_write_fails() {
        let api = FakeIngressApi::new();
        let mutator = AnnotationMutator::new(&api, fast_retry(3));
        api.delete_before_next_patch();

        let err = mutator.insert(NS, NAME, key(), &block_rule("/a")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn stopping_one_execution_leaves_the_other_untouched() {
        let api = FakeIngressApi::new();
        let mutator = AnnotationMutator::new(&api, fast_retry(3));
        let first = block_rule("/a");
        let second = block_rule("/b");

        mutator.insert(NS, NAME, key(), &first).await.unwrap();
        mutator.insert(NS, NAME, key(), &second).await.unwrap();
        mutator.remove(NS, NAME, key(), &first).await.unwrap();

        assert_eq!(api.annotation(key()), Some(second.fragment()));
    }

    #[tokio::test]
    async fn concurrent_write_is_not_lost() {
        let other = block_rule("/other");
        let api = FakeIngressApi::new();
        api.interleave(key(), &other.fragment());
        let mutator = AnnotationMutator::new(&api, fast_retry(3));
        let ours = block_rule("/ours");

        mutator.insert(NS, NAME, key(), &ours).await.unwrap();

        let text = api.annotation(key()).unwrap();
        assert!(block::contains_block(&text, &ours.markers));
        assert!(block::contains_block(&text, &other.markers));
    }

    #[tokio::test]
    async fn exhausted_retries_become_transport_error() {
        let api = FakeIngressApi::new();
        api.fail_next_patches(10);
        let mutator = AnnotationMutator::new(&api, fast_retry(2));

        let err = mutator
            .insert(NS, NAME, key(), &block_rule("/a"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }), "{err:?}");
        assert!(err.to_string().contains("gave up after 2 attempts"));
        assert_eq!(api.writes(), 0);
    }

    #[tokio::test]
    async fn block_after_foreign_delay_is_a_conflict_and_stays_written() {
        let delay = delay_rule("/slow");
        let api = FakeIngressApi::new().with_annotation(key(), &delay.fragment());
        let mutator = AnnotationMutator::new(&api, fast_retry(3));
        let block = block_rule("/fail");

        let err = mutator.insert(NS, NAME, key(), &block).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("both delay and block actions are already active on ingress shop/frontend"));
        assert!(block::contains_block(&api.annotation(key()).unwrap(), &block.markers));

        mutator.remove(NS, NAME, key(), &block).await.unwrap();
        assert_eq!(api.annotation(key()), Some(delay.fragment()));
    }

    #[tokio::test]
    async fn delay_next_to_block_is_allowed() {
        let block = block_rule("/fail");
        let api = FakeIngressApi::new().with_annotation(key(), &block.fragment());
        let mutator = AnnotationMutator::new(&api, fast_retry(3));

        mutator.insert(NS, NAME, key(), &delay_rule("/slow")).await.unwrap();
        let rules = mutator.active_rules(NS, NAME, key()).await.unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].subtype, RuleSubtype::Delay);
    }

    #[tokio::test]
    async fn insert_on_missing_ingress_is_a_validation_error() {
        let api = FakeIngressApi::missing();
        let mutator = AnnotationMutator::new(&api, fast_retry(3));
        let err = mutator
            .insert(NS, NAME, key(), &block_rule("/a"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ingress shop/frontend not found"));
    }

    #[tokio::test]
    async fn repeated_insert_is_idempotent() {
        let api = FakeIngressApi::new();
        let mutator = AnnotationMutator::new(&api, fast_retry(3));
        let rule = block_rule("/a");

        mutator.insert(NS, NAME, key(), &rule).await.unwrap();
        mutator.insert(NS, NAME, key(), &rule).await.unwrap();
        assert_eq!(api.annotation(key()), Some(rule.fragment()));
        assert_eq!(api.writes(), 1);
    }
}
