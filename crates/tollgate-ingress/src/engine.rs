//! Prepare / Start / Stop phases of one traffic-shaping action
//!
//! Prepare validates everything and renders the rule without writing.
//! Start writes the rule, Stop removes it. Each phase re-reads the live
//! ingress; the only thing carried between phases is the [`RuleState`]
//! returned by Prepare.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

use tollgate_common::kube_utils::annotation;
use tollgate_common::{Error, Result};

use crate::action::ActionParameters;
use crate::block::{ActiveRule, ExecutionId, Markers, RuleSubtype};
use crate::client::{IngressApi, KubeClusterApi, PodApi};
use crate::config::EngineConfig;
use crate::conflict::detect_conflicts;
use crate::dialect::{generate_rule, Dialect, ProxyFamily, RuleBlock};
use crate::matcher::{parse_request_matcher, RequestMatcher};
use crate::mutator::AnnotationMutator;
use crate::target::{IngressTarget, TargetAttributes};
use crate::verifier::ModuleVerifier;

/// Action parameter forcing the enterprise NGINX annotation
pub const IS_ENTERPRISE_NGINX: &str = "isEnterpriseNginx";

/// Everything Prepare needs for one action
#[derive(Clone, Debug)]
pub struct PrepareRequest {
    /// Proxy family the action targets
    pub family: ProxyFamily,
    /// Block or delay
    pub subtype: RuleSubtype,
    /// Discovery attributes of the target ingress
    pub attributes: TargetAttributes,
    /// Matcher and action parameters
    pub parameters: Map<String, Value>,
    /// Identity of this action invocation
    pub execution_id: ExecutionId,
}

/// Output of Prepare, input of Start and Stop
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleState {
    /// Namespace of the ingress
    pub namespace: String,
    /// Name of the ingress
    pub ingress: String,
    /// Annotation the rule lives in
    pub annotation_key: String,
    /// The rendered rule
    pub rule: RuleBlock,
}

impl RuleState {
    /// State for removing a block that some earlier execution left behind
    pub fn orphan(
        namespace: impl Into<String>,
        ingress: impl Into<String>,
        dialect: Dialect,
        subtype: RuleSubtype,
        execution_id: ExecutionId,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            ingress: ingress.into(),
            annotation_key: dialect.annotation_key().to_string(),
            rule: RuleBlock {
                execution_id,
                subtype,
                dialect,
                body: String::new(),
                markers: Markers::new(subtype, &execution_id),
            },
        }
    }
}

/// Resolve the dialect: enterprise NGINX when discovery saw its controller
/// or the caller asked for it
pub fn resolve_dialect(
    family: ProxyFamily,
    target: &IngressTarget,
    parameters: &Map<String, Value>,
) -> Dialect {
    let requested = match parameters.get(IS_ENTERPRISE_NGINX) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    };
    Dialect::for_family(family, requested || target.is_enterprise_nginx())
}

/// Parse matcher and action parameters and render the rule, without a cluster
pub fn render_rule(
    dialect: Dialect,
    subtype: RuleSubtype,
    parameters: &Map<String, Value>,
    execution_id: ExecutionId,
) -> Result<(RequestMatcher, RuleBlock)> {
    let matcher = parse_request_matcher(parameters)?;
    let action = ActionParameters::parse(subtype, parameters)?;
    let rule = generate_rule(dialect, &matcher, &action, execution_id);
    Ok((matcher, rule))
}

/// Runs the phases of traffic-shaping actions against a cluster
#[derive(Clone)]
pub struct TrafficShaper {
    ingresses: Arc<dyn IngressApi>,
    pods: Arc<dyn PodApi>,
    config: EngineConfig,
}

impl TrafficShaper {
    /// Create a shaper over explicit API implementations
    pub fn new(ingresses: Arc<dyn IngressApi>, pods: Arc<dyn PodApi>, config: EngineConfig) -> Self {
        Self {
            ingresses,
            pods,
            config,
        }
    }

    /// Create a shaper that talks to the cluster through `client`
    pub fn from_client(client: kube::Client, config: EngineConfig) -> Self {
        let api = Arc::new(KubeClusterApi::new(client));
        Self::new(api.clone(), api, config)
    }

    fn mutator(&self) -> AnnotationMutator<'_> {
        AnnotationMutator::new(self.ingresses.as_ref(), self.config.write_retry())
    }

    /// Validate the action against the live ingress and render its rule.
    ///
    /// Never writes. Fails on invalid parameters, a missing ingress, a
    /// conflicting rule, or (NGINX delay only) a missing sleep module.
    #[instrument(skip(self, request), fields(execution_id = %request.execution_id, subtype = %request.subtype))]
    pub async fn prepare(&self, request: PrepareRequest) -> Result<RuleState> {
        let target = IngressTarget::from_attributes(&request.attributes)?;
        let dialect = resolve_dialect(request.family, &target, &request.parameters);
        let (matcher, rule) = render_rule(
            dialect,
            request.subtype,
            &request.parameters,
            request.execution_id,
        )?;

        let ingress = self
            .ingresses
            .get_ingress(&target.namespace, &target.name)
            .await?
            .ok_or_else(|| {
                Error::validation(format!("ingress {} not found", target.qualified_name()))
            })?;

        let key = dialect.annotation_key();
        let existing = annotation(&ingress.metadata, key).unwrap_or_default();
        detect_conflicts(
            &target.qualified_name(),
            dialect,
            existing,
            &matcher,
            request.subtype,
        )?;

        if dialect.family() == ProxyFamily::Nginx && request.subtype == RuleSubtype::Delay {
            if self.config.skip_module_verification {
                debug!(ingress = %target.qualified_name(), "Sleep module verification skipped");
            } else {
                ModuleVerifier::new(self.ingresses.as_ref(), self.pods.as_ref())
                    .verify(&ingress, &target)
                    .await?;
            }
        }

        info!(ingress = %target.qualified_name(), %dialect, "Action prepared");
        Ok(RuleState {
            namespace: target.namespace,
            ingress: target.name,
            annotation_key: key.to_string(),
            rule,
        })
    }

    /// Write the prepared rule into the ingress annotation
    #[instrument(skip(self, state), fields(ingress = %state.ingress, execution_id = %state.rule.execution_id))]
    pub async fn start(&self, state: &RuleState) -> Result<()> {
        self.mutator()
            .insert(&state.namespace, &state.ingress, &state.annotation_key, &state.rule)
            .await
    }

    /// Remove the rule again; safe to call any number of times
    #[instrument(skip(self, state), fields(ingress = %state.ingress, execution_id = %state.rule.execution_id))]
    pub async fn stop(&self, state: &RuleState) -> Result<bool> {
        self.mutator()
            .remove(&state.namespace, &state.ingress, &state.annotation_key, &state.rule)
            .await
    }

    /// Rule blocks currently present in `dialect`'s annotation of an ingress
    pub async fn active_rules(
        &self,
        namespace: &str,
        ingress: &str,
        dialect: Dialect,
    ) -> Result<Vec<ActiveRule>> {
        self.mutator()
            .active_rules(namespace, ingress, dialect.annotation_key())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockPodApi;
    use crate::matcher::MISSING_CONDITION_MESSAGE;
    use crate::mutator::fake::FakeIngressApi;
    use crate::target::{
        ATTR_INGRESS, ATTR_INGRESS_CLASS, ATTR_INGRESS_CONTROLLER, ATTR_NAMESPACE,
        NGINX_ENTERPRISE_CONTROLLER,
    };
    use serde_json::json;
    use std::time::Duration;

    const ZERO: &str = "00000000-0000-0000-0000-000000000000";

    fn attributes(extra: &[(&str, &str)]) -> TargetAttributes {
        [(ATTR_NAMESPACE, "shop"), (ATTR_INGRESS, "frontend")]
            .iter()
            .chain(extra.iter())
            .map(|(k, v)| (k.to_string(), vec![v.to_string()]))
            .collect()
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn request(family: ProxyFamily, subtype: RuleSubtype, parameters: Value) -> PrepareRequest {
        PrepareRequest {
            family,
            subtype,
            attributes: attributes(&[]),
            parameters: params(parameters),
            execution_id: ZERO.parse().unwrap(),
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            retry_initial_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn shaper(api: Arc<FakeIngressApi>, config: EngineConfig) -> TrafficShaper {
        TrafficShaper::new(api, Arc::new(MockPodApi::new()), config)
    }

    #[tokio::test]
    async fn block_without_conditions_is_rejected() {
        let shaper = shaper(Arc::new(FakeIngressApi::new()), config());
        let err = shaper
            .prepare(request(
                ProxyFamily::Haproxy,
                RuleSubtype::Block,
                json!({"responseStatusCode": 503}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains(MISSING_CONDITION_MESSAGE));
    }

    #[tokio::test]
    async fn nginx_delay_with_skipped_verification_renders_expected_fragment() {
        let shaper = shaper(
            Arc::new(FakeIngressApi::new()),
            EngineConfig {
                skip_module_verification: true,
                ..config()
            },
        );
        let state = shaper
            .prepare(request(
                ProxyFamily::Nginx,
                RuleSubtype::Delay,
                json!({"conditionPathPattern": "/api/.*", "responseDelay": 500}),
            ))
            .await
            .unwrap();

        let fragment = state.rule.fragment();
        assert_eq!(state.annotation_key, "nginx.ingress.kubernetes.io/configuration-snippet");
        assert!(fragment.starts_with(&format!("# BEGIN STEADYBIT - Delay - {}", ZERO)));
        assert!(fragment.ends_with(&format!("# END STEADYBIT - Delay - {}", ZERO)));
        assert!(fragment.contains("if ($request_uri !~* /api/.*) {"));
        assert!(fragment.contains("set $steadybit_delay_ms_00000000000000000000000000000000 500;"));
        assert!(fragment.contains("steadybit_sleep_ms $steadybit_delay_ms_"));
    }

    #[tokio::test]
    async fn nginx_delay_fails_verification_without_writing() {
        let api = Arc::new(FakeIngressApi::new());
        let shaper = shaper(api.clone(), config());
        let mut request = request(
            ProxyFamily::Nginx,
            RuleSubtype::Delay,
            json!({"conditionPathPattern": "/api/.*", "responseDelay": 500}),
        );
        request.attributes = attributes(&[(ATTR_INGRESS_CLASS, "nginx")]);

        let err = shaper.prepare(request).await.unwrap_err();
        assert!(matches!(err, Error::Verification { .. }), "{err:?}");
        assert!(err.to_string().contains("ingress class nginx not found"));
        assert_eq!(api.writes(), 0);
    }

    #[tokio::test]
    async fn same_path_twice_conflicts_but_other_path_passes() {
        let api = Arc::new(FakeIngressApi::new());
        let shaper = shaper(api.clone(), config());
        let block = |path: &str, id: &str| PrepareRequest {
            execution_id: id.parse().unwrap(),
            ..request(
                ProxyFamily::Haproxy,
                RuleSubtype::Block,
                json!({"conditionPathPattern": path, "responseStatusCode": 503}),
            )
        };

        let first = shaper
            .prepare(block("/api/.*", "11111111-1111-1111-1111-111111111111"))
            .await
            .unwrap();
        shaper.start(&first).await.unwrap();

        let err = shaper
            .prepare(block("/api/.*", "22222222-2222-2222-2222-222222222222"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        shaper
            .prepare(block("/admin", "33333333-3333-3333-3333-333333333333"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn prepare_never_writes() {
        let api = Arc::new(FakeIngressApi::new());
        let shaper = shaper(api.clone(), config());
        shaper
            .prepare(request(
                ProxyFamily::Haproxy,
                RuleSubtype::Delay,
                json!({"conditionHttpMethod": "GET", "responseDelay": "250"}),
            ))
            .await
            .unwrap();
        assert_eq!(api.writes(), 0);
    }

    #[tokio::test]
    async fn second_delay_is_rejected_across_dialects() {
        let existing = render_rule(
            Dialect::HaProxy,
            RuleSubtype::Delay,
            &params(json!({"conditionPathPattern": "/a", "responseDelay": 100})),
            ExecutionId::new_v4(),
        )
        .unwrap()
        .1
        .fragment();
        let api = Arc::new(
            FakeIngressApi::new()
                .with_annotation(Dialect::NginxOpenSource.annotation_key(), &existing),
        );
        let shaper = shaper(
            api,
            EngineConfig {
                skip_module_verification: true,
                ..config()
            },
        );

        let err = shaper
            .prepare(request(
                ProxyFamily::Nginx,
                RuleSubtype::Delay,
                json!({"conditionPathPattern": "/b", "responseDelay": 100}),
            ))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("a delay rule already exists"));
    }

    #[tokio::test]
    async fn enterprise_controller_uses_server_snippets() {
        let api = Arc::new(FakeIngressApi::new());
        let shaper = shaper(api.clone(), config());
        let state = shaper
            .prepare(PrepareRequest {
                attributes: attributes(&[(ATTR_INGRESS_CONTROLLER, NGINX_ENTERPRISE_CONTROLLER)]),
                ..request(
                    ProxyFamily::Nginx,
                    RuleSubtype::Block,
                    json!({"conditionPathPattern": "/x", "responseStatusCode": 418}),
                )
            })
            .await
            .unwrap();
        assert_eq!(state.rule.dialect, Dialect::NginxEnterprise);

        shaper.start(&state).await.unwrap();
        assert_eq!(
            api.annotation("nginx.org/server-snippets"),
            Some(state.rule.fragment())
        );
    }

    #[test]
    fn enterprise_flag_parameter() {
        let target = IngressTarget::from_attributes(&attributes(&[])).unwrap();
        assert_eq!(
            resolve_dialect(ProxyFamily::Nginx, &target, &params(json!({"isEnterpriseNginx": true}))),
            Dialect::NginxEnterprise
        );
        assert_eq!(
            resolve_dialect(ProxyFamily::Nginx, &target, &params(json!({"isEnterpriseNginx": "false"}))),
            Dialect::NginxOpenSource
        );
        assert_eq!(
            resolve_dialect(ProxyFamily::Haproxy, &target, &params(json!({"isEnterpriseNginx": true}))),
            Dialect::HaProxy
        );
    }

    #[tokio::test]
    async fn full_lifecycle_and_repeated_stop() {
        let api = Arc::new(FakeIngressApi::new().with_annotation(
            Dialect::HaProxy.annotation_key(),
            "http-response set-header X-Frame-Options DENY",
        ));
        let shaper = shaper(api.clone(), config());
        let state = shaper
            .prepare(request(
                ProxyFamily::Haproxy,
                RuleSubtype::Block,
                json!({"conditionPathPattern": "/checkout", "responseStatusCode": 503}),
            ))
            .await
            .unwrap();

        shaper.start(&state).await.unwrap();
        assert_eq!(
            shaper
                .active_rules("shop", "frontend", Dialect::HaProxy)
                .await
                .unwrap()
                .len(),
            1
        );

        assert!(shaper.stop(&state).await.unwrap());
        assert!(!shaper.stop(&state).await.unwrap());
        assert_eq!(
            api.annotation(Dialect::HaProxy.annotation_key()).as_deref(),
            Some("http-response set-header X-Frame-Options DENY")
        );
    }

    #[tokio::test]
    async fn orphan_state_removes_leftover_block() {
        let api = Arc::new(FakeIngressApi::new());
        let shaper = shaper(api.clone(), config());
        let state = shaper
            .prepare(request(
                ProxyFamily::Haproxy,
                RuleSubtype::Block,
                json!({"conditionPathPattern": "/x", "responseStatusCode": 500}),
            ))
            .await
            .unwrap();
        shaper.start(&state).await.unwrap();

        let orphan = RuleState::orphan(
            "shop",
            "frontend",
            Dialect::HaProxy,
            RuleSubtype::Block,
            ZERO.parse().unwrap(),
        );
        assert!(shaper.stop(&orphan).await.unwrap());
        assert_eq!(api.annotation(Dialect::HaProxy.annotation_key()), None);
    }

    #[test]
    fn rule_state_serializes_for_handover() {
        let (_, rule) = render_rule(
            Dialect::HaProxy,
            RuleSubtype::Block,
            &params(json!({"conditionHttpMethod": "post", "responseStatusCode": 503})),
            ZERO.parse().unwrap(),
        )
        .unwrap();
        let state = RuleState {
            namespace: "shop".to_string(),
            ingress: "frontend".to_string(),
            annotation_key: Dialect::HaProxy.annotation_key().to_string(),
            rule,
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["annotationKey"], "haproxy.org/backend-config-snippet");
        assert_eq!(json["rule"]["executionId"], ZERO);

        let back: RuleState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
