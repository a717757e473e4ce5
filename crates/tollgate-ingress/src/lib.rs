//! Ingress traffic-shaping annotation engine
//!
//! Compiles a request matcher (path, method, header) and an action (block
//! with a status code, or delay) into HAProxy or NGINX configuration and
//! manages it as a marker-delimited block inside the controller's snippet
//! annotation on an Ingress.
//!
//! An action runs in three caller-driven phases on [`TrafficShaper`]:
//!
//! - **Prepare** parses and validates the parameters, reads the live
//!   ingress, rejects conflicting rules, verifies the NGINX sleep module for
//!   delay rules, and renders the [`RuleBlock`]. Nothing is written.
//! - **Start** prepends the block to the annotation.
//! - **Stop** removes exactly that block again. It is idempotent.
//!
//! Concurrent executions on one ingress are isolated by their execution id
//! and by optimistic concurrency on the ingress `resourceVersion`.

#![deny(missing_docs)]

pub mod action;
pub mod block;
pub mod client;
pub mod config;
pub mod conflict;
pub mod dialect;
pub mod engine;
pub mod matcher;
pub mod mutator;
pub mod target;
pub mod verifier;

pub use action::ActionParameters;
pub use block::{ActiveRule, ExecutionId, Markers, RuleSubtype};
pub use client::{IngressApi, KubeClusterApi, PodApi};
pub use config::EngineConfig;
pub use dialect::{Dialect, ProxyFamily, RuleBlock};
pub use engine::{render_rule, PrepareRequest, RuleState, TrafficShaper};
pub use matcher::{HeaderMatch, RequestMatcher};
pub use target::{IngressTarget, TargetAttributes};
