//! Common types for Tollgate: errors, retries, logging, and Kubernetes helpers

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager name used for every write Tollgate makes to the API server
pub const FIELD_MANAGER: &str = "tollgate";

/// Legacy annotation used to select an ingress class before `spec.ingressClassName`
pub const LEGACY_INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
