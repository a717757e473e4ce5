//! Error types for Tollgate
//!
//! Errors are structured with fields to aid an operator resolving a failed
//! action by hand. Each variant names the ingress, rule, or pod involved.
//!
//! The categories map onto the phases of an action:
//! - `Validation` is raised during Prepare, before anything is written
//! - `Conflict` is raised during Prepare or Start when rules would collide
//! - `Verification` is raised during Prepare when a proxy capability is missing
//! - `Kube` and `Transport` can surface from any phase

use thiserror::Error;

/// Main error type for Tollgate operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Malformed or incomplete matcher, action parameter, or target
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The offending parameter (e.g., "conditionHttpHeader")
        field: Option<String>,
    },

    /// A colliding rule already exists, or two incompatible rules would coexist
    #[error("conflict on ingress {ingress}: {message}")]
    Conflict {
        /// Ingress in `namespace/name` form
        ingress: String,
        /// Description of the collision
        message: String,
    },

    /// A capability the rule depends on is not available in the proxy
    #[error(
        "verification error for ingress {ingress}: {message}{}",
        checked_suffix(pods_checked)
    )]
    Verification {
        /// Ingress in `namespace/name` form
        ingress: String,
        /// Description of what's missing
        message: String,
        /// Pods that were inspected, in `namespace/name` form
        pods_checked: Vec<String>,
    },

    /// API read/write or remote command failure not covered by `Kube`
    #[error("transport error [{context}]: {message}")]
    Transport {
        /// Description of what failed
        message: String,
        /// Operation that failed (e.g., "annotation-write", "pod-exec")
        context: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error naming the offending parameter
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a conflict error for an ingress
    pub fn conflict(ingress: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            ingress: ingress.into(),
            message: msg.into(),
        }
    }

    /// Create a verification error listing the pods that were inspected
    pub fn verification(
        ingress: impl Into<String>,
        msg: impl Into<String>,
        pods_checked: Vec<String>,
    ) -> Self {
        Self::Verification {
            ingress: ingress.into(),
            message: msg.into(),
            pods_checked,
        }
    }

    /// Create a transport error with context
    pub fn transport_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error came from talking to the cluster
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Kube { .. } | Error::Transport { .. })
    }

    /// Whether the API server rejected a write because the object changed underneath it
    pub fn is_write_conflict(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 409
        )
    }

    /// Whether the API server reported the object as missing
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 404
        )
    }
}

fn checked_suffix(pods_checked: &[String]) -> String {
    if pods_checked.is_empty() {
        String::new()
    } else {
        format!(" (pods checked: {})", pods_checked.join(", "))
    }
}
