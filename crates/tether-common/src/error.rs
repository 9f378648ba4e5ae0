//! Error types for tether
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the resource or secret it concerns so that a
//! per-resource apply outcome or a degraded condition can name its target.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for tether operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Target object does not exist
    #[error("{kind} {name:?} not found")]
    NotFound {
        /// Kind of the missing object
        kind: String,
        /// Name (and namespace, when namespaced) of the missing object
        name: String,
    },

    /// Optimistic-concurrency collision on write
    #[error("conflict writing {kind} {name:?}: the object has been modified")]
    Conflict {
        /// Kind of the object being written
        kind: String,
        /// Name of the object being written
        name: String,
    },

    /// Malformed credential or connection configuration
    #[error("config error: {message}")]
    Config {
        /// Description of what is malformed
        message: String,
    },

    /// Desired manifest names a kind that has no apply strategy
    #[error("unsupported resource kind {kind:?}")]
    UnsupportedResourceKind {
        /// The kind tag found in the manifest
        kind: String,
    },

    /// Desired manifest could not be resolved
    #[error("manifest {key:?}: {message}")]
    Manifest {
        /// Lookup key passed to the resolver
        key: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "probe", "controller")
        context: String,
    },
}

impl Error {
    /// Create a not-found error for the given kind and name
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error for the given kind and name
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an unsupported-kind error
    pub fn unsupported_kind(kind: impl Into<String>) -> Self {
        Self::UnsupportedResourceKind { kind: kind.into() }
    }

    /// Create a manifest resolution error
    pub fn manifest(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Manifest {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether the target was absent, either reported by us or by the API server
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// Whether a write lost an optimistic-concurrency race
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// Check if this error is retryable
    ///
    /// Config, manifest, unsupported-kind and serialization errors need a
    /// change to the inputs before a retry can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // 409 is retried by re-reading; other 4xx need input changes
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
                )
            }
            Error::NotFound { .. } => false,
            Error::Conflict { .. } => true,
            Error::Config { .. } => false,
            Error::UnsupportedResourceKind { .. } => false,
            Error::Manifest { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}
