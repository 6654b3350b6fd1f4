//! Error types for cluster-envcheck.
//!
//! Errors carry their own retry classification so the retry engine can decide
//! between backing off and failing fast without inspecting error strings.

use std::time::Duration;

use thiserror::Error;

use crate::check::{CaptureStage, CheckEvent, CheckPhase};
use crate::retry::{RetryStop, Retryable};

/// Main error type for environment check operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A raw object could not be normalized into a resource record
    #[error("malformed {kind} {}/{name}: {reason}", .namespace.as_deref().unwrap_or("-"))]
    MalformedResource {
        /// Kind the object was listed as
        kind: String,
        /// Namespace, when one could be read from the object
        namespace: Option<String>,
        /// Name, or `<unknown>` when the object has none
        name: String,
        /// What was wrong with the object
        reason: String,
    },

    /// The cluster API could not be reached or asked us to back off
    #[error("cluster API unavailable: {0}")]
    ApiUnavailable(String),

    /// The cluster API rejected our credentials
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Kubernetes API error that was not classified into a more specific variant
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// A retried operation stopped without succeeding
    #[error("{operation} failed after {attempts} attempt(s) in {elapsed:?} ({reason}){}", .last_error.as_ref().map(|e| format!(": {e}")).unwrap_or_default())]
    RetriesExhausted {
        /// Name of the retried operation
        operation: String,
        /// Why the retry engine stopped
        reason: RetryStop,
        /// Number of attempts made
        attempts: u32,
        /// Wall time spent across all attempts and waits
        elapsed: Duration,
        /// The last error the operation returned, if any attempt ran
        last_error: Option<Box<Error>>,
    },

    /// A snapshot could not be captured, so no report can be produced
    #[error("{stage} snapshot unavailable")]
    SnapshotUnavailable {
        /// Which side of the check failed
        stage: CaptureStage,
        /// Underlying capture failure
        #[source]
        source: Box<Error>,
    },

    /// A check handle was used out of order or reused
    #[error("invalid check state: {event} is not allowed in phase {phase} (check {check_id})")]
    InvalidCheckState {
        /// Check identifier
        check_id: String,
        /// Phase the handle was in
        phase: CheckPhase,
        /// Event that was attempted
        event: CheckEvent,
    },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an API-unavailable error with the given message
    pub fn api_unavailable(msg: impl Into<String>) -> Self {
        Self::ApiUnavailable(msg.into())
    }

    /// Create a malformed-resource error
    pub fn malformed(
        kind: impl Into<String>,
        namespace: Option<String>,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::MalformedResource {
            kind: kind.into(),
            namespace,
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Classify a kube client error into the variant the retry engine understands.
    ///
    /// Authentication failures become `Unauthorized`, throttling, server errors,
    /// expired list continuations and transport failures become `ApiUnavailable`.
    /// Everything else is kept as `Kube`.
    pub fn from_kube(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 401 || resp.code == 403 => {
                Self::Unauthorized(err.to_string())
            }
            kube::Error::Api(resp) if resp.code == 429 || resp.code == 410 || resp.code >= 500 => {
                Self::ApiUnavailable(err.to_string())
            }
            kube::Error::Service(_) | kube::Error::HyperError(_) => {
                Self::ApiUnavailable(err.to_string())
            }
            _ => Self::Kube(err),
        }
    }

    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ApiUnavailable(_) => true,
            Error::Kube(e) => {
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429 || api_err.code == 410
                ) || matches!(e, kube::Error::Service(_) | kube::Error::HyperError(_))
            }
            Error::MalformedResource { .. }
            | Error::Unauthorized(_)
            | Error::RetriesExhausted { .. }
            | Error::SnapshotUnavailable { .. }
            | Error::InvalidCheckState { .. }
            | Error::Config(_)
            | Error::Serialization(_)
            | Error::Yaml(_) => false,
        }
    }
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        Error::is_retryable(self)
    }
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
