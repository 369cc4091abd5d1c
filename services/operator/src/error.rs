//! Error taxonomy for the reconcile engine.
//!
//! | Kind | Retried | Surfaced in status |
//! |------|---------|--------------------|
//! | `ValidationError` | no, until the spec changes | yes |
//! | `ObservationError` | yes, with backoff | no |
//! | `ReconcileError::Action` | yes, with backoff | as a False condition |
//! | `SafetyViolation` | yes, with backoff | yes (`SafetyHold`) |
//! | `ReconcileError::Conflict` | immediately, whole pass | no |
//!
//! Every error path ends in a requeue decision; nothing here stops the process.

use std::future::Future;
use std::time::Duration;

use crdb_api::{ParseError, UpgradePathError};
use thiserror::Error;

use crate::database::DatabaseError;
use crate::platform::PlatformError;

/// The desired spec cannot be acted on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("node count {nodes} is below the minimum of {minimum}")]
    NodeCountBelowMinimum { nodes: i32, minimum: u32 },

    #[error("image {image:?}: {source}")]
    MalformedVersion {
        image: String,
        #[source]
        source: ParseError,
    },

    #[error("storage capacity: {0}")]
    InvalidCapacity(#[source] ParseError),

    #[error("storage class {0:?} does not exist")]
    UnknownStorageClass(String),

    #[error("no storage class requested and the platform has no default")]
    NoDefaultStorageClass,

    #[error(transparent)]
    UnsupportedUpgrade(#[from] UpgradePathError),
}

impl ValidationError {
    /// Short machine-readable reason for the status condition.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NodeCountBelowMinimum { .. } => "NodeCountBelowMinimum",
            Self::MalformedVersion { .. } => "MalformedVersion",
            Self::InvalidCapacity(_) => "InvalidCapacity",
            Self::UnknownStorageClass(_) | Self::NoDefaultStorageClass => "UnknownStorageClass",
            Self::UnsupportedUpgrade(_) => "UnsupportedUpgradePath",
        }
    }
}

/// Current state could not be read.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObservationError {
    #[error("reading {what}: {source}")]
    Platform {
        what: &'static str,
        #[source]
        source: PlatformError,
    },
}

/// A step would break one of the cluster's safety rules.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SafetyViolation {
    #[error("only {live} of {members} nodes are live, {required} needed for quorum")]
    QuorumLost {
        live: usize,
        members: usize,
        required: usize,
    },

    #[error("TLS is enabled but the certificate secrets are not ready")]
    CertificatesMissing,
}

impl SafetyViolation {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::QuorumLost { .. } => "QuorumLost",
            Self::CertificatesMissing => "CertificatesMissing",
        }
    }
}

/// Everything a reconcile pass can fail with.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Observation(#[from] ObservationError),

    #[error("{operation} failed: {message}")]
    Action {
        operation: &'static str,
        message: String,
    },

    #[error("refusing to proceed: {0}")]
    Safety(#[from] SafetyViolation),

    #[error("write conflict: {0}")]
    Conflict(String),
}

impl ReconcileError {
    pub(crate) fn from_platform(operation: &'static str, err: PlatformError) -> Self {
        match err {
            PlatformError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Action {
                operation,
                message: other.to_string(),
            },
        }
    }

    pub(crate) fn from_database(operation: &'static str, err: DatabaseError) -> Self {
        Self::Action {
            operation,
            message: err.to_string(),
        }
    }
}

/// Errors that can represent an elapsed deadline.
pub trait TimedOut {
    fn timed_out(operation: &'static str, after: Duration) -> Self;
}

impl TimedOut for PlatformError {
    fn timed_out(operation: &'static str, after: Duration) -> Self {
        PlatformError::Timeout { operation, after }
    }
}

impl TimedOut for DatabaseError {
    fn timed_out(operation: &'static str, after: Duration) -> Self {
        DatabaseError::Timeout { operation, after }
    }
}

/// Run an external call under a deadline.
pub async fn bounded<T, E, F>(limit: Duration, operation: &'static str, call: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: TimedOut,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(E::timed_out(operation, limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<(), PlatformError> = bounded(
            Duration::from_millis(10),
            "list_pods",
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(PlatformError::Timeout {
                operation: "list_pods",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let result: Result<u32, DatabaseError> =
            bounded(Duration::from_secs(1), "node_statuses", async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[test]
    fn test_conflict_maps_to_conflict() {
        let err = ReconcileError::from_platform(
            "update_stateful_set",
            PlatformError::Conflict("stale".to_string()),
        );
        assert_eq!(err, ReconcileError::Conflict("stale".to_string()));

        let err = ReconcileError::from_platform(
            "update_stateful_set",
            PlatformError::Unavailable("down".to_string()),
        );
        assert!(matches!(err, ReconcileError::Action { operation: "update_stateful_set", .. }));
    }
}
