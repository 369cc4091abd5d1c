//! Convergence actors.
//!
//! Each actor owns one dimension of the cluster (certificates, bootstrap,
//! version, template rollout, size, membership, storage). The set is fixed
//! and ordered; a pass runs at most one actor, the first that reports itself
//! required.
//!
//! Actors are stateless. `is_required` is a pure function of the pass input,
//! and `act` must be safe to repeat: it either re-reads what it depends on or
//! only issues writes that are idempotent on the platform side.

pub mod certificate;
pub mod decommission;
pub mod initialize;
pub mod partitioned_update;
pub mod resize;
pub mod scale;
pub mod version_gate;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use crdb_api::{ClusterKey, ClusterStatus, ConditionType};

use crate::database::{DatabaseClient, DatabaseError};
use crate::error::{bounded, ReconcileError};
use crate::platform::{Platform, PlatformError, Secret, Service, StatefulSet};
use crate::resolver::TargetConfig;
use crate::snapshot::Snapshot;

pub use certificate::CertificateActor;
pub use decommission::DecommissionActor;
pub use initialize::InitializationActor;
pub use partitioned_update::PartitionedUpdateActor;
pub use resize::StorageResizeActor;
pub use scale::ScaleActor;
pub use version_gate::VersionGateActor;

// =============================================================================
// Core Types
// =============================================================================

/// Everything an actor may read during a pass.
#[derive(Clone, Copy)]
pub struct PassInput<'a> {
    pub key: &'a ClusterKey,
    pub snapshot: &'a Snapshot,
    pub target: &'a TargetConfig,
    pub status: &'a ClusterStatus,
}

/// Result of a single `act` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The step finished; the actor may still be required next pass.
    Completed { message: String },
    /// Waiting on the platform or the database.
    InProgress { message: String },
    /// The step could not be carried out.
    Failed { reason: String, message: String },
}

impl Outcome {
    pub fn completed(message: impl Into<String>) -> Self {
        Self::Completed {
            message: message.into(),
        }
    }

    pub fn in_progress(message: impl Into<String>) -> Self {
        Self::InProgress {
            message: message.into(),
        }
    }

    pub fn failed(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// A convergence unit.
#[async_trait]
pub trait Actor: Send + Sync {
    /// Actor name for logging.
    fn name(&self) -> &'static str;

    /// The condition this actor reports progress on.
    fn condition(&self) -> ConditionType;

    /// Whether `act` may start or restart database nodes in this pass.
    ///
    /// Such actors are refused while TLS is enabled and the certificate
    /// secrets are not all valid.
    fn starts_nodes(&self, _input: &PassInput<'_>) -> bool {
        false
    }

    /// Whether there is outstanding work for this actor.
    fn is_required(&self, input: &PassInput<'_>) -> bool;

    /// Perform one step.
    async fn act(
        &self,
        input: &PassInput<'_>,
        effects: &Effects<'_>,
    ) -> Result<Outcome, ReconcileError>;
}

/// The actor set, highest priority first.
pub static ACTOR_SET: [&dyn Actor; 7] = [
    &CertificateActor,
    &InitializationActor,
    &VersionGateActor,
    &PartitionedUpdateActor,
    &ScaleActor,
    &DecommissionActor,
    &StorageResizeActor,
];

/// What a pass should do.
#[derive(Clone, Copy)]
pub enum Plan {
    Act(&'static dyn Actor),
    Stable,
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Plan::Act(actor) => f.debug_tuple("Act").field(&actor.name()).finish(),
            Plan::Stable => f.write_str("Stable"),
        }
    }
}

/// Pick the first required actor.
pub fn plan(input: &PassInput<'_>) -> Plan {
    ACTOR_SET
        .iter()
        .copied()
        .find(|actor| actor.is_required(input))
        .map_or(Plan::Stable, Plan::Act)
}

// =============================================================================
// Effects
// =============================================================================

/// Side-effecting calls available to actors, each bounded by the API timeout.
pub struct Effects<'a> {
    pub platform: &'a dyn Platform,
    pub database: &'a dyn DatabaseClient,
    pub api_timeout: Duration,
}

impl Effects<'_> {
    pub async fn get_secret(
        &self,
        key: &ClusterKey,
        name: &str,
    ) -> Result<Option<Secret>, ReconcileError> {
        bounded(self.api_timeout, "get_secret", self.platform.get_secret(key, name))
            .await
            .map_err(|e| ReconcileError::from_platform("get_secret", e))
    }

    pub async fn apply_secret(&self, key: &ClusterKey, secret: &Secret) -> Result<(), ReconcileError> {
        bounded(
            self.api_timeout,
            "apply_secret",
            self.platform.apply_secret(key, secret),
        )
        .await
        .map_err(|e| ReconcileError::from_platform("apply_secret", e))
    }

    pub async fn apply_service(
        &self,
        key: &ClusterKey,
        service: &Service,
    ) -> Result<(), ReconcileError> {
        bounded(
            self.api_timeout,
            "apply_service",
            self.platform.apply_service(key, service),
        )
        .await
        .map_err(|e| ReconcileError::from_platform("apply_service", e))
    }

    /// Create the workload. An existing workload counts as success.
    pub async fn create_stateful_set(
        &self,
        key: &ClusterKey,
        sts: &StatefulSet,
    ) -> Result<(), ReconcileError> {
        match bounded(
            self.api_timeout,
            "create_stateful_set",
            self.platform.create_stateful_set(key, sts),
        )
        .await
        {
            Ok(()) | Err(PlatformError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(ReconcileError::from_platform("create_stateful_set", e)),
        }
    }

    pub async fn update_stateful_set(
        &self,
        key: &ClusterKey,
        sts: &StatefulSet,
    ) -> Result<(), ReconcileError> {
        bounded(
            self.api_timeout,
            "update_stateful_set",
            self.platform.update_stateful_set(key, sts),
        )
        .await
        .map_err(|e| ReconcileError::from_platform("update_stateful_set", e))
    }

    pub async fn resize_pvc(
        &self,
        key: &ClusterKey,
        name: &str,
        capacity: &str,
    ) -> Result<(), ReconcileError> {
        bounded(
            self.api_timeout,
            "resize_pvc",
            self.platform.resize_pvc(key, name, capacity),
        )
        .await
        .map_err(|e| ReconcileError::from_platform("resize_pvc", e))
    }

    /// Delete a volume claim. A claim that is already gone counts as success.
    pub async fn delete_pvc(&self, key: &ClusterKey, name: &str) -> Result<(), ReconcileError> {
        match bounded(self.api_timeout, "delete_pvc", self.platform.delete_pvc(key, name)).await {
            Ok(()) | Err(PlatformError::NotFound(_)) => Ok(()),
            Err(e) => Err(ReconcileError::from_platform("delete_pvc", e)),
        }
    }

    /// Bootstrap the cluster. An already bootstrapped cluster counts as success.
    pub async fn init_cluster(&self, key: &ClusterKey) -> Result<(), ReconcileError> {
        match bounded(self.api_timeout, "init_cluster", self.database.init_cluster(key)).await {
            Ok(()) | Err(DatabaseError::AlreadyInitialized) => Ok(()),
            Err(e) => Err(ReconcileError::from_database("init_cluster", e)),
        }
    }

    pub async fn decommission(&self, key: &ClusterKey, node_id: i32) -> Result<(), ReconcileError> {
        bounded(
            self.api_timeout,
            "decommission",
            self.database.decommission(key, node_id),
        )
        .await
        .map_err(|e| ReconcileError::from_database("decommission", e))
    }

    pub async fn set_preserve_downgrade(
        &self,
        key: &ClusterKey,
        series: &str,
    ) -> Result<(), ReconcileError> {
        bounded(
            self.api_timeout,
            "set_preserve_downgrade",
            self.database.set_preserve_downgrade(key, series),
        )
        .await
        .map_err(|e| ReconcileError::from_database("set_preserve_downgrade", e))
    }

    pub async fn reset_preserve_downgrade(&self, key: &ClusterKey) -> Result<(), ReconcileError> {
        bounded(
            self.api_timeout,
            "reset_preserve_downgrade",
            self.database.reset_preserve_downgrade(key),
        )
        .await
        .map_err(|e| ReconcileError::from_database("reset_preserve_downgrade", e))
    }
}
