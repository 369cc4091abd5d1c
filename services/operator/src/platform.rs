//! Container-platform interface.
//!
//! The engine never talks to the orchestration platform directly. Everything
//! it reads or writes goes through the `Platform` trait, which the embedding
//! manager implements on top of its API client. Objects are reduced to the
//! fields the engine reasons about.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use crdb_api::{ClusterKey, ClusterStatus, CrdbCluster, Version};
use crdb_reconcile::SpecHash;
use serde_json::json;
use thiserror::Error;

/// Errors returned by platform calls.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic-concurrency check failed: someone else wrote first.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("platform unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type PlatformResult<T> = Result<T, PlatformError>;

/// Pod template of the stateful workload.
///
/// Every field is part of `spec_hash`, so a change to any of them rolls
/// the pods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodTemplate {
    pub image: String,
    pub pull_policy: String,
    pub args: Vec<String>,
    /// Secret mounted as the node certificate directory.
    pub tls_secret: Option<String>,
    pub grpc_port: i32,
    pub http_port: i32,
}

impl PodTemplate {
    pub fn spec_hash(&self) -> SpecHash {
        SpecHash::from_json(&json!({
            "image": self.image,
            "pullPolicy": self.pull_policy,
            "args": self.args,
            "tlsSecret": self.tls_secret,
            "grpcPort": self.grpc_port,
            "httpPort": self.http_port,
        }))
    }

    pub fn version(&self) -> Option<Version> {
        Version::from_image(&self.image).ok()
    }
}

/// Per-node volume claim template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeClaimTemplate {
    pub storage_class: String,
    pub capacity: String,
}

/// The stateful workload descriptor, one per cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatefulSet {
    pub name: String,
    pub service_name: String,
    pub replicas: u32,
    /// Pods with an ordinal at or above the partition receive template
    /// updates; pods below it keep their current revision.
    pub partition: u32,
    pub template: PodTemplate,
    pub volume_claim: Option<VolumeClaimTemplate>,
}

impl StatefulSet {
    pub fn template_hash(&self) -> SpecHash {
        self.template.spec_hash()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// A running (or scheduled) database pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pod {
    pub name: String,
    pub ordinal: u32,
    pub phase: PodPhase,
    pub ready: bool,
    pub image: String,
    /// Hash of the template revision the pod was created from.
    pub template_hash: SpecHash,
}

impl Pod {
    pub fn is_running(&self) -> bool {
        self.phase == PodPhase::Running
    }

    pub fn version(&self) -> Option<Version> {
        Version::from_image(&self.image).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePort {
    pub name: String,
    pub port: i32,
}

/// Network endpoint for the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    /// Headless services give each pod a stable DNS name.
    pub headless: bool,
    pub ports: Vec<ServicePort>,
}

/// Opaque secret; values are PEM text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentVolumeClaim {
    pub name: String,
    pub ordinal: u32,
    pub storage_class: String,
    pub capacity: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageClass {
    pub name: String,
    pub is_default: bool,
    pub allow_volume_expansion: bool,
}

/// Platform operations used by the engine.
///
/// All calls scoped to a cluster take its key; object names inside the
/// namespace follow the conventions in `workload`.
#[async_trait]
pub trait Platform: Send + Sync {
    /// List every cluster resource the operator is responsible for.
    async fn list_clusters(&self) -> PlatformResult<Vec<ClusterKey>>;

    async fn get_cluster(&self, key: &ClusterKey) -> PlatformResult<Option<CrdbCluster>>;

    /// Replace the status subresource if `resource_version` still matches.
    ///
    /// Returns the new resource version, or `Conflict` if another writer got
    /// there first.
    async fn update_cluster_status(
        &self,
        key: &ClusterKey,
        resource_version: Option<&str>,
        status: &ClusterStatus,
    ) -> PlatformResult<String>;

    async fn get_stateful_set(&self, key: &ClusterKey) -> PlatformResult<Option<StatefulSet>>;

    /// Create the workload; `AlreadyExists` if it is already there.
    async fn create_stateful_set(&self, key: &ClusterKey, sts: &StatefulSet) -> PlatformResult<()>;

    async fn update_stateful_set(&self, key: &ClusterKey, sts: &StatefulSet) -> PlatformResult<()>;

    async fn list_pods(&self, key: &ClusterKey) -> PlatformResult<Vec<Pod>>;

    /// Create or replace a service.
    async fn apply_service(&self, key: &ClusterKey, service: &Service) -> PlatformResult<()>;

    async fn get_secret(&self, key: &ClusterKey, name: &str) -> PlatformResult<Option<Secret>>;

    /// Create or replace a secret.
    async fn apply_secret(&self, key: &ClusterKey, secret: &Secret) -> PlatformResult<()>;

    async fn list_pvcs(&self, key: &ClusterKey) -> PlatformResult<Vec<PersistentVolumeClaim>>;

    async fn resize_pvc(&self, key: &ClusterKey, name: &str, capacity: &str) -> PlatformResult<()>;

    async fn delete_pvc(&self, key: &ClusterKey, name: &str) -> PlatformResult<()>;

    async fn list_storage_classes(&self) -> PlatformResult<Vec<StorageClass>>;
}
