//! Database cluster interface.
//!
//! Node health, decommissioning and bootstrap are issued over the database's
//! own client protocol. The engine only needs request/response semantics, so
//! the protocol lives behind `DatabaseClient`.

use std::time::Duration;

use async_trait::async_trait;
use crdb_api::ClusterKey;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    /// No node answered.
    #[error("database unavailable: {0}")]
    Unavailable(String),

    /// `init` was sent to a cluster that is already bootstrapped.
    #[error("cluster already initialized")]
    AlreadyInitialized,

    #[error("unknown node {0}")]
    UnknownNode(i32),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("query failed: {0}")]
    Query(String),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// One row of the node status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub node_id: i32,
    /// Advertised address, `<pod>.<service>.<namespace>:<port>`.
    pub address: String,
    pub is_live: bool,
    pub is_decommissioning: bool,
    /// Replicas still held by the node.
    pub replica_count: i64,
    pub under_replicated_ranges: i64,
    /// Build tag reported by the node binary, e.g. `v19.2.6`.
    pub build_tag: String,
}

#[async_trait]
pub trait DatabaseClient: Send + Sync {
    async fn is_initialized(&self, key: &ClusterKey) -> DatabaseResult<bool>;

    async fn node_statuses(&self, key: &ClusterKey) -> DatabaseResult<Vec<NodeStatus>>;

    /// Bootstrap a fresh cluster (`cockroach init`).
    async fn init_cluster(&self, key: &ClusterKey) -> DatabaseResult<()>;

    /// Start draining a node. Re-issuing for a draining node is a no-op.
    async fn decommission(&self, key: &ClusterKey, node_id: i32) -> DatabaseResult<()>;

    /// Current `cluster.preserve_downgrade_option`, if set.
    async fn preserve_downgrade(&self, key: &ClusterKey) -> DatabaseResult<Option<String>>;

    async fn set_preserve_downgrade(&self, key: &ClusterKey, series: &str) -> DatabaseResult<()>;

    /// Clear the downgrade option, finalizing an upgrade.
    async fn reset_preserve_downgrade(&self, key: &ClusterKey) -> DatabaseResult<()>;
}
