//! CrdbCluster custom resource definitions.
//!
//! This crate holds the user-facing declarative object the operator converges
//! on, along with the value types its fields are made of:
//!
//! - `cluster`: the `CrdbCluster` resource, its spec and its status
//! - `condition`: named, timestamped status conditions
//! - `version`: image tag parsing and the supported upgrade paths
//! - `quantity`: storage capacity strings such as `1Gi`
//!
//! Nothing here talks to a platform or a database; the types are plain data
//! with serde support so they round-trip through the platform API unchanged.

pub mod cluster;
pub mod condition;
pub mod error;
pub mod quantity;
pub mod version;

pub use cluster::{
    ClusterKey, ClusterSpec, ClusterStatus, CrdbCluster, DataStore, ImageSpec, ObjectMeta,
    PullPolicy, DEFAULT_CACHE, DEFAULT_GRPC_PORT, DEFAULT_HTTP_PORT, DEFAULT_MAX_SQL_MEMORY,
};
pub use condition::{Condition, ConditionStatus, ConditionType, ConditionUpdate};
pub use error::{ParseError, UpgradePathError};
pub use quantity::parse_quantity;
pub use version::{upgrade_path, ReleaseSeries, UpgradePath, Version};
