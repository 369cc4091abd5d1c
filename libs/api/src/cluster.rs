//! The `CrdbCluster` resource.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::{apply_update, Condition, ConditionStatus, ConditionType, ConditionUpdate};

pub const DEFAULT_GRPC_PORT: i32 = 26257;
pub const DEFAULT_HTTP_PORT: i32 = 8080;
pub const DEFAULT_CACHE: &str = "25%";
pub const DEFAULT_MAX_SQL_MEMORY: &str = "25%";

/// Identity of a cluster: its namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Object metadata, the subset the operator reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    /// Incremented by the platform on every spec change.
    #[serde(default)]
    pub generation: i64,
    /// Opaque token for optimistic concurrency on writes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// The cluster custom resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdbCluster {
    pub metadata: ObjectMeta,
    pub spec: ClusterSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ClusterStatus>,
}

impl CrdbCluster {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: ClusterSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                generation: 1,
                resource_version: None,
            },
            spec,
            status: None,
        }
    }

    pub fn key(&self) -> ClusterKey {
        ClusterKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn status_or_default(&self) -> ClusterStatus {
        self.status.clone().unwrap_or_default()
    }
}

/// Desired cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Number of database nodes.
    pub nodes: i32,

    pub image: ImageSpec,

    #[serde(default)]
    pub tls_enabled: bool,

    pub data_store: DataStore,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc_port: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<i32>,

    /// Value for `--cache`, e.g. `25%` or `1GiB`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<String>,

    /// Value for `--max-sql-memory`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sql_memory: Option<String>,

    /// Extra flags passed to `cockroach start`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_args: Vec<String>,
}

/// Container image selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    pub name: String,
    #[serde(default)]
    pub pull_policy: PullPolicy,
}

impl ImageSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pull_policy: PullPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

impl PullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::IfNotPresent => "IfNotPresent",
            Self::Never => "Never",
        }
    }
}

/// Where node data lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum DataStore {
    /// Scratch storage that disappears with the pod.
    EmptyDir,
    /// One persistent volume claim per node.
    Persistent {
        capacity: String,
        #[serde(
            rename = "storageClass",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        storage_class: Option<String>,
    },
}

/// Observed state, written only by the reconcile driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub ready_replicas: i32,
    /// Lowest database version running in the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ClusterStatus {
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn is_true(&self, type_: ConditionType) -> bool {
        self.condition(type_)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Apply a condition update, keeping the list ordered and unique.
    pub fn set_condition(&mut self, update: ConditionUpdate, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        if !self.conditions.is_sorted_by_key(|c| c.type_) {
            self.conditions.sort_by_key(|c| c.type_);
            changed = true;
        }
        let before = self.conditions.len();
        self.conditions.dedup_by_key(|c| c.type_);
        changed |= before != self.conditions.len();

        apply_update(&mut self.conditions, update, now) || changed
    }
}
