//! Point-in-time view of one cluster.
//!
//! A `Snapshot` is assembled by the observer at the start of every pass and
//! never mutated afterwards. Actors decide whether they are required from the
//! snapshot alone.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use crdb_api::{ClusterKey, Version};

use crate::platform::{PersistentVolumeClaim, Pod, StatefulSet, StorageClass};

/// Health of one certificate secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretState {
    Absent,
    /// Present but unusable: missing keys, unparseable PEM, or issued by a
    /// different CA.
    Invalid,
    Valid,
}

impl SecretState {
    pub fn is_valid(&self) -> bool {
        *self == SecretState::Valid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Certificates {
    pub ca: SecretState,
    pub node: SecretState,
    pub client: SecretState,
}

impl Certificates {
    pub fn all_valid(&self) -> bool {
        self.ca.is_valid() && self.node.is_valid() && self.client.is_valid()
    }
}

impl Default for Certificates {
    fn default() -> Self {
        Self {
            ca: SecretState::Absent,
            node: SecretState::Absent,
            client: SecretState::Absent,
        }
    }
}

/// One database node as seen through the node status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHealth {
    pub node_id: i32,
    /// Pod ordinal, when the advertised address maps to one of ours.
    pub ordinal: Option<u32>,
    pub is_live: bool,
    pub is_decommissioning: bool,
    pub replica_count: i64,
    pub under_replicated_ranges: i64,
    pub version: Option<Version>,
}

impl NodeHealth {
    /// Decommissioning and holding no replicas.
    pub fn is_drained(&self) -> bool {
        self.is_decommissioning && self.replica_count == 0
    }
}

/// What the database itself reports. Every field is `None` when the
/// database could not be reached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseView {
    pub initialized: Option<bool>,
    pub nodes: Option<Vec<NodeHealth>>,
    pub preserve_downgrade: Option<String>,
}

impl DatabaseView {
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn is_reachable(&self) -> bool {
        self.nodes.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub key: ClusterKey,
    pub stateful_set: Option<StatefulSet>,
    pub pods: BTreeMap<u32, Pod>,
    pub certificates: Certificates,
    pub pvcs: BTreeMap<u32, PersistentVolumeClaim>,
    pub storage_classes: Vec<StorageClass>,
    pub database: DatabaseView,
    pub observed_at: DateTime<Utc>,
}

impl Snapshot {
    /// An empty snapshot: nothing exists yet.
    pub fn empty(key: ClusterKey) -> Self {
        Self {
            key,
            stateful_set: None,
            pods: BTreeMap::new(),
            certificates: Certificates::default(),
            pvcs: BTreeMap::new(),
            storage_classes: Vec::new(),
            database: DatabaseView::unavailable(),
            observed_at: Utc::now(),
        }
    }

    /// Replica count of the workload, 0 if it does not exist.
    pub fn replicas(&self) -> u32 {
        self.stateful_set.as_ref().map_or(0, |sts| sts.replicas)
    }

    /// Ready pods among the current replicas; pods past the replica count
    /// are on their way out and do not count.
    pub fn ready_pods(&self) -> usize {
        (0..self.replicas())
            .filter(|o| self.pods.get(o).is_some_and(|p| p.ready))
            .count()
    }

    pub fn all_pods_running(&self) -> bool {
        let replicas = self.replicas();
        replicas > 0 && (0..replicas).all(|o| self.pods.get(&o).is_some_and(Pod::is_running))
    }

    pub fn all_pods_ready(&self) -> bool {
        let replicas = self.replicas();
        (0..replicas).all(|o| self.pods.get(&o).is_some_and(|p| p.ready))
    }

    /// Lowest version any pod is running.
    pub fn running_version(&self) -> Option<Version> {
        self.pods.values().filter_map(Pod::version).min()
    }

    /// Every distinct version running in the cluster, falling back to the
    /// workload template when no pod exists yet.
    pub fn present_versions(&self) -> Vec<Version> {
        let mut versions: Vec<Version> = self.pods.values().filter_map(Pod::version).collect();
        if versions.is_empty() {
            versions.extend(
                self.stateful_set
                    .as_ref()
                    .and_then(|sts| sts.template.version()),
            );
        }
        versions.sort();
        versions.dedup();
        versions
    }

    pub fn nodes(&self) -> &[NodeHealth] {
        self.database.nodes.as_deref().unwrap_or_default()
    }

    pub fn node_for_ordinal(&self, ordinal: u32) -> Option<&NodeHealth> {
        self.nodes()
            .iter()
            .filter(|n| n.ordinal == Some(ordinal))
            .max_by_key(|n| n.node_id)
    }

    /// Live members among the workload's current ordinals.
    pub fn live_members(&self) -> usize {
        (0..self.replicas())
            .filter(|o| self.node_for_ordinal(*o).is_some_and(|n| n.is_live))
            .count()
    }

    pub fn has_quorum(&self) -> bool {
        crdb_reconcile::has_quorum(self.live_members(), self.replicas() as usize)
    }

    /// The volume claim template capacity, if any.
    pub fn claim_capacity(&self) -> Option<&str> {
        self.stateful_set
            .as_ref()
            .and_then(|sts| sts.volume_claim.as_ref())
            .map(|vc| vc.capacity.as_str())
    }
}
