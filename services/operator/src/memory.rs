//! In-memory platform and database.
//!
//! `InMemoryBackend` implements both `Platform` and `DatabaseClient` over a
//! shared model of the world. It stands in for a real platform controller
//! and database: writes land immediately, and `settle()` plays the part of
//! the platform's workload controller (creating, restarting and deleting
//! pods according to replicas and partition) and of the database (mirroring
//! running pods as nodes, draining decommissioned ones).
//!
//! The development binary runs against it, and the tests use its knobs to
//! inject failures and to hold pods back from becoming ready.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use crdb_api::{ClusterKey, ClusterSpec, ClusterStatus, CrdbCluster, Version};
use tracing::{debug, info};

use crate::database::{DatabaseClient, DatabaseError, DatabaseResult, NodeStatus};
use crate::platform::{
    PersistentVolumeClaim, Platform, PlatformError, PlatformResult, Pod, PodPhase, Secret,
    Service, StatefulSet, StorageClass,
};
use crate::workload;

/// Replicas a fresh node holds in the simulation.
const INITIAL_REPLICAS: i64 = 16;

/// A write issued by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    ServiceApplied { name: String },
    SecretApplied { name: String },
    StatefulSetCreated { replicas: u32 },
    StatefulSetUpdated { replicas: u32, partition: u32, image: String },
    PvcResized { name: String, capacity: String },
    PvcDeleted { name: String },
    ClusterInitialized,
    NodeDecommissioned { node_id: i32 },
    PreserveDowngradeSet { series: String },
    PreserveDowngradeReset,
}

#[derive(Debug, Clone)]
struct NodeRecord {
    node_id: i32,
    ordinal: u32,
    is_live: bool,
    is_decommissioning: bool,
    replica_count: i64,
    under_replicated_ranges: i64,
    build_tag: String,
}

#[derive(Debug, Clone)]
struct DatabaseState {
    reachable: bool,
    initialized: bool,
    /// Every node ever started, including ones removed from the workload.
    nodes: Vec<NodeRecord>,
    next_node_id: i32,
    preserve_downgrade: Option<String>,
}

impl Default for DatabaseState {
    fn default() -> Self {
        Self {
            reachable: true,
            initialized: false,
            nodes: Vec::new(),
            next_node_id: 1,
            preserve_downgrade: None,
        }
    }
}

impl DatabaseState {
    fn current_node_mut(&mut self, ordinal: u32) -> Option<&mut NodeRecord> {
        self.nodes
            .iter_mut()
            .filter(|n| n.ordinal == ordinal)
            .max_by_key(|n| n.node_id)
    }
}

#[derive(Debug, Default)]
struct State {
    clusters: BTreeMap<ClusterKey, CrdbCluster>,
    next_resource_version: u64,
    stateful_sets: BTreeMap<ClusterKey, StatefulSet>,
    pods: BTreeMap<ClusterKey, BTreeMap<u32, Pod>>,
    services: BTreeMap<ClusterKey, BTreeMap<String, Service>>,
    secrets: BTreeMap<ClusterKey, BTreeMap<String, Secret>>,
    pvcs: BTreeMap<ClusterKey, BTreeMap<String, PersistentVolumeClaim>>,
    storage_classes: Vec<StorageClass>,
    databases: BTreeMap<ClusterKey, DatabaseState>,

    hold_ready: bool,
    drain_step: i64,
    failing_cluster_reads: u32,
    failing_cluster_lists: u32,
    failing_observations: u32,
    status_conflicts: u32,

    mutations: Vec<(ClusterKey, Mutation)>,
    status_writes: usize,
}

impl State {
    fn bump_resource_version(&mut self) -> String {
        self.next_resource_version += 1;
        self.next_resource_version.to_string()
    }

    fn record(&mut self, key: &ClusterKey, mutation: Mutation) {
        debug!(cluster = %key, ?mutation, "[MEMORY] write");
        self.mutations.push((key.clone(), mutation));
    }

    fn observation_read(&mut self, what: &str) -> PlatformResult<()> {
        if self.failing_observations > 0 {
            self.failing_observations -= 1;
            return Err(PlatformError::Unavailable(format!("injected failure reading {what}")));
        }
        Ok(())
    }

    fn database_reachable(&self, key: &ClusterKey) -> bool {
        let reachable = self.databases.get(key).is_none_or(|db| db.reachable);
        let running = self
            .pods
            .get(key)
            .is_some_and(|pods| pods.values().any(Pod::is_running));
        reachable && running
    }

    fn grpc_port(&self, key: &ClusterKey) -> i32 {
        self.stateful_sets
            .get(key)
            .map_or(crdb_api::DEFAULT_GRPC_PORT, |sts| sts.template.grpc_port)
    }

    fn settle_cluster(&mut self, key: &ClusterKey) {
        let Some(sts) = self.stateful_sets.get(key).cloned() else {
            return;
        };
        let hash = sts.template_hash();
        let ready = !self.hold_ready;
        let drain_step = self.drain_step;

        let pods = self.pods.entry(key.clone()).or_default();
        let mut restarted = Vec::new();

        for ordinal in 0..sts.replicas {
            match pods.get_mut(&ordinal) {
                None => {
                    debug!(cluster = %key, ordinal, "[MEMORY] pod created");
                    pods.insert(
                        ordinal,
                        Pod {
                            name: workload::pod_name(key, ordinal),
                            ordinal,
                            phase: PodPhase::Running,
                            ready,
                            image: sts.template.image.clone(),
                            template_hash: hash.clone(),
                        },
                    );
                    restarted.push(ordinal);
                }
                Some(pod) if ordinal >= sts.partition && pod.template_hash != hash => {
                    debug!(cluster = %key, ordinal, image = %sts.template.image, "[MEMORY] pod restarted");
                    pod.image = sts.template.image.clone();
                    pod.template_hash = hash.clone();
                    pod.ready = ready;
                    restarted.push(ordinal);
                }
                Some(_) => {}
            }
        }

        let removed: Vec<u32> = pods.range(sts.replicas..).map(|(o, _)| *o).collect();
        for ordinal in &removed {
            debug!(cluster = %key, ordinal, "[MEMORY] pod deleted");
            pods.remove(ordinal);
        }

        if let Some(claim) = &sts.volume_claim {
            let pvcs = self.pvcs.entry(key.clone()).or_default();
            for ordinal in 0..sts.replicas {
                let name = workload::pvc_name(key, ordinal);
                pvcs.entry(name.clone()).or_insert_with(|| PersistentVolumeClaim {
                    name,
                    ordinal,
                    storage_class: claim.storage_class.clone(),
                    capacity: claim.capacity.clone(),
                });
            }
        }

        let pods = self.pods.get(key).cloned().unwrap_or_default();
        let db = self.databases.entry(key.clone()).or_default();
        if !db.initialized {
            return;
        }

        for ordinal in removed {
            if let Some(node) = db.current_node_mut(ordinal) {
                node.is_live = false;
            }
        }

        for (ordinal, pod) in &pods {
            let build_tag = pod
                .version()
                .map_or_else(|| "unknown".to_string(), |v| v.to_string());
            let fresh = restarted.contains(ordinal);
            match db.current_node_mut(*ordinal) {
                Some(node) if !(node.is_decommissioning && fresh) => {
                    node.is_live = pod.ready;
                    node.build_tag = build_tag;
                }
                _ => {
                    let node_id = db.next_node_id;
                    db.next_node_id += 1;
                    db.nodes.push(NodeRecord {
                        node_id,
                        ordinal: *ordinal,
                        is_live: pod.ready,
                        is_decommissioning: false,
                        replica_count: INITIAL_REPLICAS,
                        under_replicated_ranges: 0,
                        build_tag,
                    });
                }
            }
        }

        for node in db.nodes.iter_mut().filter(|n| n.is_decommissioning) {
            node.replica_count = (node.replica_count - drain_step).max(0);
        }
    }
}

/// Shared in-memory platform and database.
pub struct InMemoryBackend {
    state: Mutex<State>,
}

impl InMemoryBackend {
    /// An empty world with one default, expandable storage class named
    /// `standard`.
    pub fn new() -> Self {
        let state = State {
            storage_classes: vec![StorageClass {
                name: "standard".to_string(),
                is_default: true,
                allow_volume_expansion: true,
            }],
            drain_step: INITIAL_REPLICAS,
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -------------------------------------------------------------------------
    // World setup
    // -------------------------------------------------------------------------

    /// Submit a cluster resource.
    pub fn insert_cluster(&self, mut cluster: CrdbCluster) {
        let mut state = self.state();
        cluster.metadata.resource_version = Some(state.bump_resource_version());
        info!(cluster = %cluster.key(), "[MEMORY] cluster submitted");
        state.clusters.insert(cluster.key(), cluster);
    }

    /// Edit a cluster's spec the way a user would, bumping its generation.
    pub fn update_spec(&self, key: &ClusterKey, edit: impl FnOnce(&mut ClusterSpec)) {
        let mut state = self.state();
        let resource_version = state.bump_resource_version();
        if let Some(cluster) = state.clusters.get_mut(key) {
            edit(&mut cluster.spec);
            cluster.metadata.generation += 1;
            cluster.metadata.resource_version = Some(resource_version);
        }
    }

    pub fn delete_cluster(&self, key: &ClusterKey) {
        self.state().clusters.remove(key);
    }

    pub fn set_storage_classes(&self, classes: Vec<StorageClass>) {
        self.state().storage_classes = classes;
    }

    // -------------------------------------------------------------------------
    // Simulation
    // -------------------------------------------------------------------------

    /// Let the platform controller and the database catch up with every
    /// write issued so far.
    pub fn settle(&self) {
        let mut state = self.state();
        let keys: Vec<ClusterKey> = state.stateful_sets.keys().cloned().collect();
        for key in keys {
            state.settle_cluster(&key);
        }
    }

    /// Keep new and restarted pods unready until `set_pod_ready` is called.
    pub fn hold_pods_unready(&self, hold: bool) {
        self.state().hold_ready = hold;
    }

    pub fn set_pod_ready(&self, key: &ClusterKey, ordinal: u32, ready: bool) {
        let mut state = self.state();
        if let Some(pod) = state.pods.get_mut(key).and_then(|p| p.get_mut(&ordinal)) {
            pod.ready = ready;
        }
        if let Some(node) = state
            .databases
            .get_mut(key)
            .and_then(|db| db.current_node_mut(ordinal))
        {
            node.is_live = ready;
        }
    }

    /// Mark a node live or dead without touching its pod.
    pub fn set_node_live(&self, key: &ClusterKey, ordinal: u32, live: bool) {
        if let Some(node) = self
            .state()
            .databases
            .get_mut(key)
            .and_then(|db| db.current_node_mut(ordinal))
        {
            node.is_live = live;
        }
    }

    pub fn set_under_replicated(&self, key: &ClusterKey, ordinal: u32, ranges: i64) {
        if let Some(node) = self
            .state()
            .databases
            .get_mut(key)
            .and_then(|db| db.current_node_mut(ordinal))
        {
            node.under_replicated_ranges = ranges;
        }
    }

    pub fn set_database_reachable(&self, key: &ClusterKey, reachable: bool) {
        self.state()
            .databases
            .entry(key.clone())
            .or_default()
            .reachable = reachable;
    }

    /// Replicas drained from each decommissioning node per `settle()`.
    pub fn set_drain_step(&self, step: i64) {
        self.state().drain_step = step;
    }

    /// Fail the next `n` reads of cluster resources.
    pub fn fail_next_cluster_reads(&self, n: u32) {
        self.state().failing_cluster_reads = n;
    }

    /// Fail the next `n` listings of cluster resources.
    pub fn fail_next_cluster_lists(&self, n: u32) {
        self.state().failing_cluster_lists = n;
    }

    /// Fail the next `n` reads of workload objects (stateful set, pods,
    /// secrets, claims, storage classes).
    pub fn fail_next_observations(&self, n: u32) {
        self.state().failing_observations = n;
    }

    /// Make the next `n` status writes lose an optimistic-concurrency race.
    pub fn inject_status_conflicts(&self, n: u32) {
        self.state().status_conflicts = n;
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn cluster(&self, key: &ClusterKey) -> Option<CrdbCluster> {
        self.state().clusters.get(key).cloned()
    }

    pub fn status(&self, key: &ClusterKey) -> ClusterStatus {
        self.cluster(key)
            .map(|c| c.status_or_default())
            .unwrap_or_default()
    }

    pub fn stateful_set(&self, key: &ClusterKey) -> Option<StatefulSet> {
        self.state().stateful_sets.get(key).cloned()
    }

    pub fn pods(&self, key: &ClusterKey) -> Vec<Pod> {
        self.state()
            .pods
            .get(key)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pvcs(&self, key: &ClusterKey) -> Vec<PersistentVolumeClaim> {
        self.state()
            .pvcs
            .get(key)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn secret(&self, key: &ClusterKey, name: &str) -> Option<Secret> {
        self.state()
            .secrets
            .get(key)
            .and_then(|s| s.get(name))
            .cloned()
    }

    pub fn is_database_initialized(&self, key: &ClusterKey) -> bool {
        self.state()
            .databases
            .get(key)
            .is_some_and(|db| db.initialized)
    }

    /// Build tags of the live nodes backing the current pods.
    pub fn live_versions(&self, key: &ClusterKey) -> Vec<Option<Version>> {
        let state = self.state();
        let Some(db) = state.databases.get(key) else {
            return Vec::new();
        };
        let replicas = state.stateful_sets.get(key).map_or(0, |s| s.replicas);
        (0..replicas)
            .filter_map(|o| {
                db.nodes
                    .iter()
                    .filter(|n| n.ordinal == o)
                    .max_by_key(|n| n.node_id)
            })
            .filter(|n| n.is_live)
            .map(|n| n.build_tag.parse().ok())
            .collect()
    }

    pub fn preserve_downgrade_setting(&self, key: &ClusterKey) -> Option<String> {
        self.state()
            .databases
            .get(key)
            .and_then(|db| db.preserve_downgrade.clone())
    }

    /// Every engine write so far, across all clusters.
    pub fn mutations(&self) -> Vec<Mutation> {
        self.state().mutations.iter().map(|(_, m)| m.clone()).collect()
    }

    pub fn mutations_for(&self, key: &ClusterKey) -> Vec<Mutation> {
        self.state()
            .mutations
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn clear_mutations(&self) {
        self.state().mutations.clear();
    }

    /// Number of accepted status writes.
    pub fn status_writes(&self) -> usize {
        self.state().status_writes
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Platform for InMemoryBackend {
    async fn list_clusters(&self) -> PlatformResult<Vec<ClusterKey>> {
        let mut state = self.state();
        if state.failing_cluster_lists > 0 {
            state.failing_cluster_lists -= 1;
            return Err(PlatformError::Unavailable(
                "injected failure listing clusters".to_string(),
            ));
        }
        Ok(state.clusters.keys().cloned().collect())
    }

    async fn get_cluster(&self, key: &ClusterKey) -> PlatformResult<Option<CrdbCluster>> {
        let mut state = self.state();
        if state.failing_cluster_reads > 0 {
            state.failing_cluster_reads -= 1;
            return Err(PlatformError::Unavailable(format!(
                "injected failure reading {key}"
            )));
        }
        Ok(state.clusters.get(key).cloned())
    }

    async fn update_cluster_status(
        &self,
        key: &ClusterKey,
        resource_version: Option<&str>,
        status: &ClusterStatus,
    ) -> PlatformResult<String> {
        let mut state = self.state();
        if state.status_conflicts > 0 {
            state.status_conflicts -= 1;
            let bumped = state.bump_resource_version();
            if let Some(cluster) = state.clusters.get_mut(key) {
                cluster.metadata.resource_version = Some(bumped);
            }
            return Err(PlatformError::Conflict(format!("{key} was modified")));
        }

        let next = state.bump_resource_version();
        let cluster = state
            .clusters
            .get_mut(key)
            .ok_or_else(|| PlatformError::NotFound(key.to_string()))?;
        if cluster.metadata.resource_version.as_deref() != resource_version {
            return Err(PlatformError::Conflict(format!("{key} was modified")));
        }
        cluster.status = Some(status.clone());
        cluster.metadata.resource_version = Some(next.clone());
        state.status_writes += 1;
        Ok(next)
    }

    async fn get_stateful_set(&self, key: &ClusterKey) -> PlatformResult<Option<StatefulSet>> {
        let mut state = self.state();
        state.observation_read("stateful set")?;
        Ok(state.stateful_sets.get(key).cloned())
    }

    async fn create_stateful_set(&self, key: &ClusterKey, sts: &StatefulSet) -> PlatformResult<()> {
        let mut state = self.state();
        if state.stateful_sets.contains_key(key) {
            return Err(PlatformError::AlreadyExists(sts.name.clone()));
        }
        state.stateful_sets.insert(key.clone(), sts.clone());
        state.record(
            key,
            Mutation::StatefulSetCreated {
                replicas: sts.replicas,
            },
        );
        Ok(())
    }

    async fn update_stateful_set(&self, key: &ClusterKey, sts: &StatefulSet) -> PlatformResult<()> {
        let mut state = self.state();
        let existing = state
            .stateful_sets
            .get_mut(key)
            .ok_or_else(|| PlatformError::NotFound(sts.name.clone()))?;
        *existing = sts.clone();
        state.record(
            key,
            Mutation::StatefulSetUpdated {
                replicas: sts.replicas,
                partition: sts.partition,
                image: sts.template.image.clone(),
            },
        );
        Ok(())
    }

    async fn list_pods(&self, key: &ClusterKey) -> PlatformResult<Vec<Pod>> {
        let mut state = self.state();
        state.observation_read("pods")?;
        Ok(state
            .pods
            .get(key)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn apply_service(&self, key: &ClusterKey, service: &Service) -> PlatformResult<()> {
        let mut state = self.state();
        state
            .services
            .entry(key.clone())
            .or_default()
            .insert(service.name.clone(), service.clone());
        state.record(
            key,
            Mutation::ServiceApplied {
                name: service.name.clone(),
            },
        );
        Ok(())
    }

    async fn get_secret(&self, key: &ClusterKey, name: &str) -> PlatformResult<Option<Secret>> {
        let mut state = self.state();
        state.observation_read("secrets")?;
        Ok(state.secrets.get(key).and_then(|s| s.get(name)).cloned())
    }

    async fn apply_secret(&self, key: &ClusterKey, secret: &Secret) -> PlatformResult<()> {
        let mut state = self.state();
        state
            .secrets
            .entry(key.clone())
            .or_default()
            .insert(secret.name.clone(), secret.clone());
        state.record(
            key,
            Mutation::SecretApplied {
                name: secret.name.clone(),
            },
        );
        Ok(())
    }

    async fn list_pvcs(&self, key: &ClusterKey) -> PlatformResult<Vec<PersistentVolumeClaim>> {
        let mut state = self.state();
        state.observation_read("volume claims")?;
        Ok(state
            .pvcs
            .get(key)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn resize_pvc(&self, key: &ClusterKey, name: &str, capacity: &str) -> PlatformResult<()> {
        let mut state = self.state();
        let pvc = state
            .pvcs
            .get_mut(key)
            .and_then(|p| p.get_mut(name))
            .ok_or_else(|| PlatformError::NotFound(name.to_string()))?;
        pvc.capacity = capacity.to_string();
        state.record(
            key,
            Mutation::PvcResized {
                name: name.to_string(),
                capacity: capacity.to_string(),
            },
        );
        Ok(())
    }

    async fn delete_pvc(&self, key: &ClusterKey, name: &str) -> PlatformResult<()> {
        let mut state = self.state();
        state
            .pvcs
            .get_mut(key)
            .and_then(|p| p.remove(name))
            .ok_or_else(|| PlatformError::NotFound(name.to_string()))?;
        state.record(
            key,
            Mutation::PvcDeleted {
                name: name.to_string(),
            },
        );
        Ok(())
    }

    async fn list_storage_classes(&self) -> PlatformResult<Vec<StorageClass>> {
        let mut state = self.state();
        state.observation_read("storage classes")?;
        Ok(state.storage_classes.clone())
    }
}

#[async_trait]
impl DatabaseClient for InMemoryBackend {
    async fn is_initialized(&self, key: &ClusterKey) -> DatabaseResult<bool> {
        let state = self.state();
        if !state.database_reachable(key) {
            return Err(DatabaseError::Unavailable(key.to_string()));
        }
        Ok(state.databases.get(key).is_some_and(|db| db.initialized))
    }

    async fn node_statuses(&self, key: &ClusterKey) -> DatabaseResult<Vec<NodeStatus>> {
        let state = self.state();
        if !state.database_reachable(key) {
            return Err(DatabaseError::Unavailable(key.to_string()));
        }
        let port = state.grpc_port(key);
        let Some(db) = state.databases.get(key) else {
            return Ok(Vec::new());
        };
        Ok(db
            .nodes
            .iter()
            .map(|n| NodeStatus {
                node_id: n.node_id,
                address: workload::pod_address(key, n.ordinal, port),
                is_live: n.is_live,
                is_decommissioning: n.is_decommissioning,
                replica_count: n.replica_count,
                under_replicated_ranges: n.under_replicated_ranges,
                build_tag: n.build_tag.clone(),
            })
            .collect())
    }

    async fn init_cluster(&self, key: &ClusterKey) -> DatabaseResult<()> {
        let mut state = self.state();
        if !state.database_reachable(key) {
            return Err(DatabaseError::Unavailable(key.to_string()));
        }
        let db = state.databases.entry(key.clone()).or_default();
        if db.initialized {
            return Err(DatabaseError::AlreadyInitialized);
        }
        db.initialized = true;
        state.record(key, Mutation::ClusterInitialized);
        // Running pods join as nodes right away.
        state.settle_cluster(key);
        Ok(())
    }

    async fn decommission(&self, key: &ClusterKey, node_id: i32) -> DatabaseResult<()> {
        let mut state = self.state();
        if !state.database_reachable(key) {
            return Err(DatabaseError::Unavailable(key.to_string()));
        }
        let node = state
            .databases
            .get_mut(key)
            .and_then(|db| db.nodes.iter_mut().find(|n| n.node_id == node_id))
            .ok_or(DatabaseError::UnknownNode(node_id))?;
        node.is_decommissioning = true;
        state.record(key, Mutation::NodeDecommissioned { node_id });
        Ok(())
    }

    async fn preserve_downgrade(&self, key: &ClusterKey) -> DatabaseResult<Option<String>> {
        let state = self.state();
        if !state.database_reachable(key) {
            return Err(DatabaseError::Unavailable(key.to_string()));
        }
        Ok(state
            .databases
            .get(key)
            .and_then(|db| db.preserve_downgrade.clone()))
    }

    async fn set_preserve_downgrade(&self, key: &ClusterKey, series: &str) -> DatabaseResult<()> {
        let mut state = self.state();
        if !state.database_reachable(key) {
            return Err(DatabaseError::Unavailable(key.to_string()));
        }
        state.databases.entry(key.clone()).or_default().preserve_downgrade = Some(series.to_string());
        state.record(
            key,
            Mutation::PreserveDowngradeSet {
                series: series.to_string(),
            },
        );
        Ok(())
    }

    async fn reset_preserve_downgrade(&self, key: &ClusterKey) -> DatabaseResult<()> {
        let mut state = self.state();
        if !state.database_reachable(key) {
            return Err(DatabaseError::Unavailable(key.to_string()));
        }
        state.databases.entry(key.clone()).or_default().preserve_downgrade = None;
        state.record(key, Mutation::PreserveDowngradeReset);
        Ok(())
    }
}
