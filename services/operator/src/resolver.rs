//! Desired state resolver.
//!
//! Turns the user-facing spec into a `TargetConfig`: defaults filled in,
//! the version parsed out of the image, the storage class resolved against
//! what the platform offers, and the pod template the workload should run.

use crdb_api::{
    parse_quantity, ClusterKey, ClusterSpec, DataStore, Version, DEFAULT_CACHE,
    DEFAULT_GRPC_PORT, DEFAULT_HTTP_PORT, DEFAULT_MAX_SQL_MEMORY,
};
use crdb_reconcile::SpecHash;

use crate::error::ValidationError;
use crate::platform::{PodTemplate, StatefulSet, StorageClass, VolumeClaimTemplate};
use crate::workload;

/// Where certificates are mounted inside the database container.
pub const CERTS_DIR: &str = "/cockroach/cockroach-certs";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetStorage {
    Ephemeral,
    Persistent {
        capacity: String,
        capacity_bytes: u64,
        storage_class: String,
        allows_expansion: bool,
    },
}

/// Fully resolved desired state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    pub nodes: u32,
    pub image: String,
    pub version: Version,
    pub tls: bool,
    pub storage: TargetStorage,
    pub grpc_port: i32,
    pub http_port: i32,
    pub template: PodTemplate,
    pub template_hash: SpecHash,
}

impl TargetConfig {
    pub fn volume_claim(&self) -> Option<VolumeClaimTemplate> {
        match &self.storage {
            TargetStorage::Ephemeral => None,
            TargetStorage::Persistent {
                capacity,
                storage_class,
                ..
            } => Some(VolumeClaimTemplate {
                storage_class: storage_class.clone(),
                capacity: capacity.clone(),
            }),
        }
    }

    /// A new workload for this target.
    pub fn stateful_set(&self, key: &ClusterKey) -> StatefulSet {
        StatefulSet {
            name: workload::stateful_set_name(key),
            service_name: workload::headless_service_name(key),
            replicas: self.nodes,
            partition: 0,
            template: self.template.clone(),
            volume_claim: self.volume_claim(),
        }
    }
}

/// Validate `spec` and resolve it against the platform's storage classes.
pub fn resolve(
    key: &ClusterKey,
    spec: &ClusterSpec,
    storage_classes: &[StorageClass],
    min_nodes: u32,
) -> Result<TargetConfig, ValidationError> {
    let minimum = min_nodes.max(1);
    let nodes = u32::try_from(spec.nodes)
        .ok()
        .filter(|n| *n >= minimum)
        .ok_or(ValidationError::NodeCountBelowMinimum {
            nodes: spec.nodes,
            minimum,
        })?;

    let version =
        Version::from_image(&spec.image.name).map_err(|source| ValidationError::MalformedVersion {
            image: spec.image.name.clone(),
            source,
        })?;

    let storage = resolve_storage(&spec.data_store, storage_classes)?;
    let grpc_port = spec.grpc_port.unwrap_or(DEFAULT_GRPC_PORT);
    let http_port = spec.http_port.unwrap_or(DEFAULT_HTTP_PORT);

    let template = PodTemplate {
        image: spec.image.name.clone(),
        pull_policy: spec.image.pull_policy.as_str().to_string(),
        args: start_args(key, spec, grpc_port, http_port),
        tls_secret: spec
            .tls_enabled
            .then(|| workload::node_secret_name(key)),
        grpc_port,
        http_port,
    };
    let template_hash = template.spec_hash();

    Ok(TargetConfig {
        nodes,
        image: spec.image.name.clone(),
        version,
        tls: spec.tls_enabled,
        storage,
        grpc_port,
        http_port,
        template,
        template_hash,
    })
}

fn resolve_storage(
    data_store: &DataStore,
    storage_classes: &[StorageClass],
) -> Result<TargetStorage, ValidationError> {
    let DataStore::Persistent {
        capacity,
        storage_class,
    } = data_store
    else {
        return Ok(TargetStorage::Ephemeral);
    };

    let capacity_bytes = parse_quantity(capacity).map_err(ValidationError::InvalidCapacity)?;

    let class = match storage_class {
        Some(name) => storage_classes
            .iter()
            .find(|c| &c.name == name)
            .ok_or_else(|| ValidationError::UnknownStorageClass(name.clone()))?,
        None => storage_classes
            .iter()
            .find(|c| c.is_default)
            .ok_or(ValidationError::NoDefaultStorageClass)?,
    };

    Ok(TargetStorage::Persistent {
        capacity: capacity.clone(),
        capacity_bytes,
        storage_class: class.name.clone(),
        allows_expansion: class.allow_volume_expansion,
    })
}

/// Arguments for `cockroach start`.
fn start_args(key: &ClusterKey, spec: &ClusterSpec, grpc_port: i32, http_port: i32) -> Vec<String> {
    let mut args = vec![
        "start".to_string(),
        format!("--join={}", workload::join_list(key, grpc_port)),
        format!(
            "--advertise-host=$(POD_NAME).{}.{}",
            workload::headless_service_name(key),
            key.namespace
        ),
        "--logtostderr=INFO".to_string(),
    ];

    if spec.tls_enabled {
        args.push(format!("--certs-dir={CERTS_DIR}"));
    } else {
        args.push("--insecure".to_string());
    }

    args.push(format!("--port={grpc_port}"));
    args.push(format!("--http-port={http_port}"));
    args.push(format!(
        "--cache={}",
        spec.cache.as_deref().unwrap_or(DEFAULT_CACHE)
    ));
    args.push(format!(
        "--max-sql-memory={}",
        spec.max_sql_memory.as_deref().unwrap_or(DEFAULT_MAX_SQL_MEMORY)
    ));
    args.extend(spec.additional_args.iter().cloned());
    args
}
