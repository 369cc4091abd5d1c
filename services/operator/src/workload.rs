//! Object names and network addresses derived from a cluster key.
//!
//! Every object the operator owns is named after the cluster, so a cluster
//! key is enough to find all of them.

use crdb_api::ClusterKey;

use crate::platform::{Service, ServicePort};

/// Number of ordinals listed in `--join`. Kept fixed so that scaling never
/// changes the pod template.
pub const JOIN_SEEDS: u32 = 3;

/// Prefix of the per-node volume claim names.
pub const DATA_VOLUME: &str = "datadir";

pub fn stateful_set_name(key: &ClusterKey) -> String {
    key.name.clone()
}

/// The headless service shares the cluster name.
pub fn headless_service_name(key: &ClusterKey) -> String {
    key.name.clone()
}

pub fn public_service_name(key: &ClusterKey) -> String {
    format!("{}-public", key.name)
}

pub fn pod_name(key: &ClusterKey, ordinal: u32) -> String {
    format!("{}-{ordinal}", key.name)
}

pub fn pvc_name(key: &ClusterKey, ordinal: u32) -> String {
    format!("{DATA_VOLUME}-{}-{ordinal}", key.name)
}

/// Ordinal encoded in a volume claim name, if it belongs to this cluster.
pub fn pvc_ordinal(key: &ClusterKey, name: &str) -> Option<u32> {
    name.strip_prefix(DATA_VOLUME)?
        .strip_prefix('-')?
        .strip_prefix(key.name.as_str())?
        .strip_prefix('-')?
        .parse()
        .ok()
}

pub fn ca_secret_name(key: &ClusterKey) -> String {
    format!("{}-ca", key.name)
}

pub fn node_secret_name(key: &ClusterKey) -> String {
    format!("{}-node", key.name)
}

pub fn client_secret_name(key: &ClusterKey) -> String {
    format!("{}-root", key.name)
}

/// Stable DNS name of one pod through the headless service.
pub fn pod_host(key: &ClusterKey, ordinal: u32) -> String {
    format!(
        "{}.{}.{}",
        pod_name(key, ordinal),
        headless_service_name(key),
        key.namespace
    )
}

pub fn pod_address(key: &ClusterKey, ordinal: u32, port: i32) -> String {
    format!("{}:{port}", pod_host(key, ordinal))
}

/// Map an advertised node address back to its pod ordinal.
pub fn ordinal_from_address(key: &ClusterKey, address: &str) -> Option<u32> {
    let host = address.rsplit_once(':').map_or(address, |(host, _)| host);
    let pod = host.split('.').next()?;
    pod.strip_prefix(key.name.as_str())?
        .strip_prefix('-')?
        .parse()
        .ok()
}

/// Comma-separated `--join` addresses.
pub fn join_list(key: &ClusterKey, port: i32) -> String {
    (0..JOIN_SEEDS)
        .map(|ordinal| pod_address(key, ordinal, port))
        .collect::<Vec<_>>()
        .join(",")
}

fn ports(grpc_port: i32, http_port: i32) -> Vec<ServicePort> {
    vec![
        ServicePort {
            name: "grpc".to_string(),
            port: grpc_port,
        },
        ServicePort {
            name: "http".to_string(),
            port: http_port,
        },
    ]
}

/// Headless service giving each pod a stable name.
pub fn headless_service(key: &ClusterKey, grpc_port: i32, http_port: i32) -> Service {
    Service {
        name: headless_service_name(key),
        headless: true,
        ports: ports(grpc_port, http_port),
    }
}

/// Load-balanced service for SQL clients and the admin UI.
pub fn public_service(key: &ClusterKey, grpc_port: i32, http_port: i32) -> Service {
    Service {
        name: public_service_name(key),
        headless: false,
        ports: ports(grpc_port, http_port),
    }
}
