//! Fixtures for tests that need a `CrdbCluster`.
//!
//! ```
//! use crdb_testing::ClusterBuilder;
//!
//! let cluster = ClusterBuilder::new("crdb")
//!     .with_node_count(3)
//!     .with_tls()
//!     .with_pv_data_store("1Gi", "standard")
//!     .cr();
//! assert_eq!(cluster.spec.nodes, 3);
//! ```

use crdb_api::{ClusterKey, ClusterSpec, CrdbCluster, DataStore, ImageSpec};

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_IMAGE: &str = "cockroachdb/cockroach:v19.2.6";

/// Fluent builder for cluster resources.
#[derive(Debug, Clone)]
pub struct ClusterBuilder {
    cluster: CrdbCluster,
}

impl ClusterBuilder {
    /// A one-node insecure cluster on scratch storage in the default namespace.
    pub fn new(name: &str) -> Self {
        let spec = ClusterSpec {
            nodes: 1,
            image: ImageSpec::new(DEFAULT_IMAGE),
            tls_enabled: false,
            data_store: DataStore::EmptyDir,
            grpc_port: None,
            http_port: None,
            cache: None,
            max_sql_memory: None,
            additional_args: Vec::new(),
        };
        Self {
            cluster: CrdbCluster::new(DEFAULT_NAMESPACE, name, spec),
        }
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.cluster.metadata.namespace = namespace.to_string();
        self
    }

    pub fn with_node_count(mut self, nodes: i32) -> Self {
        self.cluster.spec.nodes = nodes;
        self
    }

    pub fn with_tls(mut self) -> Self {
        self.cluster.spec.tls_enabled = true;
        self
    }

    pub fn with_image(mut self, image: &str) -> Self {
        self.cluster.spec.image = ImageSpec::new(image);
        self
    }

    pub fn with_empty_dir_data_store(mut self) -> Self {
        self.cluster.spec.data_store = DataStore::EmptyDir;
        self
    }

    pub fn with_pv_data_store(mut self, capacity: &str, storage_class: &str) -> Self {
        self.cluster.spec.data_store = DataStore::Persistent {
            capacity: capacity.to_string(),
            storage_class: Some(storage_class.to_string()),
        };
        self
    }

    pub fn with_cache(mut self, cache: &str) -> Self {
        self.cluster.spec.cache = Some(cache.to_string());
        self
    }

    pub fn with_additional_args(mut self, args: &[&str]) -> Self {
        self.cluster.spec.additional_args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn key(&self) -> ClusterKey {
        self.cluster.key()
    }

    /// The resource as a caller would submit it.
    pub fn cr(&self) -> CrdbCluster {
        self.cluster.clone()
    }
}
