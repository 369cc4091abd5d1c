//! Cluster state observer.
//!
//! Reads everything the actors reason about into a `Snapshot`. Platform
//! failures abort the observation; an unreachable database does not, it is
//! recorded as an unavailable `DatabaseView`.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use crdb_api::{ClusterKey, Version};
use tracing::{debug, warn};

use crate::database::{DatabaseClient, DatabaseError};
use crate::error::{bounded, ObservationError};
use crate::pki;
use crate::platform::{Platform, PlatformError, Secret};
use crate::snapshot::{Certificates, DatabaseView, NodeHealth, Snapshot};
use crate::workload;

pub struct Observer<'a> {
    platform: &'a dyn Platform,
    database: &'a dyn DatabaseClient,
    api_timeout: Duration,
}

impl<'a> Observer<'a> {
    pub fn new(
        platform: &'a dyn Platform,
        database: &'a dyn DatabaseClient,
        api_timeout: Duration,
    ) -> Self {
        Self {
            platform,
            database,
            api_timeout,
        }
    }

    pub async fn observe(&self, key: &ClusterKey) -> Result<Snapshot, ObservationError> {
        let limit = self.api_timeout;

        let stateful_set = bounded(limit, "get_stateful_set", self.platform.get_stateful_set(key))
            .await
            .map_err(platform_err("stateful set"))?;

        let pods = bounded(limit, "list_pods", self.platform.list_pods(key))
            .await
            .map_err(platform_err("pods"))?
            .into_iter()
            .map(|pod| (pod.ordinal, pod))
            .collect::<BTreeMap<_, _>>();

        let certificates = self.certificates(key).await?;

        let pvcs = bounded(limit, "list_pvcs", self.platform.list_pvcs(key))
            .await
            .map_err(platform_err("volume claims"))?
            .into_iter()
            .map(|pvc| (pvc.ordinal, pvc))
            .collect::<BTreeMap<_, _>>();

        let storage_classes = bounded(
            limit,
            "list_storage_classes",
            self.platform.list_storage_classes(),
        )
        .await
        .map_err(platform_err("storage classes"))?;

        let database = if pods.values().any(|p| p.is_running()) {
            match self.database_view(key).await {
                Ok(view) => view,
                Err(e) => {
                    warn!(cluster = %key, error = %e, "database unreachable");
                    DatabaseView::unavailable()
                }
            }
        } else {
            debug!(cluster = %key, "no running pods, skipping database probe");
            DatabaseView::unavailable()
        };

        Ok(Snapshot {
            key: key.clone(),
            stateful_set,
            pods,
            certificates,
            pvcs,
            storage_classes,
            database,
            observed_at: Utc::now(),
        })
    }

    async fn certificates(&self, key: &ClusterKey) -> Result<Certificates, ObservationError> {
        let ca = self.secret(key, workload::ca_secret_name(key)).await?;
        let node = self.secret(key, workload::node_secret_name(key)).await?;
        let client = self.secret(key, workload::client_secret_name(key)).await?;

        Ok(Certificates {
            ca: pki::ca_state(ca.as_ref()),
            node: pki::leaf_state(node.as_ref(), ca.as_ref()),
            client: pki::leaf_state(client.as_ref(), ca.as_ref()),
        })
    }

    async fn secret(
        &self,
        key: &ClusterKey,
        name: String,
    ) -> Result<Option<Secret>, ObservationError> {
        bounded(
            self.api_timeout,
            "get_secret",
            self.platform.get_secret(key, &name),
        )
        .await
        .map_err(platform_err("secrets"))
    }

    async fn database_view(&self, key: &ClusterKey) -> Result<DatabaseView, DatabaseError> {
        let limit = self.api_timeout;

        let initialized = bounded(limit, "is_initialized", self.database.is_initialized(key)).await?;
        let statuses = bounded(limit, "node_statuses", self.database.node_statuses(key)).await?;
        let preserve_downgrade = bounded(
            limit,
            "preserve_downgrade",
            self.database.preserve_downgrade(key),
        )
        .await?;

        let nodes = statuses
            .into_iter()
            .map(|status| NodeHealth {
                node_id: status.node_id,
                ordinal: workload::ordinal_from_address(key, &status.address),
                is_live: status.is_live,
                is_decommissioning: status.is_decommissioning,
                replica_count: status.replica_count,
                under_replicated_ranges: status.under_replicated_ranges,
                version: status.build_tag.parse::<Version>().ok(),
            })
            .collect();

        Ok(DatabaseView {
            initialized: Some(initialized),
            nodes: Some(nodes),
            preserve_downgrade,
        })
    }
}

fn platform_err(what: &'static str) -> impl Fn(PlatformError) -> ObservationError {
    move |source| ObservationError::Platform { what, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::testutil::running;
    use crate::memory::InMemoryBackend;
    use crate::snapshot::SecretState;
    use crdb_testing::ClusterBuilder;

    fn observer(backend: &InMemoryBackend) -> Observer<'_> {
        Observer::new(backend, backend, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_nothing_exists_yet() {
        let backend = InMemoryBackend::new();
        let key = ClusterBuilder::new("crdb").key();

        let snapshot = observer(&backend).observe(&key).await.unwrap();
        assert!(snapshot.stateful_set.is_none());
        assert!(snapshot.pods.is_empty());
        assert!(!snapshot.database.is_reachable());
        assert_eq!(snapshot.certificates.ca, SecretState::Absent);
        assert_eq!(snapshot.storage_classes.len(), 1);
    }

    #[tokio::test]
    async fn test_maps_nodes_to_ordinals() {
        let backend = InMemoryBackend::new();
        let cluster = ClusterBuilder::new("crdb")
            .with_node_count(3)
            .with_image("cockroachdb/cockroach:v19.2.5")
            .cr();
        running(&backend, &cluster).await;

        let snapshot = observer(&backend).observe(&cluster.key()).await.unwrap();
        assert_eq!(snapshot.database.initialized, Some(true));
        assert_eq!(snapshot.live_members(), 3);
        for ordinal in 0..3 {
            let node = snapshot.node_for_ordinal(ordinal).unwrap();
            assert_eq!(node.version, Some(Version::new(19, 2, 5)));
        }
    }

    #[tokio::test]
    async fn test_unreachable_database_is_not_an_error() {
        let backend = InMemoryBackend::new();
        let cluster = ClusterBuilder::new("crdb").with_node_count(3).cr();
        running(&backend, &cluster).await;
        backend.set_database_reachable(&cluster.key(), false);

        let snapshot = observer(&backend).observe(&cluster.key()).await.unwrap();
        assert_eq!(snapshot.pods.len(), 3);
        assert_eq!(snapshot.database, DatabaseView::unavailable());
    }

    #[tokio::test]
    async fn test_platform_failure_aborts() {
        let backend = InMemoryBackend::new();
        let key = ClusterBuilder::new("crdb").key();
        backend.fail_next_observations(1);

        let err = observer(&backend).observe(&key).await.unwrap_err();
        assert!(matches!(
            err,
            ObservationError::Platform {
                what: "stateful set",
                source: PlatformError::Unavailable(_)
            }
        ));
    }
}
