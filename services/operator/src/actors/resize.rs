//! Storage resize actor: grows volume claims to the requested capacity.
//!
//! Only classes that allow volume expansion are resized, and a claim is
//! never shrunk.

use async_trait::async_trait;
use crdb_api::{parse_quantity, ConditionType};
use tracing::info;

use super::{Actor, Effects, Outcome, PassInput};
use crate::error::ReconcileError;
use crate::platform::PersistentVolumeClaim;
use crate::resolver::TargetStorage;

pub struct StorageResizeActor;

impl StorageResizeActor {
    /// Requested capacity, when expansion is possible at all.
    fn desired<'a>(input: &PassInput<'a>) -> Option<(&'a str, u64)> {
        match &input.target.storage {
            TargetStorage::Persistent {
                capacity,
                capacity_bytes,
                allows_expansion: true,
                ..
            } => Some((capacity.as_str(), *capacity_bytes)),
            _ => None,
        }
    }

    fn undersized(capacity: &str, desired: u64) -> bool {
        parse_quantity(capacity).is_ok_and(|bytes| bytes < desired)
    }

    fn undersized_claims<'a>(
        input: &'a PassInput<'_>,
        desired: u64,
    ) -> impl Iterator<Item = &'a PersistentVolumeClaim> {
        let replicas = input.snapshot.replicas();
        input
            .snapshot
            .pvcs
            .range(..replicas)
            .map(|(_, pvc)| pvc)
            .filter(move |pvc| Self::undersized(&pvc.capacity, desired))
    }
}

#[async_trait]
impl Actor for StorageResizeActor {
    fn name(&self) -> &'static str {
        "storage-resize"
    }

    fn condition(&self) -> ConditionType {
        ConditionType::StorageResized
    }

    fn is_required(&self, input: &PassInput<'_>) -> bool {
        let Some((_, desired)) = Self::desired(input) else {
            return false;
        };
        let template_small = input
            .snapshot
            .claim_capacity()
            .is_some_and(|capacity| Self::undersized(capacity, desired));

        template_small || Self::undersized_claims(input, desired).next().is_some()
    }

    async fn act(
        &self,
        input: &PassInput<'_>,
        effects: &Effects<'_>,
    ) -> Result<Outcome, ReconcileError> {
        let key = input.key;
        let Some((capacity, desired)) = Self::desired(input) else {
            return Ok(Outcome::completed("storage cannot be expanded"));
        };

        let mut resized = 0;
        for pvc in Self::undersized_claims(input, desired) {
            effects.resize_pvc(key, &pvc.name, capacity).await?;
            info!(cluster = %key, pvc = %pvc.name, %capacity, "expanded volume claim");
            resized += 1;
        }

        if let Some(sts) = input.snapshot.stateful_set.as_ref() {
            if let Some(claim) = sts.volume_claim.as_ref() {
                if Self::undersized(&claim.capacity, desired) {
                    let mut grown = sts.clone();
                    if let Some(claim) = grown.volume_claim.as_mut() {
                        claim.capacity = capacity.to_string();
                    }
                    effects.update_stateful_set(key, &grown).await?;
                }
            }
        }

        Ok(Outcome::completed(format!(
            "expanded {resized} claim(s) to {capacity}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::testutil::{effects, running, Fixture};
    use crate::memory::{InMemoryBackend, Mutation};
    use crate::platform::StorageClass;
    use crdb_api::DataStore;
    use crdb_testing::ClusterBuilder;

    fn grow(cluster: &crdb_api::CrdbCluster, capacity: &str) -> crdb_api::CrdbCluster {
        let mut desired = cluster.clone();
        desired.spec.data_store = DataStore::Persistent {
            capacity: capacity.to_string(),
            storage_class: Some("standard".to_string()),
        };
        desired
    }

    #[tokio::test]
    async fn test_expands_claims_and_template() {
        let backend = InMemoryBackend::new();
        let cluster = ClusterBuilder::new("crdb")
            .with_node_count(3)
            .with_pv_data_store("1Gi", "standard")
            .cr();
        let key = cluster.key();
        running(&backend, &cluster).await;

        let desired = grow(&cluster, "2Gi");
        let fixture = Fixture::observe(&backend, &desired).await;
        assert!(StorageResizeActor.is_required(&fixture.input()));
        StorageResizeActor
            .act(&fixture.input(), &effects(&backend))
            .await
            .unwrap();

        let mutations = backend.mutations();
        assert_eq!(mutations.len(), 4);
        assert!(mutations.contains(&Mutation::PvcResized {
            name: "datadir-crdb-1".to_string(),
            capacity: "2Gi".to_string(),
        }));
        assert!(backend.pvcs(&key).iter().all(|p| p.capacity == "2Gi"));

        let fixture = Fixture::observe(&backend, &desired).await;
        assert!(!StorageResizeActor.is_required(&fixture.input()));
    }

    #[tokio::test]
    async fn test_never_shrinks() {
        let backend = InMemoryBackend::new();
        let cluster = ClusterBuilder::new("crdb")
            .with_node_count(1)
            .with_pv_data_store("2Gi", "standard")
            .cr();
        running(&backend, &cluster).await;

        let fixture = Fixture::observe(&backend, &grow(&cluster, "1Gi")).await;
        assert!(!StorageResizeActor.is_required(&fixture.input()));
    }

    #[tokio::test]
    async fn test_skips_classes_without_expansion() {
        let backend = InMemoryBackend::new();
        backend.set_storage_classes(vec![StorageClass {
            name: "standard".to_string(),
            is_default: true,
            allow_volume_expansion: false,
        }]);
        let cluster = ClusterBuilder::new("crdb")
            .with_node_count(1)
            .with_pv_data_store("1Gi", "standard")
            .cr();
        running(&backend, &cluster).await;

        let fixture = Fixture::observe(&backend, &grow(&cluster, "5Gi")).await;
        assert!(!StorageResizeActor.is_required(&fixture.input()));
    }
}
