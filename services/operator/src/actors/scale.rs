//! Scale actor: moves the replica count one step toward the requested node
//! count and removes volume claims left behind by removed nodes.
//!
//! Scaling down only ever drops a node the decommission actor has already
//! drained.

use async_trait::async_trait;
use crdb_api::ConditionType;
use tracing::info;

use super::{Actor, Effects, Outcome, PassInput};
use crate::error::ReconcileError;
use crate::snapshot::Snapshot;

pub struct ScaleActor;

impl ScaleActor {
    fn highest_drained(snapshot: &Snapshot) -> bool {
        snapshot
            .replicas()
            .checked_sub(1)
            .and_then(|highest| snapshot.node_for_ordinal(highest))
            .is_some_and(|node| node.is_drained())
    }

    /// Highest claim ordinal past the end of the workload whose pod is gone.
    fn orphaned_claim(snapshot: &Snapshot) -> Option<u32> {
        let replicas = snapshot.replicas();
        snapshot
            .pvcs
            .range(replicas..)
            .map(|(ordinal, _)| *ordinal)
            .filter(|ordinal| !snapshot.pods.contains_key(ordinal))
            .max()
    }
}

#[async_trait]
impl Actor for ScaleActor {
    fn name(&self) -> &'static str {
        "scale"
    }

    fn condition(&self) -> ConditionType {
        ConditionType::Scaled
    }

    fn starts_nodes(&self, input: &PassInput<'_>) -> bool {
        input.snapshot.replicas() < input.target.nodes
    }

    fn is_required(&self, input: &PassInput<'_>) -> bool {
        let snapshot = input.snapshot;
        if snapshot.stateful_set.is_none() {
            return false;
        }
        let replicas = snapshot.replicas();
        let nodes = input.target.nodes;

        replicas < nodes
            || (replicas > nodes && Self::highest_drained(snapshot))
            || (replicas == nodes && Self::orphaned_claim(snapshot).is_some())
    }

    async fn act(
        &self,
        input: &PassInput<'_>,
        effects: &Effects<'_>,
    ) -> Result<Outcome, ReconcileError> {
        let key = input.key;
        let snapshot = input.snapshot;
        let nodes = input.target.nodes;
        let Some(sts) = snapshot.stateful_set.as_ref() else {
            return Ok(Outcome::in_progress("waiting for the workload"));
        };
        let replicas = sts.replicas;

        if replicas < nodes {
            if !snapshot.all_pods_ready() {
                return Ok(Outcome::in_progress(format!(
                    "waiting for {} of {replicas} pod(s) to be ready before adding a node",
                    replicas as usize - snapshot.ready_pods()
                )));
            }
            let mut scaled = sts.clone();
            scaled.replicas = replicas + 1;
            effects.update_stateful_set(key, &scaled).await?;
            info!(cluster = %key, replicas = scaled.replicas, "scaled up");
            return Ok(step_outcome(scaled.replicas, nodes));
        }

        if replicas > nodes {
            if !Self::highest_drained(snapshot) {
                return Ok(Outcome::in_progress(format!(
                    "waiting for node {} to drain",
                    replicas - 1
                )));
            }
            let mut scaled = sts.clone();
            scaled.replicas = replicas - 1;
            scaled.partition = scaled.partition.min(scaled.replicas);
            effects.update_stateful_set(key, &scaled).await?;
            info!(cluster = %key, replicas = scaled.replicas, "scaled down");
            return Ok(step_outcome(scaled.replicas, nodes));
        }

        if let Some(ordinal) = Self::orphaned_claim(snapshot) {
            let Some(pvc) = snapshot.pvcs.get(&ordinal) else {
                return Ok(Outcome::completed(format!("{nodes} node(s)")));
            };
            effects.delete_pvc(key, &pvc.name).await?;
            info!(cluster = %key, pvc = %pvc.name, "removed orphaned volume claim");
            return Ok(Outcome::completed(format!("removed claim {}", pvc.name)));
        }

        Ok(Outcome::completed(format!("{nodes} node(s)")))
    }
}

fn step_outcome(replicas: u32, nodes: u32) -> Outcome {
    if replicas == nodes {
        Outcome::completed(format!("scaled to {nodes} node(s)"))
    } else {
        Outcome::in_progress(format!("scaling: {replicas} of {nodes} node(s)"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::testutil::{effects, running, Fixture};
    use crate::memory::{InMemoryBackend, Mutation};
    use crdb_testing::ClusterBuilder;

    #[tokio::test]
    async fn test_scale_up_one_at_a_time() {
        let backend = InMemoryBackend::new();
        let cluster = ClusterBuilder::new("crdb").with_node_count(3).cr();
        running(&backend, &cluster).await;

        let mut desired = cluster.clone();
        desired.spec.nodes = 5;
        let fixture = Fixture::observe(&backend, &desired).await;
        assert!(ScaleActor.is_required(&fixture.input()));
        assert!(ScaleActor.starts_nodes(&fixture.input()));

        let outcome = ScaleActor
            .act(&fixture.input(), &effects(&backend))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::InProgress { .. }));
        assert!(matches!(
            backend.mutations().as_slice(),
            [Mutation::StatefulSetUpdated { replicas: 4, .. }]
        ));
    }

    #[tokio::test]
    async fn test_scale_up_waits_for_ready_pods() {
        let backend = InMemoryBackend::new();
        let cluster = ClusterBuilder::new("crdb").with_node_count(3).cr();
        let key = cluster.key();
        running(&backend, &cluster).await;
        backend.set_pod_ready(&key, 1, false);

        let mut desired = cluster.clone();
        desired.spec.nodes = 4;
        let fixture = Fixture::observe(&backend, &desired).await;
        let outcome = ScaleActor
            .act(&fixture.input(), &effects(&backend))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::InProgress { .. }));
        assert!(backend.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_scale_down_requires_drained_node() {
        let backend = InMemoryBackend::new();
        let cluster = ClusterBuilder::new("crdb").with_node_count(3).cr();
        running(&backend, &cluster).await;

        let mut desired = cluster.clone();
        desired.spec.nodes = 2;
        let fixture = Fixture::observe(&backend, &desired).await;
        assert!(!ScaleActor.is_required(&fixture.input()));
        assert!(!ScaleActor.starts_nodes(&fixture.input()));
    }

    #[tokio::test]
    async fn test_prunes_orphaned_claims() {
        let backend = InMemoryBackend::new();
        let cluster = ClusterBuilder::new("crdb")
            .with_node_count(3)
            .with_pv_data_store("1Gi", "standard")
            .cr();
        let key = cluster.key();
        running(&backend, &cluster).await;
        assert_eq!(backend.pvcs(&key).len(), 3);

        // Shrink the workload directly, leaving claim 2 behind.
        let mut sts = backend.stateful_set(&key).unwrap();
        sts.replicas = 2;
        sts.partition = 0;
        crate::platform::Platform::update_stateful_set(&backend, &key, &sts)
            .await
            .unwrap();
        backend.settle();
        backend.clear_mutations();

        let mut desired = cluster.clone();
        desired.spec.nodes = 2;
        let fixture = Fixture::observe(&backend, &desired).await;
        assert!(ScaleActor.is_required(&fixture.input()));
        ScaleActor
            .act(&fixture.input(), &effects(&backend))
            .await
            .unwrap();
        assert_eq!(
            backend.mutations(),
            vec![Mutation::PvcDeleted {
                name: "datadir-crdb-2".to_string()
            }]
        );

        let fixture = Fixture::observe(&backend, &desired).await;
        assert!(!ScaleActor.is_required(&fixture.input()));
    }
}
