//! Initialization actor: creates the services and the stateful workload,
//! then bootstraps the database once every pod is running.

use async_trait::async_trait;
use crdb_api::ConditionType;
use tracing::info;

use super::{Actor, Effects, Outcome, PassInput};
use crate::error::ReconcileError;
use crate::workload;

pub struct InitializationActor;

#[async_trait]
impl Actor for InitializationActor {
    fn name(&self) -> &'static str {
        "initialization"
    }

    fn condition(&self) -> ConditionType {
        ConditionType::Initialized
    }

    fn starts_nodes(&self, _input: &PassInput<'_>) -> bool {
        true
    }

    fn is_required(&self, input: &PassInput<'_>) -> bool {
        if input.snapshot.stateful_set.is_none() {
            return true;
        }
        match input.snapshot.database.initialized {
            Some(initialized) => !initialized,
            // Unreachable database: trust the recorded condition.
            None => !input.status.is_true(ConditionType::Initialized),
        }
    }

    async fn act(
        &self,
        input: &PassInput<'_>,
        effects: &Effects<'_>,
    ) -> Result<Outcome, ReconcileError> {
        let key = input.key;
        let target = input.target;
        let snapshot = input.snapshot;

        if snapshot.stateful_set.is_none() {
            effects
                .apply_service(
                    key,
                    &workload::headless_service(key, target.grpc_port, target.http_port),
                )
                .await?;
            effects
                .apply_service(
                    key,
                    &workload::public_service(key, target.grpc_port, target.http_port),
                )
                .await?;
            effects
                .create_stateful_set(key, &target.stateful_set(key))
                .await?;

            info!(cluster = %key, replicas = target.nodes, "created stateful set");
            return Ok(Outcome::in_progress(format!(
                "created workload with {} replica(s)",
                target.nodes
            )));
        }

        if !snapshot.all_pods_running() {
            let running = snapshot.pods.values().filter(|p| p.is_running()).count();
            return Ok(Outcome::in_progress(format!(
                "waiting for pods: {running} of {} running",
                snapshot.replicas()
            )));
        }

        effects.init_cluster(key).await?;
        info!(cluster = %key, "cluster initialized");
        Ok(Outcome::completed("cluster initialized"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::testutil::{effects, Fixture};
    use crate::memory::{InMemoryBackend, Mutation};
    use chrono::Utc;
    use crdb_api::ConditionUpdate;
    use crdb_testing::ClusterBuilder;

    #[tokio::test]
    async fn test_creates_workload_then_initializes() {
        let backend = InMemoryBackend::new();
        let cluster = ClusterBuilder::new("crdb").with_node_count(3).cr();
        let key = cluster.key();
        backend.insert_cluster(cluster.clone());

        let fixture = Fixture::observe(&backend, &cluster).await;
        assert!(InitializationActor.is_required(&fixture.input()));
        let outcome = InitializationActor
            .act(&fixture.input(), &effects(&backend))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::InProgress { .. }));
        assert_eq!(
            backend.mutations(),
            vec![
                Mutation::ServiceApplied {
                    name: "crdb".to_string()
                },
                Mutation::ServiceApplied {
                    name: "crdb-public".to_string()
                },
                Mutation::StatefulSetCreated { replicas: 3 },
            ]
        );

        // Pods not scheduled yet: wait without writing.
        backend.clear_mutations();
        let fixture = Fixture::observe(&backend, &cluster).await;
        let outcome = InitializationActor
            .act(&fixture.input(), &effects(&backend))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::InProgress { .. }));
        assert!(backend.mutations().is_empty());

        backend.settle();
        let fixture = Fixture::observe(&backend, &cluster).await;
        assert_eq!(fixture.snapshot.database.initialized, Some(false));
        let outcome = InitializationActor
            .act(&fixture.input(), &effects(&backend))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Completed { .. }));
        assert!(backend.is_database_initialized(&key));

        let fixture = Fixture::observe(&backend, &cluster).await;
        assert!(!InitializationActor.is_required(&fixture.input()));
    }

    #[tokio::test]
    async fn test_unreachable_database_trusts_condition() {
        let backend = InMemoryBackend::new();
        let cluster = ClusterBuilder::new("crdb").cr();
        let key = cluster.key();
        backend.insert_cluster(cluster.clone());

        let fixture = Fixture::observe(&backend, &cluster).await;
        InitializationActor
            .act(&fixture.input(), &effects(&backend))
            .await
            .unwrap();
        backend.settle();
        backend.set_database_reachable(&key, false);

        let mut fixture = Fixture::observe(&backend, &cluster).await;
        assert_eq!(fixture.snapshot.database.initialized, None);
        assert!(InitializationActor.is_required(&fixture.input()));

        fixture.status.set_condition(
            ConditionUpdate::truthy(ConditionType::Initialized, "Initialized", ""),
            Utc::now(),
        );
        assert!(!InitializationActor.is_required(&fixture.input()));
    }
}
