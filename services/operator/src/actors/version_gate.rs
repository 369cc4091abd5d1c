//! Version-gate actor: admits a version change onto the workload template.
//!
//! The gate checks the requested version against every version running in
//! the cluster. Only forward moves within a release series or into the next
//! series are admitted. A series change pins
//! `cluster.preserve_downgrade_option` to the running series first, so the
//! upgrade can still be rolled back until it is finalized.
//!
//! Admitting the change only stages it: the template is patched with the
//! partition at the replica count, so no pod restarts. The partitioned
//! update actor then rolls the nodes one at a time.

use async_trait::async_trait;
use crdb_api::{upgrade_path, ConditionType};
use tracing::info;

use super::{Actor, Effects, Outcome, PassInput};
use crate::error::{ReconcileError, ValidationError};

pub struct VersionGateActor;

#[async_trait]
impl Actor for VersionGateActor {
    fn name(&self) -> &'static str {
        "version-gate"
    }

    fn condition(&self) -> ConditionType {
        ConditionType::UpgradePathValid
    }

    fn is_required(&self, input: &PassInput<'_>) -> bool {
        input
            .snapshot
            .stateful_set
            .as_ref()
            .is_some_and(|sts| sts.template.version() != Some(input.target.version))
    }

    async fn act(
        &self,
        input: &PassInput<'_>,
        effects: &Effects<'_>,
    ) -> Result<Outcome, ReconcileError> {
        let key = input.key;
        let snapshot = input.snapshot;
        let target = input.target.version;

        let Some(sts) = snapshot.stateful_set.as_ref() else {
            return Ok(Outcome::in_progress("waiting for the workload"));
        };

        let present = snapshot.present_versions();
        let mut changes_series = false;
        for from in &present {
            let path = upgrade_path(from, &target).map_err(ValidationError::from)?;
            changes_series |= path.changes_series();
        }

        if changes_series {
            let Some(running) = present.first() else {
                return Ok(Outcome::in_progress("waiting for a running version"));
            };
            if !snapshot.database.is_reachable() {
                return Ok(Outcome::in_progress(
                    "waiting for the database before pinning the downgrade option",
                ));
            }
            let series = running.series().to_string();
            if snapshot.database.preserve_downgrade.as_deref() != Some(series.as_str()) {
                effects.set_preserve_downgrade(key, &series).await?;
                info!(cluster = %key, %series, "pinned preserve_downgrade_option");
            }
        }

        let mut staged = sts.clone();
        staged.template = input.target.template.clone();
        staged.partition = staged.replicas;
        effects.update_stateful_set(key, &staged).await?;

        info!(cluster = %key, version = %target, "upgrade staged");
        Ok(Outcome::completed(format!("upgrade to {target} staged")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::testutil::{effects, running, Fixture};
    use crate::memory::{InMemoryBackend, Mutation};
    use crdb_api::{CrdbCluster, ImageSpec};
    use crdb_testing::ClusterBuilder;

    fn with_image(cluster: &CrdbCluster, image: &str) -> CrdbCluster {
        let mut cluster = cluster.clone();
        cluster.spec.image = ImageSpec::new(image);
        cluster
    }

    #[tokio::test]
    async fn test_patch_upgrade_stages_without_pinning() {
        let backend = InMemoryBackend::new();
        let cluster = ClusterBuilder::new("crdb")
            .with_node_count(3)
            .with_image("cockroachdb/cockroach:v19.2.5")
            .cr();
        running(&backend, &cluster).await;

        let desired = with_image(&cluster, "cockroachdb/cockroach:v19.2.6");
        let fixture = Fixture::observe(&backend, &desired).await;
        assert!(VersionGateActor.is_required(&fixture.input()));

        let outcome = VersionGateActor
            .act(&fixture.input(), &effects(&backend))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Completed { .. }));
        assert_eq!(
            backend.mutations(),
            vec![Mutation::StatefulSetUpdated {
                replicas: 3,
                partition: 3,
                image: "cockroachdb/cockroach:v19.2.6".to_string(),
            }]
        );

        // Staging restarts nothing.
        backend.settle();
        assert!(backend
            .pods(&cluster.key())
            .iter()
            .all(|p| p.image == "cockroachdb/cockroach:v19.2.5"));
    }

    #[tokio::test]
    async fn test_series_change_pins_downgrade_option() {
        let backend = InMemoryBackend::new();
        let cluster = ClusterBuilder::new("crdb")
            .with_node_count(3)
            .with_image("cockroachdb/cockroach:v19.2.6")
            .cr();
        running(&backend, &cluster).await;

        let desired = with_image(&cluster, "cockroachdb/cockroach:v20.1.1");
        let fixture = Fixture::observe(&backend, &desired).await;
        VersionGateActor
            .act(&fixture.input(), &effects(&backend))
            .await
            .unwrap();

        assert_eq!(
            backend.preserve_downgrade_setting(&cluster.key()),
            Some("19.2".to_string())
        );
        assert_eq!(backend.mutations().len(), 2);
    }

    #[tokio::test]
    async fn test_rejects_downgrade_and_skips() {
        let backend = InMemoryBackend::new();
        let cluster = ClusterBuilder::new("crdb")
            .with_node_count(3)
            .with_image("cockroachdb/cockroach:v19.2.6")
            .cr();
        running(&backend, &cluster).await;

        for image in [
            "cockroachdb/cockroach:v19.2.5",
            "cockroachdb/cockroach:v19.1.4",
            "cockroachdb/cockroach:v20.2.0",
        ] {
            let desired = with_image(&cluster, image);
            let fixture = Fixture::observe(&backend, &desired).await;
            let err = VersionGateActor
                .act(&fixture.input(), &effects(&backend))
                .await
                .unwrap_err();
            assert!(
                matches!(
                    err,
                    ReconcileError::Validation(ValidationError::UnsupportedUpgrade(_))
                ),
                "{image}: {err}"
            );
        }
        assert!(backend.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_not_required_once_template_matches() {
        let backend = InMemoryBackend::new();
        let cluster = ClusterBuilder::new("crdb").with_node_count(3).cr();
        running(&backend, &cluster).await;

        let fixture = Fixture::observe(&backend, &cluster).await;
        assert!(!VersionGateActor.is_required(&fixture.input()));
    }
}
