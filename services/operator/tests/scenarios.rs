//! End-to-end scenarios against the in-memory platform.

mod common;

use common::{assert_stable_is_quiet, executed, is_workload_write, World};
use crdb_api::{ConditionStatus, ConditionType, ImageSpec};
use crdb_operator::memory::Mutation;
use crdb_operator::pki::{self, CertificateAuthority};
use crdb_operator::platform::Platform;
use crdb_operator::workload;
use crdb_operator::{ClusterPhase, Next};
use crdb_testing::ClusterBuilder;

#[tokio::test]
async fn test_insecure_three_node_create() {
    let world = World::new(ClusterBuilder::new("crdb").with_node_count(3).cr());

    let steps = world.converge().await;
    assert_eq!(executed(&steps), vec!["initialization", "initialization"]);

    let first = &steps[0];
    assert!(first.mutations.contains(&Mutation::StatefulSetCreated { replicas: 3 }));
    assert_eq!(
        first
            .mutations
            .iter()
            .filter(|m| matches!(m, Mutation::ServiceApplied { .. }))
            .count(),
        2
    );
    assert_eq!(steps[1].mutations, vec![Mutation::ClusterInitialized]);

    assert!(world.backend.is_database_initialized(&world.key));
    assert_eq!(world.backend.pods(&world.key).len(), 3);
    assert!(world.backend.secret(&world.key, &workload::ca_secret_name(&world.key)).is_none());

    let status = world.backend.status(&world.key);
    assert!(status.is_true(ConditionType::Initialized));
    assert!(status.is_true(ConditionType::Stable));
    assert_eq!(status.ready_replicas, 3);
    assert_eq!(status.version.as_deref(), Some("v19.2.6"));
    assert_eq!(status.observed_generation, 1);

    assert_stable_is_quiet(&world.step().await);
}

#[tokio::test]
async fn test_tls_single_node_create_issues_certificates_first() {
    let world = World::new(ClusterBuilder::new("crdb").with_node_count(1).with_tls().cr());

    let steps = world.converge().await;
    assert_eq!(
        executed(&steps),
        vec!["certificate", "initialization", "initialization"]
    );

    let certificates = &steps[0].mutations;
    assert_eq!(certificates.len(), 3);
    assert!(certificates.iter().all(|m| matches!(m, Mutation::SecretApplied { .. })));
    assert!(!certificates.iter().any(is_workload_write));

    let sts = world.backend.stateful_set(&world.key).unwrap();
    assert_eq!(
        sts.template.tls_secret.as_deref(),
        Some(workload::node_secret_name(&world.key).as_str())
    );
    assert!(world.condition_true(ConditionType::CertificatesReady));
    assert!(world.condition_true(ConditionType::Stable));
}

#[tokio::test]
async fn test_corrupt_ca_blocks_workload_and_is_kept() {
    let world = World::new(ClusterBuilder::new("crdb").with_node_count(3).with_tls().cr());
    let ca_name = workload::ca_secret_name(&world.key);
    let mut ca = CertificateAuthority::generate().unwrap().to_secret(ca_name.clone());
    ca.data.insert(
        pki::CA_CERT.to_string(),
        "-----BEGIN CERTIFICATE-----\nbm90IGEgY2VydGlmaWNhdGU=\n-----END CERTIFICATE-----\n"
            .to_string(),
    );
    world.backend.apply_secret(&world.key, &ca).await.unwrap();

    for _ in 0..4 {
        let step = world.step().await;
        assert_eq!(step.report.executed, Some("certificate"));
        assert_eq!(step.report.next, Next::Backoff);
        assert!(step.mutations.is_empty(), "{:?}", step.mutations);
    }
    assert!(world.backend.stateful_set(&world.key).is_none());
    assert_eq!(world.backend.secret(&world.key, &ca_name), Some(ca));

    let status = world.backend.status(&world.key);
    let certificates = status.condition(ConditionType::CertificatesReady).unwrap();
    assert_eq!(certificates.status, ConditionStatus::False);
    assert_eq!(certificates.reason, "CertificateInvalid");
}

#[tokio::test]
async fn test_rolling_upgrade_restarts_one_node_at_a_time() {
    let world = World::new(
        ClusterBuilder::new("crdb")
            .with_node_count(3)
            .with_image("cockroachdb/cockroach:v19.2.5")
            .cr(),
    );
    world.converge().await;

    world.update_spec(|spec| spec.image = ImageSpec::new("cockroachdb/cockroach:v19.2.6"));
    let mut partitions = Vec::new();
    let steps = world
        .converge_with(|world, step| {
            for mutation in &step.mutations {
                if let Mutation::StatefulSetUpdated { partition, .. } = mutation {
                    partitions.push(*partition);
                }
            }
            let upgraded = world
                .images()
                .iter()
                .filter(|i| i.ends_with("v19.2.6"))
                .count();
            assert!(upgraded <= partitions.len().saturating_sub(1));
        })
        .await;

    assert_eq!(partitions, vec![3, 2, 1, 0]);
    assert_eq!(executed(&steps)[0], "version-gate");
    assert!(world
        .images()
        .iter()
        .all(|i| i == "cockroachdb/cockroach:v19.2.6"));

    let status = world.backend.status(&world.key);
    assert_eq!(status.version.as_deref(), Some("v19.2.6"));
    assert_eq!(status.observed_generation, 2);
    assert!(status.is_true(ConditionType::Updated));
}

#[tokio::test]
async fn test_scale_down_decommissions_first() {
    let world = World::new(ClusterBuilder::new("crdb").with_node_count(3).cr());
    world.converge().await;

    world.update_spec(|spec| spec.nodes = 2);
    let steps = world.converge().await;

    let order = executed(&steps);
    assert_eq!(order, vec!["decommission", "scale"]);
    assert!(matches!(
        steps[0].mutations.as_slice(),
        [Mutation::NodeDecommissioned { .. }]
    ));
    assert!(matches!(
        steps[1].mutations.as_slice(),
        [Mutation::StatefulSetUpdated { replicas: 2, .. }]
    ));
    assert_eq!(world.backend.pods(&world.key).len(), 2);
    assert!(world.condition_true(ConditionType::Decommissioned));
    assert!(world.condition_true(ConditionType::Scaled));
}

#[tokio::test]
async fn test_scale_down_waits_for_drain() {
    let world = World::new(ClusterBuilder::new("crdb").with_node_count(3).cr());
    world.converge().await;
    world.backend.set_drain_step(5);

    world.update_spec(|spec| spec.nodes = 2);
    let steps = world.converge().await;

    let order = executed(&steps);
    assert_eq!(order.first(), Some(&"decommission"));
    assert_eq!(order.last(), Some(&"scale"));
    assert!(order[..order.len() - 1].iter().all(|a| *a == "decommission"));
    let decommissions = steps
        .iter()
        .flat_map(|s| &s.mutations)
        .filter(|m| matches!(m, Mutation::NodeDecommissioned { .. }))
        .count();
    assert_eq!(decommissions, 1);
}

#[tokio::test]
async fn test_transient_read_failure_requeues_without_action() {
    let world = World::new(ClusterBuilder::new("crdb").with_node_count(3).cr());
    world.converge().await;
    let before = world.backend.status(&world.key);
    let writes = world.backend.status_writes();

    world.update_spec(|spec| spec.nodes = 4);
    world.backend.fail_next_cluster_reads(1);
    let step = world.pass().await;
    assert_eq!(step.report.next, Next::Backoff);
    assert_eq!(step.report.executed, None);
    assert!(step.mutations.is_empty());
    assert_eq!(world.backend.status(&world.key), before);
    assert_eq!(world.backend.status_writes(), writes);

    world.backend.fail_next_observations(1);
    let step = world.pass().await;
    assert_eq!(step.report.next, Next::Backoff);
    assert!(step.mutations.is_empty());
    assert_eq!(world.backend.status_writes(), writes);

    // The next clean pass picks the change up.
    let step = world.pass().await;
    assert_eq!(step.report.executed, Some("scale"));
}

#[tokio::test]
async fn test_scale_up_adds_one_node_per_pass() {
    let world = World::new(ClusterBuilder::new("crdb").with_node_count(3).cr());
    world.converge().await;

    world.update_spec(|spec| spec.nodes = 5);
    let steps = world.converge().await;
    let replicas: Vec<u32> = steps
        .iter()
        .flat_map(|s| &s.mutations)
        .filter_map(|m| match m {
            Mutation::StatefulSetUpdated { replicas, .. } => Some(*replicas),
            _ => None,
        })
        .collect();
    assert_eq!(replicas, vec![4, 5]);
    assert_eq!(world.backend.pods(&world.key).len(), 5);
}

#[tokio::test]
async fn test_storage_expansion() {
    let world = World::new(
        ClusterBuilder::new("crdb")
            .with_node_count(3)
            .with_pv_data_store("1Gi", "standard")
            .cr(),
    );
    world.converge().await;
    assert_eq!(world.backend.pvcs(&world.key).len(), 3);

    world.update_spec(|spec| {
        spec.data_store = crdb_api::DataStore::Persistent {
            capacity: "5Gi".to_string(),
            storage_class: Some("standard".to_string()),
        }
    });
    let steps = world.converge().await;
    assert_eq!(executed(&steps), vec!["storage-resize"]);
    assert!(world
        .backend
        .pvcs(&world.key)
        .iter()
        .all(|p| p.capacity == "5Gi"));
    assert!(world.condition_true(ConditionType::StorageResized));
}

#[tokio::test]
async fn test_invalid_spec_surfaces_and_recovers() {
    let world = World::new(ClusterBuilder::new("crdb").with_node_count(0).cr());

    let step = world.step().await;
    assert_eq!(step.report.next, Next::Done);
    assert_eq!(step.report.phase, ClusterPhase::Unknown);
    assert!(step.mutations.is_empty());
    let status = world.backend.status(&world.key);
    let spec_valid = status.condition(ConditionType::SpecValid).unwrap();
    assert_eq!(spec_valid.status, ConditionStatus::False);
    assert_eq!(spec_valid.reason, "NodeCountBelowMinimum");

    world.update_spec(|spec| spec.nodes = 1);
    world.converge().await;
    assert!(world.condition_true(ConditionType::SpecValid));
    assert!(world.condition_true(ConditionType::Stable));
}

#[tokio::test]
async fn test_deleted_cluster_is_done() {
    let world = World::new(ClusterBuilder::new("crdb").cr());
    world.converge().await;
    world.backend.delete_cluster(&world.key);

    let step = world.pass().await;
    assert_eq!(step.report.next, Next::Done);
    assert!(step.mutations.is_empty());
}
