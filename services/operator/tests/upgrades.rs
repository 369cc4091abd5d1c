//! Version changes end to end: patch, next-series and rejected moves.

mod common;

use common::{executed, Step, World};
use crdb_api::{ConditionStatus, ConditionType, ImageSpec, Version};
use crdb_operator::memory::Mutation;
use crdb_operator::Next;
use crdb_testing::ClusterBuilder;
use rstest::rstest;

const REPO: &str = "cockroachdb/cockroach";

fn image(tag: &str) -> String {
    format!("{REPO}:{tag}")
}

async fn running_at(nodes: i32, tag: &str) -> World {
    let world = World::new(
        ClusterBuilder::new("crdb")
            .with_node_count(nodes)
            .with_image(&image(tag))
            .cr(),
    );
    world.converge().await;
    world
}

fn all_mutations(steps: &[Step]) -> Vec<Mutation> {
    steps.iter().flat_map(|s| s.mutations.clone()).collect()
}

fn partitions(steps: &[Step]) -> Vec<u32> {
    all_mutations(steps)
        .into_iter()
        .filter_map(|m| match m {
            Mutation::StatefulSetUpdated { partition, .. } => Some(partition),
            _ => None,
        })
        .collect()
}

#[rstest]
#[case::patch("v19.2.5", "v19.2.6", None)]
#[case::minor("v19.1.4", "v19.2.1", Some("19.1"))]
#[case::major("v19.2.6", "v20.1.1", Some("19.2"))]
#[tokio::test]
async fn test_upgrade_rolls_every_node(
    #[case] from: &str,
    #[case] to: &str,
    #[case] pinned: Option<&str>,
) {
    let world = running_at(3, from).await;
    let from_version = Version::from_image(&image(from)).unwrap();
    let to_version = Version::from_image(&image(to)).unwrap();

    world.update_spec(|spec| spec.image = ImageSpec::new(image(to)));
    let mut seen_pin = None;
    let steps = world
        .converge_with(|world, _| {
            if let Some(series) = world.backend.preserve_downgrade_setting(&world.key) {
                seen_pin = Some(series);
            }
        })
        .await;

    assert_eq!(partitions(&steps), vec![3, 2, 1, 0]);
    assert!(world.images().iter().all(|i| *i == image(to)));
    assert!(world
        .backend
        .live_versions(&world.key)
        .iter()
        .all(|v| *v == Some(to_version)));
    assert!(to_version > from_version);

    let mutations = all_mutations(&steps);
    match pinned {
        Some(series) => {
            assert_eq!(seen_pin.as_deref(), Some(series));
            assert!(mutations.contains(&Mutation::PreserveDowngradeSet {
                series: series.to_string()
            }));
            assert_eq!(mutations.last(), Some(&Mutation::PreserveDowngradeReset));
        }
        None => {
            assert_eq!(seen_pin, None);
            assert!(!mutations
                .iter()
                .any(|m| matches!(m, Mutation::PreserveDowngradeSet { .. })));
        }
    }
    assert_eq!(world.backend.preserve_downgrade_setting(&world.key), None);

    let status = world.backend.status(&world.key);
    assert_eq!(status.version, Some(to_version.to_string()));
    assert!(status.is_true(ConditionType::UpgradePathValid));
    assert!(status.is_true(ConditionType::Updated));
    assert!(status.is_true(ConditionType::Stable));
}

#[tokio::test]
async fn test_nodes_only_move_forward() {
    let world = running_at(5, "v19.2.6").await;
    let old = Some(Version::new(19, 2, 6));
    let new = Some(Version::new(20, 1, 1));

    world.update_spec(|spec| spec.image = ImageSpec::new(image("v20.1.1")));
    let mut upgraded_before = 0;
    world
        .converge_with(|world, _| {
            let live = world.backend.live_versions(&world.key);
            assert!(live.iter().all(|v| *v == old || *v == new), "{live:?}");
            let upgraded = live.iter().filter(|v| **v == new).count();
            assert!(upgraded >= upgraded_before);
            assert!(upgraded <= upgraded_before + 1);
            upgraded_before = upgraded;
        })
        .await;
    assert_eq!(upgraded_before, 5);
}

#[rstest]
#[case::downgrade("v19.2.5")]
#[case::previous_series("v19.1.4")]
#[case::skipped_series("v20.2.0")]
#[tokio::test]
async fn test_unsupported_version_change_is_rejected(#[case] to: &str) {
    let world = running_at(3, "v19.2.6").await;
    let sts_before = world.backend.stateful_set(&world.key);

    world.update_spec(|spec| spec.image = ImageSpec::new(image(to)));
    let step = world.step().await;

    assert_eq!(step.report.next, Next::Done);
    assert!(step.mutations.is_empty(), "{:?}", step.mutations);
    assert_eq!(world.backend.stateful_set(&world.key), sts_before);
    assert!(world.images().iter().all(|i| *i == image("v19.2.6")));

    let status = world.backend.status(&world.key);
    let gate = status.condition(ConditionType::UpgradePathValid).unwrap();
    assert_eq!(gate.status, ConditionStatus::False);
    assert_eq!(gate.reason, "UnsupportedUpgradePath");
    assert!(!status.is_true(ConditionType::Stable));

    // Nothing changes on later passes either.
    let again = world.step().await;
    assert_eq!(again.report.next, Next::Done);
    assert!(again.mutations.is_empty());
}

#[tokio::test]
async fn test_reverting_a_rejected_change_recovers() {
    let world = running_at(3, "v19.2.6").await;
    world.update_spec(|spec| spec.image = ImageSpec::new(image("v19.2.5")));
    world.step().await;

    world.update_spec(|spec| spec.image = ImageSpec::new(image("v19.2.6")));
    let steps = world.converge().await;
    assert!(executed(&steps).is_empty());
    assert!(all_mutations(&steps).is_empty());

    let status = world.backend.status(&world.key);
    assert!(status.is_true(ConditionType::Stable));
    assert!(status.is_true(ConditionType::UpgradePathValid));
}

#[tokio::test]
async fn test_upgrade_waits_for_unready_node() {
    let world = running_at(3, "v19.2.5").await;
    world.backend.hold_pods_unready(true);

    world.update_spec(|spec| spec.image = ImageSpec::new(image("v19.2.6")));
    // Stage, then restart the highest ordinal.
    world.step().await;
    world.step().await;

    for _ in 0..3 {
        let step = world.step().await;
        assert_eq!(step.report.executed, Some("partitioned-update"));
        assert!(step.mutations.is_empty(), "{:?}", step.mutations);
    }
    let upgraded: Vec<_> = world
        .images()
        .into_iter()
        .filter(|i| *i == image("v19.2.6"))
        .collect();
    assert_eq!(upgraded.len(), 1);

    world.backend.hold_pods_unready(false);
    world.backend.set_pod_ready(&world.key, 2, true);
    world.converge().await;
    assert!(world.images().iter().all(|i| *i == image("v19.2.6")));
}
