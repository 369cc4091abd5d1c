//! Shared harness for the operator integration tests.
//!
//! A `World` couples the in-memory backend with a driver. `step` runs one
//! reconcile pass and then lets the simulated platform settle, which is the
//! cadence a real controller sees between passes.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use crdb_api::{ClusterKey, ClusterSpec, ConditionType, CrdbCluster};
use crdb_operator::memory::Mutation;
use crdb_operator::{ClusterPhase, Driver, DriverConfig, InMemoryBackend, Next, PassReport};

/// Upper bound on passes any scenario needs.
pub const MAX_PASSES: usize = 64;

/// What one pass did.
#[derive(Debug, Clone)]
pub struct Step {
    pub report: PassReport,
    pub mutations: Vec<Mutation>,
}

pub struct World {
    pub backend: Arc<InMemoryBackend>,
    pub driver: Driver,
    pub key: ClusterKey,
}

impl World {
    pub fn new(cluster: CrdbCluster) -> Self {
        Self::with_backend(Arc::new(InMemoryBackend::new()), cluster)
    }

    pub fn with_backend(backend: Arc<InMemoryBackend>, cluster: CrdbCluster) -> Self {
        let key = cluster.key();
        backend.insert_cluster(cluster);
        let config = DriverConfig {
            api_timeout: Duration::from_secs(1),
            ..DriverConfig::default()
        };
        let driver = Driver::new(backend.clone(), backend.clone(), config);
        Self {
            backend,
            driver,
            key,
        }
    }

    /// One pass without letting the platform move.
    pub async fn pass(&self) -> Step {
        self.backend.clear_mutations();
        let report = self.driver.reconcile(&self.key).await;
        Step {
            report,
            mutations: self.backend.mutations_for(&self.key),
        }
    }

    /// One pass, then the platform settles.
    pub async fn step(&self) -> Step {
        let step = self.pass().await;
        self.backend.settle();
        step
    }

    /// Step until a pass reports the cluster stable, checking `each` after
    /// every step.
    pub async fn converge_with(&self, mut each: impl FnMut(&World, &Step)) -> Vec<Step> {
        let mut steps = Vec::new();
        for _ in 0..MAX_PASSES {
            let step = self.step().await;
            each(self, &step);
            let stable = step.report.phase == ClusterPhase::Stable;
            steps.push(step);
            if stable {
                return steps;
            }
        }
        panic!(
            "{} did not converge in {MAX_PASSES} passes; last: {:?}",
            self.key,
            steps.last().map(|s| &s.report)
        );
    }

    pub async fn converge(&self) -> Vec<Step> {
        self.converge_with(|_, _| {}).await
    }

    pub fn update_spec(&self, edit: impl FnOnce(&mut ClusterSpec)) {
        self.backend.update_spec(&self.key, edit);
    }

    pub fn condition_true(&self, condition: ConditionType) -> bool {
        self.backend.status(&self.key).is_true(condition)
    }

    pub fn images(&self) -> Vec<String> {
        self.backend
            .pods(&self.key)
            .into_iter()
            .map(|p| p.image)
            .collect()
    }
}

/// Actor names in the order they ran.
pub fn executed(steps: &[Step]) -> Vec<&'static str> {
    steps.iter().filter_map(|s| s.report.executed).collect()
}

pub fn is_workload_write(mutation: &Mutation) -> bool {
    matches!(
        mutation,
        Mutation::StatefulSetCreated { .. } | Mutation::StatefulSetUpdated { .. }
    )
}

pub fn assert_stable_is_quiet(step: &Step) {
    assert_eq!(step.report.next, Next::Done);
    assert_eq!(step.report.executed, None);
    assert!(step.mutations.is_empty(), "{:?}", step.mutations);
}
