//! Reconcile driver.
//!
//! One call to [`Driver::reconcile`] is one pass for one cluster:
//!
//! 1. Read the cluster resource.
//! 2. Observe the platform and the database.
//! 3. Resolve the spec into a target.
//! 4. Plan: pick the first required actor, or declare the cluster stable.
//! 5. Execute at most one actor and fold its outcome into the conditions.
//! 6. Write the status back under the resource version that was read.
//!
//! The driver never waits on the cluster. It returns a [`Next`] decision and
//! the worker that owns the key schedules the following pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crdb_api::{
    ClusterKey, ClusterStatus, ConditionStatus, ConditionType, ConditionUpdate, CrdbCluster,
};
use tracing::{debug, info, instrument, warn};

use crate::actors::{self, Actor, Effects, Outcome, PassInput, Plan, ACTOR_SET};
use crate::database::DatabaseClient;
use crate::error::{bounded, ObservationError, ReconcileError, SafetyViolation};
use crate::observer::Observer;
use crate::platform::{Platform, PlatformError};
use crate::resolver::resolve;
use crate::snapshot::Snapshot;

// =============================================================================
// Configuration
// =============================================================================

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Upper bound on every platform and database call.
    pub api_timeout: Duration,

    /// Delay before the next pass after an actor completed a step.
    pub requeue_after_step: Duration,

    /// Delay before the next pass while an actor waits on the cluster.
    pub requeue_in_progress: Duration,

    /// Full-pass retries after a status write conflict.
    pub max_conflict_retries: u32,

    /// Smallest node count the resolver accepts.
    pub min_nodes: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            api_timeout: Duration::from_secs(10),
            requeue_after_step: Duration::from_secs(1),
            requeue_in_progress: Duration::from_secs(5),
            max_conflict_retries: 3,
            min_nodes: 1,
        }
    }
}

// =============================================================================
// Pass Report
// =============================================================================

/// When the key should be reconciled again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Nothing to do until the resource changes.
    Done,
    /// Reconcile again after the given delay.
    Requeue(Duration),
    /// Reconcile again after the worker's exponential backoff.
    Backoff,
}

/// Coarse lifecycle phase, derived each pass and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterPhase {
    Unknown,
    Initializing,
    Converging,
    Stable,
}

impl ClusterPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Initializing => "initializing",
            Self::Converging => "converging",
            Self::Stable => "stable",
        }
    }
}

/// Summary of one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub next: Next,
    /// Actor whose `act` ran, if any.
    pub executed: Option<&'static str>,
    pub phase: ClusterPhase,
}

impl PassReport {
    fn new(next: Next, phase: ClusterPhase) -> Self {
        Self {
            next,
            executed: None,
            phase,
        }
    }
}

// =============================================================================
// Driver
// =============================================================================

pub struct Driver {
    platform: Arc<dyn Platform>,
    database: Arc<dyn DatabaseClient>,
    config: DriverConfig,
}

impl Driver {
    pub fn new(
        platform: Arc<dyn Platform>,
        database: Arc<dyn DatabaseClient>,
        config: DriverConfig,
    ) -> Self {
        Self {
            platform,
            database,
            config,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Run one pass for `key`, retrying the whole pass on write conflicts.
    #[instrument(skip(self), fields(cluster = %key))]
    pub async fn reconcile(&self, key: &ClusterKey) -> PassReport {
        let mut conflicts = 0;
        loop {
            match self.pass(key).await {
                Ok(report) => {
                    debug!(
                        phase = report.phase.as_str(),
                        executed = report.executed.unwrap_or("none"),
                        next = ?report.next,
                        "pass finished"
                    );
                    return report;
                }
                Err(ReconcileError::Conflict(message))
                    if conflicts < self.config.max_conflict_retries =>
                {
                    conflicts += 1;
                    debug!(attempt = conflicts, %message, "write conflict, retrying pass");
                }
                Err(err) => {
                    warn!(error = %err, "pass failed");
                    return PassReport::new(Next::Backoff, ClusterPhase::Unknown);
                }
            }
        }
    }

    async fn pass(&self, key: &ClusterKey) -> Result<PassReport, ReconcileError> {
        let limit = self.config.api_timeout;

        let Some(cluster) = bounded(limit, "get_cluster", self.platform.get_cluster(key))
            .await
            .map_err(|source| ObservationError::Platform {
                what: "cluster",
                source,
            })?
        else {
            debug!("cluster resource is gone");
            return Ok(PassReport::new(Next::Done, ClusterPhase::Unknown));
        };

        let observer = Observer::new(self.platform.as_ref(), self.database.as_ref(), limit);
        let snapshot = observer.observe(key).await?;

        let original = cluster.status_or_default();
        let mut status = original.clone();
        let now = Utc::now();

        let target = match resolve(
            key,
            &cluster.spec,
            &snapshot.storage_classes,
            self.config.min_nodes,
        ) {
            Ok(target) => target,
            Err(err) => {
                warn!(error = %err, "spec rejected");
                status.set_condition(
                    ConditionUpdate::falsy(ConditionType::SpecValid, err.reason(), err.to_string()),
                    now,
                );
                status.set_condition(
                    ConditionUpdate::falsy(ConditionType::Stable, "SpecInvalid", err.to_string()),
                    now,
                );
                self.write_status(&cluster, &snapshot, &original, status).await?;
                return Ok(PassReport::new(Next::Done, ClusterPhase::Unknown));
            }
        };
        status.set_condition(
            ConditionUpdate::truthy(ConditionType::SpecValid, "Valid", "spec accepted"),
            now,
        );

        let input = PassInput {
            key,
            snapshot: &snapshot,
            target: &target,
            status: &original,
        };
        let plan = actors::plan(&input);
        let mut report = match plan {
            Plan::Stable => {
                mark_stable(&mut status, now);
                PassReport::new(Next::Done, ClusterPhase::Stable)
            }
            Plan::Act(actor) => {
                let next = self.execute(actor, &input, &mut status).await?;
                PassReport {
                    next,
                    executed: Some(actor.name()),
                    phase: derive_phase(&snapshot, &status),
                }
            }
        };

        if !self.write_status(&cluster, &snapshot, &original, status).await? {
            report.next = Next::Done;
        }
        info!(phase = report.phase.as_str(), plan = ?plan, "reconciled");
        Ok(report)
    }

    /// Run `actor` once and fold the result into `status`.
    async fn execute(
        &self,
        actor: &'static dyn Actor,
        input: &PassInput<'_>,
        status: &mut ClusterStatus,
    ) -> Result<Next, ReconcileError> {
        let now = Utc::now();
        let condition = actor.condition();
        status.set_condition(
            ConditionUpdate::falsy(ConditionType::Stable, "Converging", actor.name()),
            now,
        );

        if let Err(violation) = tls_guard(actor, input) {
            warn!(actor = actor.name(), %violation, "actor held back");
            hold(status, condition, &violation, now);
            return Ok(Next::Backoff);
        }

        let effects = Effects {
            platform: self.platform.as_ref(),
            database: self.database.as_ref(),
            api_timeout: self.config.api_timeout,
        };

        let next = match actor.act(input, &effects).await {
            Ok(Outcome::Completed { message }) => {
                info!(actor = actor.name(), %message, "step completed");
                status.set_condition(ConditionUpdate::truthy(condition, "Completed", message), now);
                release(status, now);
                Next::Requeue(self.config.requeue_after_step)
            }
            Ok(Outcome::InProgress { message }) => {
                debug!(actor = actor.name(), %message, "step in progress");
                status.set_condition(ConditionUpdate::falsy(condition, "InProgress", message), now);
                release(status, now);
                Next::Requeue(self.config.requeue_in_progress)
            }
            Ok(Outcome::Failed { reason, message }) => {
                warn!(actor = actor.name(), %reason, %message, "step failed");
                status.set_condition(ConditionUpdate::falsy(condition, reason, message), now);
                Next::Backoff
            }
            Err(ReconcileError::Validation(err)) => {
                warn!(actor = actor.name(), error = %err, "change rejected");
                status.set_condition(
                    ConditionUpdate::falsy(condition, err.reason(), err.to_string()),
                    now,
                );
                Next::Done
            }
            Err(ReconcileError::Safety(violation)) => {
                warn!(actor = actor.name(), %violation, "actor held back");
                hold(status, condition, &violation, now);
                Next::Backoff
            }
            Err(err @ ReconcileError::Conflict(_)) => return Err(err),
            Err(err) => {
                warn!(actor = actor.name(), error = %err, "step errored");
                status.set_condition(
                    ConditionUpdate::falsy(condition, "ActionFailed", err.to_string()),
                    now,
                );
                Next::Backoff
            }
        };
        Ok(next)
    }

    /// Persist `status` if it differs from what was read.
    ///
    /// Returns false when the resource disappeared in the meantime.
    async fn write_status(
        &self,
        cluster: &CrdbCluster,
        snapshot: &Snapshot,
        original: &ClusterStatus,
        mut status: ClusterStatus,
    ) -> Result<bool, ReconcileError> {
        status.observed_generation = cluster.metadata.generation;
        status.ready_replicas = i32::try_from(snapshot.ready_pods()).unwrap_or(i32::MAX);
        status.version = snapshot.running_version().map(|v| v.to_string());

        if &status == original {
            return Ok(true);
        }

        let key = cluster.key();
        let write = self.platform.update_cluster_status(
            &key,
            cluster.metadata.resource_version.as_deref(),
            &status,
        );
        match bounded(self.config.api_timeout, "update_cluster_status", write).await {
            Ok(_) => Ok(true),
            Err(PlatformError::NotFound(_)) => Ok(false),
            Err(err) => Err(ReconcileError::from_platform("update_cluster_status", err)),
        }
    }
}

/// Refuse actors that would start nodes without their certificates.
pub fn tls_guard(actor: &dyn Actor, input: &PassInput<'_>) -> Result<(), SafetyViolation> {
    if input.target.tls
        && !input.snapshot.certificates.all_valid()
        && actor.starts_nodes(input)
    {
        return Err(SafetyViolation::CertificatesMissing);
    }
    Ok(())
}

/// Phase as seen from the snapshot and the conditions written this pass.
pub fn derive_phase(snapshot: &Snapshot, status: &ClusterStatus) -> ClusterPhase {
    if status.is_true(ConditionType::Stable) {
        return ClusterPhase::Stable;
    }
    let initialized = snapshot
        .database
        .initialized
        .unwrap_or_else(|| status.is_true(ConditionType::Initialized));
    if snapshot.stateful_set.is_none() || !initialized {
        ClusterPhase::Initializing
    } else {
        ClusterPhase::Converging
    }
}

fn mark_stable(status: &mut ClusterStatus, now: chrono::DateTime<Utc>) {
    for actor in ACTOR_SET.iter() {
        let condition = actor.condition();
        let pending = status
            .condition(condition)
            .is_some_and(|c| c.status != ConditionStatus::True);
        if pending {
            status.set_condition(
                ConditionUpdate::truthy(condition, "Converged", "nothing left to do"),
                now,
            );
        }
    }
    status.set_condition(
        ConditionUpdate::falsy(ConditionType::SafetyHold, "Clear", ""),
        now,
    );
    status.set_condition(
        ConditionUpdate::truthy(ConditionType::Stable, "Converged", "cluster matches its spec"),
        now,
    );
}

fn hold(
    status: &mut ClusterStatus,
    condition: ConditionType,
    violation: &SafetyViolation,
    now: chrono::DateTime<Utc>,
) {
    status.set_condition(
        ConditionUpdate::truthy(ConditionType::SafetyHold, violation.reason(), violation.to_string()),
        now,
    );
    status.set_condition(
        ConditionUpdate::falsy(condition, violation.reason(), violation.to_string()),
        now,
    );
}

fn release(status: &mut ClusterStatus, now: chrono::DateTime<Utc>) {
    if status.is_true(ConditionType::SafetyHold) {
        status.set_condition(
            ConditionUpdate::falsy(ConditionType::SafetyHold, "Clear", ""),
            now,
        );
    }
}
