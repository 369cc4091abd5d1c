//! Partitioned update actor: rolls a template change through the cluster one
//! node at a time.
//!
//! The workload's partition decides which pods run the new template: pods
//! with an ordinal at or above it are updated by the platform, pods below it
//! are left alone. Lowering the partition by one ordinal per step, from the
//! top, restarts exactly one node per step. Before every step the node
//! restarted last must be ready, live and fully replicated again.

use async_trait::async_trait;
use crdb_api::ConditionType;
use crdb_reconcile::{classify_members, next_to_roll, quorum};
use tracing::info;

use super::{Actor, Effects, Outcome, PassInput};
use crate::error::{ReconcileError, SafetyViolation};
use crate::platform::Pod;
use crate::snapshot::Snapshot;

pub struct PartitionedUpdateActor;

impl PartitionedUpdateActor {
    /// The template changed in a way that leaves the version alone.
    fn template_drift(input: &PassInput<'_>) -> bool {
        input.snapshot.stateful_set.as_ref().is_some_and(|sts| {
            sts.template_hash() != input.target.template_hash
                && sts.template.version() == Some(input.target.version)
        })
    }

    /// Current members whose pod was created from an older template.
    fn stale_pods(snapshot: &Snapshot) -> Vec<&Pod> {
        let Some(sts) = snapshot.stateful_set.as_ref() else {
            return Vec::new();
        };
        let desired = sts.template_hash();
        let members = snapshot.pods.range(..sts.replicas).map(|(_, pod)| pod);
        let (_, stale) = classify_members(members, &desired, |pod| &pod.template_hash);
        stale
    }

    fn finalize_pending(input: &PassInput<'_>) -> bool {
        input.snapshot.database.preserve_downgrade.is_some()
            && input
                .snapshot
                .stateful_set
                .as_ref()
                .is_some_and(|sts| sts.template.version() == Some(input.target.version))
    }

    /// The first updated member that has not yet rejoined.
    fn unsettled(snapshot: &Snapshot) -> Option<String> {
        let sts = snapshot.stateful_set.as_ref()?;
        let hash = sts.template_hash();
        (sts.partition..sts.replicas).find_map(|ordinal| {
            let Some(pod) = snapshot.pods.get(&ordinal) else {
                return Some(format!("pod {ordinal} is not scheduled"));
            };
            if pod.template_hash != hash {
                return Some(format!("{} is restarting", pod.name));
            }
            if !pod.ready {
                return Some(format!("{} is not ready", pod.name));
            }
            match snapshot.node_for_ordinal(ordinal) {
                None => Some(format!("{} has not rejoined", pod.name)),
                Some(node) if !node.is_live => Some(format!("{} is not live", pod.name)),
                Some(node) if node.under_replicated_ranges > 0 => Some(format!(
                    "{} has {} under-replicated ranges",
                    pod.name, node.under_replicated_ranges
                )),
                Some(_) => None,
            }
        })
    }
}

#[async_trait]
impl Actor for PartitionedUpdateActor {
    fn name(&self) -> &'static str {
        "partitioned-update"
    }

    fn condition(&self) -> ConditionType {
        ConditionType::Updated
    }

    fn starts_nodes(&self, _input: &PassInput<'_>) -> bool {
        true
    }

    fn is_required(&self, input: &PassInput<'_>) -> bool {
        input.snapshot.stateful_set.is_some()
            && (Self::template_drift(input)
                || !Self::stale_pods(input.snapshot).is_empty()
                || Self::finalize_pending(input))
    }

    async fn act(
        &self,
        input: &PassInput<'_>,
        effects: &Effects<'_>,
    ) -> Result<Outcome, ReconcileError> {
        let key = input.key;
        let snapshot = input.snapshot;
        let Some(sts) = snapshot.stateful_set.as_ref() else {
            return Ok(Outcome::in_progress("waiting for the workload"));
        };

        if Self::template_drift(input) {
            let mut staged = sts.clone();
            staged.template = input.target.template.clone();
            staged.partition = staged.replicas;
            effects.update_stateful_set(key, &staged).await?;
            info!(cluster = %key, "pod template updated");
            return Ok(Outcome::in_progress(format!(
                "template updated, {} node(s) to roll",
                staged.replicas
            )));
        }

        if let Some(waiting) = Self::unsettled(snapshot) {
            return Ok(Outcome::in_progress(format!("waiting: {waiting}")));
        }

        let stale = Self::stale_pods(snapshot);
        if let Some(next) = next_to_roll(&stale, |pod| pod.ordinal) {
            if !snapshot.has_quorum() {
                let members = snapshot.replicas() as usize;
                return Err(SafetyViolation::QuorumLost {
                    live: snapshot.live_members(),
                    members,
                    required: quorum(members),
                }
                .into());
            }

            let mut rolled = sts.clone();
            rolled.partition = next.ordinal;
            effects.update_stateful_set(key, &rolled).await?;
            info!(cluster = %key, pod = %next.name, "restarting node");
            return Ok(Outcome::in_progress(format!(
                "restarting {} ({} stale)",
                next.name,
                stale.len()
            )));
        }

        if Self::finalize_pending(input) {
            effects.reset_preserve_downgrade(key).await?;
            info!(cluster = %key, version = %input.target.version, "upgrade finalized");
            return Ok(Outcome::completed(format!(
                "upgrade to {} finalized",
                input.target.version
            )));
        }

        Ok(Outcome::completed(format!(
            "all {} node(s) run the current template",
            sts.replicas
        )))
    }
}
