//! Decommission actor: drains the highest-ordinal node before the workload
//! shrinks.

use async_trait::async_trait;
use crdb_api::ConditionType;
use crdb_reconcile::quorum;
use tracing::info;

use super::{Actor, Effects, Outcome, PassInput};
use crate::error::{ReconcileError, SafetyViolation};

pub struct DecommissionActor;

#[async_trait]
impl Actor for DecommissionActor {
    fn name(&self) -> &'static str {
        "decommission"
    }

    fn condition(&self) -> ConditionType {
        ConditionType::Decommissioned
    }

    fn is_required(&self, input: &PassInput<'_>) -> bool {
        let snapshot = input.snapshot;
        let replicas = snapshot.replicas();
        if replicas <= input.target.nodes {
            return false;
        }
        !snapshot
            .node_for_ordinal(replicas - 1)
            .is_some_and(|node| node.is_drained())
    }

    async fn act(
        &self,
        input: &PassInput<'_>,
        effects: &Effects<'_>,
    ) -> Result<Outcome, ReconcileError> {
        let key = input.key;
        let snapshot = input.snapshot;
        let replicas = snapshot.replicas();
        let Some(ordinal) = replicas.checked_sub(1) else {
            return Ok(Outcome::completed("no nodes to remove"));
        };

        if !snapshot.has_quorum() {
            let members = replicas as usize;
            return Err(SafetyViolation::QuorumLost {
                live: snapshot.live_members(),
                members,
                required: quorum(members),
            }
            .into());
        }

        let Some(node) = snapshot.node_for_ordinal(ordinal) else {
            return Ok(Outcome::failed(
                "NodeNotFound",
                format!("no database node backs pod {ordinal}"),
            ));
        };

        if !node.is_decommissioning {
            effects.decommission(key, node.node_id).await?;
            info!(cluster = %key, node_id = node.node_id, ordinal, "decommissioning node");
            return Ok(Outcome::in_progress(format!(
                "decommissioning node {} ({} replicas)",
                node.node_id, node.replica_count
            )));
        }

        if node.replica_count > 0 {
            return Ok(Outcome::in_progress(format!(
                "draining node {}: {} replicas left",
                node.node_id, node.replica_count
            )));
        }

        Ok(Outcome::completed(format!("node {} drained", node.node_id)))
    }
}
