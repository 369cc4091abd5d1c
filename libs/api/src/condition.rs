//! Status conditions.
//!
//! Conditions are the externally visible progress markers on a cluster and
//! double as gating state between reconcile passes. The list is kept ordered
//! by `ConditionType` so that status diffs stay stable.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Named condition types, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    /// The spec passed validation.
    SpecValid,
    /// CA, node and client certificate secrets exist.
    CertificatesReady,
    /// The database cluster has been bootstrapped.
    Initialized,
    /// The requested version is reachable from the running one.
    UpgradePathValid,
    /// Every node runs the current pod template.
    Updated,
    /// The node count matches the spec.
    Scaled,
    /// The node being removed has been drained.
    Decommissioned,
    /// Volume claims match the requested capacity.
    StorageResized,
    /// A safety rule is holding back progress.
    SafetyHold,
    /// Nothing is left to converge.
    Stable,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpecValid => "SpecValid",
            Self::CertificatesReady => "CertificatesReady",
            Self::Initialized => "Initialized",
            Self::UpgradePathValid => "UpgradePathValid",
            Self::Updated => "Updated",
            Self::Scaled => "Scaled",
            Self::Decommissioned => "Decommissioned",
            Self::StorageResized => "StorageResized",
            Self::SafetyHold => "SafetyHold",
            Self::Stable => "Stable",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tri-state condition value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A condition as persisted on the resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// A desired condition change. The timestamp is filled in when applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionUpdate {
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
}

impl ConditionUpdate {
    pub fn new(
        type_: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_,
            status,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn truthy(type_: ConditionType, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(type_, ConditionStatus::True, reason, message)
    }

    pub fn falsy(type_: ConditionType, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(type_, ConditionStatus::False, reason, message)
    }
}

/// Apply `update` to an ordered condition list.
///
/// `last_transition_time` only moves when the status value flips. Returns
/// true if anything changed.
pub fn apply_update(conditions: &mut Vec<Condition>, update: ConditionUpdate, now: DateTime<Utc>) -> bool {
    match conditions.binary_search_by_key(&update.type_, |c| c.type_) {
        Ok(idx) => {
            let existing = &mut conditions[idx];
            if existing.status == update.status
                && existing.reason == update.reason
                && existing.message == update.message
            {
                return false;
            }
            if existing.status != update.status {
                existing.status = update.status;
                existing.last_transition_time = now;
            }
            existing.reason = update.reason;
            existing.message = update.message;
            true
        }
        Err(idx) => {
            conditions.insert(
                idx,
                Condition {
                    type_: update.type_,
                    status: update.status,
                    last_transition_time: now,
                    reason: update.reason,
                    message: update.message,
                },
            );
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_conditions_stay_ordered() {
        let now = Utc::now();
        let mut conditions = Vec::new();

        apply_update(
            &mut conditions,
            ConditionUpdate::truthy(ConditionType::Stable, "Converged", ""),
            now,
        );
        apply_update(
            &mut conditions,
            ConditionUpdate::truthy(ConditionType::Initialized, "Initialized", ""),
            now,
        );
        apply_update(
            &mut conditions,
            ConditionUpdate::falsy(ConditionType::Updated, "InProgress", ""),
            now,
        );

        let order: Vec<_> = conditions.iter().map(|c| c.type_).collect();
        assert_eq!(
            order,
            vec![
                ConditionType::Initialized,
                ConditionType::Updated,
                ConditionType::Stable
            ]
        );
    }

    #[test]
    fn test_transition_time_moves_only_on_flip() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(30);
        let t2 = t1 + Duration::seconds(30);
        let mut conditions = Vec::new();

        apply_update(
            &mut conditions,
            ConditionUpdate::falsy(ConditionType::Updated, "InProgress", "node 2"),
            t0,
        );
        assert!(apply_update(
            &mut conditions,
            ConditionUpdate::falsy(ConditionType::Updated, "InProgress", "node 1"),
            t1,
        ));
        assert_eq!(conditions[0].last_transition_time, t0);
        assert_eq!(conditions[0].message, "node 1");

        assert!(apply_update(
            &mut conditions,
            ConditionUpdate::truthy(ConditionType::Updated, "Completed", ""),
            t2,
        ));
        assert_eq!(conditions[0].last_transition_time, t2);
    }

    #[test]
    fn test_identical_update_is_noop() {
        let now = Utc::now();
        let mut conditions = Vec::new();
        let update = ConditionUpdate::truthy(ConditionType::Scaled, "Completed", "3 nodes");

        assert!(apply_update(&mut conditions, update.clone(), now));
        assert!(!apply_update(
            &mut conditions,
            update,
            now + Duration::seconds(5)
        ));
    }

    #[test]
    fn test_condition_serializes_type_field() {
        let condition = Condition {
            type_: ConditionType::CertificatesReady,
            status: ConditionStatus::True,
            last_transition_time: Utc::now(),
            reason: "Generated".to_string(),
            message: String::new(),
        };
        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "CertificatesReady");
        assert_eq!(json["status"], "True");
        assert!(json.get("lastTransitionTime").is_some());
    }
}
