//! Reconciliation primitives.
//!
//! Helpers shared by the reconcile engine that carry no knowledge of the
//! platform or the database:
//!
//! - **Spec hashes**: a deterministic digest of a pod template, used to tell
//!   which members already run the desired configuration.
//! - **Quorum**: majority math for a replicated cluster.
//! - **Rollout ordering**: which stale member to restart next.
//!
//! # Invariants
//!
//! - Hashes are deterministic given the same template, regardless of key order
//! - A rollout never picks more than one member per call

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Digest of a pod template, compared to tell stale members from current
/// ones.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Hash `value` in canonical form (object keys sorted, no whitespace),
    /// truncated to 128 bits.
    pub fn from_json(value: &Value) -> Self {
        let mut canonical = String::new();
        write_canonical(value, &mut canonical);
        let digest = Sha256::digest(canonical.as_bytes());
        Self(format!("sha256:{}", hex::encode(&digest[..16])))
    }

    /// Wrap an already computed hash string, e.g. one read back from a label.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, field)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(key.as_str()).to_string());
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars print compactly and strings come out escaped.
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Split members into (current, stale) based on their spec hash.
pub fn classify_members<I, F>(
    members: I,
    desired_spec_hash: &SpecHash,
    get_spec_hash: F,
) -> (Vec<I::Item>, Vec<I::Item>)
where
    I: IntoIterator,
    F: Fn(&I::Item) -> &SpecHash,
{
    let mut current = Vec::new();
    let mut stale = Vec::new();

    for member in members {
        if get_spec_hash(&member) == desired_spec_hash {
            current.push(member);
        } else {
            stale.push(member);
        }
    }

    (current, stale)
}

/// Pick the next stale member to roll.
///
/// Members are rolled from the highest ordinal down, the same order a
/// partitioned stateful workload applies updates in.
pub fn next_to_roll<T, F>(stale: &[T], ordinal: F) -> Option<&T>
where
    F: Fn(&T) -> u32,
{
    stale.iter().max_by_key(|m| ordinal(m))
}

/// Smallest number of live members that still forms a majority of `members`.
pub fn quorum(members: usize) -> usize {
    members / 2 + 1
}

/// Whether `live` members out of `members` form a majority.
///
/// An empty membership never has quorum.
pub fn has_quorum(live: usize, members: usize) -> bool {
    members > 0 && live >= quorum(members)
}
