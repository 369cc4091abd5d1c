//! CockroachDB cluster operator.
//!
//! Converges CockroachDB clusters toward their `CrdbCluster` spec. Each pass
//! observes the platform and the database, resolves the spec into a target,
//! and runs at most one convergence actor.
//!
//! ## Architecture
//!
//! ```text
//! Controller
//! └── ClusterWorker(key)          one per cluster, sequential passes
//!     └── Driver::reconcile       observe → resolve → plan → act → status
//!         ├── Observer            read-only snapshot
//!         ├── resolve             spec → TargetConfig
//!         └── actors              fixed, ordered actor set
//! ```
//!
//! ## Modules
//!
//! - `platform` / `database`: the ports the engine talks through
//! - `memory`: in-memory implementation of both ports
//! - `observer`, `snapshot`: current state
//! - `resolver`, `workload`, `pki`: desired state and the objects it implies
//! - `actors`, `driver`: the reconcile pass
//! - `worker`: per-cluster scheduling
//! - `config`: environment configuration

pub mod actors;
pub mod config;
pub mod database;
pub mod driver;
pub mod error;
pub mod memory;
pub mod observer;
pub mod pki;
pub mod platform;
pub mod resolver;
pub mod snapshot;
pub mod worker;
pub mod workload;

pub use config::{LogFormat, OperatorConfig};
pub use driver::{ClusterPhase, Driver, DriverConfig, Next, PassReport};
pub use error::{ReconcileError, SafetyViolation, ValidationError};
pub use memory::InMemoryBackend;
