//! Worker tree that schedules reconcile passes.
//!
//! ```text
//! Controller
//! └── ClusterWorker(namespace/name)
//! ```
//!
//! - `framework`: worker trait, handles, supervisor, backoff and restart
//!   policies
//! - `cluster`: the per-cluster worker
//! - `controller`: event intake, periodic ticks and resync

pub mod cluster;
pub mod controller;
pub mod framework;

pub use cluster::{ClusterMessage, ClusterWorker, WorkerStatus};
pub use controller::{ClusterEvent, Controller, ControllerConfig};
pub use framework::{BackoffPolicy, RestartPolicy, Supervisor, WorkerError, WorkerHandle};
