//! Cluster worker: owns reconcile scheduling for one cluster key.
//!
//! Passes for a key only ever run inside its worker, one message at a time,
//! so two passes for the same cluster never overlap. Across clusters the
//! shared semaphore bounds how many passes run at once.
//!
//! Change notifications coalesce through the `dirty` flag: any number of
//! notifications between two passes cause exactly one pass. Requeues are
//! cooperative; the worker records when the next pass is due and the
//! controller's periodic `Tick` runs it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use crdb_api::ClusterKey;
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use super::framework::{BackoffPolicy, Worker, WorkerContext, WorkerError};
use crate::driver::{Driver, Next, PassReport};

// =============================================================================
// Messages
// =============================================================================

#[derive(Debug)]
pub enum ClusterMessage {
    /// The cluster or something it owns changed.
    Reconcile,
    /// Periodic wake-up; runs a pass if one is due.
    Tick,
    Stop,
}

/// What the worker last did, published for the controller.
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub passes: u64,
    pub last_report: Option<PassReport>,
    pub next_reconcile_at: Option<Instant>,
    /// Passes in a row that ended in backoff.
    pub consecutive_failures: u32,
}

// =============================================================================
// Worker
// =============================================================================

pub struct ClusterWorker {
    key: ClusterKey,
    driver: Arc<Driver>,
    permits: Arc<Semaphore>,
    backoff: BackoffPolicy,
    dirty: Arc<AtomicBool>,
    next_reconcile_at: Option<Instant>,
    failures: u32,
    passes: u64,
    status_tx: watch::Sender<WorkerStatus>,
}

impl ClusterWorker {
    pub fn new(
        key: ClusterKey,
        driver: Arc<Driver>,
        permits: Arc<Semaphore>,
        backoff: BackoffPolicy,
        dirty: Arc<AtomicBool>,
    ) -> (Self, watch::Receiver<WorkerStatus>) {
        let (status_tx, status_rx) = watch::channel(WorkerStatus::default());
        let worker = Self {
            key,
            driver,
            permits,
            backoff,
            dirty,
            next_reconcile_at: None,
            failures: 0,
            passes: 0,
            status_tx,
        };
        (worker, status_rx)
    }

    fn is_due(&self, now: Instant) -> bool {
        self.next_reconcile_at.is_some_and(|at| at <= now)
    }

    async fn run_pass(&mut self) -> Result<(), WorkerError> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::Stopped)?;

        self.next_reconcile_at = None;
        let report = self.driver.reconcile(&self.key).await;
        self.passes += 1;

        let now = Instant::now();
        match report.next {
            Next::Done => {
                self.failures = 0;
            }
            Next::Requeue(after) => {
                self.failures = 0;
                self.next_reconcile_at = Some(now + after);
            }
            Next::Backoff => {
                let delay = self.backoff.delay(self.failures);
                self.failures = self.failures.saturating_add(1);
                self.next_reconcile_at = Some(now + delay);
                debug!(
                    cluster = %self.key,
                    failures = self.failures,
                    delay_ms = delay.as_millis() as u64,
                    "backing off"
                );
            }
        }

        let status = WorkerStatus {
            passes: self.passes,
            last_report: Some(report),
            next_reconcile_at: self.next_reconcile_at,
            consecutive_failures: self.failures,
        };
        self.status_tx.send_replace(status);
        Ok(())
    }
}

#[async_trait]
impl Worker for ClusterWorker {
    type Message = ClusterMessage;

    fn name(&self) -> &str {
        "cluster"
    }

    async fn on_start(&mut self, _ctx: &mut WorkerContext) -> Result<(), WorkerError> {
        // A fresh worker has never seen its cluster.
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: ClusterMessage,
        ctx: &mut WorkerContext,
    ) -> Result<bool, WorkerError> {
        if ctx.is_shutdown() {
            return Ok(false);
        }
        match msg {
            ClusterMessage::Stop => return Ok(false),
            ClusterMessage::Reconcile | ClusterMessage::Tick => {
                let dirty = self.dirty.swap(false, Ordering::AcqRel);
                if dirty || self.is_due(Instant::now()) {
                    self.run_pass().await?;
                }
            }
        }
        Ok(true)
    }
}
