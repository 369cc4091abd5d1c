//! Worker framework types and traits.
//!
//! Provides the building blocks the controller runs cluster workers on:
//! - `Worker` trait for message-driven tasks
//! - `Supervisor` for tracking worker lifecycles and restart budgets
//! - `WorkerHandle` for sending messages to workers
//! - Backoff and restart policies

use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for worker messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// A message-driven task.
///
/// Workers process messages one at a time and own their state outright;
/// other tasks only reach them through their mailbox.
#[async_trait]
pub trait Worker: Send + 'static {
    type Message: Message;

    /// Worker name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on failure.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut WorkerContext,
    ) -> Result<bool, WorkerError>;

    /// Called when the worker starts (or restarts).
    async fn on_start(&mut self, _ctx: &mut WorkerContext) -> Result<(), WorkerError> {
        Ok(())
    }

    /// Called when the worker is about to stop.
    async fn on_stop(&mut self, _ctx: &mut WorkerContext) {}

    /// Called after a failed message, before the next one is handled.
    fn on_crash(&mut self, _error: &WorkerError) {}
}

/// Context provided to workers during message handling.
pub struct WorkerContext {
    pub worker_id: String,

    /// Shutdown signal receiver.
    pub shutdown: watch::Receiver<bool>,

    pub messages_processed: u64,

    pub last_message_at: Option<Instant>,

    pub state: WorkerState,
}

impl WorkerContext {
    pub fn new(worker_id: String, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            worker_id,
            shutdown,
            messages_processed: 0,
            last_message_at: None,
            state: WorkerState::Starting,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum WorkerError {
    /// Transient error; the worker keeps processing messages.
    #[error("transient error: {0}")]
    Transient(String),

    /// Permanent error; the worker stops.
    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("mailbox full")]
    MailboxFull,

    #[error("worker stopped")]
    Stopped,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

// =============================================================================
// Worker Handle
// =============================================================================

/// Handle for sending messages to a worker.
#[derive(Debug)]
pub struct WorkerHandle<M: Message> {
    tx: mpsc::Sender<M>,
    worker_id: String,
}

impl<M: Message> Clone for WorkerHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            worker_id: self.worker_id.clone(),
        }
    }
}

impl<M: Message> WorkerHandle<M> {
    /// Send a message, waiting for mailbox space.
    pub async fn send(&self, msg: M) -> Result<(), WorkerError> {
        self.tx.send(msg).await.map_err(|_| WorkerError::Stopped)
    }

    /// Send a message without waiting.
    pub fn try_send(&self, msg: M) -> Result<(), WorkerError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => WorkerError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => WorkerError::Stopped,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }
}

/// Type-erased worker reference for supervision.
pub struct WorkerRef {
    pub worker_id: String,

    pub worker_type: String,

    task_handle: tokio::task::JoinHandle<()>,

    shutdown_tx: watch::Sender<bool>,
}

impl WorkerRef {
    /// Signal the worker to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }

    /// Abort the worker task immediately.
    pub fn abort(&self) {
        self.task_handle.abort();
    }
}

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay for the first retry.
    pub base: Duration,

    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based), never above `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(30) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exponent);
        let max = self.max.as_millis() as f64;
        let delay = delay.min(max);

        let spread = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if spread > 0.0 {
            rand::rng().random_range(-spread..=spread)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).clamp(0.0, max) as u64)
    }
}

// =============================================================================
// Restart Policy
// =============================================================================

/// Worker restart policy.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Maximum restarts within `window` before a worker is marked degraded.
    pub max_restarts: u32,

    pub window: Duration,

    /// Backoff between restarts.
    pub backoff: BackoffPolicy,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(300),
            backoff: BackoffPolicy::default(),
        }
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Tracks spawned workers by id and decides which dead ones to restart.
///
/// The supervisor does not know how to build workers. `reap` reports the ids
/// that are due for a restart and the owner respawns them under the same id,
/// which keeps their restart history.
pub struct Supervisor {
    children: HashMap<String, Supervised>,

    restart_policy: RestartPolicy,
}

struct Supervised {
    worker_ref: WorkerRef,
    restart_count: u32,
    restart_timestamps: Vec<Instant>,
    restart_at: Option<Instant>,
    state: SupervisedState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SupervisedState {
    Running,
    Restarting,
    Degraded,
}

impl Supervisor {
    pub fn new(restart_policy: RestartPolicy) -> Self {
        Self {
            children: HashMap::new(),
            restart_policy,
        }
    }

    /// Spawn `worker` under `worker_id`, replacing any previous child with
    /// that id.
    pub fn spawn<W>(
        &mut self,
        worker_id: String,
        worker: W,
        mailbox_size: usize,
    ) -> WorkerHandle<W::Message>
    where
        W: Worker,
    {
        let (tx, rx) = mpsc::channel(mailbox_size.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker_type = worker.name().to_string();

        let loop_id = worker_id.clone();
        let task_handle = tokio::spawn(async move {
            run_worker_loop(worker, rx, shutdown_rx, loop_id).await;
        });

        let worker_ref = WorkerRef {
            worker_id: worker_id.clone(),
            worker_type: worker_type.clone(),
            task_handle,
            shutdown_tx,
        };

        let (restart_count, restart_timestamps) = match self.children.remove(&worker_id) {
            Some(previous) => {
                previous.worker_ref.stop();
                (previous.restart_count, previous.restart_timestamps)
            }
            None => (0, Vec::new()),
        };

        self.children.insert(
            worker_id.clone(),
            Supervised {
                worker_ref,
                restart_count,
                restart_timestamps,
                restart_at: None,
                state: SupervisedState::Running,
            },
        );

        debug!(worker_id = %worker_id, worker_type = %worker_type, "Spawned worker");

        WorkerHandle { tx, worker_id }
    }

    /// Stop one worker and forget it.
    pub fn stop(&mut self, worker_id: &str) {
        if let Some(child) = self.children.remove(worker_id) {
            child.worker_ref.stop();
        }
    }

    /// Stop all workers, aborting the ones that do not exit within `grace`.
    pub async fn stop_all(&mut self, grace: Duration) {
        info!(count = self.children.len(), "Stopping all workers");

        for child in self.children.values() {
            child.worker_ref.stop();
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.children.values().all(|c| !c.worker_ref.is_running()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        for (worker_id, child) in &self.children {
            if child.worker_ref.is_running() {
                warn!(worker_id = %worker_id, "Force aborting worker");
                child.worker_ref.abort();
            }
        }

        self.children.clear();
    }

    /// Collect workers whose task ended unexpectedly and are due a restart.
    ///
    /// A dead worker first waits out its restart backoff. Workers that died
    /// more than `max_restarts` times within the window are marked degraded
    /// and never returned again.
    pub fn reap(&mut self) -> Vec<String> {
        let now = Instant::now();
        let policy = &self.restart_policy;
        let mut due = Vec::new();

        for (worker_id, child) in &mut self.children {
            match child.state {
                SupervisedState::Running if !child.worker_ref.is_running() => {
                    child
                        .restart_timestamps
                        .retain(|t| now.duration_since(*t) < policy.window);

                    if child.restart_timestamps.len() >= policy.max_restarts as usize {
                        error!(
                            worker_id = %worker_id,
                            restart_count = child.restart_count,
                            "Worker exceeded max restarts, marking as degraded"
                        );
                        child.state = SupervisedState::Degraded;
                        continue;
                    }

                    let delay = policy.backoff.delay(child.restart_timestamps.len() as u32);
                    info!(
                        worker_id = %worker_id,
                        delay_ms = delay.as_millis() as u64,
                        "Scheduling worker restart"
                    );
                    child.state = SupervisedState::Restarting;
                    child.restart_at = Some(now + delay);
                }
                SupervisedState::Restarting if child.restart_at.is_none_or(|at| at <= now) => {
                    child.restart_count += 1;
                    child.restart_timestamps.push(now);
                    due.push(worker_id.clone());
                }
                _ => {}
            }
        }

        due
    }

    pub fn running_count(&self) -> usize {
        self.children
            .values()
            .filter(|c| c.worker_ref.is_running())
            .count()
    }

    pub fn degraded_count(&self) -> usize {
        self.children
            .values()
            .filter(|c| c.state == SupervisedState::Degraded)
            .count()
    }

    pub fn restart_count(&self, worker_id: &str) -> u32 {
        self.children
            .get(worker_id)
            .map_or(0, |c| c.restart_count)
    }
}

// =============================================================================
// Worker Loop
// =============================================================================

async fn run_worker_loop<W: Worker>(
    mut worker: W,
    mut rx: mpsc::Receiver<W::Message>,
    mut shutdown: watch::Receiver<bool>,
    worker_id: String,
) {
    let mut ctx = WorkerContext::new(worker_id.clone(), shutdown.clone());

    if let Err(e) = worker.on_start(&mut ctx).await {
        error!(worker_id = %worker_id, error = %e, "Worker failed to start");
        return;
    }

    ctx.state = WorkerState::Running;
    debug!(worker_id = %worker_id, "Worker started");

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(worker_id = %worker_id, "Worker received shutdown signal");
                    break;
                }
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(worker_id = %worker_id, "Worker mailbox closed");
                    break;
                };
                ctx.messages_processed += 1;
                ctx.last_message_at = Some(Instant::now());

                match worker.handle(msg, &mut ctx).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(worker_id = %worker_id, "Worker requested stop");
                        break;
                    }
                    Err(e) => {
                        error!(worker_id = %worker_id, error = %e, "Worker error");
                        worker.on_crash(&e);
                        if matches!(e, WorkerError::Permanent(_)) {
                            ctx.state = WorkerState::Failed;
                            break;
                        }
                    }
                }
            }
        }
    }

    if ctx.state != WorkerState::Failed {
        ctx.state = WorkerState::Stopping;
    }
    worker.on_stop(&mut ctx).await;
    if ctx.state != WorkerState::Failed {
        ctx.state = WorkerState::Stopped;
    }

    debug!(
        worker_id = %worker_id,
        messages_processed = ctx.messages_processed,
        "Worker stopped"
    );
}

// =============================================================================
// Tests
// =============================================================================
