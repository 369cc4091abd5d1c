//! Controller: the root of the worker tree.
//!
//! ```text
//! Controller
//! └── ClusterWorker(namespace/name)   one per cluster resource
//! ```
//!
//! The controller turns cluster events into worker notifications, wakes
//! workers on a fixed tick so requeued passes run, and periodically resyncs
//! against the platform's list of clusters. Workers that die are respawned
//! through the supervisor's restart budget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crdb_api::ClusterKey;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use super::cluster::{ClusterMessage, ClusterWorker, WorkerStatus};
use super::framework::{BackoffPolicy, RestartPolicy, Supervisor, WorkerError, WorkerHandle};
use crate::driver::Driver;
use crate::error::bounded;
use crate::platform::{Platform, PlatformError};

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Passes allowed to run at the same time across all clusters.
    pub max_concurrent_reconciles: usize,

    pub mailbox_size: usize,

    /// How often workers are woken to run due passes.
    pub tick_interval: Duration,

    /// How often the cluster list is re-read from the platform.
    pub resync_interval: Duration,

    /// Backoff applied by workers after failed passes.
    pub backoff: BackoffPolicy,

    pub restart: RestartPolicy,

    /// Time workers get to exit on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: 4,
            mailbox_size: 16,
            tick_interval: Duration::from_secs(1),
            resync_interval: Duration::from_secs(300),
            backoff: BackoffPolicy {
                base: Duration::from_millis(500),
                max: Duration::from_secs(60),
                jitter: 0.25,
            },
            restart: RestartPolicy::default(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// A change reported by the platform's watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    Changed(ClusterKey),
    Deleted(ClusterKey),
}

struct WorkerEntry {
    handle: WorkerHandle<ClusterMessage>,
    dirty: Arc<AtomicBool>,
    status: watch::Receiver<WorkerStatus>,
}

pub struct Controller {
    platform: Arc<dyn Platform>,
    driver: Arc<Driver>,
    config: ControllerConfig,
    supervisor: Supervisor,
    workers: HashMap<ClusterKey, WorkerEntry>,
    permits: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
}

impl Controller {
    pub fn new(
        platform: Arc<dyn Platform>,
        driver: Arc<Driver>,
        config: ControllerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_reconciles.max(1)));
        let supervisor = Supervisor::new(config.restart.clone());
        Self {
            platform,
            driver,
            config,
            supervisor,
            workers: HashMap::new(),
            permits,
            shutdown,
        }
    }

    /// Run until shutdown is signaled or the event stream ends.
    pub async fn run(mut self, mut events: mpsc::Receiver<ClusterEvent>) {
        info!(
            tick_interval_ms = self.config.tick_interval.as_millis() as u64,
            resync_interval_secs = self.config.resync_interval.as_secs(),
            "Starting controller"
        );

        let mut shutdown = self.shutdown.clone();
        let mut tick = tokio::time::interval(self.config.tick_interval);
        let mut resync = tokio::time::interval(self.config.resync_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Controller shutting down");
                        break;
                    }
                }

                event = events.recv() => {
                    match event {
                        Some(ClusterEvent::Changed(key)) => self.notify(&key),
                        Some(ClusterEvent::Deleted(key)) => self.forget(&key),
                        None => {
                            info!("Event stream closed");
                            break;
                        }
                    }
                }

                _ = resync.tick() => {
                    if let Err(e) = self.resync().await {
                        warn!(error = %e, "Resync failed, keeping current workers");
                    }
                }

                _ = tick.tick() => self.tick(),
            }
        }

        self.shutdown().await;
    }

    /// Reconcile the worker set against the platform's cluster list.
    pub async fn resync(&mut self) -> Result<(), PlatformError> {
        let keys = bounded(
            self.driver.config().api_timeout,
            "list_clusters",
            self.platform.list_clusters(),
        )
        .await?;

        let gone: Vec<ClusterKey> = self
            .workers
            .keys()
            .filter(|key| !keys.contains(key))
            .cloned()
            .collect();
        for key in gone {
            self.forget(&key);
        }
        for key in &keys {
            self.notify(key);
        }

        debug!(clusters = keys.len(), workers = self.workers.len(), "Resync complete");
        Ok(())
    }

    /// Mark `key` as changed, spawning its worker if needed.
    pub fn notify(&mut self, key: &ClusterKey) {
        let entry = self.ensure_worker(key);
        entry.dirty.store(true, Ordering::Release);
        match entry.handle.try_send(ClusterMessage::Reconcile) {
            // A full mailbox already holds a message that will see the flag.
            Ok(()) | Err(WorkerError::MailboxFull) => {}
            Err(e) => {
                warn!(cluster = %key, error = %e, "Worker unreachable, will respawn");
            }
        }
    }

    /// Stop the worker for a deleted cluster.
    pub fn forget(&mut self, key: &ClusterKey) {
        if let Some(entry) = self.workers.remove(key) {
            let _ = entry.handle.try_send(ClusterMessage::Stop);
            self.supervisor.stop(entry.handle.worker_id());
            info!(cluster = %key, "Stopped worker");
        }
    }

    /// Wake every worker and respawn the dead ones that are due.
    pub fn tick(&mut self) {
        for worker_id in self.supervisor.reap() {
            let Some(key) = self
                .workers
                .iter()
                .find(|(_, entry)| entry.handle.worker_id() == worker_id)
                .map(|(key, _)| key.clone())
            else {
                continue;
            };
            warn!(cluster = %key, "Respawning worker");
            self.workers.remove(&key);
            self.notify(&key);
        }

        for (key, entry) in &self.workers {
            match entry.handle.try_send(ClusterMessage::Tick) {
                Ok(()) | Err(WorkerError::MailboxFull) => {}
                Err(e) => debug!(cluster = %key, error = %e, "Tick not delivered"),
            }
        }
    }

    /// Stop every worker.
    pub async fn shutdown(&mut self) {
        self.workers.clear();
        self.supervisor.stop_all(self.config.shutdown_grace).await;
    }

    pub fn worker_status(&self, key: &ClusterKey) -> Option<WorkerStatus> {
        self.workers
            .get(key)
            .map(|entry| entry.status.borrow().clone())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn ensure_worker(&mut self, key: &ClusterKey) -> &mut WorkerEntry {
        let driver = &self.driver;
        let permits = &self.permits;
        let supervisor = &mut self.supervisor;
        let config = &self.config;

        self.workers.entry(key.clone()).or_insert_with(|| {
            let dirty = Arc::new(AtomicBool::new(true));
            let (worker, status) = ClusterWorker::new(
                key.clone(),
                driver.clone(),
                permits.clone(),
                config.backoff.clone(),
                dirty.clone(),
            );
            let handle = supervisor.spawn(key.to_string(), worker, config.mailbox_size);
            info!(cluster = %key, "Spawned worker");
            WorkerEntry {
                handle,
                dirty,
                status,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverConfig;
    use crate::memory::InMemoryBackend;
    use crdb_testing::ClusterBuilder;

    fn controller(backend: &Arc<InMemoryBackend>) -> (Controller, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let driver = Arc::new(Driver::new(
            backend.clone(),
            backend.clone(),
            DriverConfig::default(),
        ));
        let controller = Controller::new(
            backend.clone(),
            driver,
            ControllerConfig::default(),
            shutdown_rx,
        );
        (controller, shutdown_tx)
    }

    async fn wait_for_pass(controller: &Controller, key: &ClusterKey) -> WorkerStatus {
        for _ in 0..500 {
            if let Some(status) = controller.worker_status(key).filter(|s| s.passes > 0) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no pass ran for {key}");
    }

    #[tokio::test]
    async fn test_resync_spawns_and_stops_workers() {
        let backend = Arc::new(InMemoryBackend::new());
        let a = ClusterBuilder::new("alpha").cr();
        let b = ClusterBuilder::new("beta").cr();
        backend.insert_cluster(a.clone());
        backend.insert_cluster(b.clone());

        let (mut controller, _shutdown) = controller(&backend);
        controller.resync().await.unwrap();
        assert_eq!(controller.worker_count(), 2);
        wait_for_pass(&controller, &a.key()).await;
        wait_for_pass(&controller, &b.key()).await;

        backend.delete_cluster(&b.key());
        controller.resync().await.unwrap();
        assert_eq!(controller.worker_count(), 1);
        assert!(controller.worker_status(&b.key()).is_none());

        controller.shutdown().await;
        assert_eq!(controller.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_events_drive_workers() {
        let backend = Arc::new(InMemoryBackend::new());
        let cluster = ClusterBuilder::new("crdb").with_node_count(1).cr();
        let key = cluster.key();
        backend.insert_cluster(cluster);

        let (controller, shutdown) = controller(&backend);
        let (events, rx) = mpsc::channel(8);
        let task = tokio::spawn(controller.run(rx));

        events.send(ClusterEvent::Changed(key.clone())).await.unwrap();
        for _ in 0..500 {
            if backend.stateful_set(&key).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(backend.stateful_set(&key).is_some());

        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(15), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_resync_failure_keeps_workers() {
        let backend = Arc::new(InMemoryBackend::new());
        let cluster = ClusterBuilder::new("crdb").cr();
        backend.insert_cluster(cluster.clone());

        let (mut controller, _shutdown) = controller(&backend);
        controller.notify(&cluster.key());
        assert_eq!(controller.worker_count(), 1);

        backend.fail_next_cluster_lists(1);
        assert!(controller.resync().await.is_err());
        assert_eq!(controller.worker_count(), 1);
        controller.shutdown().await;
    }
}
