//! Registry of live workers.
//!
//! Tracks which workers are reachable for broadcast and which worker serves
//! each connection. The registry never controls a worker's lifetime, with
//! one exception: [`WorkerRegistry::stop_all`] at process shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use courier_core::{ConnectionId, WorkerId};
use courier_telemetry::metrics::BROADCASTS_TOTAL;
use dashmap::DashMap;
use futures::future::join_all;
use metrics::counter;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::worker::WorkerHandle;

#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<WorkerId, WorkerHandle>>,
    connections: DashMap<ConnectionId, WorkerHandle>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a worker to the live set. Returns `false` if it was already there.
    pub fn register(&self, worker: WorkerHandle) -> bool {
        let mut workers = self.workers.write();
        if workers.contains_key(worker.id()) {
            return false;
        }
        debug!(worker_id = %worker.id(), "worker registered");
        let _ = workers.insert(worker.id().clone(), worker);
        true
    }

    /// Map a connection to its worker and make sure the worker is live.
    ///
    /// Returns `false` if the connection already had a worker; that worker is
    /// replaced and leaves the live set.
    pub fn register_for_connection(
        &self,
        connection_id: ConnectionId,
        worker: WorkerHandle,
    ) -> bool {
        let previous = self.connections.insert(connection_id.clone(), worker.clone());
        if let Some(prev) = &previous {
            if prev.id() != worker.id() {
                let _ = self.workers.write().remove(prev.id());
            }
        }
        let _ = self.register(worker);
        debug!(connection_id = %connection_id, "connection mapped");
        previous.is_none()
    }

    /// Remove a worker from the live set. Unknown ids are a no-op.
    pub fn deregister(&self, worker_id: &WorkerId) -> Option<WorkerHandle> {
        let removed = self.workers.write().remove(worker_id);
        if removed.is_some() {
            debug!(worker_id = %worker_id, "worker deregistered");
        }
        removed
    }

    /// Drop a connection's mapping and its worker's membership.
    pub fn deregister_for_connection(&self, connection_id: &ConnectionId) -> Option<WorkerHandle> {
        let (_, worker) = self.connections.remove(connection_id)?;
        let _ = self.workers.write().remove(worker.id());
        debug!(connection_id = %connection_id, worker_id = %worker.id(), "connection unmapped");
        Some(worker)
    }

    pub fn count(&self) -> usize {
        self.workers.read().len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Point-in-time copy of the live set.
    pub fn snapshot(&self) -> Vec<WorkerHandle> {
        self.workers.read().values().cloned().collect()
    }

    pub fn worker_for_connection(&self, connection_id: &ConnectionId) -> Option<WorkerHandle> {
        self.connections.get(connection_id).map(|entry| entry.value().clone())
    }

    /// Post to the worker serving one connection.
    pub fn send_to(&self, connection_id: &ConnectionId, text: impl Into<Arc<str>>) -> bool {
        self.worker_for_connection(connection_id)
            .is_some_and(|worker| worker.post(text))
    }

    /// Post `text` to every worker live at the moment of the call.
    ///
    /// Returns the number of workers in the snapshot. Workers that stopped
    /// in the meantime drop the message silently.
    pub fn broadcast(&self, text: impl Into<Arc<str>>) -> usize {
        let text: Arc<str> = text.into();
        let targets = self.snapshot();
        for worker in &targets {
            let _ = worker.post(Arc::clone(&text));
        }
        counter!(BROADCASTS_TOTAL).increment(1);
        debug!(recipients = targets.len(), "broadcast posted");
        targets.len()
    }

    /// Stop every registered worker and empty the registry.
    pub async fn stop_all(&self) {
        let taken: HashMap<WorkerId, WorkerHandle> = {
            let mut workers = self.workers.write();
            let mut taken: HashMap<_, _> = workers.drain().collect();
            let connections: Vec<ConnectionId> =
                self.connections.iter().map(|entry| entry.key().clone()).collect();
            for connection_id in connections {
                if let Some((_, worker)) = self.connections.remove(&connection_id) {
                    let _ = taken.entry(worker.id().clone()).or_insert(worker);
                }
            }
            taken
        };

        let n = taken.len();
        let _ = join_all(taken.values().map(|worker| worker.stop())).await;
        info!(count = n, "all workers stopped");
    }
}
