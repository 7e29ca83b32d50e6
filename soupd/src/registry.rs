//! Registry seams consumed by the supervisor.
//!
//! The session registry owns the rooms that transports and consumers belong to;
//! the worker registry tracks which workers are reachable. Both live in the host.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::notify::{
    DtlsStateChangeNotify, IceSelectedTupleChangeNotify, IceStateChangeNotify,
    LayersChangeNotify, ProducerCloseNotify,
};
use crate::worker::Worker;

/// A session (room) owning transports and consumers on some worker.
#[async_trait]
pub trait Session: Send + Sync {
    async fn on_ice_state_change(&self, notify: IceStateChangeNotify) -> anyhow::Result<()>;

    async fn on_ice_selected_tuple_change(
        &self,
        notify: IceSelectedTupleChangeNotify,
    ) -> anyhow::Result<()>;

    async fn on_dtls_state_change(&self, notify: DtlsStateChangeNotify) -> anyhow::Result<()>;

    async fn on_producer_close(&self, notify: ProducerCloseNotify) -> anyhow::Result<()>;

    async fn on_layers_change(&self, notify: LayersChangeNotify) -> anyhow::Result<()>;
}

pub trait SessionRegistry: Send + Sync {
    fn session_by_transport_id(&self, transport_id: &str) -> Option<Arc<dyn Session>>;

    fn session_by_consumer_id(&self, consumer_id: &str) -> Option<Arc<dyn Session>>;

    /// Called exactly once per worker when it goes offline for good.
    fn on_worker_disconnected(&self, worker_id: &str);
}

pub trait WorkerRegistry: Send + Sync {
    fn connect(&self, worker: Arc<Worker>);

    fn disconnect(&self, worker_id: &str);
}

/// Both registries, as handed to a worker at start.
#[derive(Clone)]
pub struct Registries {
    pub sessions: Arc<dyn SessionRegistry>,
    pub workers: Arc<dyn WorkerRegistry>,
}

impl Registries {
    pub fn new(sessions: Arc<dyn SessionRegistry>, workers: Arc<dyn WorkerRegistry>) -> Self {
        Self { sessions, workers }
    }
}

/// Session registry for hosts that route nothing (the standalone binary).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSessions;

impl SessionRegistry for NoSessions {
    fn session_by_transport_id(&self, _transport_id: &str) -> Option<Arc<dyn Session>> {
        None
    }

    fn session_by_consumer_id(&self, _consumer_id: &str) -> Option<Arc<dyn Session>> {
        None
    }

    fn on_worker_disconnected(&self, worker_id: &str) {
        tracing::debug!(%worker_id, "No sessions to notify");
    }
}

#[derive(Default)]
pub struct InMemoryWorkerRegistry {
    workers: DashMap<String, Arc<Worker>>,
}

impl InMemoryWorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, worker_id: &str) -> Option<Arc<Worker>> {
        self.workers.get(worker_id).map(|w| Arc::clone(w.value()))
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Ids of registered workers that currently report online.
    pub fn online_workers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .workers
            .iter()
            .filter(|entry| entry.value().online())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }
}

impl WorkerRegistry for InMemoryWorkerRegistry {
    fn connect(&self, worker: Arc<Worker>) {
        let worker_id = worker.id().to_string();
        if self.workers.insert(worker_id.clone(), worker).is_some() {
            tracing::warn!(%worker_id, "Replaced an already registered worker");
        } else {
            tracing::info!(%worker_id, "Worker registered");
        }
    }

    fn disconnect(&self, worker_id: &str) {
        if self.workers.remove(worker_id).is_some() {
            tracing::info!(%worker_id, "Worker deregistered");
        } else {
            tracing::debug!(%worker_id, "Deregister for unknown worker");
        }
    }
}
