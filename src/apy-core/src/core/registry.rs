//! Endpoint registry: the in-memory route table plus its durable copy.
//!
//! Lookups go through a sharded [`DashMap`]. Each entry is an
//! [`EndpointSlot`] whose record is guarded by a short-lived
//! [`parking_lot::Mutex`]; store writes for a route identity are serialized
//! by a shared async writer lock so the last write always carries the latest
//! snapshot.

use crate::error::{ApyError, ApyResult};
use crate::models::{Endpoint, RouteId, normalize_path};
use apy_memory::Store;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub(crate) struct SlotState {
    pub(crate) endpoint: Endpoint,
    /// Requests admitted by the rate check that have not finished yet.
    pub(crate) in_flight: u64,
}

pub struct EndpointSlot {
    id: RouteId,
    state: Mutex<SlotState>,
    writer: Arc<tokio::sync::Mutex<()>>,
    retired: AtomicBool,
}

impl EndpointSlot {
    fn new(endpoint: Endpoint, writer: Arc<tokio::sync::Mutex<()>>) -> Self {
        Self {
            id: endpoint.route_id(),
            state: Mutex::new(SlotState {
                endpoint,
                in_flight: 0,
            }),
            writer,
            retired: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &RouteId {
        &self.id
    }

    /// Copy of the current record.
    pub fn snapshot(&self) -> Endpoint {
        self.state.lock().endpoint.clone()
    }

    /// Run `f` under the slot lock. Never call `.await` inside.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut SlotState) -> R) -> R {
        f(&mut self.state.lock())
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    /// A slot is retired once it was replaced or deleted; it is never
    /// written to the store again.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}

pub struct Registry {
    routes: DashMap<RouteId, Arc<EndpointSlot>>,
    store: Arc<dyn Store>,
    persist_timeout: Duration,
}

impl Registry {
    pub fn new(store: Arc<dyn Store>, persist_timeout: Duration) -> Self {
        Self {
            routes: DashMap::new(),
            store,
            persist_timeout,
        }
    }

    /// Insert or replace the record for the endpoint's route identity and
    /// persist it. Persistence failures are logged, never returned.
    pub async fn register(&self, endpoint: Endpoint) -> RouteId {
        let slot = self.install(endpoint);
        info!(route = %slot.id(), "endpoint registered");
        self.persist(&slot).await;
        slot.id().clone()
    }

    fn install(&self, endpoint: Endpoint) -> Arc<EndpointSlot> {
        let endpoint = endpoint.normalized();
        match self.routes.entry(endpoint.route_id()) {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.get().clone();
                let slot = Arc::new(EndpointSlot::new(endpoint, previous.writer.clone()));
                previous.retire();
                occupied.insert(slot.clone());
                slot
            }
            Entry::Vacant(vacant) => {
                let slot = Arc::new(EndpointSlot::new(endpoint, Arc::default()));
                vacant.insert(slot.clone());
                slot
            }
        }
    }

    pub fn lookup(&self, path: &str, method: &str) -> ApyResult<Arc<EndpointSlot>> {
        let id = RouteId::new(path, method);
        self.routes
            .get(&id)
            .map(|slot| slot.value().clone())
            .ok_or(ApyError::NotFound {
                route: id.to_string(),
            })
    }

    /// Exact `(path, method)` match, falling back to the first path segment
    /// so `/abc/rest` reaches the endpoint registered at `/abc`.
    pub fn resolve(&self, path: &str, method: &str) -> ApyResult<Arc<EndpointSlot>> {
        self.lookup(path, method).or_else(|err| {
            let first = path.trim_start_matches('/').split('/').next().unwrap_or_default();
            let head = normalize_path(first);
            if head == normalize_path(path) {
                return Err(err);
            }
            self.lookup(&head, method)
        })
    }

    /// Remove one route identity. The store is updated first; if that fails
    /// the endpoint stays registered and the error is returned.
    pub async fn delete(&self, path: &str, method: &str) -> ApyResult<Endpoint> {
        let slot = self.lookup(path, method)?;
        let writer = slot.writer.clone();
        let _write = writer.lock().await;

        self.delete_record(&slot).await?;
        Ok(self.unregister(slot))
    }

    /// Delete every method registered under `path`, all or nothing: memory is
    /// only touched once every store record is gone, and records removed
    /// before a failing one are written back.
    pub async fn delete_path(&self, path: &str) -> ApyResult<Vec<Endpoint>> {
        let path = normalize_path(path);
        let mut slots: Vec<Arc<EndpointSlot>> = self
            .routes
            .iter()
            .filter(|entry| entry.value().state.lock().endpoint.path == path)
            .map(|entry| entry.value().clone())
            .collect();
        slots.sort_by(|a, b| a.id().cmp(b.id()));

        // Writers are taken in route order; nothing else holds two at once.
        let mut guards = Vec::with_capacity(slots.len());
        for slot in &slots {
            guards.push(slot.writer.clone().lock_owned().await);
        }
        // Lost a race with another delete.
        slots.retain(|slot| self.routes.contains_key(slot.id()));
        if slots.is_empty() {
            return Err(ApyError::NotFound {
                route: format!("* {path}"),
            });
        }

        for (done, slot) in slots.iter().enumerate() {
            if let Err(e) = self.delete_record(slot).await {
                for restored in &slots[..done] {
                    match timeout(self.persist_timeout, self.write_record(restored)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(route = %restored.id(), error = %e, "restoring endpoint record failed")
                        }
                        Err(_) => warn!(route = %restored.id(), "restoring endpoint record timed out"),
                    }
                }
                return Err(e);
            }
        }

        let deleted: Vec<Endpoint> = slots.into_iter().map(|slot| self.unregister(slot)).collect();
        drop(guards);
        Ok(deleted)
    }

    // Caller holds the slot's writer lock.
    async fn delete_record(&self, slot: &EndpointSlot) -> ApyResult<()> {
        match timeout(self.persist_timeout, self.store.delete(slot.id().as_str())).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                warn!(route = %slot.id(), error = %e, "deleting endpoint record failed");
                Err(ApyError::persistence(e))
            }
            Err(_) => {
                warn!(route = %slot.id(), "deleting endpoint record timed out");
                Err(ApyError::persistence("store delete timed out"))
            }
        }
    }

    fn unregister(&self, slot: Arc<EndpointSlot>) -> Endpoint {
        let removed = self.routes.remove(slot.id()).map(|(_, s)| s);
        let current = removed.unwrap_or(slot);
        current.retire();
        info!(route = %current.id(), "endpoint deleted");
        current.snapshot()
    }

    /// Write the slot's current record to the store. Waiting for earlier
    /// writes and the write itself share one persistence timeout. Failures
    /// are logged and swallowed.
    pub async fn persist(&self, slot: &EndpointSlot) {
        let write = async {
            let _write = slot.writer.lock().await;
            if slot.is_retired() {
                debug!(route = %slot.id(), "skipping write for retired endpoint");
                return Ok(());
            }
            self.write_record(slot).await
        };

        match timeout(self.persist_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(route = %slot.id(), error = %e, "persisting endpoint failed"),
            Err(_) => warn!(route = %slot.id(), "persisting endpoint timed out"),
        }
    }

    // Caller holds the slot's writer lock; `persist` bounds the whole call.
    async fn write_record(&self, slot: &EndpointSlot) -> ApyResult<()> {
        let record = serde_json::to_string(&slot.snapshot()).map_err(ApyError::persistence)?;
        self.store
            .save(slot.id().as_str(), &record)
            .await
            .map_err(ApyError::persistence)?;
        debug!(route = %slot.id(), "endpoint persisted");
        Ok(())
    }

    /// Load every persisted record and install those with a target URL.
    /// Unreadable or malformed records are skipped.
    pub async fn hydrate(&self) -> ApyResult<usize> {
        let keys = self.store.keys().await.map_err(ApyError::persistence)?;
        let mut loaded = 0;

        for key in keys {
            let raw = match self.store.load(&key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "loading endpoint record failed");
                    continue;
                }
            };
            let endpoint: Endpoint = match serde_json::from_str(&raw) {
                Ok(e) => e,
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping malformed endpoint record");
                    continue;
                }
            };
            if endpoint.url.is_empty() {
                debug!(key = %key, "skipping endpoint record without target url");
                continue;
            }
            self.install(endpoint);
            loaded += 1;
        }

        info!(endpoints = loaded, "registry hydrated from store");
        Ok(loaded)
    }

    /// Snapshot of every registered record.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.routes.iter().map(|entry| entry.value().snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
