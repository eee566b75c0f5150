//! Registry of live connections.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::connection::{ConnectionId, WebSocketHandle};
use crate::error::{WsError, WsResult};

/// Counters kept by a [`ConnectionRegistry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Connections currently registered.
    pub active: usize,
    /// Connections ever registered.
    pub total_accepted: usize,
    /// Connections refused because of the limit or shutdown.
    pub total_rejected: usize,
    /// Connections that have left the registry.
    pub total_closed: usize,
}

/// Tracks every live connection so the server can enforce a limit and
/// close them all on shutdown.
///
/// A listener takes a [`ConnectionSlot`] with [`reserve`](Self::reserve)
/// before it answers an upgrade. The connection fills the slot when it
/// starts and leaves the registry as the very last step of its teardown,
/// after its close callback has run. [`shutdown`](Self::shutdown)
/// therefore returns only once every close callback has finished.
///
/// # Example
///
/// ```
/// use portico_ws::{ConnectionRegistry, RegistryConfig};
///
/// let registry = ConnectionRegistry::new(RegistryConfig::new().max_connections(1));
/// let slot = registry.reserve().unwrap();
/// assert!(registry.reserve().is_err());
/// drop(slot);
/// assert!(registry.check_capacity().is_ok());
/// ```
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, WebSocketHandle>,
    config: RegistryConfig,
    /// Held while admitting a connection or stopping admission.
    admission: Mutex<Admission>,
    count: watch::Sender<usize>,
    accepting: AtomicBool,
    total_accepted: AtomicUsize,
    total_rejected: AtomicUsize,
    total_closed: AtomicUsize,
}

#[derive(Debug, Default)]
struct Admission {
    /// Slots handed out but not yet filled.
    reserved: usize,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("active", &self.len())
            .field("config", &self.config)
            .field("accepting", &self.is_accepting())
            .finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        let (count, _) = watch::channel(0);
        Arc::new(Self {
            connections: DashMap::new(),
            config,
            admission: Mutex::new(Admission::default()),
            count,
            accepting: AtomicBool::new(true),
            total_accepted: AtomicUsize::new(0),
            total_rejected: AtomicUsize::new(0),
            total_closed: AtomicUsize::new(0),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Returns true until shutdown starts.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Checks whether another connection could be admitted right now,
    /// without holding a place for it.
    pub fn check_capacity(&self) -> WsResult<()> {
        let admission = self.admission.lock();
        self.admits(&admission)
    }

    fn admits(&self, admission: &Admission) -> WsResult<()> {
        if !self.is_accepting() {
            return Err(WsError::connection_limit("server is shutting down"));
        }
        let max = self.config.max_connections;
        let current = self.connections.len() + admission.reserved;
        if max != 0 && current >= max {
            warn!(current, max, "connection limit reached");
            return Err(WsError::connection_limit(format!(
                "maximum connections ({max}) reached"
            )));
        }
        Ok(())
    }

    /// Holds a place for one connection.
    ///
    /// Listeners call this before answering an upgrade so a full server can
    /// refuse with an HTTP error instead of a 101. The place is released if
    /// the slot is dropped unused.
    pub fn reserve(self: &Arc<Self>) -> WsResult<ConnectionSlot> {
        let mut admission = self.admission.lock();
        if let Err(e) = self.admits(&admission) {
            drop(admission);
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        admission.reserved += 1;
        drop(admission);
        self.publish_count();
        Ok(ConnectionSlot {
            registry: Some(Arc::clone(self)),
        })
    }

    fn release(&self) {
        let mut admission = self.admission.lock();
        admission.reserved = admission.reserved.saturating_sub(1);
        drop(admission);
        self.publish_count();
    }

    /// Moves a reserved place into the map. Returns false if shutdown
    /// started after the place was reserved.
    fn fill(&self, handle: WebSocketHandle) -> bool {
        let id = handle.id();
        let mut admission = self.admission.lock();
        admission.reserved = admission.reserved.saturating_sub(1);
        self.connections.insert(id, handle);
        let accepting = self.is_accepting();
        drop(admission);

        self.total_accepted.fetch_add(1, Ordering::Relaxed);
        self.publish_count();
        debug!(connection_id = %id, total = self.connections.len(), "connection registered");
        accepting
    }

    fn deregister(&self, id: ConnectionId) {
        if self.connections.remove(&id).is_some() {
            self.total_closed.fetch_add(1, Ordering::Relaxed);
            self.publish_count();
            debug!(connection_id = %id, "connection deregistered");
        }
    }

    fn publish_count(&self) {
        self.count
            .send_modify(|count| *count = self.connections.len() + self.admission.lock().reserved);
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns true if no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Returns a handle to a registered connection.
    pub fn get(&self, id: &ConnectionId) -> Option<WebSocketHandle> {
        self.connections.get(id).map(|e| e.value().clone())
    }

    /// Returns the IDs of every registered connection.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|e| *e.key()).collect()
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active: self.len(),
            total_accepted: self.total_accepted.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            total_closed: self.total_closed.load(Ordering::Relaxed),
        }
    }

    /// Starts a normal close on every open connection.
    pub async fn close_all(&self) {
        // Collect first; no map guard may live across an await.
        let handles: Vec<WebSocketHandle> =
            self.connections.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            if handle.is_open() {
                if let Err(e) = handle.close().await {
                    debug!(connection_id = %handle.id(), error = %e, "close during shutdown failed");
                }
            }
        }
    }

    /// Waits until no connection is registered and no slot is outstanding.
    pub async fn wait_empty(&self) {
        let mut count = self.count.subscribe();
        loop {
            if *count.borrow_and_update() == 0 {
                return;
            }
            if count.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stops accepting, closes every connection and waits until each one
    /// has finished its teardown.
    pub async fn shutdown(&self) {
        {
            let _admission = self.admission.lock();
            self.accepting.store(false, Ordering::SeqCst);
        }
        info!(active = self.len(), "closing websocket connections");
        self.close_all().await;
        self.wait_empty().await;
        info!("all websocket connections closed");
    }

    /// Like [`shutdown`](Self::shutdown) but gives up after `timeout`.
    /// Returns true if every connection finished in time.
    pub async fn shutdown_timeout(&self, timeout: Duration) -> bool {
        let done = tokio::time::timeout(timeout, self.shutdown()).await.is_ok();
        if !done {
            warn!(remaining = self.len(), "websocket shutdown timed out");
        }
        done
    }
}

/// A place in a [`ConnectionRegistry`] held for a connection that has not
/// started yet.
#[derive(Debug)]
#[must_use = "the place is released when the slot is dropped"]
pub struct ConnectionSlot {
    registry: Option<Arc<ConnectionRegistry>>,
}

impl ConnectionSlot {
    /// Registers `handle` in the reserved place.
    ///
    /// If shutdown began after the reservation, the connection is still
    /// tracked so shutdown waits for it, and a close is started at once.
    pub(crate) fn fill(mut self, handle: WebSocketHandle) -> Registration {
        let id = handle.id();
        let registry = self.registry.take();
        if let Some(registry) = &registry {
            if !registry.fill(handle.clone()) {
                debug!(connection_id = %id, "registered during shutdown, closing");
                handle.start_close();
            }
        }
        Registration { registry, id }
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.take() {
            registry.release();
        }
    }
}

/// Removes a connection from its registry when dropped, including when
/// the connection task unwinds.
pub(crate) struct Registration {
    registry: Option<Arc<ConnectionRegistry>>,
    id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.take() {
            registry.deregister(self.id);
        }
    }
}
