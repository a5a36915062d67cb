//! Process-wide connection table: every live connection is registered here
//! under its connection id, with incoming/outgoing bookkeeping and the
//! dispatcher shared by every connection spawned through it.
//!
//! Entries are held as [`Weak`] references, same as the reference
//! `async_protocol_handler_config<T>::m_connects` map — the table observes
//! connection lifetime rather than owning it, so a connection that's
//! dropped elsewhere just quietly stops upgrading.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use uuid::Uuid;

use crate::config::HandlerConfig;
use crate::dispatcher::CommandDispatcher;
use crate::error::{LevinError, LevinResult};
use crate::handler::ProtocolHandler;
use crate::transport::Transport;

struct Entry {
    handler: Weak<ProtocolHandler>,
    is_incoming: bool,
}

pub struct ConnectionTable {
    connections: Mutex<HashMap<Uuid, Entry>>,
    incoming_count: AtomicUsize,
    outgoing_count: AtomicUsize,
    dispatcher: Mutex<Option<Arc<dyn CommandDispatcher>>>,
    config: HandlerConfig,
}

impl ConnectionTable {
    /// Builds a table using [`HandlerConfig::default`] — no handshake
    /// command gating, default packet size ceilings and invoke timeout.
    pub fn new() -> Arc<Self> {
        Self::with_config(HandlerConfig::default())
    }

    pub fn with_config(config: HandlerConfig) -> Arc<Self> {
        Arc::new(ConnectionTable {
            connections: Mutex::new(HashMap::new()),
            incoming_count: AtomicUsize::new(0),
            outgoing_count: AtomicUsize::new(0),
            dispatcher: Mutex::new(None),
            config,
        })
    }

    /// (Re)assigns the dispatcher every connection spawned from here on
    /// will use. Connections already running keep the dispatcher they were
    /// built with.
    pub fn set_handler(&self, dispatcher: Arc<dyn CommandDispatcher>) {
        *self.dispatcher.lock() = Some(dispatcher);
    }

    pub fn incoming_count(&self) -> usize {
        self.incoming_count.load(Ordering::Relaxed)
    }

    pub fn outgoing_count(&self) -> usize {
        self.outgoing_count.load(Ordering::Relaxed)
    }

    /// Registers a new connection over `transport`, spawns its receive
    /// loop, and arranges for it to unregister itself once that loop exits
    /// for any reason.
    pub fn spawn_connection(self: &Arc<Self>, is_incoming: bool, transport: Arc<dyn Transport>) -> LevinResult<Uuid> {
        let dispatcher = self.dispatcher.lock().clone().ok_or(LevinError::HandlerNotDefined)?;
        let id = Uuid::new_v4();
        let handler = ProtocolHandler::with_config(id, is_incoming, transport, dispatcher, self.config);

        self.connections.lock().insert(id, Entry { handler: Arc::downgrade(&handler), is_incoming });
        if is_incoming {
            self.incoming_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.outgoing_count.fetch_add(1, Ordering::Relaxed);
        }

        let table = self.clone();
        tokio::spawn(async move {
            if let Err(err) = handler.run().await {
                log::debug!("connection {id} ended with an error: {err}");
            }
            table.unregister(id);
        });

        Ok(id)
    }

    pub fn unregister(&self, id: Uuid) {
        if let Some(entry) = self.connections.lock().remove(&id) {
            if entry.is_incoming {
                self.incoming_count.fetch_sub(1, Ordering::Relaxed);
            } else {
                self.outgoing_count.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    pub fn find(&self, id: Uuid) -> Option<Arc<ProtocolHandler>> {
        self.connections.lock().get(&id).and_then(|entry| entry.handler.upgrade())
    }

    pub async fn invoke(&self, id: Uuid, command: u32, payload: Vec<u8>, timeout: Duration) -> LevinResult<Vec<u8>> {
        let handler = self.find(id).ok_or(LevinError::ConnectionNotFound(id))?;
        handler.invoke(command, payload, timeout).await
    }

    pub async fn notify(&self, id: Uuid, command: u32, payload: Vec<u8>) -> LevinResult<()> {
        let handler = self.find(id).ok_or(LevinError::ConnectionNotFound(id))?;
        handler.notify(command, payload).await
    }

    /// Non-blocking invoke by connection id; delegates to
    /// [`ProtocolHandler::invoke_async`], reporting `ConnectionNotFound`
    /// inline through `on_settled` if `id` isn't (or is no longer) live.
    pub async fn invoke_async<F>(&self, id: Uuid, command: u32, payload: Vec<u8>, timeout: Duration, on_settled: F)
    where
        F: FnOnce(LevinResult<Vec<u8>>) + Send + 'static,
    {
        match self.find(id) {
            Some(handler) => handler.invoke_async(command, payload, timeout, on_settled).await,
            None => on_settled(Err(LevinError::ConnectionNotFound(id))),
        }
    }

    /// Emits already-framed bytes verbatim to `id` (used for noise/
    /// fragmented-notify pipelines built outside the table).
    pub async fn send(&self, id: Uuid, raw_bytes: Vec<u8>) -> LevinResult<()> {
        let handler = self.find(id).ok_or(LevinError::ConnectionNotFound(id))?;
        handler.send(raw_bytes).await
    }

    pub async fn close(&self, id: Uuid) -> LevinResult<()> {
        let handler = self.find(id).ok_or(LevinError::ConnectionNotFound(id))?;
        handler.request_close().await;
        Ok(())
    }

    /// Schedules the dispatcher's deferred-work hook (`callback`) for `id`.
    pub fn request_callback(&self, id: Uuid) -> LevinResult<()> {
        let handler = self.find(id).ok_or(LevinError::ConnectionNotFound(id))?;
        handler.request_callback();
        Ok(())
    }

    /// Runs `f` over every connection still alive at the moment of the
    /// call, skipping (and not removing) any that have already died —
    /// they'll be pruned by their own teardown task.
    pub fn foreach_connection(&self, mut f: impl FnMut(&Arc<ProtocolHandler>)) {
        let handlers: Vec<Arc<ProtocolHandler>> =
            self.connections.lock().values().filter_map(|entry| entry.handler.upgrade()).collect();
        for handler in &handlers {
            f(handler);
        }
    }

    /// Runs `f` against a single connection by id, if it's still alive.
    /// Returns `false` if `id` is unknown or its connection has already
    /// gone away.
    pub fn for_connection(&self, id: Uuid, f: impl FnOnce(&Arc<ProtocolHandler>)) -> bool {
        match self.find(id) {
            Some(handler) => {
                f(&handler);
                true
            }
            None => false,
        }
    }

    /// Closes up to `count` randomly chosen connections matching
    /// `direction` (`Some(true)` incoming-only, `Some(false)` outgoing-only,
    /// `None` either), for callers enforcing a maximum connection count.
    /// `seed` pins the shuffle for deterministic tests; `None` seeds from
    /// the wall clock. Returns the ids actually closed, in eviction order.
    pub async fn evict_random(&self, count: usize, direction: Option<bool>, seed: Option<u64>) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .connections
            .lock()
            .iter()
            .filter(|(_, entry)| direction.map_or(true, |incoming| entry.is_incoming == incoming))
            .map(|(id, _)| *id)
            .collect();
        if ids.is_empty() {
            return Vec::new();
        }
        let mut rng = StdRng::seed_from_u64(seed.unwrap_or_else(wall_clock_seed));
        ids.shuffle(&mut rng);
        ids.truncate(count);
        for &victim in &ids {
            let _ = self.close(victim).await;
        }
        ids
    }
}

fn wall_clock_seed() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}
