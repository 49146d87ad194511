//! ==============================================================================
//! hub.rs - fan-out of live events to connected observers
//! ==============================================================================
//!
//! purpose:
//!     owns the set of open observer channels. nothing outside this module can
//!     touch the set; callers only get subscribe / unsubscribe / publish.
//!
//! delivery model:
//!
//!     publish(kind, payload)
//!         │  serialize once -> Arc<str>
//!         ▼
//!     ┌──────────────── registry (RwLock<HashMap>) ────────────────┐
//!     │  obs 1 ──try_send──► [bounded mpsc] ──► sse stream         │
//!     │  obs 2 ──try_send──► [bounded mpsc] ──► sse stream         │
//!     │  obs 3 ──full/closed──► removed after the read lock is gone│
//!     └────────────────────────────────────────────────────────────┘
//!
//!     - try_send never waits, so a stuck browser cannot stall the device
//!     - full buffer: the observer has already missed state, so it is
//!       dropped; its EventSource reconnects and starts over from init
//!     - closed channel: the observer is unsubscribed, nobody else notices
//!
//!     state events are published from inside the register's write guard
//!     (see register.rs), and subscribe reads the init snapshot inside the
//!     register's read guard. a new observer therefore sees every change
//!     either in its init or as a later event, never neither.
//!
//! ==============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use futures_util::stream::{self, Stream};
use log::{debug, error, warn};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::domain::{EventKind, InitPayload};
use crate::error::TransportError;
use crate::register::StateRegister;

pub type ObserverId = u64;

/// one serialized event as queued for an observer
#[derive(Clone, Debug)]
pub struct HubEvent {
    pub kind: EventKind,
    pub data: Arc<str>,
}

struct HubInner {
    observers: RwLock<HashMap<ObserverId, mpsc::Sender<HubEvent>>>,
    next_id: AtomicU64,
    buffer: usize,
    register: Arc<StateRegister>,
}

impl HubInner {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<ObserverId, mpsc::Sender<HubEvent>>> {
        match self.observers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ObserverId, mpsc::Sender<HubEvent>>> {
        match self.observers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn remove(&self, id: ObserverId) -> bool {
        let removed = self.write().remove(&id).is_some();
        if removed {
            debug!("[HUB] Observer {} unsubscribed", id);
        }
        removed
    }
}

#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    /// `buffer` is the per-observer queue depth
    pub fn new(register: Arc<StateRegister>, buffer: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                observers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
                register,
            }),
        }
    }

    /// register a new observer. its first queued event is always `init`
    /// carrying the snapshot current at registration.
    pub fn subscribe(&self) -> ObserverConnection {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        // no register mutation (and so no state publish) can run until the
        // observer is in the registry
        let count = self.inner.register.observe(|snapshot| {
            let init = InitPayload {
                kind: EventKind::Init.as_str(),
                latest: snapshot,
            };
            if let Some(data) = encode(EventKind::Init, &init) {
                // fresh channel with capacity >= 1, cannot be full
                let _ = tx.try_send(HubEvent {
                    kind: EventKind::Init,
                    data,
                });
            }
            let mut observers = self.inner.write();
            observers.insert(id, tx);
            observers.len()
        });

        debug!("[HUB] Observer {} subscribed ({} connected)", id, count);

        ObserverConnection {
            id,
            rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// remove an observer. returns false if it was already gone.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.inner.remove(id)
    }

    /// offer an event to every registered observer, returning how many took it
    pub fn publish<T: Serialize>(&self, kind: EventKind, payload: &T) -> usize {
        let Some(data) = encode(kind, payload) else {
            return 0;
        };
        let event = HubEvent { kind, data };

        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let observers = self.inner.read();
            for (id, tx) in observers.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => failed.push(TransportError::Lagging(*id)),
                    Err(TrySendError::Closed(_)) => failed.push(TransportError::Closed(*id)),
                }
            }
        }

        for err in failed {
            let id = match err {
                TransportError::Lagging(id) => {
                    warn!("[HUB] {}, disconnecting", err);
                    id
                }
                TransportError::Closed(id) => {
                    debug!("[HUB] {}", err);
                    id
                }
            };
            self.inner.remove(id);
        }

        debug!("[HUB] {} delivered to {} observer(s)", kind.as_str(), delivered);
        delivered
    }

    pub fn observer_count(&self) -> usize {
        self.inner.read().len()
    }
}

fn encode<T: Serialize>(kind: EventKind, payload: &T) -> Option<Arc<str>> {
    match serde_json::to_string(payload) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            error!("[HUB] Failed to serialize {} payload: {}", kind.as_str(), e);
            None
        }
    }
}

/// receiving end held by the transport for one observer.
/// dropping it unsubscribes.
pub struct ObserverConnection {
    id: ObserverId,
    rx: mpsc::Receiver<HubEvent>,
    hub: Weak<HubInner>,
}

impl ObserverConnection {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// next event; None once the hub has dropped this observer
    pub async fn recv(&mut self) -> Option<HubEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<HubEvent> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> impl Stream<Item = HubEvent> + Send + 'static {
        stream::unfold(self, |mut conn| async move {
            let event = conn.recv().await?;
            Some((event, conn))
        })
    }
}

impl Drop for ObserverConnection {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
    }
}
