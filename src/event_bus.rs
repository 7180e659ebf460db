//! In-process typed pub/sub.
//!
//! Every cross-module notification in this crate (a peer connecting, a
//! timeline advancing, a conflict surfacing) flows through one bus instance
//! owned by the [`crate::manager::P2pManager`] that created it. There is no
//! process-wide singleton: tests construct their own bus and never observe
//! another test's events.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};

use crate::hash::Hash;
use crate::model::Seal;

const QUEUE_CAPACITY: usize = 1_000;

/// A divergence the sync engine could not reconcile on its own.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub timeline: String,
    pub local_head: Hash,
    pub remote_head: Hash,
    pub conflict_type: String,
}

/// Every event this crate emits. New variants should stay data-carrying;
/// subscribers match on [`EventKind`], not on this enum directly, so adding
/// a variant never breaks existing `Subscribe` calls for other kinds.
#[derive(Clone, Debug)]
pub enum Event {
    PeerConnected { peer_id: String, address: SocketAddr },
    PeerDisconnected { peer_id: String },
    TimelineUpdated { timeline: String, head: Hash },
    SealBroadcast { timeline: String, seal: Box<Seal> },
    ConflictDetected(ConflictInfo),
    MeshTopologyChanged,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    PeerConnected,
    PeerDisconnected,
    TimelineUpdated,
    SealBroadcast,
    ConflictDetected,
    MeshTopologyChanged,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::PeerConnected { .. } => EventKind::PeerConnected,
            Event::PeerDisconnected { .. } => EventKind::PeerDisconnected,
            Event::TimelineUpdated { .. } => EventKind::TimelineUpdated,
            Event::SealBroadcast { .. } => EventKind::SealBroadcast,
            Event::ConflictDetected(_) => EventKind::ConflictDetected,
            Event::MeshTopologyChanged => EventKind::MeshTopologyChanged,
        }
    }
}

pub type SubscriptionId = u64;

type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    handler: Handler,
}

struct Inner {
    subscribers: RwLock<HashMap<EventKind, Vec<Subscription>>>,
    next_id: AtomicU64,
}

/// Timestamped wrapper is not needed on the wire; callers that want
/// ordering info can read `Utc::now()` themselves. Kept here only as a
/// convenience constant for modules that log bus activity.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Bounded, lossy, per-manager event bus.
pub struct EventBus {
    inner: Arc<Inner>,
    sender: mpsc::Sender<Event>,
    receiver: RwLock<Option<mpsc::Receiver<Event>>>,
    dispatcher: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
            sender,
            receiver: RwLock::new(Some(receiver)),
            dispatcher: RwLock::new(None),
        }
    }

    pub async fn subscribe<F, Fut>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let boxed: Handler = Arc::new(move |event| Box::pin(handler(event)));
        self.inner
            .subscribers
            .write()
            .await
            .entry(kind)
            .or_default()
            .push(Subscription { id, handler: boxed });
        id
    }

    pub async fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) {
        if let Some(subs) = self.inner.subscribers.write().await.get_mut(&kind) {
            subs.retain(|s| s.id != id);
        }
    }

    /// Enqueue for dispatch. Drops the event if the queue is full; this is
    /// the documented lossy contract, not an error condition.
    pub fn publish(&self, event: Event) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.sender.try_send(event) {
            log::warn!("event bus queue full, dropping event");
        }
    }

    /// Idempotent: a second call while already running is a no-op.
    pub async fn start(&self) {
        let mut dispatcher = self.dispatcher.write().await;
        if dispatcher.is_some() {
            return;
        }
        let receiver = match self.receiver.write().await.take() {
            Some(r) => r,
            None => return,
        };
        let inner = Arc::clone(&self.inner);
        *dispatcher = Some(tokio::spawn(dispatch_loop(inner, receiver)));
    }

    /// Stops the dispatcher task. The bus cannot be restarted afterward
    /// since its receiver half is consumed; callers needing a fresh bus
    /// should construct a new [`EventBus`].
    pub async fn stop(&self) {
        if let Some(handle) = self.dispatcher.write().await.take() {
            handle.abort();
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut receiver: mpsc::Receiver<Event>) {
    while let Some(event) = receiver.recv().await {
        let kind = event.kind();
        let handlers: Vec<Handler> = {
            let subscribers = inner.subscribers.read().await;
            match subscribers.get(&kind) {
                Some(subs) => subs.iter().map(|s| Arc::clone(&s.handler)).collect(),
                None => continue,
            }
        };
        for handler in handlers {
            let event = event.clone();
            tokio::spawn(async move {
                handler(event).await;
            });
        }
    }
}
