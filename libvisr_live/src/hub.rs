use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use super::error::SubscriberSendFailure;

pub type SubscriberId = u64;

/// A serialized message, shared between every subscriber it is sent to
pub type Payload = Arc<str>;

/// One connected output endpoint
pub trait Subscriber: Send + Sync {
    /// Deliver a payload without blocking
    fn send(&self, payload: &Payload) -> Result<(), SubscriberSendFailure>;
}

/// A subscriber fed through a bounded tokio channel; the receiving half is drained by the
/// connection task (typically a websocket writer)
impl Subscriber for mpsc::Sender<Payload> {
    fn send(&self, payload: &Payload) -> Result<(), SubscriberSendFailure> {
        self.try_send(payload.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubscriberSendFailure::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SubscriberSendFailure::Disconnected,
        })
    }
}

/// Outcome of one broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub pruned: Vec<SubscriberId>,
}

/// The live set of subscribers.
///
/// Broadcasts iterate over a snapshot of the set, so subscribers may be added or removed
/// while a broadcast is in flight. A subscriber whose send fails is removed.
#[derive(Default)]
pub struct SubscriberHub {
    subscribers: Mutex<HashMap<SubscriberId, Arc<dyn Subscriber>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for SubscriberHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberHub")
            .field("subscribers", &self.len())
            .finish()
    }
}

impl SubscriberHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriberId, Arc<dyn Subscriber>>> {
        // The map holds no invariant a panicking holder could break, so keep serving
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a subscriber and return its id
    pub fn add(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut subscribers = self.lock();
            subscribers.insert(id, subscriber);
            subscribers.len()
        };
        log::info!("Subscriber {id} connected ({count} connected)");
        id
    }

    /// Remove a subscriber. Removing an absent id does nothing.
    pub fn remove(&self, id: SubscriberId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            log::info!("Subscriber {id} disconnected");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<SubscriberId> {
        let mut ids: Vec<SubscriberId> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Send a payload to every subscriber registered when the broadcast began
    pub fn broadcast(&self, payload: &Payload) -> BroadcastReport {
        let mut snapshot: Vec<(SubscriberId, Arc<dyn Subscriber>)> = self
            .lock()
            .iter()
            .map(|(id, subscriber)| (*id, subscriber.clone()))
            .collect();
        snapshot.sort_unstable_by_key(|(id, _)| *id);

        let mut report = BroadcastReport::default();
        for (id, subscriber) in snapshot {
            match subscriber.send(payload) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    log::warn!("Send to subscriber {id} failed: {e}. Removing it.");
                    report.pruned.push(id);
                }
            }
        }

        if !report.pruned.is_empty() {
            let mut subscribers = self.lock();
            for id in report.pruned.iter() {
                subscribers.remove(id);
            }
        }
        report
    }

    /// Serialize a value to JSON once and broadcast it
    pub fn broadcast_json<T: Serialize>(&self, value: &T) -> Result<BroadcastReport, serde_json::Error> {
        let payload: Payload = serde_json::to_string(value)?.into();
        Ok(self.broadcast(&payload))
    }
}
