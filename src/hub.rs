//! Hub (C8): per-user status fan-out (§4.8)
//!
//! Best-effort, at-most-once, never authoritative: any consumer must be
//! able to recover full state by reading the Store. `Publish` takes the
//! read lock and only performs non-blocking sends, so a slow subscriber
//! never stalls other subscribers or the publisher.

use crate::types::{ServerId, ServerStatus, UserId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Bounded buffer capacity per subscriber (§4.8)
const SUBSCRIBER_BUFFER: usize = 10;

/// A status change, published after every successful Lifecycle transition
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub server_id: ServerId,
    pub status: ServerStatus,
    pub status_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

type SubscriberId = u64;

/// In-process pub/sub bus keyed by user id.
pub struct Hub {
    subscribers: DashMap<UserId, Vec<(SubscriberId, mpsc::Sender<StatusEvent>)>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription; dropping it unregisters from the Hub.
pub struct Subscription {
    user_id: UserId,
    id: SubscriberId,
    pub receiver: mpsc::Receiver<StatusEvent>,
}

impl Hub {
    pub fn new() -> Self {
        Self { subscribers: DashMap::new(), next_id: std::sync::atomic::AtomicU64::new(0) }
    }

    /// Register a new bounded-buffer subscriber for `user_id`.
    pub fn subscribe(self: &std::sync::Arc<Self>, user_id: UserId) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.subscribers.entry(user_id).or_default().push((id, tx));
        debug!(user_id = %user_id, subscriber_id = id, "hub subscription registered");
        Subscription { user_id, id, receiver: rx }
    }

    /// Remove a subscriber; called automatically when a [`Subscription`] drops.
    pub fn unsubscribe(&self, user_id: UserId, id: SubscriberId) {
        if let Some(mut entry) = self.subscribers.get_mut(&user_id) {
            entry.retain(|(sub_id, _)| *sub_id != id);
            let empty = entry.is_empty();
            drop(entry);
            if empty {
                self.subscribers.remove(&user_id);
            }
        }
    }

    /// Publish `event` to all of `user_id`'s live subscribers. Non-blocking:
    /// a full buffer drops the event for that subscriber rather than
    /// backing up the publisher (§4.8, §5).
    pub fn publish(&self, user_id: UserId, event: StatusEvent) {
        let Some(entry) = self.subscribers.get(&user_id) else {
            trace!(user_id = %user_id, "publish with no subscribers");
            return;
        };
        for (id, sender) in entry.iter() {
            if sender.try_send(event.clone()).is_err() {
                debug!(user_id = %user_id, subscriber_id = id, "dropped status event, slow consumer");
            }
        }
    }
}

/// Convenience wrapper pairing a [`Subscription`] with the [`Hub`] it came
/// from, so dropping it unregisters automatically.
pub struct HubHandle {
    hub: std::sync::Arc<Hub>,
    subscription: Option<Subscription>,
}

impl HubHandle {
    pub fn subscribe(hub: std::sync::Arc<Hub>, user_id: UserId) -> Self {
        let subscription = hub.subscribe(user_id);
        Self { hub, subscription: Some(subscription) }
    }

    pub fn receiver(&mut self) -> &mut mpsc::Receiver<StatusEvent> {
        &mut self.subscription.as_mut().unwrap().receiver
    }
}

impl Drop for HubHandle {
    fn drop(&mut self) {
        if let Some(sub) = self.subscription.take() {
            self.hub.unsubscribe(sub.user_id, sub.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn event(status: ServerStatus) -> StatusEvent {
        StatusEvent { server_id: ServerId::new(), status, status_message: None, timestamp: Utc::now() }
    }

    #[tokio::test]
    async fn subscriber_receives_published_events_in_order() {
        let hub = Arc::new(Hub::new());
        let user_id = UserId::new();
        let mut handle = HubHandle::subscribe(hub.clone(), user_id);

        hub.publish(user_id, event(ServerStatus::Pending));
        hub.publish(user_id, event(ServerStatus::Starting));

        let first = handle.receiver().recv().await.unwrap();
        let second = handle.receiver().recv().await.unwrap();
        assert_eq!(first.status, ServerStatus::Pending);
        assert_eq!(second.status, ServerStatus::Starting);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_a_no_op() {
        let hub = Hub::new();
        hub.publish(UserId::new(), event(ServerStatus::Running));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_events_past_buffer_capacity() {
        let hub = Arc::new(Hub::new());
        let user_id = UserId::new();
        let mut handle = HubHandle::subscribe(hub.clone(), user_id);

        for _ in 0..(SUBSCRIBER_BUFFER + 5) {
            hub.publish(user_id, event(ServerStatus::Running));
        }

        let mut drained = 0;
        while handle.receiver().try_recv().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, SUBSCRIBER_BUFFER, "excess events beyond the buffer should have been dropped");
    }

    #[tokio::test]
    async fn unsubscribe_on_drop_removes_empty_user_entry() {
        let hub = Arc::new(Hub::new());
        let user_id = UserId::new();
        {
            let _handle = HubHandle::subscribe(hub.clone(), user_id);
            assert!(hub.subscribers.contains_key(&user_id));
        }
        assert!(!hub.subscribers.contains_key(&user_id));
    }
}
