use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;

use crate::message::MessageType;

pub type ListenerId = u64;

/// Status change published by an observable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceEvent {
    /// The representation changed.  `message_type` overrides the resource's notification
    /// policy for this change only.
    Changed { message_type: Option<MessageType> },
    /// The resource is gone; subscribers get a final 4.04.
    Removed,
}

/// Handle that can be used to inform the server when changes are detected.
///
/// Clones share the same set of listeners, so a resource can hand a clone to whatever task
/// watches the underlying data.
#[derive(Debug, Clone, Default)]
pub struct Observers {
    inner: Arc<ObserversInner>,
}

#[derive(Debug, Default)]
struct ObserversInner {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<ListenerId, UnboundedSender<ResourceEvent>>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `listener` to every future event.  Keep the returned id to
    /// [`Observers::unregister`] it again.
    pub async fn on_change(&self, listener: UnboundedSender<ResourceEvent>) -> ListenerId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.write().await.insert(id, listener);
        id
    }

    pub async fn unregister(&self, id: ListenerId) {
        self.inner.listeners.write().await.remove(&id);
    }

    pub async fn listener_count(&self) -> usize {
        self.inner.listeners.read().await.len()
    }

    /// Inform the server that a change to the underlying resource has occurred.  Every
    /// subscriber receives a fresh representation, so spurious calls produce spurious
    /// notifications.
    pub async fn notify_change(&self) {
        self.publish(ResourceEvent::Changed { message_type: None })
            .await;
    }

    /// Like [`Observers::notify_change`] but forces the notification message type, e.g. a
    /// Confirmable notification now and then to find out which subscribers are still alive.
    pub async fn notify_change_as(&self, message_type: MessageType) {
        self.publish(ResourceEvent::Changed {
            message_type: Some(message_type),
        })
        .await;
    }

    pub async fn resource_removed(&self) {
        self.publish(ResourceEvent::Removed).await;
    }

    async fn publish(&self, event: ResourceEvent) {
        self.inner.listeners.write().await.retain(|id, listener| {
            let alive = listener.send(event).is_ok();
            if !alive {
                debug!("Dropping closed change listener {id}");
            }
            alive
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn test_publish_reaches_listeners() {
        let observers = Observers::new();
        let (tx, mut rx) = unbounded_channel();
        observers.on_change(tx).await;

        observers.clone().notify_change().await;
        observers
            .notify_change_as(MessageType::Confirmable)
            .await;
        observers.resource_removed().await;

        assert_eq!(rx.recv().await, Some(ResourceEvent::Changed { message_type: None }));
        assert_eq!(
            rx.recv().await,
            Some(ResourceEvent::Changed {
                message_type: Some(MessageType::Confirmable)
            })
        );
        assert_eq!(rx.recv().await, Some(ResourceEvent::Removed));
    }

    #[tokio::test]
    async fn test_unregister_and_closed_listeners() {
        let observers = Observers::new();
        let (kept_tx, mut kept_rx) = unbounded_channel();
        let (closed_tx, closed_rx) = unbounded_channel();
        let (removed_tx, mut removed_rx) = unbounded_channel();
        observers.on_change(kept_tx).await;
        observers.on_change(closed_tx).await;
        let removed = observers.on_change(removed_tx).await;
        drop(closed_rx);

        observers.unregister(removed).await;
        observers.notify_change().await;

        assert_eq!(observers.listener_count().await, 1);
        assert!(kept_rx.try_recv().is_ok());
        assert!(removed_rx.try_recv().is_err());
    }
}
