use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::limits::WATCH_CHANNEL_CAPACITY;
use crate::model::Event;

/// Broadcast hub backing the store's watch feed, one channel per namespace.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to changes in a namespace. Creates the channel if needed.
    pub fn subscribe(&self, namespace: &str) -> broadcast::Receiver<Event> {
        if let Some(sender) = self.channels.get(namespace) {
            return sender.subscribe();
        }
        self.channels
            .entry(namespace.to_string())
            .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, event: &Event) {
        if let Some(sender) = self.channels.get(event.namespace()) {
            let _ = sender.send(event.clone());
        }
    }
}
