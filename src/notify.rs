use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-owner change feed. Every persisted event lands on its owner's channel.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
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

    /// Subscribe to an owner's events. Creates the channel if needed.
    pub fn subscribe(&self, owner_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(owner_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening. Channels whose receivers are all gone
    /// are dropped on the way.
    pub fn send(&self, event: &Event) {
        let owner_id = event.owner_id();
        let delivered = match self.channels.get(&owner_id) {
            Some(sender) => sender.send(event.clone()).is_ok(),
            None => return,
        };
        if !delivered {
            self.channels
                .remove_if(&owner_id, |_, sender| sender.receiver_count() == 0);
        }
    }

    pub fn subscriber_count(&self, owner_id: &Ulid) -> usize {
        self.channels
            .get(owner_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}
