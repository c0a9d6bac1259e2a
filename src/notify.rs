use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-telescope broadcast of committed events. A telescope controller
/// subscribes to its own id to follow its schedule as it changes.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a telescope. Creates the channel if needed.
    pub fn subscribe(&self, telescope_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(telescope_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening. Lagging receivers lose the oldest events.
    pub fn send(&self, telescope_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&telescope_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop the channel; subscribers see the stream close.
    pub fn remove(&self, telescope_id: &Ulid) {
        self.channels.remove(telescope_id);
    }

    pub fn subscriber_count(&self, telescope_id: &Ulid) -> usize {
        self.channels
            .get(telescope_id)
            .map_or(0, |s| s.receiver_count())
    }
}
