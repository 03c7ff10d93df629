use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, VenueId};

const CHANNEL_CAPACITY: usize = 256;

/// Per-venue broadcast of committed ledger events.
///
/// Lagging subscribers lose the oldest events (`RecvError::Lagged`) and are
/// expected to re-read the venue's intervals.
pub struct NotifyHub {
    channels: DashMap<VenueId, broadcast::Sender<Event>>,
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

    /// Subscribe to committed events for a venue. Creates the channel if needed.
    pub fn subscribe(&self, venue_id: &VenueId) -> broadcast::Receiver<Event> {
        self.channels
            .entry(venue_id.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, venue_id: &VenueId, event: &Event) {
        if let Some(sender) = self.channels.get(venue_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop channels whose subscribers have all gone away.
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
        before - self.channels.len()
    }
}
