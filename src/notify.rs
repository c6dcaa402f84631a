use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::slot::SlotKey;

const CHANNEL_CAPACITY: usize = 256;

/// Committed schedule changes, published per provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleEvent {
    BookingCreated {
        id: Ulid,
        slot: SlotKey,
        date: NaiveDate,
        queue_position: u32,
    },
    BookingUpdated {
        id: Ulid,
        queue_position: u32,
    },
    BookingDeleted {
        id: Ulid,
    },
    SlotAdded {
        slot: SlotKey,
        capacity: u32,
    },
    SlotRemoved {
        slot: SlotKey,
    },
    SlotsMerged {
        removed: Vec<SlotKey>,
        merged: SlotKey,
        capacity: u32,
        rewritten: u32,
    },
    CapacityChanged {
        slot: SlotKey,
        capacity: u32,
    },
    DateOpened {
        date: NaiveDate,
    },
    DateClosed {
        date: NaiveDate,
    },
    DateReset {
        date: NaiveDate,
    },
    ProviderUpdated,
    ProviderDeleted,
}

/// Broadcast hub so presentation layers can refresh after a change.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<ScheduleEvent>>,
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

    /// Subscribe to changes of one provider. Creates the channel if needed.
    pub fn subscribe(&self, provider_id: Ulid) -> broadcast::Receiver<ScheduleEvent> {
        let sender = self
            .channels
            .entry(provider_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, provider_id: Ulid, event: ScheduleEvent) {
        if let Some(sender) = self.channels.get(&provider_id) {
            let _ = sender.send(event);
        }
    }

    /// Drop a provider's channel (e.g. when the provider is deleted).
    pub fn remove(&self, provider_id: &Ulid) {
        self.channels.remove(provider_id);
    }
}
