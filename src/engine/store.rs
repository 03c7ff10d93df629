use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::SharedVenueLedger;

/// In-memory index over all venue ledgers. Each ledger sits behind its own
/// lock; the maps themselves are sharded and never held across an await.
pub struct InMemoryStore {
    ledgers: DashMap<VenueId, SharedVenueLedger>,
    /// Reverse lookup: block id → venue id
    entity_to_venue: DashMap<Ulid, VenueId>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            ledgers: DashMap::new(),
            entity_to_venue: DashMap::new(),
        }
    }

    // ── Venue ledgers ────────────────────────────────────────

    pub fn venue_count(&self) -> usize {
        self.ledgers.len()
    }

    pub fn get_ledger(&self, venue_id: &VenueId) -> Option<SharedVenueLedger> {
        self.ledgers.get(venue_id).map(|e| e.value().clone())
    }

    /// Ledger for `venue_id`, created empty on first use. The flag is true
    /// when this call created it.
    pub fn ledger_or_create(&self, venue_id: &VenueId) -> (SharedVenueLedger, bool) {
        if let Some(ledger) = self.get_ledger(venue_id) {
            return (ledger, false);
        }
        match self.ledgers.entry(venue_id.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let ledger = Arc::new(RwLock::new(VenueLedger::new(venue_id.clone())));
                entry.insert(ledger.clone());
                (ledger, true)
            }
        }
    }

    /// Undo `ledger_or_create` after a failed write: drop `ledger` from the
    /// index if it is still empty and the caller's handle is the only one
    /// outside the map. `current` is the caller's write-locked view of it.
    /// Returns whether it was dropped.
    pub fn discard_if_unused(&self, ledger: &SharedVenueLedger, current: &VenueLedger) -> bool {
        if !current.intervals.is_empty() {
            return false;
        }
        self.ledgers
            .remove_if(&current.venue_id, |_, held| {
                Arc::ptr_eq(held, ledger) && Arc::strong_count(held) == 2
            })
            .is_some()
    }

    pub fn insert_ledger(&self, ledger: VenueLedger) {
        for interval in &ledger.intervals {
            self.map_entity(interval.id, ledger.venue_id.clone());
        }
        self.ledgers
            .insert(ledger.venue_id.clone(), Arc::new(RwLock::new(ledger)));
    }

    /// Venue ids sorted ascending.
    pub fn venue_ids(&self) -> Vec<VenueId> {
        let mut ids: Vec<VenueId> = self.ledgers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    // ── Entity index ─────────────────────────────────────────

    pub fn contains_entity(&self, id: &Ulid) -> bool {
        self.entity_to_venue.contains_key(id)
    }

    pub fn get_venue_for_entity(&self, id: &Ulid) -> Option<VenueId> {
        self.entity_to_venue.get(id).map(|e| e.value().clone())
    }

    pub fn map_entity(&self, id: Ulid, venue_id: VenueId) {
        self.entity_to_venue.insert(id, venue_id);
    }

    pub fn unmap_entity(&self, id: &Ulid) {
        self.entity_to_venue.remove(id);
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event to a ledger the caller already holds the write lock on.
    pub fn apply_event(&self, ledger: &mut VenueLedger, event: &Event) {
        apply_to_ledger(ledger, event);
        match event {
            Event::BlockAdded { id, venue_id, .. } => self.map_entity(*id, venue_id.clone()),
            Event::BlockRemoved { id, .. } => self.unmap_entity(id),
            Event::BlockRescheduled { .. } => {}
        }
    }
}

/// Apply an event to a bare ledger (no index bookkeeping).
pub(super) fn apply_to_ledger(ledger: &mut VenueLedger, event: &Event) {
    match event {
        Event::BlockAdded {
            id,
            venue_id,
            range,
            label,
        } => {
            ledger.insert_interval(Interval {
                id: *id,
                venue_id: venue_id.clone(),
                range: *range,
                label: label.clone(),
            });
        }
        Event::BlockRescheduled { id, range, .. } => {
            if let Some(mut interval) = ledger.remove_interval(*id) {
                interval.range = *range;
                ledger.insert_interval(interval);
            }
        }
        Event::BlockRemoved { id, .. } => {
            ledger.remove_interval(*id);
        }
    }
}
