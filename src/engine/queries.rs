use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::free_within;
use super::conflict::{self, validate_query_window};
use super::{Engine, EngineError};

impl Engine {
    /// Conflict check against the venue's current intervals.
    /// Unknown venues have no intervals and therefore never conflict.
    pub async fn has_conflict(&self, venue_id: &VenueId, candidate: &DateRange) -> bool {
        let Some(ledger) = self.store.get_ledger(venue_id) else {
            return false;
        };
        let guard = ledger.read().await;
        conflict::has_conflict(&guard, candidate)
    }

    /// All intervals for a venue, ascending by start. Empty for unknown venues.
    pub async fn list_for_venue(&self, venue_id: &VenueId) -> Vec<Interval> {
        let Some(ledger) = self.store.get_ledger(venue_id) else {
            return Vec::new();
        };
        let guard = ledger.read().await;
        guard.intervals.clone()
    }

    pub async fn is_free_on(&self, venue_id: &VenueId, date: NaiveDate) -> bool {
        let Some(ledger) = self.store.get_ledger(venue_id) else {
            return true;
        };
        let guard = ledger.read().await;
        guard.containing(date).is_none()
    }

    /// Intervals intersecting `range`, ascending by start.
    pub async fn conflicting(&self, venue_id: &VenueId, range: &DateRange) -> Vec<Interval> {
        let Some(ledger) = self.store.get_ledger(venue_id) else {
            return Vec::new();
        };
        let guard = ledger.read().await;
        guard.overlapping(range).cloned().collect()
    }

    /// Maximal free sub-ranges of `window`.
    pub async fn free_ranges(
        &self,
        venue_id: &VenueId,
        window: &DateRange,
    ) -> Result<Vec<DateRange>, EngineError> {
        validate_query_window(window)?;
        let Some(ledger) = self.store.get_ledger(venue_id) else {
            return Ok(vec![*window]);
        };
        let guard = ledger.read().await;
        Ok(free_within(&guard, window))
    }

    pub async fn get_block(&self, id: Ulid) -> Option<Interval> {
        let venue_id = self.store.get_venue_for_entity(&id)?;
        let ledger = self.store.get_ledger(&venue_id)?;
        let guard = ledger.read().await;
        guard.get(id).cloned()
    }

    /// Venues that have ever held a block, sorted.
    pub fn venue_ids(&self) -> Vec<VenueId> {
        self.store.venue_ids()
    }

    pub fn venue_count(&self) -> usize {
        self.store.venue_count()
    }
}
