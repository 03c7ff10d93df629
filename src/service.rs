//! Read-only availability queries for booking workflows and UIs.

use std::sync::Arc;

use chrono::NaiveDate;

use crate::engine::{Engine, EngineError};
use crate::model::*;

/// Façade over the ledger exposing only reads. Cloning is cheap.
#[derive(Clone)]
pub struct AvailabilityService {
    engine: Arc<Engine>,
}

impl AvailabilityService {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Preview whether `[start, end]` could be blocked on the venue, listing
    /// every interval that would stand in the way.
    pub async fn check_range(
        &self,
        venue_id: &VenueId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Availability, EngineError> {
        let range = DateRange::new(start, end)?;
        let conflicting = self.engine.conflicting(venue_id, &range).await;
        Ok(Availability {
            free: conflicting.is_empty(),
            conflicting,
        })
    }

    pub async fn get_blocked_ranges(&self, venue_id: &VenueId) -> Vec<Interval> {
        self.engine.list_for_venue(venue_id).await
    }

    pub async fn is_free_on(&self, venue_id: &VenueId, date: NaiveDate) -> bool {
        self.engine.is_free_on(venue_id, date).await
    }

    /// Free stretches inside `window`, keeping only those of at least
    /// `min_days` days when given.
    pub async fn free_ranges(
        &self,
        venue_id: &VenueId,
        window: &DateRange,
        min_days: Option<u32>,
    ) -> Result<Vec<DateRange>, EngineError> {
        let mut free = self.engine.free_ranges(venue_id, window).await?;
        if let Some(min) = min_days {
            free.retain(|r| r.days() >= i64::from(min));
        }
        Ok(free)
    }
}
