use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

/// Opaque venue identifier minted by the external venue catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VenueId(String);

impl VenueId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VenueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VenueId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for VenueId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Rejected `[start, end]` pair where `start > end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid date range: start {start} is after end {end}")]
pub struct InvalidRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Closed interval of calendar days `[start, end]`. Both ends are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawDateRange")]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

#[derive(Deserialize)]
struct RawDateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl TryFrom<RawDateRange> for DateRange {
    type Error = InvalidRange;

    fn try_from(raw: RawDateRange) -> Result<Self, Self::Error> {
        DateRange::new(raw.start, raw.end)
    }
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, InvalidRange> {
        if start > end {
            return Err(InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn single_day(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Number of calendar days covered, counting both ends.
    pub fn days(&self) -> i64 {
        self.end.signed_duration_since(self.start).num_days() + 1
    }

    /// Closed-range intersection: sharing a single boundary day counts.
    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// A blocked or booked period on one venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub id: Ulid,
    pub venue_id: VenueId,
    pub range: DateRange,
    /// Block reason or booking reference, free-form.
    pub label: Option<String>,
}

/// Candidate for a batch insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBlock {
    pub id: Ulid,
    pub venue_id: VenueId,
    pub range: DateRange,
    pub label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VenueLedger {
    pub venue_id: VenueId,
    /// Non-overlapping intervals sorted by `range.start`, so ends are sorted too.
    pub intervals: Vec<Interval>,
}

impl VenueLedger {
    pub fn new(venue_id: VenueId) -> Self {
        Self {
            venue_id,
            intervals: Vec::new(),
        }
    }

    /// Insert interval maintaining sort order by range start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .partition_point(|i| i.range.start <= interval.range.start);
        self.intervals.insert(pos, interval);
    }

    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Interval> {
        self.intervals.iter().find(|i| i.id == id)
    }

    /// Intervals whose closed range intersects `query`.
    /// Binary search skips everything starting after `query.end`.
    pub fn overlapping(&self, query: &DateRange) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.range.start <= query.end);
        let query_start = query.start;
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.range.end >= query_start)
    }

    /// The interval covering `date`, if any.
    pub fn containing(&self, date: NaiveDate) -> Option<&Interval> {
        self.overlapping(&DateRange::single_day(date)).next()
    }
}

/// The event types, one per mutation. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BlockAdded {
        id: Ulid,
        venue_id: VenueId,
        range: DateRange,
        label: Option<String>,
    },
    BlockRescheduled {
        id: Ulid,
        venue_id: VenueId,
        range: DateRange,
    },
    BlockRemoved {
        id: Ulid,
        venue_id: VenueId,
    },
}

impl Event {
    pub fn venue_id(&self) -> &VenueId {
        match self {
            Event::BlockAdded { venue_id, .. }
            | Event::BlockRescheduled { venue_id, .. }
            | Event::BlockRemoved { venue_id, .. } => venue_id,
        }
    }
}

/// Result of previewing a range before inserting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub free: bool,
    pub conflicting: Vec<Interval>,
}
