use chrono::Datelike;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// True iff any interval on the venue intersects `candidate` (closed ranges).
pub fn has_conflict(ledger: &VenueLedger, candidate: &DateRange) -> bool {
    ledger.overlapping(candidate).next().is_some()
}

/// Fails with the first interval that intersects `candidate`, skipping `ignore`.
pub(crate) fn check_no_conflict(
    ledger: &VenueLedger,
    candidate: &DateRange,
    ignore: Option<Ulid>,
) -> Result<(), EngineError> {
    match ledger
        .overlapping(candidate)
        .find(|i| Some(i.id) != ignore)
    {
        Some(existing) => {
            metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
            Err(EngineError::Conflict(existing.id))
        }
        None => Ok(()),
    }
}

pub(crate) fn validate_range(range: &DateRange) -> Result<(), EngineError> {
    let (start_year, end_year) = (range.start().year(), range.end().year());
    if start_year < MIN_VALID_YEAR || end_year > MAX_VALID_YEAR {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    if range.days() > MAX_BLOCK_DAYS {
        return Err(EngineError::LimitExceeded("block too wide"));
    }
    Ok(())
}

pub(crate) fn validate_query_window(range: &DateRange) -> Result<(), EngineError> {
    if range.days() > MAX_QUERY_WINDOW_DAYS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

pub(crate) fn validate_venue_id(venue_id: &VenueId) -> Result<(), EngineError> {
    if venue_id.as_str().is_empty() {
        return Err(EngineError::LimitExceeded("empty venue id"));
    }
    if venue_id.as_str().len() > MAX_VENUE_ID_LEN {
        return Err(EngineError::LimitExceeded("venue id too long"));
    }
    Ok(())
}

pub(crate) fn validate_label(label: Option<&str>) -> Result<(), EngineError> {
    if let Some(l) = label
        && l.len() > MAX_LABEL_LEN {
            return Err(EngineError::LimitExceeded("label too long"));
        }
    Ok(())
}
