use crate::model::*;

// ── Free-range algorithm ─────────────────────────────────────────

/// Closed sub-ranges of `window` not covered by any range in `blocked`.
///
/// `blocked` must be sorted by start and pairwise disjoint, which every
/// venue ledger guarantees. Ranges partially outside the window are clipped.
pub fn subtract_blocked(window: &DateRange, blocked: &[DateRange]) -> Vec<DateRange> {
    let mut free = Vec::new();
    // Next day not yet accounted for; None once we run past the calendar.
    let mut cursor = Some(window.start());

    for b in blocked {
        let Some(from) = cursor else { break };
        if from > window.end() || b.start() > window.end() {
            break;
        }
        if b.end() < from {
            continue;
        }
        if b.start() > from
            && let Some(until) = b.start().pred_opt() {
                free.extend(DateRange::new(from, until).ok());
            }
        cursor = b.end().succ_opt();
    }

    if let Some(from) = cursor
        && from <= window.end() {
            free.extend(DateRange::new(from, window.end()).ok());
        }
    free
}

/// Free ranges of `window` on `ledger`.
pub fn free_within(ledger: &VenueLedger, window: &DateRange) -> Vec<DateRange> {
    let blocked: Vec<DateRange> = ledger.overlapping(window).map(|i| i.range).collect();
    subtract_blocked(window, &blocked)
}
