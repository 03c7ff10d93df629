use std::collections::{HashMap, HashSet};

use tokio::sync::RwLockWriteGuard;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, validate_label, validate_range, validate_venue_id};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Insert a block on a venue. Check and write happen under the venue's
    /// write lock, so overlapping concurrent inserts cannot both succeed.
    pub async fn insert_block(
        &self,
        id: Ulid,
        venue_id: VenueId,
        range: DateRange,
        label: Option<String>,
    ) -> Result<Interval, EngineError> {
        validate_venue_id(&venue_id)?;
        validate_range(&range)?;
        validate_label(label.as_deref())?;
        if self.store.contains_entity(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.check_venue_capacity(std::slice::from_ref(&venue_id))?;

        let _gate = self.commit_gate.read().await;
        let (ledger, created) = self.store.ledger_or_create(&venue_id);
        let mut guard = ledger.write().await;
        let result = self.insert_locked(&mut guard, id, range, label).await;
        if result.is_err() && created {
            self.store.discard_if_unused(&ledger, &guard);
        }
        result
    }

    async fn insert_locked(
        &self,
        guard: &mut VenueLedger,
        id: Ulid,
        range: DateRange,
        label: Option<String>,
    ) -> Result<Interval, EngineError> {
        if guard.intervals.len() >= MAX_INTERVALS_PER_VENUE {
            return Err(EngineError::LimitExceeded("too many blocks on venue"));
        }
        // Another insert may have claimed the id while we waited for the lock.
        if self.store.contains_entity(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        check_no_conflict(guard, &range, None)?;

        let venue_id = guard.venue_id.clone();
        let event = Event::BlockAdded {
            id,
            venue_id: venue_id.clone(),
            range,
            label: label.clone(),
        };
        self.persist_and_apply(guard, &event).await?;
        debug!("blocked {range} on venue {venue_id} ({id})");
        Ok(Interval {
            id,
            venue_id,
            range,
            label,
        })
    }

    /// Remove a block, freeing its dates. Returns the removed interval.
    pub async fn remove_block(&self, id: Ulid) -> Result<Interval, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        let removed = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        let event = Event::BlockRemoved {
            id,
            venue_id: guard.venue_id.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("unblocked {} on venue {} ({id})", removed.range, removed.venue_id);
        Ok(removed)
    }

    /// Move a block to new dates: delete-then-insert as one logged step.
    /// The block's own current dates never count as a conflict.
    pub async fn reschedule_block(
        &self,
        id: Ulid,
        range: DateRange,
    ) -> Result<Interval, EngineError> {
        validate_range(&range)?;
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        check_no_conflict(&guard, &range, Some(id))?;

        let event = Event::BlockRescheduled {
            id,
            venue_id: guard.venue_id.clone(),
            range,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .get(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Atomically insert several blocks, possibly on different venues.
    /// All-or-nothing: if any candidate conflicts with the ledger or with
    /// another candidate on the same venue, nothing is committed.
    pub async fn batch_insert_blocks(
        &self,
        blocks: Vec<NewBlock>,
    ) -> Result<Vec<Interval>, EngineError> {
        if blocks.is_empty() {
            return Ok(Vec::new());
        }
        if blocks.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let mut seen = HashSet::with_capacity(blocks.len());
        for b in &blocks {
            validate_venue_id(&b.venue_id)?;
            validate_range(&b.range)?;
            validate_label(b.label.as_deref())?;
            if !seen.insert(b.id) || self.store.contains_entity(&b.id) {
                return Err(EngineError::AlreadyExists(b.id));
            }
        }

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut venue_ids: Vec<VenueId> = blocks.iter().map(|b| b.venue_id.clone()).collect();
        venue_ids.sort();
        venue_ids.dedup();
        self.check_venue_capacity(&venue_ids)?;

        let _gate = self.commit_gate.read().await;
        let ledgers: Vec<_> = venue_ids
            .iter()
            .map(|venue_id| self.store.ledger_or_create(venue_id))
            .collect();
        let mut guards = Vec::with_capacity(ledgers.len());
        for (ledger, _) in &ledgers {
            guards.push(ledger.write().await);
        }

        let result = self.batch_insert_locked(blocks, &venue_ids, &mut guards).await;
        if result.is_err() {
            for ((ledger, created), guard) in ledgers.iter().zip(&guards) {
                if *created {
                    self.store.discard_if_unused(ledger, guard);
                }
            }
        }
        result
    }

    /// Validate and commit a batch. `guards[i]` is the write-locked ledger of
    /// `venue_ids[i]`. The batch is logged as one WAL commit and applied only
    /// once that commit is durable.
    async fn batch_insert_locked(
        &self,
        blocks: Vec<NewBlock>,
        venue_ids: &[VenueId],
        guards: &mut [RwLockWriteGuard<'_, VenueLedger>],
    ) -> Result<Vec<Interval>, EngineError> {
        let slot = |venue_id: &VenueId, id: Ulid| {
            venue_ids
                .binary_search(venue_id)
                .map_err(|_| EngineError::NotFound(id))
        };

        // Phase 1: validate against stored intervals and within the batch.
        let mut by_venue: HashMap<&VenueId, Vec<&NewBlock>> = HashMap::new();
        for b in &blocks {
            by_venue.entry(&b.venue_id).or_default().push(b);
        }
        for (venue_id, batch) in &by_venue {
            let guard = &guards[slot(venue_id, batch[0].id)?];
            if guard.intervals.len() + batch.len() > MAX_INTERVALS_PER_VENUE {
                return Err(EngineError::LimitExceeded("too many blocks on venue"));
            }
            for (i, b) in batch.iter().enumerate() {
                if self.store.contains_entity(&b.id) {
                    return Err(EngineError::AlreadyExists(b.id));
                }
                check_no_conflict(guard, &b.range, None)?;
                if let Some(other) = batch[i + 1..].iter().find(|o| o.range.overlaps(&b.range)) {
                    metrics::counter!(observability::CONFLICTS_TOTAL).increment(1);
                    return Err(EngineError::Conflict(other.id));
                }
            }
        }

        // Phase 2: one durable commit, then apply and announce.
        let events: Vec<Event> = blocks
            .iter()
            .map(|b| Event::BlockAdded {
                id: b.id,
                venue_id: b.venue_id.clone(),
                range: b.range,
                label: b.label.clone(),
            })
            .collect();
        self.wal_append(events.clone()).await?;
        for (b, event) in blocks.iter().zip(&events) {
            let guard = &mut guards[slot(&b.venue_id, b.id)?];
            self.store.apply_event(guard, event);
            self.notify.send(event.venue_id(), event);
        }

        debug!("batch inserted {} blocks across {} venues", blocks.len(), venue_ids.len());
        Ok(blocks
            .into_iter()
            .map(|b| Interval {
                id: b.id,
                venue_id: b.venue_id,
                range: b.range,
                label: b.label,
            })
            .collect())
    }

    fn check_venue_capacity(&self, venue_ids: &[VenueId]) -> Result<(), EngineError> {
        let new_venues = venue_ids
            .iter()
            .filter(|v| self.store.get_ledger(v).is_none())
            .count();
        if new_venues > 0 && self.store.venue_count() + new_venues > MAX_VENUES {
            return Err(EngineError::LimitExceeded("too many venues"));
        }
        Ok(())
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    /// No-op for an ephemeral engine.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        if !self.is_durable() {
            return Ok(());
        }
        // Exclusive gate: no mutation is between its WAL append and its
        // in-memory apply while we snapshot and swap the log.
        let _gate = self.commit_gate.write().await;

        let mut events = Vec::new();
        for venue_id in self.store.venue_ids() {
            let Some(ledger) = self.store.get_ledger(&venue_id) else {
                continue;
            };
            let guard = ledger.read().await;
            events.extend(guard.intervals.iter().map(|i| Event::BlockAdded {
                id: i.id,
                venue_id: i.venue_id.clone(),
                range: i.range,
                label: i.label.clone(),
            }));
        }
        let count = events.len();

        let result = self
            .wal_request(|response| WalCommand::Compact { events, response })
            .await?;
        if let Some(Err(e)) = result {
            return Err(EngineError::WalError(e.to_string()));
        }
        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        match self
            .wal_request(|response| WalCommand::AppendsSinceCompact { response })
            .await
        {
            Ok(Some(n)) => n,
            _ => 0,
        }
    }
}
