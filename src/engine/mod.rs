mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

#[cfg(test)]
use availability::subtract_blocked;
pub use conflict::has_conflict;
pub use error::EngineError;
pub use store::InMemoryStore;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub type SharedVenueLedger = Arc<RwLock<VenueLedger>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// One commit: every event lands in a single frame.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// take the first append, drain whatever else is already queued, write the
/// whole batch with one fsync, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (events, response) = match cmd {
            WalCommand::Append { events, response } => (events, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(events, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                Ok(other) => {
                    // Commit what we have before compacting underneath it.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
    debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(events, _)| wal.append_buffered(events));
    // Flush even after a failed append so half-written bytes don't bleed
    // into the next batch; every caller in this batch is told it failed.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// The ledger: every venue's intervals, a durable log, and change fan-out.
pub struct Engine {
    pub(super) store: InMemoryStore,
    /// `None` for an ephemeral engine that never touches disk.
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    pub notify: Arc<NotifyHub>,
    /// Mutations hold this shared for their whole check-and-commit;
    /// compaction holds it exclusively. Always taken before any ledger lock.
    pub(super) commit_gate: RwLock<()>,
}

impl Engine {
    /// Open a durable engine, replaying `wal_path` if it exists.
    /// Must be called inside a Tokio runtime (spawns the WAL writer).
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = replay_into_store(&events);
        info!(
            "replayed {} events from {} ({} venues)",
            events.len(),
            wal_path.display(),
            store.venue_count()
        );

        Ok(Self {
            store,
            wal_tx: Some(wal_tx),
            notify,
            commit_gate: RwLock::new(()),
        })
    }

    /// In-memory engine with no persistence, for tests and embedding.
    pub fn ephemeral(notify: Arc<NotifyHub>) -> Self {
        Self {
            store: InMemoryStore::new(),
            wal_tx: None,
            notify,
            commit_gate: RwLock::new(()),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.wal_tx.is_some()
    }

    pub fn subscribe(&self, venue_id: &VenueId) -> broadcast::Receiver<Event> {
        self.notify.subscribe(venue_id)
    }

    /// Send a command to the WAL writer and wait for its answer.
    async fn wal_request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> WalCommand,
    ) -> Result<Option<T>, EngineError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(None);
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(build(tx))
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map(Some)
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))
    }

    /// Log one commit via the background group-commit writer.
    async fn wal_append(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let result = self
            .wal_request(|response| WalCommand::Append { events, response })
            .await?;
        match result {
            Some(Err(e)) => Err(EngineError::WalError(e.to_string())),
            _ => Ok(()),
        }
    }

    /// WAL-append + apply + notify. Caller holds the venue's write lock.
    pub(super) async fn persist_and_apply(
        &self,
        ledger: &mut VenueLedger,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(vec![event.clone()]).await?;
        self.store.apply_event(ledger, event);
        self.notify.send(event.venue_id(), event);
        Ok(())
    }

    /// Lookup block → venue, acquire that venue's write lock, and confirm the
    /// block is still there once the lock is held.
    pub(super) async fn resolve_entity_write(
        &self,
        id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<VenueLedger>, EngineError> {
        let venue_id = self
            .store
            .get_venue_for_entity(id)
            .ok_or(EngineError::NotFound(*id))?;
        let ledger = self
            .store
            .get_ledger(&venue_id)
            .ok_or(EngineError::NotFound(*id))?;
        let guard = ledger.write_owned().await;
        if guard.get(*id).is_none() {
            return Err(EngineError::NotFound(*id));
        }
        Ok(guard)
    }
}

/// Rebuild the in-memory state from replayed events.
fn replay_into_store(events: &[Event]) -> InMemoryStore {
    let mut ledgers: HashMap<VenueId, VenueLedger> = HashMap::new();
    for event in events {
        let ledger = ledgers
            .entry(event.venue_id().clone())
            .or_insert_with(|| VenueLedger::new(event.venue_id().clone()));
        store::apply_to_ledger(ledger, event);
    }

    let store = InMemoryStore::new();
    for (_, ledger) in ledgers {
        store.insert_ledger(ledger);
    }
    store
}
