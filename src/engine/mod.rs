mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use availability::availability;
pub use conflict::{collect_conflicts, scan_conflicts};
pub use queries::sort_newest_first;
pub use error::EngineError;
pub use store::{chunks_for, Chunk, ChunkId, Footprint, SpotStore};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::model::*;
use crate::notify::{NotifyHub, ALL_SPOTS_CHANNEL};
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL and batches appends for group commit.
///
/// Waits for one append, drains whatever else is already queued, then pays a
/// single flush + fsync for the whole batch and answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

/// Make the whole batch durable or none of it. Every sender gets the same answer.
fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let result = wal.append_batch(batch.iter().map(|(event, _)| event));
    if let Err(e) = &result {
        tracing::error!("WAL batch of {} events rolled back: {e}", batch.len());
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
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
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// The spot ledger of one canvas.
pub struct Engine {
    pub store: Arc<SpotStore>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Needs a tokio runtime.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let wal = Wal::open(&wal_path)?;
        let events = Wal::replay(&wal_path)?.events;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: Arc::new(SpotStore::new()),
            wal_tx,
            notify,
        };

        // Sole owner of every lock here, so try_write never fails. No blocking_write:
        // this can run inside the runtime when a canvas is opened lazily.
        {
            let mut whitelist = engine
                .store
                .whitelist
                .try_write()
                .map_err(|_| io::Error::other("replay: whitelist lock contended"))?;
            for event in &events {
                match event {
                    Event::SpotClaimed { spot } => {
                        let mut guards = Vec::new();
                        for id in chunks_for(&spot.rect()) {
                            let chunk = engine.store.chunk(id);
                            let guard = chunk
                                .try_write_owned()
                                .map_err(|_| io::Error::other("replay: chunk lock contended"))?;
                            guards.push(guard);
                        }
                        if let Err(e) = conflict::check_no_overlap(&guards, &spot.rect()) {
                            tracing::warn!(
                                "replay: skipping spot {} by {} in {}: {e}",
                                spot.id,
                                spot.owner_wallet,
                                wal_path.display()
                            );
                            continue;
                        }
                        engine.store.apply_claim(&mut guards, spot.clone());
                    }
                    other => store::apply_whitelist(&mut whitelist, other),
                }
            }
        }

        tracing::info!(
            "replayed {} events from {} ({} spots)",
            events.len(),
            wal_path.display(),
            engine.store.spot_count()
        );
        Ok(engine)
    }

    /// Live feed of claims. See [`crate::notify`] for channel names.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Event> {
        self.notify.subscribe(channel)
    }
}

/// Write one event through the group-commit writer and wait until it is durable.
pub(super) async fn append_event(
    wal_tx: &mpsc::Sender<WalCommand>,
    event: &Event,
) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await
        .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::StoreUnavailable(e.to_string()))
}

pub(super) fn publish_claim(notify: &NotifyHub, chunks: &[ChunkId], event: &Event) {
    notify.send(ALL_SPOTS_CHANNEL, event);
    for chunk in chunks {
        notify.send(&chunk.channel(), event);
    }
}
