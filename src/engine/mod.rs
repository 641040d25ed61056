mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
pub mod window;

pub use availability::{compute, free_slots, resolve_range};
pub use conflict::{find_conflict, has_conflict};
pub use error::{EngineError, NotFound, WindowError};
pub use window::validate_window;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};

use crate::clock::{Clock, SystemClock};
use crate::config::SchedulingConfig;
use crate::gate::{AccessGate, Directory};
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

pub type SharedTimeline = Arc<RwLock<RoomTimeline>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    /// Fold the log down to live reservations. Answers with the number kept.
    Compact {
        response: oneshot::Sender<io::Result<usize>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = Vec<(Event, oneshot::Sender<io::Result<()>>)>;

/// Owns the WAL. Appends that queue up while a flush is running are
/// committed together with one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };

        let mut batch: Pending = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_control(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Pending) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result = batch.iter().try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so no half-written batch lingers in
    // the buffer; every caller in the batch is told it failed.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, batch = batch.len(), "wal flush failed");
    }
    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { response } => {
            let _ = response.send(wal.compact());
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Apply an event to a room timeline. The caller holds the room's write lock.
fn apply_to_timeline(
    timeline: &mut RoomTimeline,
    event: &Event,
    index: &DashMap<ReservationId, RoomId>,
) {
    match event {
        Event::ReservationCreated { reservation } => {
            index.insert(reservation.id, reservation.room_id);
            timeline.insert(reservation.clone());
        }
        Event::ReservationUpdated { reservation } => {
            index.insert(reservation.id, reservation.room_id);
            timeline.replace(reservation.clone());
        }
        Event::ReservationDeleted { id, .. } => {
            timeline.remove(*id);
            index.remove(id);
        }
    }
}

/// The scheduling engine: per-room timelines in memory, made durable through
/// a group-commit WAL.
pub struct Engine {
    pub(super) rooms: DashMap<RoomId, SharedTimeline>,
    /// Reverse lookup: reservation id → room id.
    pub(super) reservation_to_room: DashMap<ReservationId, RoomId>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) config: SchedulingConfig,
    pub(super) gate: Arc<dyn AccessGate>,
    pub(super) directory: Arc<dyn Directory>,
    pub(super) clock: Arc<dyn Clock>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Must be
    /// called inside a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        config: SchedulingConfig,
        gate: Arc<dyn AccessGate>,
        directory: Arc<dyn Directory>,
    ) -> io::Result<Self> {
        Self::with_clock(wal_path, config, gate, directory, Arc::new(SystemClock))
    }

    pub fn with_clock(
        wal_path: PathBuf,
        config: SchedulingConfig,
        gate: Arc<dyn AccessGate>,
        directory: Arc<dyn Directory>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            reservation_to_room: DashMap::new(),
            wal_tx,
            config,
            gate,
            directory,
            clock,
        };

        // Nothing else holds these locks yet, so try_write always succeeds.
        // blocking_write would panic inside the runtime.
        for event in &events {
            let timeline = engine.timeline_or_create(event.room_id());
            if let Ok(mut guard) = timeline.try_write() {
                apply_to_timeline(&mut guard, event, &engine.reservation_to_room);
            }
        }
        tracing::info!(
            path = %wal_path.display(),
            events = events.len(),
            reservations = engine.reservation_to_room.len(),
            "wal replayed"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &SchedulingConfig {
        &self.config
    }

    pub(super) fn now(&self) -> Ms {
        self.clock.now()
    }

    pub(super) fn timeline(&self, room_id: &RoomId) -> Option<SharedTimeline> {
        self.rooms.get(room_id).map(|e| e.value().clone())
    }

    pub(super) fn timeline_or_create(&self, room_id: RoomId) -> SharedTimeline {
        self.rooms
            .entry(room_id)
            .or_insert_with(|| Arc::new(RwLock::new(RoomTimeline::new(room_id))))
            .clone()
    }

    pub(super) fn room_of(&self, id: &ReservationId) -> Option<RoomId> {
        self.reservation_to_room.get(id).map(|e| *e.value())
    }

    /// Hand an event to the background writer and wait for its fsync.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("wal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("wal writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// Make `event` durable, then apply it. On a WAL failure the timeline
    /// is left untouched.
    pub(super) async fn persist_and_apply(&self, timeline: &mut RoomTimeline, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_timeline(timeline, event, &self.reservation_to_room);
        Ok(())
    }

    /// Rewrite the WAL as one record per live reservation. Returns how many
    /// were kept.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| EngineError::Storage("wal writer shut down".into()))?;
        let kept = rx
            .await
            .map_err(|_| EngineError::Storage("wal writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        tracing::info!(reservations = kept, "wal compacted");
        Ok(kept)
    }

    /// Records appended since the last compaction, as counted by the writer.
    pub async fn wal_appends_since_compact(&self) -> Result<u64, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| EngineError::Storage("wal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("wal writer dropped response".into()))
    }
}
