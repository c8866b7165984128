mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;
#[cfg(test)]
mod tests;

pub use conflict::{has_conflict, now_ms, overlaps};
pub use error::EngineError;
pub use mutations::{CancelPolicy, PageFields};
pub use slots::{
    cancel_deadline, compute_eligible_dates, generate_slots, is_date_eligible, is_offered_slot,
    local_instant,
};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono_tz::Tz;
use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::meeting::MeetingProvisioner;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub type SharedPage = Arc<RwLock<BookingPage>>;
pub type SharedOwner = Arc<RwLock<OwnerState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// Events of one append land in the same flush, in order.
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

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { events, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };

        let mut batch: Vec<PendingAppend> = vec![(events, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { events, response } => batch.push((events, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .flat_map(|(events, _)| events)
        .try_for_each(|event| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes never bleed into
    // the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
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
        WalCommand::Append { .. } => {}
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pages: DashMap<Ulid, SharedPage>,
    /// Page ids with a create in flight.
    pending_pages: DashSet<Ulid>,
    /// slug → page id. Entries are reserved before the page is persisted.
    slugs: DashMap<String, Ulid>,
    owners: DashMap<Ulid, SharedOwner>,
    /// booking / notification id → owner id
    entity_to_owner: DashMap<Ulid, Ulid>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Shared by every mutation, exclusive for compaction, so a snapshot never
    /// races an append.
    write_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
    meetings: Arc<dyn MeetingProvisioner>,
    default_tz: Tz,
}

/// Apply an owner-scoped event. Caller holds the owner's write lock.
fn apply_to_owner(os: &mut OwnerState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BookingConfirmed { booking } => {
            entity_map.insert(booking.id, booking.owner_id);
            match booking.status {
                BookingStatus::Confirmed => os.insert_confirmed(booking.clone()),
                BookingStatus::Cancelled => os.cancelled.push(booking.clone()),
            }
        }
        Event::BookingCancelled {
            id, cancelled_at, ..
        } => {
            if let Some(mut booking) = os.remove_confirmed(*id) {
                booking.status = BookingStatus::Cancelled;
                booking.cancelled_at = Some(*cancelled_at);
                os.cancelled.push(booking);
            }
        }
        Event::MeetingUrlSet {
            id, meeting_url, ..
        } => {
            if let Some(booking) = os.find_booking_mut(id) {
                booking.meeting_url = meeting_url.clone();
            }
        }
        Event::NotificationCreated { notification } => {
            entity_map.insert(notification.id, notification.owner_id);
            os.notifications.push(notification.clone());
        }
        Event::NotificationRead { id, .. } => {
            if let Some(n) = os.notifications.iter_mut().find(|n| n.id == *id) {
                n.is_read = true;
            }
        }
        // Page events live in the page map, not on the owner.
        Event::PageCreated { .. } | Event::PageUpdated { .. } | Event::PageDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        meetings: Arc<dyn MeetingProvisioner>,
        default_tz: Tz,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            pages: DashMap::new(),
            pending_pages: DashSet::new(),
            slugs: DashMap::new(),
            owners: DashMap::new(),
            entity_to_owner: DashMap::new(),
            wal_tx,
            write_gate: RwLock::new(()),
            notify,
            meetings,
            default_tz,
        };

        // Rebuild into plain maps first; nothing else can see them yet.
        let mut pages: HashMap<Ulid, BookingPage> = HashMap::new();
        let mut owners: HashMap<Ulid, OwnerState> = HashMap::new();
        for event in events {
            match event {
                Event::PageCreated { page } | Event::PageUpdated { page } => {
                    pages.insert(page.id, page);
                }
                Event::PageDeleted { id, .. } => {
                    pages.remove(&id);
                }
                other => {
                    let owner_id = other.owner_id();
                    let os = owners
                        .entry(owner_id)
                        .or_insert_with(|| OwnerState::new(owner_id));
                    apply_to_owner(os, &other, &engine.entity_to_owner);
                }
            }
        }
        for (id, page) in pages {
            engine.slugs.insert(page.slug.clone(), id);
            engine.pages.insert(id, Arc::new(RwLock::new(page)));
        }
        for (id, os) in owners {
            engine.owners.insert(id, Arc::new(RwLock::new(os)));
        }

        Ok(engine)
    }

    pub fn default_timezone(&self) -> Tz {
        self.default_tz
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append_all(std::slice::from_ref(event)).await
    }

    async fn wal_append_all(&self, events: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events: events.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_page_state(&self, id: &Ulid) -> Option<SharedPage> {
        self.pages.get(id).map(|e| e.value().clone())
    }

    pub fn get_owner(&self, id: &Ulid) -> Option<SharedOwner> {
        self.owners.get(id).map(|e| e.value().clone())
    }

    fn owner_or_create(&self, id: Ulid) -> SharedOwner {
        self.owners
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(OwnerState::new(id))))
            .value()
            .clone()
    }

    pub fn get_owner_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_owner.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append, apply to the locked owner, then broadcast.
    async fn persist_and_apply(&self, os: &mut OwnerState, event: &Event) -> Result<(), EngineError> {
        self.persist_and_apply_all(os, std::slice::from_ref(event)).await
    }

    /// Like `persist_and_apply`, but every event commits or none does.
    async fn persist_and_apply_all(&self, os: &mut OwnerState, events: &[Event]) -> Result<(), EngineError> {
        self.wal_append_all(events).await?;
        for event in events {
            apply_to_owner(os, event, &self.entity_to_owner);
            self.notify.send(event);
        }
        Ok(())
    }

    /// Lookup entity → owner, acquire that owner's write lock.
    async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<OwnerState>, EngineError> {
        let owner_id = self
            .get_owner_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let os = self
            .get_owner(&owner_id)
            .ok_or(EngineError::NotFound(owner_id))?;
        Ok(os.write_owned().await)
    }
}
