mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod quota;
#[cfg(test)]
mod tests;

pub use conflict::{find_overlap, has_overlap, validate_window};
pub use error::{EngineError, ErrorKind};
pub use lifecycle::{Transition, next_status};
pub use quota::{QuotaPolicy, default_for_roles, remaining, role_default, would_exceed};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use quota::{Usage, UsageLedger};

pub type SharedTelescopeState = Arc<RwLock<TelescopeState>>;

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

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch = match cmd {
            WalCommand::Append { event, response } => vec![(event, response)],
            other => {
                handle_maintenance(&mut wal, other);
                continue;
            }
        };
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
            handle_maintenance(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so half-written bytes never leak
    // into the next batch.
    let flushed = wal.flush_sync();
    let result = result.and(flushed);

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_maintenance(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// Where an appointment lives and who owns it; lets callers lock the right
/// user and telescope without scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppointmentRef {
    pub telescope_id: Ulid,
    pub user_id: Ulid,
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedTelescopeState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) appointments: DashMap<Ulid, AppointmentRef>,
    pub(super) users: DashMap<Ulid, UserRecord>,
    /// Explicit caps; users without an entry fall back to their role default.
    pub(super) caps: DashMap<Ulid, AllottedTime>,
    pub(super) ledger: UsageLedger,
    /// Serializes quota-affecting mutations per user. Always taken before a
    /// telescope lock.
    user_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Mutations hold this shared; compaction holds it exclusively so no
    /// append can land between the snapshot and the file swap.
    pub(super) commit_gate: RwLock<()>,
    pub(super) policy: QuotaPolicy,
}

/// Apply an event directly to a TelescopeState (no locking — caller holds the lock).
fn apply_to_telescope(
    ts: &mut TelescopeState,
    event: &Event,
    index: &DashMap<Ulid, AppointmentRef>,
    ledger: &UsageLedger,
) {
    match event {
        Event::AppointmentCreated {
            id,
            telescope_id,
            user_id,
            span,
            status,
            priority,
            kind,
            public,
        } => {
            ts.insert_appointment(Appointment {
                id: *id,
                telescope_id: *telescope_id,
                user_id: *user_id,
                span: *span,
                status: *status,
                priority: *priority,
                kind: *kind,
                public: *public,
                coordinates: Vec::new(),
                calibrated_at: None,
            });
            index.insert(*id, AppointmentRef {
                telescope_id: *telescope_id,
                user_id: *user_id,
            });
            ledger.record(*user_id, *id, Usage {
                span: *span,
                status: *status,
            });
        }
        Event::AppointmentRescheduled { id, span, .. } => {
            // Re-insert so the start-ordered invariant holds.
            if let Some(mut appointment) = ts.remove_appointment(*id) {
                appointment.span = *span;
                ledger.update(appointment.user_id, *id, |u| u.span = *span);
                ts.insert_appointment(appointment);
            }
        }
        Event::AppointmentStatusChanged { id, status, .. } => {
            if let Some(appointment) = ts.get_mut(*id) {
                appointment.status = *status;
                ledger.update(appointment.user_id, *id, |u| u.status = *status);
            }
        }
        Event::CoordinateAdded { id, coordinate, .. } => {
            if let Some(appointment) = ts.get_mut(*id) {
                appointment.coordinates.push(*coordinate);
            }
        }
        Event::AppointmentCalibrated { id, at, .. } => {
            if let Some(appointment) = ts.get_mut(*id) {
                appointment.calibrated_at = Some(*at);
            }
        }
        Event::AppointmentPurged { id, .. } => {
            if let Some(appointment) = ts.remove_appointment(*id) {
                ledger.remove(appointment.user_id, *id);
            }
            index.remove(id);
        }
        // Telescope/user/cap events are handled at the engine level, not here
        Event::TelescopeCreated { .. }
        | Event::TelescopeDeleted { .. }
        | Event::UserRegistered { .. }
        | Event::UserRolesChanged { .. }
        | Event::AllottedTimeSet { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, policy: QuotaPolicy) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            appointments: DashMap::new(),
            users: DashMap::new(),
            caps: DashMap::new(),
            ledger: UsageLedger::new(),
            user_locks: DashMap::new(),
            commit_gate: RwLock::new(()),
            policy,
        };

        // Sole owner of these Arcs during replay, so try_read/try_write always
        // succeed. No blocking_read/blocking_write: lazy tenant creation runs
        // inside the runtime.
        for event in &events {
            match event {
                Event::TelescopeCreated { id, name } => {
                    let ts = TelescopeState::new(*id, name.clone());
                    engine.state.insert(*id, Arc::new(RwLock::new(ts)));
                }
                Event::TelescopeDeleted { id } => {
                    if let Some((_, ts)) = engine.state.remove(id)
                        && let Ok(guard) = ts.try_read()
                    {
                        engine.forget_appointments(&guard);
                    }
                }
                Event::UserRegistered { .. }
                | Event::UserRolesChanged { .. }
                | Event::AllottedTimeSet { .. } => engine.apply_account_event(event),
                other => {
                    if let Some(telescope_id) = other.telescope_id()
                        && let Some(entry) = engine.state.get(&telescope_id)
                    {
                        let ts = entry.clone();
                        drop(entry);
                        if let Ok(mut guard) = ts.try_write() {
                            apply_to_telescope(&mut guard, other, &engine.appointments, &engine.ledger);
                        }
                    }
                }
            }
        }

        Ok(engine)
    }

    fn apply_account_event(&self, event: &Event) {
        match event {
            Event::UserRegistered { id, name, roles } => {
                self.users.insert(*id, UserRecord {
                    id: *id,
                    name: name.clone(),
                    roles: roles.iter().copied().collect(),
                });
            }
            Event::UserRolesChanged { id, roles } => {
                if let Some(mut user) = self.users.get_mut(id) {
                    user.roles = roles.iter().copied().collect();
                }
            }
            Event::AllottedTimeSet { user_id, max_ms } => {
                self.caps.insert(*user_id, AllottedTime::from_option(*max_ms));
            }
            _ => {}
        }
    }

    /// Drop index and ledger entries for every appointment on a telescope
    /// that is going away.
    pub(super) fn forget_appointments(&self, ts: &TelescopeState) {
        for appointment in &ts.appointments {
            self.appointments.remove(&appointment.id);
            self.ledger.remove(appointment.user_id, appointment.id);
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_telescope(&self, id: &Ulid) -> Option<SharedTelescopeState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    /// True while `ts` is still the live state registered under `id`. A
    /// writer that waited on the lock re-checks this before committing.
    pub(super) fn is_registered(&self, id: &Ulid, ts: &SharedTelescopeState) -> bool {
        self.state.get(id).is_some_and(|e| Arc::ptr_eq(e.value(), ts))
    }

    pub fn locate_appointment(&self, id: &Ulid) -> Option<AppointmentRef> {
        self.appointments.get(id).map(|e| *e.value())
    }

    pub fn quota_policy(&self) -> QuotaPolicy {
        self.policy
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        telescope_id: Ulid,
        ts: &mut TelescopeState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_telescope(ts, event, &self.appointments, &self.ledger);
        self.notify.send(telescope_id, event);
        Ok(())
    }

    /// WAL-append + apply for user and cap events.
    pub(super) async fn persist_account_event(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_account_event(event);
        Ok(())
    }

    pub(super) async fn lock_user(&self, user_id: Ulid) -> OwnedMutexGuard<()> {
        let lock = self.user_locks.entry(user_id).or_default().clone();
        lock.lock_owned().await
    }

    /// Lookup appointment → (owner lock, telescope write lock), in that order.
    pub(super) async fn resolve_appointment_write(
        &self,
        id: &Ulid,
    ) -> Result<
        (
            AppointmentRef,
            OwnedMutexGuard<()>,
            tokio::sync::OwnedRwLockWriteGuard<TelescopeState>,
        ),
        EngineError,
    > {
        let location = self.locate_appointment(id).ok_or(EngineError::NotFound(*id))?;
        let user_guard = self.lock_user(location.user_id).await;
        let ts = self
            .get_telescope(&location.telescope_id)
            .ok_or(EngineError::NotFound(location.telescope_id))?;
        let guard = ts.clone().write_owned().await;
        if !self.is_registered(&location.telescope_id, &ts) {
            return Err(EngineError::NotFound(location.telescope_id));
        }
        if guard.get(*id).is_none() {
            // Purged between lookup and lock.
            return Err(EngineError::NotFound(*id));
        }
        Ok((location, user_guard, guard))
    }
}
