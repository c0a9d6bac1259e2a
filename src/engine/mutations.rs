use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{RwLock, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_overlap, check_telescope_idle, now_ms, validate_span};
use super::lifecycle::{self, Transition};
use super::quota::check_quota;
use super::{Engine, EngineError, SharedTelescopeState, WalCommand};

impl Engine {
    // ── Telescopes ───────────────────────────────────────────

    pub async fn create_telescope(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        if self.state.len() >= MAX_TELESCOPES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many telescopes"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("telescope name too long"));
        }
        // Reserve the id before the WAL write. The held guard keeps writers
        // off the new state until it is committed.
        let ts: SharedTelescopeState = Arc::new(RwLock::new(TelescopeState::new(id, name.clone())));
        let _guard = ts.clone().write_owned().await;
        match self.state.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(ts);
            }
        }

        let event = Event::TelescopeCreated { id, name };
        if let Err(e) = self.wal_append(&event).await {
            self.state.remove(&id);
            return Err(e);
        }
        self.notify.send(id, &event);
        info!(telescope = %id, "telescope created");
        Ok(())
    }

    /// Only telescopes whose appointments are all CANCELED can go; those are
    /// dropped with it.
    pub async fn delete_telescope(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let ts = self.get_telescope(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ts.write().await;
        if !self.is_registered(&id, &ts) {
            return Err(EngineError::NotFound(id));
        }
        if guard
            .appointments
            .iter()
            .any(|a| a.status != AppointmentStatus::Canceled)
        {
            return Err(EngineError::HasAppointments(id));
        }

        let event = Event::TelescopeDeleted { id };
        self.wal_append(&event).await?;
        self.forget_appointments(&guard);
        self.state.remove(&id);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        info!(telescope = %id, "telescope deleted");
        Ok(())
    }

    // ── Users and allotted time ──────────────────────────────

    pub async fn register_user(
        &self,
        id: Ulid,
        name: Option<String>,
        roles: RoleSet,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        if self.users.len() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("user name too long"));
        }
        if roles.len() > MAX_ROLES_PER_USER {
            return Err(EngineError::LimitExceeded("too many roles"));
        }
        let _user = self.lock_user(id).await;
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = Event::UserRegistered {
            id,
            name,
            roles: roles.into_iter().collect(),
        };
        self.persist_account_event(&event).await?;
        info!(user = %id, "user registered");
        Ok(())
    }

    pub async fn set_user_roles(&self, id: Ulid, roles: RoleSet) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        if roles.len() > MAX_ROLES_PER_USER {
            return Err(EngineError::LimitExceeded("too many roles"));
        }
        let _user = self.lock_user(id).await;
        if !self.users.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::UserRolesChanged {
            id,
            roles: roles.into_iter().collect(),
        };
        self.persist_account_event(&event).await
    }

    /// Lowering a cap below current usage is allowed; it only blocks new time.
    pub async fn set_allotted_time(
        &self,
        user_id: Ulid,
        allotted: AllottedTime,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        if let AllottedTime::Limited(ms) = allotted
            && ms < 0
        {
            return Err(EngineError::Invalid("allotted time must be non-negative"));
        }
        let _user = self.lock_user(user_id).await;
        if !self.users.contains_key(&user_id) {
            return Err(EngineError::NotFound(user_id));
        }
        let event = Event::AllottedTimeSet {
            user_id,
            max_ms: allotted.as_option(),
        };
        self.persist_account_event(&event).await?;
        info!(user = %user_id, cap_ms = ?allotted.as_option(), "allotted time set");
        Ok(())
    }

    // ── Appointments ─────────────────────────────────────────

    /// Directly SCHEDULED; no approval step.
    pub async fn create_appointment(&self, new: NewAppointment) -> Result<(), EngineError> {
        self.insert_appointment(new, AppointmentStatus::Scheduled).await
    }

    /// REQUESTED; waits for an administrator to approve or deny.
    pub async fn request_appointment(&self, new: NewAppointment) -> Result<(), EngineError> {
        self.insert_appointment(new, AppointmentStatus::Requested).await
    }

    async fn insert_appointment(
        &self,
        new: NewAppointment,
        status: AppointmentStatus,
    ) -> Result<(), EngineError> {
        validate_span(&new.span)?;
        let _gate = self.commit_gate.read().await;
        let ts = self
            .get_telescope(&new.telescope_id)
            .ok_or(EngineError::NotFound(new.telescope_id))?;
        if !self.users.contains_key(&new.user_id) {
            return Err(EngineError::NotFound(new.user_id));
        }

        let _user = self.lock_user(new.user_id).await;
        let mut guard = ts.write().await;
        if !self.is_registered(&new.telescope_id, &ts) {
            return Err(EngineError::NotFound(new.telescope_id));
        }
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_TELESCOPE {
            return Err(EngineError::LimitExceeded("too many appointments on telescope"));
        }
        if self.appointments.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(new.id));
        }

        check_no_overlap(&guard, &new.span, None)?;
        let cap = self.allotted_cap(new.user_id)?;
        let used = self.ledger.used(new.user_id, self.policy, None);
        check_quota(new.user_id, cap, used, new.span.duration_ms())?;

        let event = Event::AppointmentCreated {
            id: new.id,
            telescope_id: new.telescope_id,
            user_id: new.user_id,
            span: new.span,
            status,
            priority: new.priority,
            kind: new.kind,
            public: new.public,
        };
        self.persist_and_apply(new.telescope_id, &mut guard, &event).await?;
        info!(
            appointment = %new.id,
            telescope = %new.telescope_id,
            user = %new.user_id,
            status = %status,
            "appointment created"
        );
        Ok(())
    }

    /// Move an appointment to a new window on the same telescope. The
    /// appointment's own prior window neither conflicts nor counts toward
    /// the owner's usage.
    pub async fn reschedule_appointment(&self, id: Ulid, span: Span) -> Result<(), EngineError> {
        validate_span(&span)?;
        let _gate = self.commit_gate.read().await;
        let (location, _user, mut guard) = self.resolve_appointment_write(&id).await?;
        let appointment = guard.get(id).ok_or(EngineError::NotFound(id))?;
        lifecycle::ensure_reschedulable(appointment)?;

        check_no_overlap(&guard, &span, Some(id))?;
        let cap = self.allotted_cap(location.user_id)?;
        let used = self.ledger.used(location.user_id, self.policy, Some(id));
        check_quota(location.user_id, cap, used, span.duration_ms())?;

        let event = Event::AppointmentRescheduled {
            id,
            telescope_id: location.telescope_id,
            span,
        };
        self.persist_and_apply(location.telescope_id, &mut guard, &event).await?;
        info!(appointment = %id, start = span.start, end = span.end, "appointment rescheduled");
        Ok(())
    }

    pub async fn approve_appointment(&self, id: Ulid) -> Result<(), EngineError> {
        self.transition(id, Transition::Approve).await
    }

    pub async fn deny_appointment(&self, id: Ulid) -> Result<(), EngineError> {
        self.transition(id, Transition::Deny).await
    }

    pub async fn start_appointment(&self, id: Ulid) -> Result<(), EngineError> {
        self.transition(id, Transition::Start).await
    }

    pub async fn complete_appointment(&self, id: Ulid) -> Result<(), EngineError> {
        self.transition(id, Transition::Complete).await
    }

    pub async fn cancel_appointment(&self, id: Ulid) -> Result<(), EngineError> {
        self.transition(id, Transition::Cancel).await
    }

    /// Apply one lifecycle transition. A failed guard leaves state untouched.
    pub async fn transition(&self, id: Ulid, transition: Transition) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let (location, _user, mut guard) = self.resolve_appointment_write(&id).await?;
        let appointment = guard.get(id).ok_or(EngineError::NotFound(id))?;
        let from = appointment.status;
        let next = lifecycle::next_status(appointment, transition)?;
        let span = appointment.span;

        match transition {
            Transition::Approve => {
                let cap = self.allotted_cap(location.user_id)?;
                let used = self.ledger.used(location.user_id, self.policy, Some(id));
                check_quota(location.user_id, cap, used, span.duration_ms())?;
            }
            Transition::Start => {
                check_no_overlap(&guard, &span, Some(id))?;
                check_telescope_idle(&guard, id)?;
            }
            Transition::Deny | Transition::Complete | Transition::Cancel => {}
        }

        let event = Event::AppointmentStatusChanged {
            id,
            telescope_id: location.telescope_id,
            status: next,
        };
        self.persist_and_apply(location.telescope_id, &mut guard, &event).await?;
        metrics::counter!(
            crate::observability::APPOINTMENT_TRANSITIONS_TOTAL,
            "action" => transition.as_str()
        )
        .increment(1);
        info!(appointment = %id, %from, to = %next, action = transition.as_str(), "appointment transition");
        Ok(())
    }

    pub async fn add_coordinate(&self, id: Ulid, coordinate: Coordinate) -> Result<(), EngineError> {
        if !coordinate.is_valid() {
            return Err(EngineError::Invalid("coordinate out of range"));
        }
        let _gate = self.commit_gate.read().await;
        let (location, _user, mut guard) = self.resolve_appointment_write(&id).await?;
        let appointment = guard.get(id).ok_or(EngineError::NotFound(id))?;
        lifecycle::ensure_free_control_running(appointment, "add coordinate to")?;
        if appointment.coordinates.len() >= MAX_COORDINATES_PER_APPOINTMENT {
            return Err(EngineError::LimitExceeded("too many coordinates"));
        }

        let event = Event::CoordinateAdded {
            id,
            telescope_id: location.telescope_id,
            coordinate,
        };
        self.persist_and_apply(location.telescope_id, &mut guard, &event).await
    }

    pub async fn calibrate(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let (location, _user, mut guard) = self.resolve_appointment_write(&id).await?;
        let appointment = guard.get(id).ok_or(EngineError::NotFound(id))?;
        lifecycle::ensure_free_control_running(appointment, "calibrate")?;

        let event = Event::AppointmentCalibrated {
            id,
            telescope_id: location.telescope_id,
            at: now_ms(),
        };
        self.persist_and_apply(location.telescope_id, &mut guard, &event).await
    }

    /// Physically remove a CANCELED appointment.
    pub async fn purge_appointment(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let (location, _user, mut guard) = self.resolve_appointment_write(&id).await?;
        let appointment = guard.get(id).ok_or(EngineError::NotFound(id))?;
        lifecycle::ensure_purgeable(appointment)?;

        let event = Event::AppointmentPurged {
            id,
            telescope_id: location.telescope_id,
        };
        self.persist_and_apply(location.telescope_id, &mut guard, &event).await?;
        info!(appointment = %id, "appointment purged");
        Ok(())
    }

    /// CANCELED appointments whose window ended at or before `cutoff`.
    pub fn collect_purgeable(&self, cutoff: Ms) -> Vec<Ulid> {
        let mut ids = Vec::new();
        for entry in self.state.iter() {
            let ts = entry.value().clone();
            if let Ok(guard) = ts.try_read() {
                ids.extend(
                    guard
                        .appointments
                        .iter()
                        .filter(|a| a.status == AppointmentStatus::Canceled && a.span.end <= cutoff)
                        .map(|a| a.id),
                );
            }
        }
        ids
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        for user in self.users.iter() {
            events.push(Event::UserRegistered {
                id: user.id,
                name: user.name.clone(),
                roles: user.roles.iter().copied().collect(),
            });
        }
        for cap in self.caps.iter() {
            events.push(Event::AllottedTimeSet {
                user_id: *cap.key(),
                max_ms: cap.value().as_option(),
            });
        }

        let telescopes: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        for ts in telescopes {
            let guard = ts.read().await;
            events.push(Event::TelescopeCreated {
                id: guard.id,
                name: guard.name.clone(),
            });
            for a in &guard.appointments {
                events.push(Event::AppointmentCreated {
                    id: a.id,
                    telescope_id: a.telescope_id,
                    user_id: a.user_id,
                    span: a.span,
                    status: a.status,
                    priority: a.priority,
                    kind: a.kind,
                    public: a.public,
                });
                for coordinate in &a.coordinates {
                    events.push(Event::CoordinateAdded {
                        id: a.id,
                        telescope_id: a.telescope_id,
                        coordinate: *coordinate,
                    });
                }
                if let Some(at) = a.calibrated_at {
                    events.push(Event::AppointmentCalibrated {
                        id: a.id,
                        telescope_id: a.telescope_id,
                        at,
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
