use ulid::Ulid;

use crate::model::*;

use super::conflict;
use super::quota::{self, default_for_roles};
use super::{Engine, EngineError};

impl Engine {
    /// Whether `span` collides with a live appointment on the telescope,
    /// ignoring `exclude`. An unknown telescope has nothing to collide with.
    pub async fn has_overlap(&self, telescope_id: Ulid, span: Span, exclude: Option<Ulid>) -> bool {
        self.find_overlap(telescope_id, span, exclude).await.is_some()
    }

    pub async fn find_overlap(
        &self,
        telescope_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Option<Ulid> {
        let ts = self.get_telescope(&telescope_id)?;
        let guard = ts.read().await;
        conflict::find_overlap(&guard, &span, exclude)
    }

    /// The user's cap: explicit record first, then the role default.
    pub fn allotted_cap(&self, user_id: Ulid) -> Result<AllottedTime, EngineError> {
        let user = self.users.get(&user_id).ok_or(EngineError::NotFound(user_id))?;
        if let Some(cap) = self.caps.get(&user_id) {
            return Ok(*cap);
        }
        default_for_roles(&user.roles).ok_or(EngineError::MissingAllottedTime(user_id))
    }

    /// Summed duration of the user's quota-consuming appointments.
    pub fn used_time(&self, user_id: Ulid) -> Ms {
        self.ledger.used(user_id, self.policy, None)
    }

    /// `Ok(None)` means unlimited.
    pub fn remaining_time(&self, user_id: Ulid) -> Result<Option<Ms>, EngineError> {
        let cap = self.allotted_cap(user_id)?;
        Ok(quota::remaining(cap, self.used_time(user_id)))
    }

    pub fn would_exceed_cap(&self, user_id: Ulid, additional: Ms) -> Result<bool, EngineError> {
        let cap = self.allotted_cap(user_id)?;
        Ok(quota::would_exceed(cap, self.used_time(user_id), additional))
    }

    pub fn allotted_time_info(&self, user_id: Ulid) -> Result<AllottedTimeInfo, EngineError> {
        let cap = self.allotted_cap(user_id)?;
        let used_ms = self.used_time(user_id);
        Ok(AllottedTimeInfo {
            user_id,
            cap,
            used_ms,
            remaining_ms: quota::remaining(cap, used_ms),
        })
    }

    pub fn get_user(&self, id: &Ulid) -> Option<UserRecord> {
        self.users.get(id).map(|u| u.value().clone())
    }

    pub fn list_users(&self) -> Vec<UserRecord> {
        let mut users: Vec<_> = self.users.iter().map(|u| u.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        users
    }

    pub async fn list_telescopes(&self) -> Vec<TelescopeInfo> {
        let telescopes: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut infos = Vec::with_capacity(telescopes.len());
        for ts in telescopes {
            let guard = ts.read().await;
            infos.push(TelescopeInfo {
                id: guard.id,
                name: guard.name.clone(),
                appointment_count: guard.appointments.len(),
            });
        }
        infos.sort_by_key(|t| t.id);
        infos
    }

    pub async fn get_appointment(&self, id: Ulid) -> Option<Appointment> {
        let location = self.locate_appointment(&id)?;
        let ts = self.get_telescope(&location.telescope_id)?;
        let guard = ts.read().await;
        guard.get(id).cloned()
    }

    /// Start-ordered appointments on one telescope; empty if unknown.
    pub async fn appointments_for_telescope(&self, telescope_id: Ulid) -> Vec<Appointment> {
        let Some(ts) = self.get_telescope(&telescope_id) else {
            return Vec::new();
        };
        let guard = ts.read().await;
        guard.appointments.clone()
    }

    pub async fn appointments_for_user(&self, user_id: Ulid) -> Vec<Appointment> {
        let mut out: Vec<_> = self
            .all_appointments()
            .await
            .into_iter()
            .filter(|a| a.user_id == user_id)
            .collect();
        out.sort_by_key(|a| a.span.start);
        out
    }

    pub async fn all_appointments(&self) -> Vec<Appointment> {
        let telescopes: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for ts in telescopes {
            let guard = ts.read().await;
            out.extend(guard.appointments.iter().cloned());
        }
        out.sort_by_key(|a| (a.span.start, a.telescope_id));
        out
    }
}
