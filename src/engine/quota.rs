//! Allotted-time accounting.
//!
//! A user's consumption is the summed duration of their appointments whose
//! status counts against the cap. The cap comes from an explicit per-user
//! record or, failing that, from the most generous default among the user's
//! roles.

use std::collections::HashMap;

use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

const HOUR: Ms = 3_600_000;

/// Which statuses consume allotted time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaPolicy {
    /// Count pending REQUESTED appointments as well as committed ones.
    pub count_requested: bool,
}

impl QuotaPolicy {
    pub fn consumes(&self, status: AppointmentStatus) -> bool {
        match status {
            AppointmentStatus::Scheduled
            | AppointmentStatus::InProgress
            | AppointmentStatus::Completed => true,
            AppointmentStatus::Requested => self.count_requested,
            AppointmentStatus::Canceled => false,
        }
    }
}

pub fn role_default(role: Role) -> AllottedTime {
    match role {
        Role::Guest | Role::User => AllottedTime::Limited(5 * HOUR),
        Role::Student | Role::Alumnus => AllottedTime::Limited(20 * HOUR),
        Role::Member | Role::Researcher => AllottedTime::Limited(50 * HOUR),
        Role::Admin => AllottedTime::Unlimited,
    }
}

/// Most generous default among `roles`; `None` for a user with no roles.
pub fn default_for_roles(roles: &RoleSet) -> Option<AllottedTime> {
    roles.iter().map(|r| role_default(*r)).reduce(|best, next| match (best, next) {
        (AllottedTime::Unlimited, _) | (_, AllottedTime::Unlimited) => AllottedTime::Unlimited,
        (AllottedTime::Limited(a), AllottedTime::Limited(b)) => AllottedTime::Limited(a.max(b)),
    })
}

/// `None` when unlimited; never negative.
pub fn remaining(cap: AllottedTime, used: Ms) -> Option<Ms> {
    cap.as_option().map(|max| (max - used).max(0))
}

pub fn would_exceed(cap: AllottedTime, used: Ms, additional: Ms) -> bool {
    match cap {
        AllottedTime::Unlimited => false,
        AllottedTime::Limited(max) => used.saturating_add(additional) > max,
    }
}

pub(crate) fn check_quota(
    user_id: Ulid,
    cap: AllottedTime,
    used: Ms,
    additional: Ms,
) -> Result<(), EngineError> {
    match cap {
        AllottedTime::Limited(cap_ms) if would_exceed(cap, used, additional) => {
            Err(EngineError::QuotaExceeded {
                user_id,
                cap_ms,
                used_ms: used,
                requested_ms: additional,
            })
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub span: Span,
    pub status: AppointmentStatus,
}

/// Per-user index of appointment windows, kept in step with telescope state
/// so quota checks never need to lock other telescopes.
#[derive(Default)]
pub struct UsageLedger {
    by_user: DashMap<Ulid, HashMap<Ulid, Usage>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, user_id: Ulid, appointment_id: Ulid, usage: Usage) {
        self.by_user
            .entry(user_id)
            .or_default()
            .insert(appointment_id, usage);
    }

    pub fn update(&self, user_id: Ulid, appointment_id: Ulid, f: impl FnOnce(&mut Usage)) {
        if let Some(mut entries) = self.by_user.get_mut(&user_id)
            && let Some(usage) = entries.get_mut(&appointment_id)
        {
            f(usage);
        }
    }

    pub fn remove(&self, user_id: Ulid, appointment_id: Ulid) {
        if let Some(mut entries) = self.by_user.get_mut(&user_id) {
            entries.remove(&appointment_id);
        }
    }

    /// Summed duration of the user's consuming appointments, skipping `exclude`.
    pub fn used(&self, user_id: Ulid, policy: QuotaPolicy, exclude: Option<Ulid>) -> Ms {
        self.by_user.get(&user_id).map_or(0, |entries| {
            entries
                .iter()
                .filter(|(id, _)| Some(**id) != exclude)
                .filter(|(_, u)| policy.consumes(u.status))
                .map(|(_, u)| u.span.duration_ms())
                .sum()
        })
    }
}
