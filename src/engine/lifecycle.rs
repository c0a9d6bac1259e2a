use crate::model::*;

use super::EngineError;

/// Status-changing actions on an appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Approve,
    Deny,
    Start,
    Complete,
    Cancel,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Approve => "approve",
            Transition::Deny => "deny",
            Transition::Start => "start",
            Transition::Complete => "complete",
            Transition::Cancel => "cancel",
        }
    }
}

/// REQUESTED ─approve→ SCHEDULED ─start→ IN_PROGRESS ─complete→ COMPLETED
/// REQUESTED ─deny→ CANCELED; any non-terminal ─cancel→ CANCELED.
pub fn next_status(
    appointment: &Appointment,
    transition: Transition,
) -> Result<AppointmentStatus, EngineError> {
    use AppointmentStatus::*;
    let next = match (appointment.status, transition) {
        (Requested, Transition::Approve) => Scheduled,
        (Requested, Transition::Deny) => Canceled,
        (Scheduled, Transition::Start) => InProgress,
        (InProgress, Transition::Complete) => Completed,
        (from, Transition::Cancel) if !from.is_terminal() => Canceled,
        (from, t) => return Err(invalid(appointment, from, t.as_str())),
    };
    Ok(next)
}

pub fn ensure_reschedulable(appointment: &Appointment) -> Result<(), EngineError> {
    match appointment.status {
        AppointmentStatus::Requested | AppointmentStatus::Scheduled => Ok(()),
        from => Err(invalid(appointment, from, "reschedule")),
    }
}

/// Live pointing commands need a running free-control session.
pub fn ensure_free_control_running(
    appointment: &Appointment,
    action: &'static str,
) -> Result<(), EngineError> {
    if appointment.status != AppointmentStatus::InProgress {
        return Err(invalid(appointment, appointment.status, action));
    }
    if appointment.kind != AppointmentType::FreeControl {
        return Err(EngineError::Invalid("appointment is not FREE_CONTROL"));
    }
    Ok(())
}

pub fn ensure_purgeable(appointment: &Appointment) -> Result<(), EngineError> {
    match appointment.status {
        AppointmentStatus::Canceled => Ok(()),
        from => Err(invalid(appointment, from, "purge")),
    }
}

fn invalid(appointment: &Appointment, from: AppointmentStatus, action: &'static str) -> EngineError {
    EngineError::InvalidTransition {
        id: appointment.id,
        from,
        action,
    }
}
