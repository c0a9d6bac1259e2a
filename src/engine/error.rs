use ulid::Ulid;

use crate::model::{AppointmentStatus, Ms};

/// Stable classification of engine failures, surfaced to clients as a tag
/// and a SQLSTATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Overlap,
    QuotaExceeded,
    InvalidTransition,
    NotFound,
    Integrity,
    AlreadyExists,
    InUse,
    LimitExceeded,
    Storage,
}

impl ErrorKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Overlap => "OVERLAP",
            ErrorKind::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorKind::InvalidTransition => "INVALID_TRANSITION",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Integrity => "INTEGRITY",
            ErrorKind::AlreadyExists => "ALREADY_EXISTS",
            ErrorKind::InUse => "IN_USE",
            ErrorKind::LimitExceeded => "LIMIT_EXCEEDED",
            ErrorKind::Storage => "STORAGE",
        }
    }

    pub fn sqlstate(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "22023",
            ErrorKind::Overlap => "23P01",
            ErrorKind::QuotaExceeded => "53400",
            ErrorKind::InvalidTransition => "55000",
            ErrorKind::NotFound => "02000",
            ErrorKind::Integrity => "XX001",
            ErrorKind::AlreadyExists => "23505",
            ErrorKind::InUse => "55006",
            ErrorKind::LimitExceeded => "54000",
            ErrorKind::Storage => "58030",
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Candidate window intersects this live appointment.
    Overlap(Ulid),
    /// Another appointment is already running on the telescope.
    TelescopeBusy(Ulid),
    QuotaExceeded {
        user_id: Ulid,
        cap_ms: Ms,
        used_ms: Ms,
        requested_ms: Ms,
    },
    InvalidTransition {
        id: Ulid,
        from: AppointmentStatus,
        action: &'static str,
    },
    /// User exists but has neither an explicit cap nor a role default.
    MissingAllottedTime(Ulid),
    HasAppointments(Ulid),
    Invalid(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            EngineError::Overlap(_) | EngineError::TelescopeBusy(_) => ErrorKind::Overlap,
            EngineError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            EngineError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            EngineError::MissingAllottedTime(_) => ErrorKind::Integrity,
            EngineError::HasAppointments(_) => ErrorKind::InUse,
            EngineError::Invalid(_) => ErrorKind::Validation,
            EngineError::LimitExceeded(_) => ErrorKind::LimitExceeded,
            EngineError::WalError(_) => ErrorKind::Storage,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Overlap(id) => write!(f, "overlaps appointment {id}"),
            EngineError::TelescopeBusy(id) => {
                write!(f, "telescope busy: appointment {id} is in progress")
            }
            EngineError::QuotaExceeded {
                user_id,
                cap_ms,
                used_ms,
                requested_ms,
            } => write!(
                f,
                "allotted time exceeded for user {user_id}: cap {cap_ms} ms, used {used_ms} ms, requested {requested_ms} ms"
            ),
            EngineError::InvalidTransition { id, from, action } => {
                write!(f, "cannot {action} appointment {id} in status {from}")
            }
            EngineError::MissingAllottedTime(id) => {
                write!(f, "no allotted time record for user {id}")
            }
            EngineError::HasAppointments(id) => {
                write!(f, "cannot delete telescope {id}: has appointments")
            }
            EngineError::Invalid(msg) => write!(f, "invalid: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
