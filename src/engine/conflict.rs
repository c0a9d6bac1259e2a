use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

/// Build a window from raw client input, rejecting `end <= start`.
pub fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::Invalid("end must be after start"));
    }
    let span = Span { start, end };
    validate_span(&span)?;
    Ok(span)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.end <= span.start {
        return Err(EngineError::Invalid("end must be after start"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_WINDOW_DURATION_MS {
        return Err(EngineError::LimitExceeded("window too long"));
    }
    Ok(())
}

/// First live appointment on the telescope whose window intersects `span`,
/// ignoring `exclude` (the appointment being rescheduled).
pub fn find_overlap(ts: &TelescopeState, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    ts.overlapping(span)
        .filter(|a| a.status.occupies_telescope())
        .find(|a| Some(a.id) != exclude)
        .map(|a| a.id)
}

pub fn has_overlap(ts: &TelescopeState, span: &Span, exclude: Option<Ulid>) -> bool {
    find_overlap(ts, span, exclude).is_some()
}

pub(crate) fn check_no_overlap(
    ts: &TelescopeState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_overlap(ts, span, exclude) {
        Some(conflicting) => Err(EngineError::Overlap(conflicting)),
        None => Ok(()),
    }
}

/// The telescope runs one observation at a time, whatever the windows say.
pub(crate) fn check_telescope_idle(ts: &TelescopeState, starting: Ulid) -> Result<(), EngineError> {
    match ts.in_progress().find(|a| a.id != starting) {
        Some(running) => Err(EngineError::TelescopeBusy(running.id)),
        None => Ok(()),
    }
}
