use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// `a.start < b.end && a.end > b.start`, with empty spans never overlapping.
pub fn overlaps(a: &Span, b: &Span) -> bool {
    a.overlaps(b)
}

/// True if `candidate` overlaps any span in `existing`.
/// Degenerate existing entries (`start >= end`) are ignored.
pub fn has_conflict(candidate: &Span, existing: &[Span]) -> bool {
    existing.iter().any(|e| overlaps(candidate, e))
}

/// Reject empty, reversed, out-of-range or oversized booking spans before they
/// reach the guard.
pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.is_empty() {
        return Err(EngineError::InvalidInterval);
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_BOOKING_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    Ok(())
}

/// Commit-time guard. Caller holds the owner's write lock, so the confirmed
/// list cannot change between this check and the WAL append.
pub(crate) fn check_no_conflict(os: &OwnerState, span: &Span) -> Result<(), EngineError> {
    match first_conflict(os, span, None) {
        Some(existing) => Err(EngineError::Conflict(existing)),
        None => Ok(()),
    }
}

/// Id of the earliest confirmed booking overlapping `span`, skipping `exclude`.
pub(crate) fn first_conflict(os: &OwnerState, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    if span.is_empty() {
        return None;
    }
    os.overlapping(span)
        .filter(|b| Some(b.id) != exclude)
        .find(|b| overlaps(span, &b.span))
        .map(|b| b.id)
}
