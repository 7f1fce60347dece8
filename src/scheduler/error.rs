use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug)]
pub enum SchedulingError {
    /// Malformed input; the caller must fix the request before retrying.
    InvalidRequest(&'static str),
    /// A requested slot falls inside the named institution-wide blackout.
    BlackoutConflict(Ulid),
    /// A requested slot is already blocked by the named schedule entry.
    SlotUnavailable(Ulid),
    /// The requester is at their booking limit and supplied no justification.
    QuotaExceeded { used: u32, limit: u32 },
    /// Unknown booking id, or the booking is already terminal.
    NotFound(Ulid),
    /// Operation not valid for the booking's current status.
    InvalidState(BookingStatus),
    /// Write-path congestion. Retryable as-is.
    Contention,
    /// Persistence unreachable. Retryable with backoff.
    DependencyUnavailable(String),
}

impl SchedulingError {
    /// Stable kind tag callers branch on.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulingError::InvalidRequest(_) => "invalid_request",
            SchedulingError::BlackoutConflict(_) => "blackout_conflict",
            SchedulingError::SlotUnavailable(_) => "slot_unavailable",
            SchedulingError::QuotaExceeded { .. } => "quota_exceeded",
            SchedulingError::NotFound(_) => "not_found",
            SchedulingError::InvalidState(_) => "invalid_state",
            SchedulingError::Contention => "contention",
            SchedulingError::DependencyUnavailable(_) => "dependency_unavailable",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            SchedulingError::Contention | SchedulingError::DependencyUnavailable(_)
        )
    }
}

impl std::fmt::Display for SchedulingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulingError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            SchedulingError::BlackoutConflict(id) => write!(
                f,
                "requested slots fall inside blackout period {id}; pick different slots"
            ),
            SchedulingError::SlotUnavailable(id) => write!(
                f,
                "requested slots conflict with existing entry {id}; pick different slots"
            ),
            SchedulingError::QuotaExceeded { used, limit } => write!(
                f,
                "booking quota reached ({used}/{limit}); a justification and staff approval are required"
            ),
            SchedulingError::NotFound(id) => write!(f, "no active booking {id}"),
            SchedulingError::InvalidState(status) => {
                write!(f, "operation not valid for a booking in status {}", status.as_str())
            }
            SchedulingError::Contention => {
                write!(f, "write path congested; try again")
            }
            SchedulingError::DependencyUnavailable(e) => {
                write!(f, "persistence unavailable ({e}); try again later")
            }
        }
    }
}

impl std::error::Error for SchedulingError {}
