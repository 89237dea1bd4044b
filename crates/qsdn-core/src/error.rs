//! Error types for the QSDN controller
//!
//! Errors are grouped by the layer that raises them. [`RelayError`] is what a
//! failed request carries as its cause; [`QsdnError`] is the umbrella for
//! callers of the public API.

use std::fmt;

use thiserror::Error;

use crate::identity::{LinkId, RequestId, SiteId};

/// Top-level error type for the controller
#[derive(Debug, Clone, Error)]
pub enum QsdnError {
    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("Path error: {0}")]
    Path(#[from] PathError),

    #[error("Reservation error: {0}")]
    Reservation(#[from] ReservationError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Controller already started")]
    AlreadyStarted,
}

/// Errors raised by the topology graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("Unknown site: {0}")]
    UnknownSite(SiteId),

    #[error("Unknown link: {0}")]
    UnknownLink(LinkId),

    #[error("Site {0} cannot link to itself")]
    SelfLoop(SiteId),

    #[error("Site {0} is being removed")]
    SiteRemoving(SiteId),

    #[error("Cannot shrink {link} to {capacity} bits: {reserved} bits are reserved")]
    CapacityBelowReserved {
        link: LinkId,
        capacity: u64,
        reserved: u64,
    },
}

/// Errors raised by path computation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("Unknown site: {0}")]
    UnknownSite(SiteId),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Source and destination are disconnected regardless of capacity
    #[error("{destination} is unreachable from {origin}")]
    Unreachable { origin: SiteId, destination: SiteId },

    /// Connected, but no simple path has enough capacity on every link
    #[error("No path from {origin} to {destination} can carry {amount} bits")]
    NoFeasiblePath {
        origin: SiteId,
        destination: SiteId,
        amount: u64,
    },
}

/// Errors raised while claiming link capacity
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReservationError {
    #[error("Link {link} has {available} bits available, {requested} requested")]
    CapacityExceeded {
        link: LinkId,
        requested: u64,
        available: u64,
    },

    /// Another request is ahead in the queue for this link
    #[error("Reservation conflict on link {0}")]
    Conflict(LinkId),

    #[error("Link {0} is not available for reservations")]
    LinkUnavailable(LinkId),

    #[error("Site {0} is not available for reservations")]
    SiteUnavailable(SiteId),

    #[error("Invalid reservation: {0}")]
    Invalid(String),
}

impl ReservationError {
    /// A lost race for capacity that may succeed later
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. } | Self::Conflict(_))
    }
}

/// Errors raised by site agents
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("Agent for site {0} is unreachable")]
    Unreachable(SiteId),

    #[error("Agent for site {site} timed out during {operation}")]
    Timeout { site: SiteId, operation: String },

    #[error("Site {site} has {available} bits on {link}, {requested} requested")]
    CapacityExceeded {
        site: SiteId,
        link: LinkId,
        requested: u64,
        available: u64,
    },

    /// Key that was promised to a request is no longer there
    #[error("Capacity on {link} was revoked at site {site}")]
    CapacityRevoked { site: SiteId, link: LinkId },

    #[error("Site {site} rejected the call: {reason}")]
    Rejected { site: SiteId, reason: String },
}

impl AgentError {
    /// The site that raised this error
    pub fn site(&self) -> &SiteId {
        match self {
            Self::Unreachable(site) => site,
            Self::Timeout { site, .. } => site,
            Self::CapacityExceeded { site, .. } => site,
            Self::CapacityRevoked { site, .. } => site,
            Self::Rejected { site, .. } => site,
        }
    }
}

/// Why a request was cancelled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller asked for it
    Caller,
    /// A site on the path was deregistered
    SiteDeregistered(SiteId),
    /// The reservation TTL ran out before the request progressed
    ReservationExpired,
    /// The controller is shutting down
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Caller => write!(f, "cancelled by caller"),
            Self::SiteDeregistered(site) => write!(f, "site {} deregistered", site),
            Self::ReservationExpired => write!(f, "reservation expired"),
            Self::Shutdown => write!(f, "controller shutting down"),
        }
    }
}

/// Terminal cause of a failed request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Reservation(#[from] ReservationError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    /// A committed hop could not be undone; the link is quarantined
    #[error("Rollback failed on {link} at site {site} (after: {cause})")]
    RollbackFailure {
        link: LinkId,
        site: SiteId,
        cause: Box<RelayError>,
    },

    #[error("Request {0}")]
    Cancelled(CancelReason),

    #[error("Request deadline exceeded")]
    DeadlineExceeded,

    #[error("Unknown request: {0}")]
    UnknownRequest(RequestId),
}

impl RelayError {
    /// Errors worth another attempt with a fresh path
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Agent(AgentError::Rejected { .. }) => false,
            Self::Agent(_) => true,
            Self::Reservation(ReservationError::Invalid(_)) => false,
            Self::Reservation(_) => true,
            _ => false,
        }
    }

    /// Errors caused by the shape of the topology or the request itself
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Topology(_)
                | Self::Path(PathError::UnknownSite(_))
                | Self::Path(PathError::Unreachable { .. })
                | Self::Path(PathError::InvalidRequest(_))
        )
    }
}

/// Result type alias for controller operations
pub type QsdnResult<T> = Result<T, QsdnError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> LinkId {
        LinkId::between("A", "B").unwrap()
    }

    #[test]
    fn test_path_error_display() {
        let err = PathError::Unreachable {
            origin: "A".into(),
            destination: "Z".into(),
        };
        assert!(format!("{}", err).contains("unreachable"));

        let err = PathError::NoFeasiblePath {
            origin: "A".into(),
            destination: "C".into(),
            amount: 4,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("4 bits"));
        assert!(msg.contains("A"));
    }

    #[test]
    fn test_reservation_error_display() {
        let err = ReservationError::CapacityExceeded {
            link: link(),
            requested: 6,
            available: 4,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("A<->B"));
        assert!(msg.contains("6"));
        assert!(msg.contains("4"));
        assert!(err.is_contention());
        assert!(!ReservationError::LinkUnavailable(link()).is_contention());
    }

    #[test]
    fn test_transient_classification() {
        let unreachable: RelayError = AgentError::Unreachable("B".into()).into();
        assert!(unreachable.is_transient());
        assert!(!unreachable.is_structural());

        let timeout: RelayError = AgentError::Timeout {
            site: "B".into(),
            operation: "commit_segment".into(),
        }
        .into();
        assert!(timeout.is_transient());

        let conflict: RelayError = ReservationError::Conflict(link()).into();
        assert!(conflict.is_transient());

        let stale: RelayError = ReservationError::SiteUnavailable("B".into()).into();
        assert!(stale.is_transient());
        let invalid: RelayError = ReservationError::Invalid("empty".into()).into();
        assert!(!invalid.is_transient());

        let unknown: RelayError = PathError::UnknownSite("Q".into()).into();
        assert!(unknown.is_structural());
        assert!(!unknown.is_transient());

        let disconnected: RelayError = PathError::Unreachable {
            origin: "A".into(),
            destination: "C".into(),
        }
        .into();
        assert!(disconnected.is_structural());
    }

    #[test]
    fn test_rollback_failure_is_fatal() {
        let err = RelayError::RollbackFailure {
            link: link(),
            site: "A".into(),
            cause: Box::new(AgentError::Unreachable("B".into()).into()),
        };
        assert!(!err.is_transient());
        assert!(format!("{}", err).contains("Rollback failed"));
    }

    #[test]
    fn test_error_conversions() {
        let err: QsdnError = TopologyError::UnknownSite("X".into()).into();
        assert!(matches!(err, QsdnError::Topology(_)));

        let err: QsdnError = RelayError::DeadlineExceeded.into();
        assert!(matches!(err, QsdnError::Relay(_)));
        assert!(format!("{}", err).contains("Relay error"));
    }

    #[test]
    fn test_cancel_reason_display() {
        let err = RelayError::Cancelled(CancelReason::SiteDeregistered("B".into()));
        assert_eq!(format!("{}", err), "Request site B deregistered");
    }
}
