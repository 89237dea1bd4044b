//! Key requests and their lifecycle

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::identity::{RequestId, SiteId};

/// Priority levels for key requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority - may wait behind everything else
    Low,
    /// Normal priority (default)
    #[default]
    Normal,
    /// High priority - served before normal requests on a contended link
    High,
    /// Critical - jumps every queue
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A request for `amount` bits of shared key between two sites
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRequest {
    pub id: RequestId,
    pub source: SiteId,
    pub destination: SiteId,
    pub amount: u64,
    pub priority: Priority,
    pub deadline: Option<DateTime<Utc>>,
    pub submitted_at: DateTime<Utc>,
}

impl KeyRequest {
    pub fn new(source: SiteId, destination: SiteId, amount: u64, priority: Priority) -> Self {
        Self {
            id: RequestId::new(),
            source,
            destination,
            amount,
            priority,
            deadline: None,
            submitted_at: Utc::now(),
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Check whether the deadline, if any, has passed
    pub fn is_past_deadline(&self) -> bool {
        self.deadline.is_some_and(|deadline| Utc::now() > deadline)
    }
}

/// Lifecycle of a key request
///
/// `Submitted -> Pathing -> Reserving -> Relaying(0..n) -> Completed`, with a
/// transition to `Failed` from every non-terminal state. A retry moves a
/// request from `Reserving` or `Relaying` back to `Pathing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestState {
    Submitted,
    Pathing,
    Reserving,
    Relaying { hop: usize, hops: usize },
    Completed,
    Failed,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Check whether a transition from `self` to `next` is allowed
    pub fn can_transition_to(&self, next: &RequestState) -> bool {
        use RequestState::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (_, Failed) => true,
            (Submitted, Pathing) => true,
            (Pathing, Reserving) => true,
            (Reserving, Relaying { hop: 0, .. }) => true,
            (Reserving | Relaying { .. }, Pathing) => true,
            (Relaying { hop: a, .. }, Relaying { hop: b, .. }) => *b == a + 1,
            (Relaying { .. }, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitted => write!(f, "submitted"),
            Self::Pathing => write!(f, "pathing"),
            Self::Reserving => write!(f, "reserving"),
            Self::Relaying { hop, hops } => write!(f, "relaying({}/{})", hop + 1, hops),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Externally visible status of a request
#[derive(Debug, Clone)]
pub struct RequestStatus {
    pub id: RequestId,
    pub state: RequestState,
    /// Set when `state` is [`RequestState::Failed`]
    pub cause: Option<RelayError>,
    /// Sites of the path currently (or last) in use
    pub path: Option<Vec<SiteId>>,
    /// Number of path attempts made so far
    pub attempts: u32,
}

impl RequestStatus {
    pub fn is_completed(&self) -> bool {
        self.state == RequestState::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.state == RequestState::Failed
    }
}
