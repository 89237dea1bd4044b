//! Controller events
//!
//! Everything the controller reports to its [`ReportingSink`](crate::ReportingSink):
//! request lifecycle transitions, link capacity and health changes, and site
//! status changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{LinkId, RequestId, SiteId};
use crate::link::{LinkHealth, LinkState};
use crate::request::RequestState;
use crate::site::SiteStatus;

/// Events emitted by the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControllerEvent {
    /// A request moved between lifecycle states
    RequestTransition {
        request: RequestId,
        from: RequestState,
        to: RequestState,
        /// Failure cause, rendered, when `to` is `Failed`
        cause: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A link's pool accounting changed
    LinkCapacityChanged {
        link: LinkId,
        capacity: u64,
        reserved: u64,
        consumed: u64,
        available: u64,
        timestamp: DateTime<Utc>,
    },

    /// A link was activated, deactivated, or quarantined
    LinkHealthChanged {
        link: LinkId,
        health: LinkHealth,
        timestamp: DateTime<Utc>,
    },

    /// A site changed operational status
    SiteStatusChanged {
        site: SiteId,
        status: SiteStatus,
        timestamp: DateTime<Utc>,
    },

    /// A site registered with the controller
    SiteRegistered {
        site: SiteId,
        timestamp: DateTime<Utc>,
    },

    /// A site was removed from the topology
    SiteRemoved {
        site: SiteId,
        timestamp: DateTime<Utc>,
    },
}

impl ControllerEvent {
    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RequestTransition { timestamp, .. } => *timestamp,
            Self::LinkCapacityChanged { timestamp, .. } => *timestamp,
            Self::LinkHealthChanged { timestamp, .. } => *timestamp,
            Self::SiteStatusChanged { timestamp, .. } => *timestamp,
            Self::SiteRegistered { timestamp, .. } => *timestamp,
            Self::SiteRemoved { timestamp, .. } => *timestamp,
        }
    }

    /// Create a request transition event
    pub fn transition(
        request: RequestId,
        from: RequestState,
        to: RequestState,
        cause: Option<String>,
    ) -> Self {
        Self::RequestTransition {
            request,
            from,
            to,
            cause,
            timestamp: Utc::now(),
        }
    }

    /// Create a capacity event from the current state of a link
    pub fn capacity_changed(link: &LinkState) -> Self {
        Self::LinkCapacityChanged {
            link: link.id.clone(),
            capacity: link.capacity,
            reserved: link.reserved,
            consumed: link.consumed,
            available: link.available(),
            timestamp: Utc::now(),
        }
    }

    pub fn link_health(link: LinkId, health: LinkHealth) -> Self {
        Self::LinkHealthChanged {
            link,
            health,
            timestamp: Utc::now(),
        }
    }

    pub fn site_status(site: SiteId, status: SiteStatus) -> Self {
        Self::SiteStatusChanged {
            site,
            status,
            timestamp: Utc::now(),
        }
    }

    pub fn site_registered(site: SiteId) -> Self {
        Self::SiteRegistered {
            site,
            timestamp: Utc::now(),
        }
    }

    pub fn site_removed(site: SiteId) -> Self {
        Self::SiteRemoved {
            site,
            timestamp: Utc::now(),
        }
    }

    /// The request this event concerns, if any
    pub fn request(&self) -> Option<RequestId> {
        match self {
            Self::RequestTransition { request, .. } => Some(*request),
            _ => None,
        }
    }
}
