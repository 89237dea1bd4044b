//! Sites and the health reports their agents push

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::{DeviceId, SiteId};
use crate::link::PoolState;

/// Operational status of a site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SiteStatus {
    #[default]
    Online,
    /// Reachable but reporting problems; still usable for relays
    Degraded,
    /// Not usable for path computation
    Offline,
}

impl SiteStatus {
    /// Whether paths may be routed through a site in this status
    pub fn is_usable(&self) -> bool {
        !matches!(self, Self::Offline)
    }
}

impl fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Degraded => write!(f, "degraded"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// What a site is able to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteCapabilities {
    /// Can act as a trusted relay between two of its links
    pub can_relay: bool,
    /// Has a key-generation source attached
    pub has_key_source: bool,
}

impl Default for SiteCapabilities {
    fn default() -> Self {
        Self {
            can_relay: true,
            has_key_source: true,
        }
    }
}

/// A site in the QKD network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub capabilities: SiteCapabilities,
    pub status: SiteStatus,
    /// QKD devices attached to this site, as reported on registration
    pub devices: Vec<DeviceId>,
}

impl Site {
    /// Create an online site with default capabilities and no devices
    pub fn new(id: impl Into<SiteId>) -> Self {
        Self {
            id: id.into(),
            capabilities: SiteCapabilities::default(),
            status: SiteStatus::Online,
            devices: Vec::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: SiteCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_status(mut self, status: SiteStatus) -> Self {
        self.status = status;
        self
    }

    /// Mark this site as an endpoint only (it will not relay)
    pub fn endpoint_only(mut self) -> Self {
        self.capabilities.can_relay = false;
        self
    }

    pub fn with_device(mut self, device: impl Into<DeviceId>) -> Self {
        self.devices.push(device.into());
        self
    }

    /// Check whether a device is attached to this site
    pub fn has_device(&self, device: &DeviceId) -> bool {
        self.devices.contains(device)
    }
}

/// Periodic health report pushed by a site agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub site: SiteId,
    pub status: SiteStatus,
    /// Pool state of the links this site reports on
    pub links: Vec<PoolState>,
}

impl HealthReport {
    pub fn new(site: SiteId, status: SiteStatus) -> Self {
        Self {
            site,
            status,
            links: Vec::new(),
        }
    }

    pub fn with_link(mut self, pool: PoolState) -> Self {
        self.links.push(pool);
        self
    }
}
