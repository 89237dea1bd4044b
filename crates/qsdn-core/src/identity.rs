//! Identifiers used throughout the controller
//!
//! - [`SiteId`]: a site's unique name/address
//! - [`DeviceId`]: a QKD device attached to a site
//! - [`LinkId`]: an undirected quantum link, stored as a canonical ordered pair
//! - [`RequestId`] / [`ReservationId`]: per-request and per-reservation handles

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique name/address of a site
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(String);

impl SiteId {
    /// Create a site identity from a name or address
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the underlying name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SiteId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for SiteId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Identity of a QKD device attached to a site
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Undirected quantum link between two sites
///
/// The endpoints are stored in sorted order so `LinkId::new(a, b)` and
/// `LinkId::new(b, a)` are equal. The derived ordering is the global lock
/// order used when reserving capacity on several links at once.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LinkId {
    low: SiteId,
    high: SiteId,
}

impl LinkId {
    /// Create a link identity between two distinct sites
    ///
    /// Returns `None` for a self-loop.
    pub fn new(a: SiteId, b: SiteId) -> Option<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Some(Self { low: a, high: b }),
            std::cmp::Ordering::Greater => Some(Self { low: b, high: a }),
            std::cmp::Ordering::Equal => None,
        }
    }

    /// Convenience constructor from anything convertible to a [`SiteId`]
    pub fn between(a: impl Into<SiteId>, b: impl Into<SiteId>) -> Option<Self> {
        Self::new(a.into(), b.into())
    }

    /// The endpoint that sorts first
    pub fn low(&self) -> &SiteId {
        &self.low
    }

    /// The endpoint that sorts last
    pub fn high(&self) -> &SiteId {
        &self.high
    }

    /// Both endpoints, in canonical order
    pub fn endpoints(&self) -> (&SiteId, &SiteId) {
        (&self.low, &self.high)
    }

    /// Check whether a site terminates this link
    pub fn touches(&self, site: &SiteId) -> bool {
        &self.low == site || &self.high == site
    }

    /// Given one endpoint, return the other
    pub fn other(&self, site: &SiteId) -> Option<&SiteId> {
        if &self.low == site {
            Some(&self.high)
        } else if &self.high == site {
            Some(&self.low)
        } else {
            None
        }
    }
}

impl Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.low, self.high)
    }
}

/// Identity of a key request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 8 hex chars are enough to tell requests apart in logs
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

/// Identity of a reservation held by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReservationId(Uuid);

impl ReservationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_id_is_canonical() {
        let ab = LinkId::between("A", "B").unwrap();
        let ba = LinkId::between("B", "A").unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.low().as_str(), "A");
        assert_eq!(ab.high().as_str(), "B");
        assert_eq!(ab.to_string(), "A<->B");
    }

    #[test]
    fn test_link_id_rejects_self_loop() {
        assert!(LinkId::between("A", "A").is_none());
    }

    #[test]
    fn test_link_id_other_endpoint() {
        let link = LinkId::between("alice", "bob").unwrap();
        assert_eq!(link.other(&SiteId::from("alice")), Some(&SiteId::from("bob")));
        assert_eq!(link.other(&SiteId::from("bob")), Some(&SiteId::from("alice")));
        assert!(link.other(&SiteId::from("carol")).is_none());
        assert!(link.touches(&SiteId::from("bob")));
    }

    #[test]
    fn test_link_ordering_follows_endpoints() {
        let ab = LinkId::between("A", "B").unwrap();
        let ac = LinkId::between("A", "C").unwrap();
        let bc = LinkId::between("B", "C").unwrap();
        let mut links = vec![bc.clone(), ac.clone(), ab.clone()];
        links.sort();
        assert_eq!(links, vec![ab, ac, bc]);
    }

    #[test]
    fn test_request_id_display_is_short() {
        let id = RequestId::new();
        assert_eq!(id.to_string().len(), 8);
    }
}
