//! Quantum links and their key-pool accounting
//!
//! A link's pool is tracked as three numbers: `capacity`, `reserved`, and
//! `consumed` (key handed out and not yet regenerated). The invariant
//! `reserved + consumed <= capacity` holds after every operation, so
//! `available = capacity - reserved - consumed` never underflows.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ReservationError;
use crate::identity::{DeviceId, LinkId, SiteId};

/// Whether a link may carry relays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LinkHealth {
    #[default]
    Active,
    /// Waiting for the devices it needs to register
    Inactive,
    /// Taken out of service after a failed rollback; needs an operator
    Quarantined,
}

impl fmt::Display for LinkHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
            Self::Quarantined => write!(f, "quarantined"),
        }
    }
}

/// Tunable attributes of a link
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkParams {
    /// Maximum key-pool size in bits
    pub capacity: u64,
    /// Key generation rate in bits per second
    pub rate_bits_per_sec: f64,
    /// Measured one-way latency
    pub latency: Duration,
}

impl LinkParams {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            rate_bits_per_sec: 0.0,
            latency: Duration::ZERO,
        }
    }

    pub fn with_rate(mut self, rate_bits_per_sec: f64) -> Self {
        self.rate_bits_per_sec = rate_bits_per_sec.max(0.0);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

/// Live state of one link
#[derive(Debug, Clone, PartialEq)]
pub struct LinkState {
    pub id: LinkId,
    pub capacity: u64,
    pub reserved: u64,
    pub consumed: u64,
    pub rate_bits_per_sec: f64,
    pub latency: Duration,
    pub health: LinkHealth,
    /// Fractional bits generated but not yet credited back to the pool
    refill_carry: f64,
}

impl LinkState {
    pub fn new(id: LinkId, params: LinkParams) -> Self {
        Self {
            id,
            capacity: params.capacity,
            reserved: 0,
            consumed: 0,
            rate_bits_per_sec: params.rate_bits_per_sec.max(0.0),
            latency: params.latency,
            health: LinkHealth::Active,
            refill_carry: 0.0,
        }
    }

    /// Key currently free to reserve
    pub fn available(&self) -> u64 {
        self.capacity - self.reserved - self.consumed
    }

    /// Check the pool accounting invariant
    pub fn is_consistent(&self) -> bool {
        self.reserved
            .checked_add(self.consumed)
            .is_some_and(|used| used <= self.capacity)
    }

    pub fn is_active(&self) -> bool {
        self.health == LinkHealth::Active
    }

    /// Claim `amount` bits from the pool
    pub fn reserve(&mut self, amount: u64) -> Result<(), ReservationError> {
        let available = self.available();
        if amount > available {
            return Err(ReservationError::CapacityExceeded {
                link: self.id.clone(),
                requested: amount,
                available,
            });
        }
        self.reserved += amount;
        debug_assert!(self.is_consistent());
        Ok(())
    }

    /// Return previously reserved bits to the pool
    pub fn release(&mut self, amount: u64) {
        self.reserved = self.reserved.saturating_sub(amount);
    }

    /// Convert previously reserved bits into consumed key
    pub fn consume(&mut self, amount: u64) {
        let amount = amount.min(self.reserved);
        self.reserved -= amount;
        self.consumed += amount;
        debug_assert!(self.is_consistent());
    }

    /// Credit regenerated key back to the pool
    ///
    /// Returns the number of whole bits credited. Never tops up beyond
    /// capacity because only consumed key is regenerated.
    pub fn refill(&mut self, elapsed: Duration) -> u64 {
        if self.consumed == 0 {
            self.refill_carry = 0.0;
            return 0;
        }
        let generated = self.rate_bits_per_sec * elapsed.as_secs_f64() + self.refill_carry;
        let whole = generated.floor();
        self.refill_carry = generated - whole;

        let credited = (whole as u64).min(self.consumed);
        self.consumed -= credited;
        if self.consumed == 0 {
            self.refill_carry = 0.0;
        }
        credited
    }

    /// Apply new parameters
    ///
    /// Capacity may not drop below what is currently reserved; consumed key
    /// is trimmed so the invariant still holds.
    pub fn apply_params(&mut self, params: LinkParams) -> Result<(), u64> {
        if params.capacity < self.reserved {
            return Err(self.reserved);
        }
        self.capacity = params.capacity;
        self.consumed = self.consumed.min(self.capacity - self.reserved);
        self.rate_bits_per_sec = params.rate_bits_per_sec.max(0.0);
        self.latency = params.latency;
        Ok(())
    }

    /// The pool state as an agent would report it
    pub fn pool_state(&self) -> PoolState {
        PoolState {
            link: self.id.clone(),
            capacity: self.capacity,
            available: self.available(),
            rate_bits_per_sec: self.rate_bits_per_sec,
            latency_ms: self.latency.as_millis() as u64,
        }
    }
}

/// Key-pool occupancy of one link, as seen by a site agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolState {
    pub link: LinkId,
    pub capacity: u64,
    pub available: u64,
    pub rate_bits_per_sec: f64,
    pub latency_ms: u64,
}

impl PoolState {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

/// A statically configured link
///
/// If device ids are given, the link only becomes active once each endpoint
/// has registered with that device attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub a: SiteId,
    pub b: SiteId,
    pub capacity: u64,
    #[serde(default)]
    pub rate_bits_per_sec: f64,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub a_device: Option<DeviceId>,
    #[serde(default)]
    pub b_device: Option<DeviceId>,
}

impl LinkSpec {
    pub fn new(a: impl Into<SiteId>, b: impl Into<SiteId>, capacity: u64) -> Self {
        Self {
            a: a.into(),
            b: b.into(),
            capacity,
            rate_bits_per_sec: 0.0,
            latency_ms: 0,
            a_device: None,
            b_device: None,
        }
    }

    pub fn with_rate(mut self, rate_bits_per_sec: f64) -> Self {
        self.rate_bits_per_sec = rate_bits_per_sec;
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Require a device on each endpoint before the link activates
    pub fn with_devices(mut self, a_device: impl Into<DeviceId>, b_device: impl Into<DeviceId>) -> Self {
        self.a_device = Some(a_device.into());
        self.b_device = Some(b_device.into());
        self
    }

    pub fn link_id(&self) -> Option<LinkId> {
        LinkId::new(self.a.clone(), self.b.clone())
    }

    pub fn params(&self) -> LinkParams {
        LinkParams::new(self.capacity)
            .with_rate(self.rate_bits_per_sec)
            .with_latency(Duration::from_millis(self.latency_ms))
    }

    /// The device this link needs on `site`, if any
    pub fn required_device(&self, site: &SiteId) -> Option<&DeviceId> {
        if site == &self.a {
            self.a_device.as_ref()
        } else if site == &self.b {
            self.b_device.as_ref()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(capacity: u64) -> LinkState {
        LinkState::new(
            LinkId::between("A", "B").unwrap(),
            LinkParams::new(capacity).with_rate(100.0),
        )
    }

    #[test]
    fn test_reserve_and_release() {
        let mut state = link(10);
        state.reserve(6).unwrap();
        assert_eq!(state.available(), 4);

        let err = state.reserve(6).unwrap_err();
        assert!(matches!(
            err,
            ReservationError::CapacityExceeded { requested: 6, available: 4, .. }
        ));

        state.release(6);
        assert_eq!(state.available(), 10);
        assert!(state.is_consistent());
    }

    #[test]
    fn test_consume_moves_reserved_to_consumed() {
        let mut state = link(10);
        state.reserve(4).unwrap();
        state.consume(4);
        assert_eq!(state.reserved, 0);
        assert_eq!(state.consumed, 4);
        assert_eq!(state.available(), 6);
    }

    #[test]
    fn test_refill_is_rate_bounded_and_capped() {
        let mut state = link(1000);
        state.reserve(500).unwrap();
        state.consume(500);

        // 100 bits/s for 1.5s
        assert_eq!(state.refill(Duration::from_millis(1500)), 150);
        assert_eq!(state.consumed, 350);

        // Long idle period only restores what was consumed
        assert_eq!(state.refill(Duration::from_secs(60)), 350);
        assert_eq!(state.available(), 1000);
        assert_eq!(state.refill(Duration::from_secs(60)), 0);
    }

    #[test]
    fn test_refill_carries_fractional_bits() {
        let mut state = link(100);
        state.reserve(10).unwrap();
        state.consume(10);
        state.rate_bits_per_sec = 1.0;

        assert_eq!(state.refill(Duration::from_millis(600)), 0);
        assert_eq!(state.refill(Duration::from_millis(600)), 1);
    }

    #[test]
    fn test_apply_params_keeps_invariant() {
        let mut state = link(10);
        state.reserve(3).unwrap();
        state.consume(3);
        state.reserve(4).unwrap();

        assert_eq!(state.apply_params(LinkParams::new(2)), Err(4));

        state.apply_params(LinkParams::new(5)).unwrap();
        assert_eq!(state.capacity, 5);
        assert_eq!(state.consumed, 1);
        assert!(state.is_consistent());
    }

    #[test]
    fn test_link_spec_devices() {
        let spec = LinkSpec::new("A", "B", 100).with_devices("dev-a", "dev-b");
        assert_eq!(
            spec.required_device(&SiteId::from("B")),
            Some(&DeviceId::from("dev-b"))
        );
        assert!(spec.required_device(&SiteId::from("C")).is_none());
        assert_eq!(spec.link_id(), LinkId::between("B", "A"));
    }
}
