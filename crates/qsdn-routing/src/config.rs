//! Controller configuration
//!
//! Durations are stored as whole milliseconds so the config reads naturally
//! from TOML (`ttl_ms = 30000`). Every section has defaults; a config file
//! only needs to name what it changes.

use std::time::Duration;

use qsdn_core::{QsdnError, QsdnResult};
use serde::{Deserialize, Serialize};

use crate::path::PathPolicy;

/// Top-level controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Path ranking weights and search bounds
    pub path: PathPolicy,
    pub reservation: ReservationConfig,
    pub relay: RelayConfig,
    /// Requests running at once; the rest wait for a slot
    pub max_concurrent_requests: usize,
    /// How long finished requests stay queryable
    pub request_retention_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            path: PathPolicy::default(),
            reservation: ReservationConfig::default(),
            relay: RelayConfig::default(),
            max_concurrent_requests: 64,
            request_retention_ms: 10 * 60 * 1000,
        }
    }
}

impl ControllerConfig {
    pub fn with_path_policy(mut self, path: PathPolicy) -> Self {
        self.path = path;
        self
    }

    pub fn with_reservation(mut self, reservation: ReservationConfig) -> Self {
        self.reservation = reservation;
        self
    }

    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    pub fn request_retention(&self) -> Duration {
        Duration::from_millis(self.request_retention_ms)
    }

    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> QsdnResult<()> {
        let invalid = |msg: &str| Err(QsdnError::Config(msg.to_string()));

        if !self.path.alpha.is_finite() || self.path.alpha < 0.0 {
            return invalid("path.alpha must be a non-negative number");
        }
        if !self.path.beta.is_finite() || self.path.beta < 0.0 {
            return invalid("path.beta must be a non-negative number");
        }
        if self.path.max_candidates == 0 {
            return invalid("path.max_candidates must be at least 1");
        }
        if self.path.max_hops == 0 {
            return invalid("path.max_hops must be at least 1");
        }
        if self.reservation.ttl_ms == 0 {
            return invalid("reservation.ttl_ms must be positive");
        }
        if self.reservation.sweep_interval_ms == 0 || self.reservation.refill_interval_ms == 0 {
            return invalid("reservation sweep and refill intervals must be positive");
        }
        if self.relay.max_attempts == 0 {
            return invalid("relay.max_attempts must be at least 1");
        }
        if self.relay.agent_timeout_ms == 0 {
            return invalid("relay.agent_timeout_ms must be positive");
        }
        if self.max_concurrent_requests == 0 {
            return invalid("max_concurrent_requests must be at least 1");
        }
        Ok(())
    }
}

/// Reservation lifetimes and background task cadence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservationConfig {
    /// Time a reservation survives without progress
    pub ttl_ms: u64,
    /// How long a request waits in a link queue for contended capacity
    pub queue_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub refill_interval_ms: u64,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            queue_timeout_ms: 5_000,
            sweep_interval_ms: 1_000,
            refill_interval_ms: 1_000,
        }
    }
}

impl ReservationConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }
}

/// Retry and timeout policy for relays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Path attempts per request, including the first
    pub max_attempts: u32,
    /// Deadline for every single agent call
    pub agent_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            agent_timeout_ms: 2_000,
            backoff_base_ms: 50,
            backoff_max_ms: 2_000,
        }
    }
}

impl RelayConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base_ms = base.as_millis() as u64;
        self.backoff_max_ms = max.as_millis() as u64;
        self
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    /// Delay before retry number `retry` (1 for the first retry)
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(20);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}
