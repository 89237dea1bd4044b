//! Core traits for the QSDN controller
//!
//! These traits are the seams between the relay engine and everything it
//! treats as external:
//!
//! - [`SiteAgent`]: the controller's proxy for a remote site agent
//! - [`ReportingSink`]: passive receiver of controller events
//! - [`KeyRequestService`]: the inbound key-request API

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{AgentError, QsdnError};
use crate::event::ControllerEvent;
use crate::identity::{LinkId, RequestId, SiteId};
use crate::key::{HopAck, HopCommand, ReservationToken};
use crate::link::PoolState;
use crate::request::{Priority, RequestStatus};

/// Proxy for a remote site agent
///
/// Every method may block on I/O. Implementations do not retry and do not
/// enforce timeouts themselves: the caller wraps each call in its own
/// timeout and treats expiry as a failure.
#[async_trait]
pub trait SiteAgent: Send + Sync {
    /// The site this agent speaks for
    fn site_id(&self) -> &SiteId;

    /// Current occupancy of the key pool on one of this site's links
    async fn get_pool_state(&self, link: &LinkId) -> Result<PoolState, AgentError>;

    /// Hold `amount` bits of the local pool for `ttl`
    async fn reserve_local(
        &self,
        link: &LinkId,
        amount: u64,
        ttl: Duration,
    ) -> Result<ReservationToken, AgentError>;

    /// Execute one relay hop, combining the upstream material with local key
    async fn commit_segment(
        &self,
        request_id: RequestId,
        hop: &HopCommand,
    ) -> Result<HopAck, AgentError>;

    /// Throw away the contribution of a previously committed hop
    async fn discard_segment(&self, request_id: RequestId, hop_index: usize)
    -> Result<(), AgentError>;

    /// Return a local reservation to the pool
    async fn release_local(&self, token: &ReservationToken) -> Result<(), AgentError>;
}

/// Fire-and-forget receiver of controller events
///
/// `report` is called from inside the controller's critical paths and must
/// not block.
pub trait ReportingSink: Send + Sync {
    fn report(&self, event: ControllerEvent);
}

/// Inbound key-request API of the network manager
#[async_trait]
pub trait KeyRequestService: Send + Sync {
    /// Submit a request; failures are reported through the request status
    async fn submit_key_request(
        &self,
        source: SiteId,
        destination: SiteId,
        amount: u64,
        priority: Priority,
    ) -> Result<RequestId, QsdnError>;

    /// Lifecycle state, plus the failure cause once failed
    fn get_request_status(&self, id: &RequestId) -> Result<RequestStatus, QsdnError>;

    /// Cancel a request that has not completed
    ///
    /// Returns `false` if the request had already reached a terminal state.
    async fn cancel_request(&self, id: &RequestId) -> Result<bool, QsdnError>;
}
