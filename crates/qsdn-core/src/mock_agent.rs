//! In-memory site agent for testing and simulation
//!
//! [`MockSiteAgent`] keeps a key pool per link, hands out local reservation
//! tokens, and answers relay hops by XOR-ing the upstream material with fresh
//! random key drawn from the pool. Every call is recorded so tests can assert
//! on the exact sequence of commits and discards.
//!
//! ## Fault injection
//!
//! ```rust,ignore
//! let agent = MockSiteAgent::new("B").with_pool(link, 1024);
//!
//! agent.set_offline(true);          // every call fails with Unreachable
//! agent.set_stalled(true);          // every call hangs until the caller times out
//! agent.fail_discards(true);        // discard_segment fails, rollback cannot complete
//! agent.go_offline_at_commit(1);    // commit of hop 1 takes the agent offline
//! ```
//!
//! Links without a configured pool are treated as unlimited.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::RngCore;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use crate::error::AgentError;
use crate::identity::{LinkId, RequestId, SiteId};
use crate::key::{HopAck, HopCommand, KeyMaterial, ReservationToken};
use crate::link::PoolState;
use crate::traits::SiteAgent;

/// A call received by a [`MockSiteAgent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCall {
    GetPoolState(LinkId),
    ReserveLocal { link: LinkId, amount: u64 },
    Commit { request: RequestId, index: usize },
    Discard { request: RequestId, index: usize },
    ReleaseLocal { token: Uuid },
}

#[derive(Debug, Clone)]
struct MockPool {
    capacity: u64,
    available: u64,
    rate_bits_per_sec: f64,
    latency_ms: u64,
}

#[derive(Debug, Default)]
struct MockFaults {
    offline: bool,
    stalled: bool,
    fail_discard: bool,
    offline_at_commit: Option<usize>,
    revoke_at_commit: Option<usize>,
    commit_delay: Option<Duration>,
}

/// In-memory [`SiteAgent`] with fault injection
pub struct MockSiteAgent {
    site: SiteId,
    pools: DashMap<LinkId, MockPool>,
    tokens: DashMap<Uuid, ReservationToken>,
    /// Local link key contributed per (request, hop)
    contributions: DashMap<(RequestId, usize), KeyMaterial>,
    calls: Mutex<Vec<AgentCall>>,
    faults: Mutex<MockFaults>,
}

impl MockSiteAgent {
    pub fn new(site: impl Into<SiteId>) -> Self {
        Self {
            site: site.into(),
            pools: DashMap::new(),
            tokens: DashMap::new(),
            contributions: DashMap::new(),
            calls: Mutex::new(Vec::new()),
            faults: Mutex::new(MockFaults::default()),
        }
    }

    /// Give the agent a finite pool of `capacity` bits on `link`
    pub fn with_pool(self, link: LinkId, capacity: u64) -> Self {
        self.pools.insert(
            link,
            MockPool {
                capacity,
                available: capacity,
                rate_bits_per_sec: 0.0,
                latency_ms: 0,
            },
        );
        self
    }

    /// Set the rate and latency this agent reports for `link`
    pub fn with_metrics(self, link: LinkId, rate_bits_per_sec: f64, latency_ms: u64) -> Self {
        self.pools
            .entry(link)
            .and_modify(|pool| {
                pool.rate_bits_per_sec = rate_bits_per_sec;
                pool.latency_ms = latency_ms;
            })
            .or_insert(MockPool {
                capacity: u64::MAX,
                available: u64::MAX,
                rate_bits_per_sec,
                latency_ms,
            });
        self
    }

    pub fn set_offline(&self, offline: bool) {
        self.faults.lock().offline = offline;
    }

    pub fn is_offline(&self) -> bool {
        self.faults.lock().offline
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.faults.lock().stalled = stalled;
    }

    pub fn fail_discards(&self, fail: bool) {
        self.faults.lock().fail_discard = fail;
    }

    /// Go offline when asked to commit hop `index`
    pub fn go_offline_at_commit(&self, index: usize) {
        self.faults.lock().offline_at_commit = Some(index);
    }

    /// Report the link's key as revoked when asked to commit hop `index`
    pub fn revoke_at_commit(&self, index: usize) {
        self.faults.lock().revoke_at_commit = Some(index);
    }

    /// Sleep before answering every commit
    pub fn set_commit_delay(&self, delay: Duration) {
        self.faults.lock().commit_delay = Some(delay);
    }

    /// Every call received so far, in order
    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().clone()
    }

    /// Hop indices committed for `request`, in call order
    pub fn commits_for(&self, request: &RequestId) -> Vec<usize> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                AgentCall::Commit { request: r, index } if r == request => Some(*index),
                _ => None,
            })
            .collect()
    }

    /// Hop indices discarded for `request`, in call order
    pub fn discards_for(&self, request: &RequestId) -> Vec<usize> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                AgentCall::Discard { request: r, index } if r == request => Some(*index),
                _ => None,
            })
            .collect()
    }

    /// Local tokens not yet committed or released
    pub fn outstanding_tokens(&self) -> usize {
        self.tokens.len()
    }

    /// Bits left in the pool for `link`, `None` if the pool is unlimited
    pub fn pool_available(&self, link: &LinkId) -> Option<u64> {
        self.pools.get(link).map(|pool| pool.available)
    }

    fn record(&self, call: AgentCall) {
        trace!(site = %self.site, call = ?call, "Mock agent call");
        self.calls.lock().push(call);
    }

    /// Apply the offline/stalled faults shared by every call
    async fn gate(&self) -> Result<(), AgentError> {
        let (offline, stalled) = {
            let faults = self.faults.lock();
            (faults.offline, faults.stalled)
        };
        if offline {
            return Err(AgentError::Unreachable(self.site.clone()));
        }
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn draw(&self, link: &LinkId, amount: u64) -> Result<(), AgentError> {
        match self.pools.get_mut(link) {
            Some(mut pool) => {
                if pool.available < amount {
                    return Err(AgentError::CapacityExceeded {
                        site: self.site.clone(),
                        link: link.clone(),
                        requested: amount,
                        available: pool.available,
                    });
                }
                pool.available -= amount;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn refund(&self, link: &LinkId, amount: u64) {
        if let Some(mut pool) = self.pools.get_mut(link) {
            pool.available = pool.available.saturating_add(amount).min(pool.capacity);
        }
    }
}

fn fresh_key(bits: u64) -> KeyMaterial {
    let mut bytes = vec![0u8; KeyMaterial::bytes_for_bits(bits)];
    rand::rng().fill_bytes(&mut bytes);
    KeyMaterial::from_bytes(bytes)
}

#[async_trait]
impl SiteAgent for MockSiteAgent {
    fn site_id(&self) -> &SiteId {
        &self.site
    }

    async fn get_pool_state(&self, link: &LinkId) -> Result<PoolState, AgentError> {
        self.record(AgentCall::GetPoolState(link.clone()));
        self.gate().await?;

        let pool = self.pools.get(link).ok_or_else(|| AgentError::Rejected {
            site: self.site.clone(),
            reason: format!("no pool for {}", link),
        })?;
        Ok(PoolState {
            link: link.clone(),
            capacity: pool.capacity,
            available: pool.available,
            rate_bits_per_sec: pool.rate_bits_per_sec,
            latency_ms: pool.latency_ms,
        })
    }

    async fn reserve_local(
        &self,
        link: &LinkId,
        amount: u64,
        ttl: Duration,
    ) -> Result<ReservationToken, AgentError> {
        self.record(AgentCall::ReserveLocal {
            link: link.clone(),
            amount,
        });
        self.gate().await?;

        if !link.touches(&self.site) {
            return Err(AgentError::Rejected {
                site: self.site.clone(),
                reason: format!("{} does not terminate at this site", link),
            });
        }
        self.draw(link, amount)?;

        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let token = ReservationToken {
            id: Uuid::new_v4(),
            site: self.site.clone(),
            link: link.clone(),
            amount,
            expires_at,
        };
        self.tokens.insert(token.id, token.clone());
        debug!(site = %self.site, link = %link, amount, token = %token.id, "Local reservation taken");
        Ok(token)
    }

    #[instrument(name = "agent_commit", skip_all, fields(site = %self.site, request = %request_id, hop = hop.index))]
    async fn commit_segment(
        &self,
        request_id: RequestId,
        hop: &HopCommand,
    ) -> Result<HopAck, AgentError> {
        self.record(AgentCall::Commit {
            request: request_id,
            index: hop.index,
        });

        let delay = {
            let mut faults = self.faults.lock();
            if faults.offline_at_commit == Some(hop.index) {
                faults.offline = true;
            }
            faults.commit_delay
        };
        self.gate().await?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.faults.lock().revoke_at_commit == Some(hop.index) {
            return Err(AgentError::CapacityRevoked {
                site: self.site.clone(),
                link: hop.link.clone(),
            });
        }

        match hop.token {
            Some(token_id) => {
                let (_, token) =
                    self.tokens
                        .remove(&token_id)
                        .ok_or_else(|| AgentError::CapacityRevoked {
                            site: self.site.clone(),
                            link: hop.link.clone(),
                        })?;
                if token.link != hop.link || token.amount < hop.amount {
                    self.refund(&token.link, token.amount);
                    return Err(AgentError::Rejected {
                        site: self.site.clone(),
                        reason: format!("token {} does not cover hop {}", token_id, hop.index),
                    });
                }
            }
            None => self.draw(&hop.link, hop.amount)?,
        }

        let local = fresh_key(hop.amount);
        let mut material = hop
            .upstream
            .clone()
            .unwrap_or_else(|| KeyMaterial::zeroed(local.len()));
        material.xor_with(&local);
        self.contributions.insert((request_id, hop.index), local);

        debug!(
            site = %self.site,
            request = %request_id,
            hop = hop.index,
            link = %hop.link,
            fingerprint = %material.fingerprint(),
            "Segment committed"
        );
        Ok(HopAck {
            index: hop.index,
            material,
        })
    }

    #[instrument(name = "agent_discard", skip_all, fields(site = %self.site, request = %request_id, hop = hop_index))]
    async fn discard_segment(
        &self,
        request_id: RequestId,
        hop_index: usize,
    ) -> Result<(), AgentError> {
        self.record(AgentCall::Discard {
            request: request_id,
            index: hop_index,
        });
        self.gate().await?;

        if self.faults.lock().fail_discard {
            return Err(AgentError::Rejected {
                site: self.site.clone(),
                reason: format!("discard of hop {} failed", hop_index),
            });
        }

        // Key that reached the wire is burned, not refunded
        if self.contributions.remove(&(request_id, hop_index)).is_some() {
            debug!(site = %self.site, request = %request_id, hop = hop_index, "Segment discarded");
        }
        Ok(())
    }

    async fn release_local(&self, token: &ReservationToken) -> Result<(), AgentError> {
        self.record(AgentCall::ReleaseLocal { token: token.id });
        self.gate().await?;

        if let Some((_, held)) = self.tokens.remove(&token.id) {
            self.refund(&held.link, held.amount);
            debug!(site = %self.site, token = %token.id, amount = held.amount, "Local reservation released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link_ab() -> LinkId {
        LinkId::between("A", "B").unwrap()
    }

    fn hop(index: usize, amount: u64, token: Option<Uuid>, upstream: Option<KeyMaterial>) -> HopCommand {
        HopCommand {
            index,
            from: "A".into(),
            to: "B".into(),
            link: link_ab(),
            amount,
            token,
            upstream,
        }
    }

    #[tokio::test]
    async fn test_reserve_and_release_restore_pool() {
        let agent = MockSiteAgent::new("A").with_pool(link_ab(), 100);

        let token = agent
            .reserve_local(&link_ab(), 40, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(agent.pool_available(&link_ab()), Some(60));
        assert_eq!(agent.outstanding_tokens(), 1);

        agent.release_local(&token).await.unwrap();
        assert_eq!(agent.pool_available(&link_ab()), Some(100));
        assert_eq!(agent.outstanding_tokens(), 0);

        // Releasing twice is a no-op
        agent.release_local(&token).await.unwrap();
        assert_eq!(agent.pool_available(&link_ab()), Some(100));
    }

    #[tokio::test]
    async fn test_reserve_beyond_pool_fails() {
        let agent = MockSiteAgent::new("A").with_pool(link_ab(), 10);
        let err = agent
            .reserve_local(&link_ab(), 11, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::CapacityExceeded { available: 10, .. }));
    }

    #[tokio::test]
    async fn test_commit_consumes_token_and_xors_upstream() {
        let agent = MockSiteAgent::new("A").with_pool(link_ab(), 64);
        let request = RequestId::new();
        let token = agent
            .reserve_local(&link_ab(), 32, Duration::from_secs(5))
            .await
            .unwrap();

        let upstream = KeyMaterial::from_bytes(vec![0xaa; 4]);
        let ack = agent
            .commit_segment(request, &hop(1, 32, Some(token.id), Some(upstream.clone())))
            .await
            .unwrap();

        assert_eq!(ack.index, 1);
        assert_eq!(ack.material.len(), 4);
        assert_eq!(agent.outstanding_tokens(), 0);
        assert_eq!(agent.pool_available(&link_ab()), Some(32));
        assert_eq!(agent.commits_for(&request), vec![1]);

        // Spent token cannot be reused
        let err = agent
            .commit_segment(request, &hop(2, 32, Some(token.id), Some(upstream)))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::CapacityRevoked { .. }));
    }

    #[tokio::test]
    async fn test_offline_agent_is_unreachable() {
        let agent = MockSiteAgent::new("B");
        agent.set_offline(true);

        let err = agent.get_pool_state(&link_ab()).await.unwrap_err();
        assert_eq!(err, AgentError::Unreachable("B".into()));
        assert_eq!(agent.calls().len(), 1);

        agent.set_offline(false);
        tokio_test::assert_ok!(agent.reserve_local(&link_ab(), 1, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_offline_at_commit() {
        let agent = MockSiteAgent::new("A");
        agent.go_offline_at_commit(1);
        let request = RequestId::new();

        agent.commit_segment(request, &hop(0, 8, None, None)).await.unwrap();
        let err = agent
            .commit_segment(request, &hop(1, 8, None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Unreachable(_)));
        assert!(agent.is_offline());
    }

    #[tokio::test]
    async fn test_stalled_agent_never_answers() {
        let agent = MockSiteAgent::new("A");
        agent.set_stalled(true);

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            agent.commit_segment(RequestId::new(), &hop(0, 8, None, None)),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_discard_faults() {
        let agent = MockSiteAgent::new("A");
        let request = RequestId::new();
        agent.commit_segment(request, &hop(0, 8, None, None)).await.unwrap();

        agent.fail_discards(true);
        tokio_test::assert_err!(agent.discard_segment(request, 0).await);

        agent.fail_discards(false);
        tokio_test::assert_ok!(agent.discard_segment(request, 0).await);
        assert_eq!(agent.discards_for(&request), vec![0, 0]);
    }

    #[tokio::test]
    async fn test_unconfigured_pool_is_unlimited() {
        let agent = MockSiteAgent::new("A");
        agent
            .reserve_local(&link_ab(), u64::MAX / 2, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(agent.pool_available(&link_ab()), None);
        assert!(agent.get_pool_state(&link_ab()).await.is_err());
    }

    #[tokio::test]
    async fn test_metrics_reported_in_pool_state() {
        let agent = MockSiteAgent::new("A")
            .with_pool(link_ab(), 500)
            .with_metrics(link_ab(), 250.0, 7);
        let state = agent.get_pool_state(&link_ab()).await.unwrap();
        assert_eq!(state.capacity, 500);
        assert_eq!(state.latency_ms, 7);
        assert_eq!(state.rate_bits_per_sec, 250.0);
    }
}
