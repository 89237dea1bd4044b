//! Relay orchestration
//!
//! The orchestrator drives one key request through its lifecycle:
//!
//! ```text
//! submitted -> pathing -> reserving -> relaying(0..n) -> completed
//!                 ^           |             |
//!                 +-----------+-------------+   (transient failure, retry)
//! ```
//!
//! and `failed` from every live state. An attempt computes ranked paths on a
//! fresh snapshot, reserves capacity on one of them, takes a local token at
//! every hop's upstream site, then commits the hops strictly in order, each
//! one fed the previous hop's output. Any failure after the reservation runs
//! the rollback: discard committed hops in reverse, release local tokens,
//! release the reservation set. A committed hop that cannot be discarded
//! quarantines its link and becomes the request's cause.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use qsdn_core::{
    AgentError, CancelReason, ControllerEvent, HopCommand, KeyMaterial, KeyRequest, LinkHealth,
    LinkId, RelayError, RequestId, RequestState, RequestStatus, ReservationError,
    ReservationToken, SiteAgent, SiteId, SiteStatus,
};
use qsdn_logging::{CorrelationExt, RelayCorrelation, spans};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, field, info, info_span, instrument, trace, warn};

use crate::agents::AgentRegistry;
use crate::config::ControllerConfig;
use crate::path::{PathFinder, RelayPath};
use crate::reservation::{Claimant, ReservationManager, ReservationSet};
use crate::topology::TopologyGraph;

/// Controller-side record of one request
struct RequestEntry {
    request: KeyRequest,
    claimant: Claimant,
    correlation: RelayCorrelation,
    cancel: CancellationToken,
    inner: Mutex<EntryState>,
    state_tx: watch::Sender<RequestState>,
}

struct EntryState {
    state: RequestState,
    cause: Option<RelayError>,
    path: Option<Vec<SiteId>>,
    attempts: u32,
    cancel_reason: Option<CancelReason>,
    key: Option<KeyMaterial>,
    finished_at: Option<Instant>,
}

impl RequestEntry {
    fn status(&self) -> RequestStatus {
        let inner = self.inner.lock();
        RequestStatus {
            id: self.request.id,
            state: inner.state,
            cause: inner.cause.clone(),
            path: inner.path.clone(),
            attempts: inner.attempts,
        }
    }

    fn is_terminal(&self) -> bool {
        self.inner.lock().state.is_terminal()
    }

    /// The error a cancelled request reports
    fn cancelled(&self) -> RelayError {
        let reason = self
            .inner
            .lock()
            .cancel_reason
            .clone()
            .unwrap_or(CancelReason::Caller);
        RelayError::Cancelled(reason)
    }

    fn involves(&self, site: &SiteId) -> bool {
        if self.request.source == *site || self.request.destination == *site {
            return true;
        }
        self.inner
            .lock()
            .path
            .as_ref()
            .is_some_and(|path| path.contains(site))
    }
}

/// Everything an attempt holds once capacity is reserved
struct Claim<'a> {
    path: &'a RelayPath,
    set: ReservationSet,
    tokens: Vec<ReservationToken>,
    committed: Vec<usize>,
    /// A commit whose outcome is unknown (timed out or abandoned)
    uncertain: Option<usize>,
}

/// Drives key requests over the topology
pub struct RelayOrchestrator {
    topology: Arc<TopologyGraph>,
    reservations: Arc<ReservationManager>,
    agents: Arc<AgentRegistry>,
    finder: PathFinder,
    config: ControllerConfig,
    requests: DashMap<RequestId, Arc<RequestEntry>>,
}

impl RelayOrchestrator {
    pub fn new(
        topology: Arc<TopologyGraph>,
        reservations: Arc<ReservationManager>,
        agents: Arc<AgentRegistry>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            topology,
            reservations,
            agents,
            finder: PathFinder::new(config.path.clone()),
            config,
            requests: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Start tracking a request in the `Submitted` state
    pub fn admit(&self, request: KeyRequest) -> RequestId {
        let id = request.id;
        let (state_tx, _) = watch::channel(RequestState::Submitted);
        let entry = RequestEntry {
            claimant: self.reservations.claimant(id, request.priority),
            correlation: RelayCorrelation::for_request(&id),
            cancel: CancellationToken::new(),
            inner: Mutex::new(EntryState {
                state: RequestState::Submitted,
                cause: None,
                path: None,
                attempts: 0,
                cancel_reason: None,
                key: None,
                finished_at: None,
            }),
            state_tx,
            request,
        };
        debug!(
            request = %id,
            source = %entry.request.source,
            destination = %entry.request.destination,
            amount = entry.request.amount,
            priority = %entry.request.priority,
            "Request admitted"
        );
        self.requests.insert(id, Arc::new(entry));
        id
    }

    fn entry(&self, id: &RequestId) -> Option<Arc<RequestEntry>> {
        self.requests.get(id).map(|entry| Arc::clone(&entry))
    }

    pub fn status(&self, id: &RequestId) -> Option<RequestStatus> {
        self.entry(id).map(|entry| entry.status())
    }

    /// Token that fires when the request is cancelled
    pub fn cancellation(&self, id: &RequestId) -> Option<CancellationToken> {
        self.entry(id).map(|entry| entry.cancel.clone())
    }

    /// Number of requests not yet completed or failed
    pub fn live_count(&self) -> usize {
        self.requests
            .iter()
            .filter(|entry| !entry.is_terminal())
            .count()
    }

    /// Run a previously admitted request to a terminal state
    pub async fn run(&self, id: RequestId) {
        let Some(entry) = self.entry(&id) else {
            warn!(request = %id, "Run requested for unknown request");
            return;
        };
        let span = info_span!(
            spans::HANDLE_REQUEST,
            request = %id,
            source = %entry.request.source,
            destination = %entry.request.destination,
            amount = entry.request.amount,
            trace_id = field::Empty,
            span_id = field::Empty,
            parent_span_id = field::Empty,
            attempt = field::Empty,
            hop = field::Empty,
        );
        span.record_correlation(&entry.correlation);
        self.drive(&entry).instrument(span).await;
    }

    async fn drive(&self, entry: &RequestEntry) {
        let max_attempts = self.config.relay.max_attempts.max(1);
        let mut first_transient: Option<RelayError> = None;
        let mut attempt = 0;

        let outcome = loop {
            attempt += 1;
            if entry.cancel.is_cancelled() {
                break Err(entry.cancelled());
            }
            if entry.request.is_past_deadline() {
                break Err(RelayError::DeadlineExceeded);
            }
            entry.inner.lock().attempts = attempt;

            let err = match self.attempt(entry, attempt).await {
                Ok(key) => break Ok(key),
                Err(err) => err,
            };

            if err.is_transient() && attempt < max_attempts {
                debug!(attempt, error = %err, "Attempt failed, retrying");
                first_transient.get_or_insert_with(|| err.clone());
                let delay = self.config.relay.backoff(attempt);
                tokio::select! {
                    biased;
                    _ = entry.cancel.cancelled() => break Err(entry.cancelled()),
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            // A retry that ran out of paths reports what sent it looking
            break Err(match (err, first_transient.take()) {
                (RelayError::Path(_), Some(transient)) => transient,
                (err, _) => err,
            });
        };

        match outcome {
            Ok(key) => {
                info!(attempts = attempt, key = %key.fingerprint(), "Request completed");
                entry.inner.lock().key = Some(key);
                self.transition(entry, RequestState::Completed, None);
            }
            Err(cause) => {
                warn!(attempts = attempt, cause = %cause, "Request failed");
                self.transition(entry, RequestState::Failed, Some(&cause));
            }
        }
    }

    /// One pass of path, reserve, relay
    async fn attempt(&self, entry: &RequestEntry, attempt: u32) -> Result<KeyMaterial, RelayError> {
        let ctx = entry.correlation.attempt(attempt);
        let span = info_span!(
            spans::RELAY_ATTEMPT,
            attempt,
            trace_id = field::Empty,
            span_id = field::Empty,
            parent_span_id = field::Empty,
            hop = field::Empty,
        );
        span.record_correlation(&ctx);

        async {
            self.transition(entry, RequestState::Pathing, None);
            let request = &entry.request;
            let snapshot = self.topology.snapshot();
            let paths = self.finder.find_paths(
                &snapshot,
                &request.source,
                &request.destination,
                request.amount,
            )?;
            trace!(version = snapshot.version(), candidates = paths.len(), "Paths computed");

            self.transition(entry, RequestState::Reserving, None);
            let (path, set) = self.reserve(entry, &paths).await?;
            debug!(path = %path, reservation = %set.id, "Capacity reserved");

            let mut claim = Claim {
                path,
                set,
                tokens: Vec::with_capacity(path.hop_count()),
                committed: Vec::with_capacity(path.hop_count()),
                uncertain: None,
            };

            match self.relay(entry, &ctx, &mut claim).await {
                Ok(key) => Ok(key),
                Err(cause) => Err(self.rollback(entry, &claim, cause).await),
            }
        }
        .instrument(span)
        .await
    }

    /// Reserve capacity on the best candidate that has it, or queue on the
    /// best contended one
    async fn reserve<'p>(
        &self,
        entry: &RequestEntry,
        paths: &'p [RelayPath],
    ) -> Result<(&'p RelayPath, ReservationSet), RelayError> {
        let ttl = self.config.reservation.ttl();
        let mut contended: Option<&'p RelayPath> = None;
        let mut refusal: Option<ReservationError> = None;
        let previous = entry.inner.lock().path.clone();

        // The candidate is recorded before it holds any site, so a site
        // deregistered mid-reservation finds and cancels this request
        for path in paths {
            entry.inner.lock().path = Some(path.sites.clone());
            match self.reservations.try_reserve(&entry.claimant, path, ttl) {
                Ok(set) => return Ok((path, set)),
                Err(err) => {
                    trace!(path = %path, error = %err, "Candidate refused");
                    if err.is_contention() {
                        contended.get_or_insert(path);
                    }
                    refusal.get_or_insert(err);
                }
            }
        }

        let Some(path) = contended else {
            entry.inner.lock().path = previous;
            return Err(refusal
                .unwrap_or_else(|| ReservationError::Invalid("no candidate paths".into()))
                .into());
        };

        debug!(path = %path, "All candidates contended, queueing");
        entry.inner.lock().path = Some(path.sites.clone());
        let wait = self.config.reservation.queue_timeout();
        tokio::select! {
            biased;
            _ = entry.cancel.cancelled() => Err(entry.cancelled()),
            result = self.reservations.reserve_queued(&entry.claimant, path, ttl, wait) => {
                Ok((path, result?))
            }
        }
    }

    /// Take local tokens, then commit every hop in order
    async fn relay(
        &self,
        entry: &RequestEntry,
        ctx: &RelayCorrelation,
        claim: &mut Claim<'_>,
    ) -> Result<KeyMaterial, RelayError> {
        let request = &entry.request;
        let path = claim.path;
        let hops = path.hop_count();
        let ttl = self.config.reservation.ttl();

        self.ensure_registered(path)?;
        for (from, _, link) in path.hops() {
            let agent = self.agent_for(from)?;
            let token = self
                .call(Some(entry), from, "reserve_local", agent.reserve_local(link, request.amount, ttl))
                .await?;
            claim.tokens.push(token);
        }
        self.reservations.mark_progress(&claim.set.id);

        let mut upstream: Option<KeyMaterial> = None;
        for (index, (from, to, link)) in path.hops().enumerate() {
            if request.is_past_deadline() {
                return Err(RelayError::DeadlineExceeded);
            }
            self.ensure_registered(path)?;
            self.transition(entry, RequestState::Relaying { hop: index, hops }, None);

            let hop_ctx = ctx.hop(index);
            let span = info_span!(
                spans::RELAY_HOP,
                hop = index,
                site = %from,
                link = %link,
                trace_id = field::Empty,
                span_id = field::Empty,
                parent_span_id = field::Empty,
                attempt = field::Empty,
            );
            span.record_correlation(&hop_ctx);

            let command = HopCommand {
                index,
                from: from.clone(),
                to: to.clone(),
                link: link.clone(),
                amount: request.amount,
                token: claim.tokens.get(index).map(|token| token.id),
                upstream: upstream.take(),
            };

            let agent = self.agent_for(from)?;
            let result = self
                .call(Some(entry), from, "commit_segment", agent.commit_segment(request.id, &command))
                .instrument(span)
                .await;

            match result {
                Ok(ack) => {
                    claim.committed.push(index);
                    self.reservations.mark_progress(&claim.set.id);
                    trace!(hop = index, "Hop committed");
                    upstream = Some(ack.material);
                }
                Err(err) => {
                    if matches!(
                        err,
                        RelayError::Agent(AgentError::Timeout { .. }) | RelayError::Cancelled(_)
                    ) {
                        claim.uncertain = Some(index);
                    }
                    debug!(hop = index, error = %err, "Hop failed");
                    return Err(err);
                }
            }
        }

        if !self.reservations.consume(&claim.set.id) {
            return Err(RelayError::Cancelled(CancelReason::ReservationExpired));
        }

        let bytes = KeyMaterial::bytes_for_bits(request.amount);
        Ok(upstream.unwrap_or_else(|| KeyMaterial::zeroed(bytes)))
    }

    /// Undo a failed attempt and return the error the request should carry
    #[instrument(name = "rollback", skip_all, fields(reservation = %claim.set.id, committed = claim.committed.len()))]
    async fn rollback(&self, entry: &RequestEntry, claim: &Claim<'_>, cause: RelayError) -> RelayError {
        let request = entry.request.id;
        let path = claim.path;
        let mut failure: Option<(LinkId, SiteId)> = None;

        if let Some(index) = claim.uncertain {
            let site = &path.sites[index];
            if let Err(err) = self.discard(request, site, index).await {
                debug!(hop = index, error = %err, "Discard of unacknowledged hop failed");
            }
        }

        for &index in claim.committed.iter().rev() {
            let site = &path.sites[index];
            let link = &path.links[index];
            if let Err(err) = self.discard(request, site, index).await {
                warn!(hop = index, site = %site, link = %link, error = %err, "Rollback could not discard hop");
                if let Err(e) = self.topology.set_link_health(link, LinkHealth::Quarantined) {
                    debug!(link = %link, error = %e, "Could not quarantine link");
                }
                failure.get_or_insert_with(|| (link.clone(), site.clone()));
            }
        }

        for (index, token) in claim.tokens.iter().enumerate() {
            if claim.committed.contains(&index) {
                continue;
            }
            let Some(agent) = self.agents.get(&token.site) else {
                continue;
            };
            if let Err(err) = self
                .call(None, &token.site, "release_local", agent.release_local(token))
                .await
            {
                debug!(site = %token.site, error = %err, "Local release failed");
            }
        }

        self.reservations.release(&claim.set.id);

        match failure {
            Some((link, site)) => RelayError::RollbackFailure {
                link,
                site,
                cause: Box::new(cause),
            },
            None => {
                debug!(cause = %cause, "Rollback complete");
                cause
            }
        }
    }

    async fn discard(&self, request: RequestId, site: &SiteId, index: usize) -> Result<(), RelayError> {
        let agent = self.agent_for(site)?;
        self.call(None, site, "discard_segment", agent.discard_segment(request, index))
            .await
    }

    /// Fail if any site on `path` has been deregistered
    fn ensure_registered(&self, path: &RelayPath) -> Result<(), RelayError> {
        let departed = path
            .sites
            .iter()
            .find(|site| !self.agents.is_registered(site) || self.topology.is_removing(site));
        match departed {
            Some(site) => {
                debug!(site = %site, "Path runs through a deregistered site");
                Err(RelayError::Cancelled(CancelReason::SiteDeregistered(site.clone())))
            }
            None => Ok(()),
        }
    }

    fn agent_for(&self, site: &SiteId) -> Result<Arc<dyn SiteAgent>, RelayError> {
        self.agents
            .get(site)
            .ok_or_else(|| AgentError::Unreachable(site.clone()).into())
    }

    /// Await one agent call under the per-call timeout
    ///
    /// With an `entry`, the call is abandoned as soon as the request is
    /// cancelled. A site that answers `Unreachable` is marked offline.
    async fn call<T>(
        &self,
        entry: Option<&RequestEntry>,
        site: &SiteId,
        operation: &'static str,
        call: impl Future<Output = Result<T, AgentError>>,
    ) -> Result<T, RelayError> {
        let timed = tokio::time::timeout(self.config.relay.agent_timeout(), call);
        let result = match entry {
            Some(entry) => tokio::select! {
                biased;
                _ = entry.cancel.cancelled() => return Err(entry.cancelled()),
                result = timed => result,
            },
            None => timed.await,
        };

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                if let AgentError::Unreachable(unreachable) = &err {
                    self.mark_offline(unreachable);
                }
                Err(err.into())
            }
            Err(_) => {
                debug!(site = %site, operation, "Agent call timed out");
                Err(AgentError::Timeout {
                    site: site.clone(),
                    operation: operation.to_string(),
                }
                .into())
            }
        }
    }

    fn mark_offline(&self, site: &SiteId) {
        match self.topology.set_site_status(site, SiteStatus::Offline) {
            Ok(true) => warn!(site = %site, "Site unreachable, marked offline"),
            Ok(false) => {}
            Err(err) => trace!(site = %site, error = %err, "Unreachable site is not in the topology"),
        }
    }

    fn transition(&self, entry: &RequestEntry, next: RequestState, cause: Option<&RelayError>) -> bool {
        let from = {
            let mut inner = entry.inner.lock();
            let from = inner.state;
            if from == next {
                return false;
            }
            if !from.can_transition_to(&next) {
                warn!(request = %entry.request.id, from = %from, to = %next, "Invalid transition ignored");
                return false;
            }
            inner.state = next;
            if let Some(cause) = cause {
                inner.cause = Some(cause.clone());
            }
            if next.is_terminal() {
                inner.finished_at = Some(Instant::now());
            }
            from
        };

        entry.state_tx.send_replace(next);
        self.topology.reporter().report(ControllerEvent::transition(
            entry.request.id,
            from,
            next,
            cause.map(ToString::to_string),
        ));
        true
    }

    /// Ask a live request to stop
    ///
    /// Returns `Ok(false)` if the request already reached a terminal state.
    pub fn cancel(&self, id: &RequestId, reason: CancelReason) -> Result<bool, RelayError> {
        let entry = self.entry(id).ok_or(RelayError::UnknownRequest(*id))?;
        {
            let mut inner = entry.inner.lock();
            if inner.state.is_terminal() {
                return Ok(false);
            }
            inner.cancel_reason.get_or_insert(reason);
        }
        entry.cancel.cancel();
        debug!(request = %id, "Cancellation requested");
        Ok(true)
    }

    /// Cancel every live request that starts, ends, or relays at `site`
    pub fn cancel_routed_through(&self, site: &SiteId, reason: CancelReason) -> Vec<RequestId> {
        let affected: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|entry| !entry.is_terminal() && entry.involves(site))
            .map(|entry| *entry.key())
            .collect();

        affected
            .into_iter()
            .filter(|id| matches!(self.cancel(id, reason.clone()), Ok(true)))
            .collect()
    }

    /// Wait until the request completes or fails
    pub async fn wait(&self, id: &RequestId) -> Result<RequestStatus, RelayError> {
        let entry = self.entry(id).ok_or(RelayError::UnknownRequest(*id))?;
        let mut rx = entry.state_tx.subscribe();
        // The entry owns the sender, so the channel cannot close under us
        let _ = rx.wait_for(RequestState::is_terminal).await;
        Ok(entry.status())
    }

    /// Hand out the relayed key of a completed request, once
    pub fn take_key(&self, id: &RequestId) -> Result<Option<KeyMaterial>, RelayError> {
        let entry = self.entry(id).ok_or(RelayError::UnknownRequest(*id))?;
        let key = entry.inner.lock().key.take();
        Ok(key)
    }

    /// Forget terminal requests that finished more than `retention` ago
    pub fn prune_finished(&self, retention: Duration) -> usize {
        let before = self.requests.len();
        let now = Instant::now();
        self.requests.retain(|_, entry| {
            entry
                .inner
                .lock()
                .finished_at
                .is_none_or(|finished| now.duration_since(finished) < retention)
        });
        let pruned = before.saturating_sub(self.requests.len());
        if pruned > 0 {
            debug!(pruned, "Pruned finished requests");
        }
        pruned
    }

    /// Cancel everything still running
    pub fn shutdown(&self) -> usize {
        let ids: Vec<RequestId> = self.requests.iter().map(|entry| *entry.key()).collect();
        let cancelled = ids
            .iter()
            .filter(|id| matches!(self.cancel(id, CancelReason::Shutdown), Ok(true)))
            .count();
        if cancelled > 0 {
            info!(cancelled, "Cancelled live requests for shutdown");
        }
        cancelled
    }
}
