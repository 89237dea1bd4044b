//! The network manager
//!
//! [`NetworkManager`] is the controller's front door. Sites register with an
//! agent, operators declare static links, clients submit key requests, and
//! agents push health reports. Behind it sit the topology, the agent
//! registry, the reservation manager, and the relay orchestrator.
//!
//! Each request runs on its own task, bounded by `max_concurrent_requests`.
//! [`start`](NetworkManager::start) spawns the reservation sweep and the pool
//! refill; [`shutdown`](NetworkManager::shutdown) cancels live requests and
//! waits for every task to finish.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use qsdn_core::{
    AgentError, CancelReason, HealthReport, KeyMaterial, KeyRequest, KeyRequestService, LinkHealth,
    LinkId, LinkParams, LinkSpec, Priority, QsdnError, QsdnResult, RelayError, ReportingSink,
    RequestId, RequestStatus, Site, SiteAgent, SiteId, SiteStatus, TopologyError, TracingReporter,
};
use qsdn_logging::spans;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, instrument, trace, warn};

use crate::agents::AgentRegistry;
use crate::config::ControllerConfig;
use crate::orchestrator::RelayOrchestrator;
use crate::reservation::ReservationManager;
use crate::topology::{SiteRemoval, TopologyGraph};

/// Centralized controller for a QKD network
pub struct NetworkManager {
    config: ControllerConfig,
    topology: Arc<TopologyGraph>,
    reservations: Arc<ReservationManager>,
    agents: Arc<AgentRegistry>,
    orchestrator: Arc<RelayOrchestrator>,
    /// Declared links, applied whenever both endpoints are registered
    static_links: Mutex<BTreeMap<LinkId, LinkSpec>>,
    permits: Arc<Semaphore>,
    request_tasks: TaskTracker,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl NetworkManager {
    /// Create a manager that reports events as log lines
    pub fn new(config: ControllerConfig) -> QsdnResult<Self> {
        Self::with_reporter(config, Arc::new(TracingReporter))
    }

    pub fn with_reporter(config: ControllerConfig, reporter: Arc<dyn ReportingSink>) -> QsdnResult<Self> {
        config.validate()?;

        let topology = Arc::new(TopologyGraph::new().with_reporter(reporter));
        let reservations = Arc::new(ReservationManager::new(Arc::clone(&topology)));
        let agents = Arc::new(AgentRegistry::new());
        let orchestrator = Arc::new(RelayOrchestrator::new(
            Arc::clone(&topology),
            Arc::clone(&reservations),
            Arc::clone(&agents),
            config.clone(),
        ));

        Ok(Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            config,
            topology,
            reservations,
            agents,
            orchestrator,
            static_links: Mutex::new(BTreeMap::new()),
            request_tasks: TaskTracker::new(),
            background_tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn topology(&self) -> &Arc<TopologyGraph> {
        &self.topology
    }

    pub fn reservations(&self) -> &Arc<ReservationManager> {
        &self.reservations
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    // ---- Sites and links ----

    /// Register a site and the agent that speaks for it
    ///
    /// Re-registration refreshes capabilities and devices, brings the site
    /// back online, and re-evaluates which static links can be active.
    #[instrument(name = "register_site", skip_all, fields(site = %site.id))]
    pub fn register_site(&self, site: Site, agent: Arc<dyn SiteAgent>) -> QsdnResult<()> {
        if agent.site_id() != &site.id {
            return Err(AgentError::Rejected {
                site: site.id.clone(),
                reason: format!("agent speaks for {}", agent.site_id()),
            }
            .into());
        }

        if self.topology.contains_site(&site.id) {
            self.topology.set_site_status(&site.id, site.status)?;
        }
        let added = self.topology.add_site(site);
        self.agents.register(agent);
        self.apply_static_links();
        self.reservations.wake_waiters();

        info!(added, "Site registered");
        Ok(())
    }

    /// Deregister a site
    ///
    /// Every live request that starts, ends, or relays at the site is
    /// cancelled. Removal from the topology waits for their reservations.
    #[instrument(name = "unregister_site", skip(self), fields(site = %site))]
    pub fn unregister_site(&self, site: &SiteId) -> QsdnResult<SiteRemoval> {
        if !self.topology.contains_site(site) {
            return Err(TopologyError::UnknownSite(site.clone()).into());
        }

        // Retired first: a request that records this site after the scan
        // below still fails its next registration check
        self.agents.retire(site);
        let cancelled = self
            .orchestrator
            .cancel_routed_through(site, CancelReason::SiteDeregistered(site.clone()));
        let removal = self.topology.remove_site(site)?;

        info!(cancelled = cancelled.len(), removal = ?removal, "Site deregistered");
        Ok(removal)
    }

    /// Sites with a live agent
    pub fn registered_sites(&self) -> Vec<SiteId> {
        self.agents.active_sites()
    }

    /// Declare a link
    ///
    /// The link enters the topology once both endpoints are registered. It
    /// stays inactive until each endpoint reports the device the link
    /// declares for it.
    pub fn add_static_link(&self, spec: LinkSpec) -> QsdnResult<LinkId> {
        let id = spec
            .link_id()
            .ok_or_else(|| TopologyError::SelfLoop(spec.a.clone()))?;

        if self.topology.link(&id).is_some() {
            self.topology.add_or_update_link(&spec.a, &spec.b, spec.params())?;
        }
        self.static_links.lock().insert(id.clone(), spec);
        self.apply_static_links();
        debug!(link = %id, "Static link declared");
        Ok(id)
    }

    /// Add or update a link directly; both sites must be known
    pub fn add_or_update_link(&self, a: &SiteId, b: &SiteId, params: LinkParams) -> QsdnResult<LinkId> {
        let id = self.topology.add_or_update_link(a, b, params)?;
        self.reservations.wake_waiters();
        Ok(id)
    }

    /// Bring every declared link in line with the registered sites
    fn apply_static_links(&self) {
        let specs: Vec<LinkSpec> = self.static_links.lock().values().cloned().collect();

        for spec in specs {
            let Some(id) = spec.link_id() else {
                continue;
            };
            let (Some(a), Some(b)) = (self.topology.site(&spec.a), self.topology.site(&spec.b)) else {
                continue;
            };
            let ready = [&a, &b].iter().all(|site| {
                spec.required_device(&site.id)
                    .is_none_or(|device| site.has_device(device))
            });
            let wanted = if ready {
                LinkHealth::Active
            } else {
                LinkHealth::Inactive
            };

            let result = match self.topology.link(&id) {
                None => self
                    .topology
                    .add_link_with_health(&spec.a, &spec.b, spec.params(), wanted)
                    .map(|_| ()),
                Some(state) if state.health == LinkHealth::Quarantined || state.health == wanted => Ok(()),
                Some(state) => self.topology.set_link_health(&state.id, wanted).map(|_| ()),
            };
            if let Err(err) = result {
                debug!(a = %spec.a, b = %spec.b, error = %err, "Static link not applied");
            }
        }
    }

    // ---- Key requests ----

    /// Submit a request; it runs on its own task
    #[instrument(skip(self, request), fields(request = %request.id, source = %request.source, destination = %request.destination, amount = request.amount))]
    pub fn submit(&self, request: KeyRequest) -> RequestId {
        let id = self.orchestrator.admit(request);
        if self.shutdown.is_cancelled() {
            let _ = self.orchestrator.cancel(&id, CancelReason::Shutdown);
        }

        let orchestrator = Arc::clone(&self.orchestrator);
        let permits = Arc::clone(&self.permits);
        let cancel = self.orchestrator.cancellation(&id).unwrap_or_default();
        self.request_tasks.spawn(async move {
            // A cancelled request skips the line and fails at once
            let _permit = tokio::select! {
                permit = permits.acquire_owned() => permit.ok(),
                _ = cancel.cancelled() => None,
            };
            orchestrator.run(id).await;
        });
        id
    }

    pub fn request_status(&self, id: &RequestId) -> QsdnResult<RequestStatus> {
        self.orchestrator
            .status(id)
            .ok_or_else(|| RelayError::UnknownRequest(*id).into())
    }

    /// Wait until a request completes or fails
    pub async fn wait_for_terminal(&self, id: &RequestId) -> QsdnResult<RequestStatus> {
        Ok(self.orchestrator.wait(id).await?)
    }

    /// Take the relayed key of a completed request
    ///
    /// The key is handed out once; later calls return `None`.
    pub fn take_key(&self, id: &RequestId) -> QsdnResult<Option<KeyMaterial>> {
        Ok(self.orchestrator.take_key(id)?)
    }

    // ---- Agent-facing ----

    /// Apply a health report pushed by a site agent
    #[instrument(skip(self, report), fields(site = %report.site, status = %report.status))]
    pub fn report_health(&self, report: HealthReport) -> QsdnResult<()> {
        if !self.agents.record_report(&report.site) {
            return Err(TopologyError::UnknownSite(report.site.clone()).into());
        }
        self.topology.set_site_status(&report.site, report.status)?;

        for pool in &report.links {
            if !pool.link.touches(&report.site) {
                debug!(link = %pool.link, "Report names a link of another site");
                continue;
            }
            if let Err(err) = self.topology.update_link_metrics(pool) {
                debug!(link = %pool.link, error = %err, "Pool report ignored");
            }
        }

        if report.status.is_usable() {
            self.reservations.wake_waiters();
        }
        Ok(())
    }

    /// Pull pool state for every link from one of its endpoints
    ///
    /// Returns the number of links whose metrics were refreshed.
    pub async fn poll_pool_states(&self) -> usize {
        poll_pools(&self.topology, &self.agents, self.config.relay.agent_timeout())
            .instrument(info_span!(spans::POLL_POOLS))
            .await
    }

    /// Put a quarantined link back into service
    pub fn restore_link(&self, link: &LinkId) -> QsdnResult<bool> {
        let restored = self.topology.set_link_health(link, LinkHealth::Active)?;
        if restored {
            info!(link = %link, "Link restored");
            self.reservations.wake_waiters();
        }
        Ok(restored)
    }

    // ---- Lifecycle ----

    /// Spawn the reservation sweep and pool refill tasks
    pub fn start(&self) -> QsdnResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(QsdnError::AlreadyStarted);
        }

        let sweep = SweepTask {
            reservations: Arc::clone(&self.reservations),
            orchestrator: Arc::clone(&self.orchestrator),
            agents: Arc::clone(&self.agents),
            topology: Arc::clone(&self.topology),
            retention: self.config.request_retention(),
        };
        let sweep_every = self.config.reservation.sweep_interval();
        let shutdown = self.shutdown.clone();
        let sweep_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => sweep.run_once(),
                }
            }
            debug!("Sweep task stopped");
        });

        let reservations = Arc::clone(&self.reservations);
        let refill_every = self.config.reservation.refill_interval();
        let shutdown = self.shutdown.clone();
        let refill_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(refill_every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last = Instant::now();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    now = interval.tick() => {
                        let credited = reservations.refill(now.duration_since(last));
                        last = now;
                        trace!(credited, "Refill tick");
                    }
                }
            }
            debug!("Refill task stopped");
        });

        self.background_tasks.lock().extend([sweep_task, refill_task]);
        info!(
            sweep_ms = sweep_every.as_millis() as u64,
            refill_ms = refill_every.as_millis() as u64,
            "Network manager started"
        );
        Ok(())
    }

    /// Cancel live requests and wait for every task to finish
    pub async fn shutdown(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        let cancelled = self.orchestrator.shutdown();

        let tasks: Vec<JoinHandle<()>> = self.background_tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.request_tasks.close();
        self.request_tasks.wait().await;
        info!(cancelled, "Network manager stopped");
    }
}

/// Periodic housekeeping: expire stale reservations, prune retired agents
/// and finished requests
struct SweepTask {
    reservations: Arc<ReservationManager>,
    orchestrator: Arc<RelayOrchestrator>,
    agents: Arc<AgentRegistry>,
    topology: Arc<TopologyGraph>,
    retention: Duration,
}

impl SweepTask {
    fn run_once(&self) {
        let span = info_span!(spans::RESERVATION_SWEEP);
        let _enter = span.enter();

        for expired in self.reservations.sweep_expired() {
            match self
                .orchestrator
                .cancel(&expired.request, CancelReason::ReservationExpired)
            {
                Ok(true) => warn!(request = %expired.request, reservation = %expired.id, "Request cancelled, reservation expired"),
                Ok(false) => {}
                Err(err) => debug!(reservation = %expired.id, error = %err, "Expired reservation had no request"),
            }
        }
        self.agents.prune(|site| self.topology.contains_site(site));
        self.orchestrator.prune_finished(self.retention);
    }
}

async fn poll_pools(topology: &TopologyGraph, agents: &AgentRegistry, timeout: Duration) -> usize {
    let mut refreshed = 0;
    for link in topology.links() {
        let (low, high) = link.id.endpoints();
        for site in [low, high] {
            let Some(agent) = agents.get(site) else {
                continue;
            };
            match tokio::time::timeout(timeout, agent.get_pool_state(&link.id)).await {
                Ok(Ok(pool)) => {
                    if topology.update_link_metrics(&pool).is_ok() {
                        refreshed += 1;
                    }
                    break;
                }
                Ok(Err(AgentError::Unreachable(unreachable))) => {
                    if let Ok(true) = topology.set_site_status(&unreachable, SiteStatus::Offline) {
                        warn!(site = %unreachable, "Site unreachable during poll, marked offline");
                    }
                }
                Ok(Err(err)) => debug!(link = %link.id, site = %site, error = %err, "Pool poll refused"),
                Err(_) => debug!(link = %link.id, site = %site, "Pool poll timed out"),
            }
        }
    }
    refreshed
}

#[async_trait]
impl KeyRequestService for NetworkManager {
    async fn submit_key_request(
        &self,
        source: SiteId,
        destination: SiteId,
        amount: u64,
        priority: Priority,
    ) -> Result<RequestId, QsdnError> {
        Ok(self.submit(KeyRequest::new(source, destination, amount, priority)))
    }

    fn get_request_status(&self, id: &RequestId) -> Result<RequestStatus, QsdnError> {
        self.request_status(id)
    }

    async fn cancel_request(&self, id: &RequestId) -> Result<bool, QsdnError> {
        Ok(self.orchestrator.cancel(id, CancelReason::Caller)?)
    }
}
