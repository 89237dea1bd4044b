//! Link capacity reservations
//!
//! A [`ReservationSet`] claims the same amount on every link of a path, or
//! nothing at all. Links are locked in ascending [`LinkId`] order, so two
//! requests claiming overlapping paths can never deadlock, and no lock is
//! ever held across an `.await`.
//!
//! Contended links keep a wait queue ordered by priority, then arrival.
//! A request may take capacity on a link only if nobody ranked ahead of it
//! is waiting there. Every reservation carries a TTL; the sweep releases
//! those whose request stopped making progress.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use qsdn_core::{
    ControllerEvent, LinkId, LinkState, Priority, RequestId, ReservationError, ReservationId, SiteId,
};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace};

use crate::path::RelayPath;
use crate::topology::TopologyGraph;

/// Who is asking for capacity, and where they stand in line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claimant {
    pub request: RequestId,
    pub priority: Priority,
    /// Arrival sequence number; lower arrived earlier
    pub arrival: u64,
}

/// Position in a link's wait queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WaitTicket {
    priority: Priority,
    arrival: u64,
    request: RequestId,
}

impl From<&Claimant> for WaitTicket {
    fn from(claimant: &Claimant) -> Self {
        Self {
            priority: claimant.priority,
            arrival: claimant.arrival,
            request: claimant.request,
        }
    }
}

impl Ord for WaitTicket {
    /// Higher priority first, then earlier arrival
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.arrival.cmp(&other.arrival))
            .then_with(|| self.request.cmp(&other.request))
    }
}

impl PartialOrd for WaitTicket {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Handle to a granted reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationSet {
    pub id: ReservationId,
    pub request: RequestId,
    /// Claimed links, in lock order
    pub links: Vec<LinkId>,
    /// Bits claimed on each link
    pub amount: u64,
}

/// A reservation released by the TTL sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredReservation {
    pub id: ReservationId,
    pub request: RequestId,
}

#[derive(Debug)]
struct ActiveReservation {
    set: ReservationSet,
    sites: Vec<SiteId>,
    ttl: Duration,
    expires_at: Instant,
}

/// Arbiter of link capacity
pub struct ReservationManager {
    topology: Arc<TopologyGraph>,
    active: DashMap<ReservationId, ActiveReservation>,
    queues: Mutex<HashMap<LinkId, BTreeSet<WaitTicket>>>,
    /// Signalled whenever capacity is freed or a queue shrinks
    freed: Notify,
    arrivals: AtomicU64,
}

impl ReservationManager {
    pub fn new(topology: Arc<TopologyGraph>) -> Self {
        Self {
            topology,
            active: DashMap::new(),
            queues: Mutex::new(HashMap::new()),
            freed: Notify::new(),
            arrivals: AtomicU64::new(0),
        }
    }

    pub fn topology(&self) -> &Arc<TopologyGraph> {
        &self.topology
    }

    /// Stamp a request with the next arrival number
    pub fn claimant(&self, request: RequestId, priority: Priority) -> Claimant {
        Claimant {
            request,
            priority,
            arrival: self.arrivals.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Claim `path.amount` on every link of `path`, all or nothing
    #[instrument(skip(self, claimant, path), fields(request = %claimant.request, path = %path, amount = path.amount))]
    pub fn try_reserve(
        &self,
        claimant: &Claimant,
        path: &RelayPath,
        ttl: Duration,
    ) -> Result<ReservationSet, ReservationError> {
        if path.amount == 0 {
            return Err(ReservationError::Invalid("amount must be positive".into()));
        }
        if path.links.is_empty() {
            return Err(ReservationError::Invalid("path has no links".into()));
        }

        let mut links = path.links.clone();
        links.sort();
        links.dedup();

        self.check_queue(claimant, &links)?;

        let handles = links
            .iter()
            .map(|link| {
                self.topology
                    .link_handle(link)
                    .ok_or_else(|| ReservationError::LinkUnavailable(link.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.topology.hold_sites(&path.sites)?;

        let events = {
            let mut guards: Vec<_> = handles.iter().map(|handle| handle.lock()).collect();

            let mut granted = 0;
            let mut refusal = None;
            for state in guards.iter_mut() {
                if !state.is_active() {
                    refusal = Some(ReservationError::LinkUnavailable(state.id.clone()));
                    break;
                }
                if let Err(err) = state.reserve(path.amount) {
                    refusal = Some(err);
                    break;
                }
                granted += 1;
            }

            if let Some(err) = refusal {
                for state in guards.iter_mut().take(granted) {
                    state.release(path.amount);
                }
                drop(guards);
                self.topology.release_sites(&path.sites);
                trace!(error = %err, "Reservation refused");
                return Err(err);
            }

            guards
                .iter()
                .map(|state| ControllerEvent::capacity_changed(state))
                .collect::<Vec<_>>()
        };
        self.topology.bump_version();
        for event in events {
            self.topology.reporter().report(event);
        }

        let set = ReservationSet {
            id: ReservationId::new(),
            request: claimant.request,
            links,
            amount: path.amount,
        };
        self.active.insert(
            set.id,
            ActiveReservation {
                set: set.clone(),
                sites: path.sites.clone(),
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        debug!(reservation = %set.id, "Reservation granted");
        Ok(set)
    }

    /// Like [`try_reserve`](Self::try_reserve), but wait up to `wait` for
    /// contended capacity, queued behind earlier and higher-priority claims
    #[instrument(skip(self, claimant, path), fields(request = %claimant.request, path = %path))]
    pub async fn reserve_queued(
        &self,
        claimant: &Claimant,
        path: &RelayPath,
        ttl: Duration,
        wait: Duration,
    ) -> Result<ReservationSet, ReservationError> {
        let deadline = Instant::now() + wait;
        let _ticket = QueueTicket::enqueue(self, claimant, &path.links);

        loop {
            let freed = self.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            match self.try_reserve(claimant, path, ttl) {
                Ok(set) => return Ok(set),
                Err(err) if err.is_contention() => {
                    if tokio::time::timeout_at(deadline, freed).await.is_err() {
                        debug!(error = %err, "Gave up waiting for capacity");
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Fail if someone ranked ahead of `claimant` is waiting on any link
    fn check_queue(&self, claimant: &Claimant, links: &[LinkId]) -> Result<(), ReservationError> {
        let ticket = WaitTicket::from(claimant);
        let queues = self.queues.lock();
        for link in links {
            let blocked = queues.get(link).is_some_and(|queue| {
                queue
                    .iter()
                    .next()
                    .is_some_and(|head| head.request != claimant.request && *head < ticket)
            });
            if blocked {
                return Err(ReservationError::Conflict(link.clone()));
            }
        }
        Ok(())
    }

    /// Return a reservation's capacity to the pool
    ///
    /// Idempotent: returns `false` if the reservation was already released,
    /// consumed, or expired.
    pub fn release(&self, id: &ReservationId) -> bool {
        let Some((_, active)) = self.active.remove(id) else {
            return false;
        };
        self.settle(&active, |state, amount| state.release(amount));
        debug!(reservation = %id, request = %active.set.request, "Reservation released");
        true
    }

    /// Convert a reservation into consumed key
    ///
    /// Returns `false` if the reservation is no longer live.
    pub fn consume(&self, id: &ReservationId) -> bool {
        let Some((_, active)) = self.active.remove(id) else {
            return false;
        };
        self.settle(&active, |state, amount| state.consume(amount));
        debug!(reservation = %id, request = %active.set.request, "Reservation consumed");
        true
    }

    fn settle(&self, active: &ActiveReservation, apply: impl Fn(&mut LinkState, u64)) {
        let handles: Vec<_> = active
            .set
            .links
            .iter()
            .filter_map(|link| self.topology.link_handle(link))
            .collect();

        let events: Vec<ControllerEvent> = {
            let mut guards: Vec<_> = handles.iter().map(|handle| handle.lock()).collect();
            guards
                .iter_mut()
                .map(|state| {
                    apply(&mut **state, active.set.amount);
                    ControllerEvent::capacity_changed(state)
                })
                .collect()
        };
        self.topology.bump_version();
        for event in events {
            self.topology.reporter().report(event);
        }
        self.topology.release_sites(&active.sites);
        self.freed.notify_waiters();
    }

    /// Push a reservation's expiry out by its TTL
    pub fn mark_progress(&self, id: &ReservationId) -> bool {
        match self.active.get_mut(id) {
            Some(mut active) => {
                active.expires_at = Instant::now() + active.ttl;
                true
            }
            None => false,
        }
    }

    /// Release every reservation past its TTL
    pub fn sweep_expired(&self) -> Vec<ExpiredReservation> {
        let now = Instant::now();
        let due: Vec<ReservationId> = self
            .active
            .iter()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| *entry.key())
            .collect();

        due.iter().filter_map(|id| self.expire(id, now)).collect()
    }

    /// Release `id` if it is still due at `now`
    ///
    /// The deadline is checked again under the map's shard lock, so a
    /// reservation that made progress since it was found due is kept.
    fn expire(&self, id: &ReservationId, now: Instant) -> Option<ExpiredReservation> {
        let (_, active) = self
            .active
            .remove_if(id, |_, active| active.expires_at <= now)?;
        self.settle(&active, |state, amount| state.release(amount));
        info!(reservation = %id, request = %active.set.request, "Reservation expired");
        Some(ExpiredReservation {
            id: *id,
            request: active.set.request,
        })
    }

    /// Credit `elapsed` worth of key generation to every link
    ///
    /// Returns the total number of bits credited.
    pub fn refill(&self, elapsed: Duration) -> u64 {
        let mut total = 0;
        for handle in self.topology.link_handles() {
            let event = {
                let mut state = handle.lock();
                let credited = state.refill(elapsed);
                total += credited;
                (credited > 0).then(|| ControllerEvent::capacity_changed(&state))
            };
            if let Some(event) = event {
                self.topology.reporter().report(event);
            }
        }
        if total > 0 {
            self.topology.bump_version();
            self.freed.notify_waiters();
            trace!(bits = total, "Pools refilled");
        }
        total
    }

    /// Look up a live reservation
    pub fn reservation(&self, id: &ReservationId) -> Option<ReservationSet> {
        self.active.get(id).map(|active| active.set.clone())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Number of requests waiting on `link`
    pub fn queued_on(&self, link: &LinkId) -> usize {
        self.queues.lock().get(link).map_or(0, BTreeSet::len)
    }

    /// Wake every queued waiter so it re-checks capacity
    pub fn wake_waiters(&self) {
        self.freed.notify_waiters();
    }
}

/// Queue membership for the duration of a [`ReservationManager::reserve_queued`]
/// call; leaving the queue wakes the others
struct QueueTicket<'a> {
    manager: &'a ReservationManager,
    ticket: WaitTicket,
    links: Vec<LinkId>,
}

impl<'a> QueueTicket<'a> {
    fn enqueue(manager: &'a ReservationManager, claimant: &Claimant, links: &[LinkId]) -> Self {
        let ticket = WaitTicket::from(claimant);
        let mut queues = manager.queues.lock();
        for link in links {
            queues.entry(link.clone()).or_default().insert(ticket);
        }
        Self {
            manager,
            ticket,
            links: links.to_vec(),
        }
    }
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        {
            let mut queues = self.manager.queues.lock();
            for link in &self.links {
                if let Some(queue) = queues.get_mut(link) {
                    queue.remove(&self.ticket);
                    if queue.is_empty() {
                        queues.remove(link);
                    }
                }
            }
        }
        self.manager.freed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathFinder;
    use qsdn_core::{LinkHealth, LinkParams, MemoryReporter, Site};

    const TTL: Duration = Duration::from_secs(30);

    fn id(name: &str) -> SiteId {
        SiteId::from(name)
    }

    fn setup(links: &[(&str, &str, u64)]) -> (Arc<TopologyGraph>, ReservationManager) {
        let topology = Arc::new(TopologyGraph::new());
        for (a, b, capacity) in links {
            topology.add_site(Site::new(*a));
            topology.add_site(Site::new(*b));
            topology
                .add_or_update_link(&id(a), &id(b), LinkParams::new(*capacity).with_rate(1.0))
                .unwrap();
        }
        let manager = ReservationManager::new(topology.clone());
        (topology, manager)
    }

    fn path(topology: &TopologyGraph, from: &str, to: &str, amount: u64) -> RelayPath {
        PathFinder::default()
            .find_paths(&topology.snapshot(), &id(from), &id(to), amount)
            .unwrap()
            .remove(0)
    }

    fn link(a: &str, b: &str) -> LinkId {
        LinkId::between(a, b).unwrap()
    }

    #[test]
    fn test_reserve_is_all_or_nothing() {
        let (topology, manager) = setup(&[("A", "B", 10), ("B", "C", 5)]);
        let route = path(&topology, "A", "C", 4);

        // Drain B-C behind the manager's back so the second link fails
        topology.link_handle(&link("B", "C")).unwrap().lock().reserve(3).unwrap();

        let claimant = manager.claimant(RequestId::new(), Priority::Normal);
        let err = manager.try_reserve(&claimant, &route, TTL).unwrap_err();
        assert!(matches!(err, ReservationError::CapacityExceeded { available: 2, .. }));

        let ab = topology.link(&link("A", "B")).unwrap();
        assert_eq!(ab.reserved, 0);
        assert_eq!(topology.holds(&id("B")), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let (topology, manager) = setup(&[("A", "B", 10)]);
        let route = path(&topology, "A", "B", 6);
        let claimant = manager.claimant(RequestId::new(), Priority::Normal);

        let set = manager.try_reserve(&claimant, &route, TTL).unwrap();
        assert_eq!(topology.link(&link("A", "B")).unwrap().available(), 4);
        assert_eq!(topology.holds(&id("A")), 1);

        assert!(manager.release(&set.id));
        assert!(!manager.release(&set.id));
        assert!(!manager.consume(&set.id));

        let state = topology.link(&link("A", "B")).unwrap();
        assert_eq!(state.reserved, 0);
        assert_eq!(state.available(), 10);
        assert_eq!(topology.holds(&id("A")), 0);
    }

    #[test]
    fn test_consume_moves_reserved_to_consumed() {
        let reporter = Arc::new(MemoryReporter::new());
        let topology = Arc::new(TopologyGraph::new().with_reporter(reporter.clone()));
        for name in ["A", "B", "C"] {
            topology.add_site(Site::new(name));
        }
        topology
            .add_or_update_link(&id("A"), &id("B"), LinkParams::new(10))
            .unwrap();
        topology
            .add_or_update_link(&id("B"), &id("C"), LinkParams::new(5))
            .unwrap();
        let manager = ReservationManager::new(topology.clone());

        let route = path(&topology, "A", "C", 4);
        let claimant = manager.claimant(RequestId::new(), Priority::Normal);
        let set = manager.try_reserve(&claimant, &route, TTL).unwrap();
        reporter.clear();

        assert!(manager.consume(&set.id));
        for (a, b, remaining) in [("A", "B", 6), ("B", "C", 1)] {
            let state = topology.link(&link(a, b)).unwrap();
            assert_eq!(state.reserved, 0);
            assert_eq!(state.consumed, 4);
            assert_eq!(state.available(), remaining);
        }
        let capacity_events = reporter
            .events()
            .iter()
            .filter(|e| matches!(e, ControllerEvent::LinkCapacityChanged { .. }))
            .count();
        assert_eq!(capacity_events, 2);
    }

    #[test]
    fn test_inactive_link_is_unavailable() {
        let (topology, manager) = setup(&[("A", "B", 10)]);
        let route = path(&topology, "A", "B", 1);
        topology
            .set_link_health(&link("A", "B"), LinkHealth::Quarantined)
            .unwrap();

        let claimant = manager.claimant(RequestId::new(), Priority::Normal);
        assert!(matches!(
            manager.try_reserve(&claimant, &route, TTL),
            Err(ReservationError::LinkUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_releases_expired() {
        let (topology, manager) = setup(&[("A", "B", 10)]);
        let route = path(&topology, "A", "B", 5);
        let request = RequestId::new();
        let claimant = manager.claimant(request, Priority::Normal);
        let set = manager
            .try_reserve(&claimant, &route, Duration::from_secs(5))
            .unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(manager.sweep_expired().is_empty());
        assert!(manager.mark_progress(&set.id));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(manager.sweep_expired().is_empty());

        tokio::time::advance(Duration::from_secs(3)).await;
        let expired = manager.sweep_expired();
        assert_eq!(expired, vec![ExpiredReservation { id: set.id, request }]);
        assert_eq!(topology.link(&link("A", "B")).unwrap().available(), 10);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_after_sweep_scan_keeps_reservation() {
        let (topology, manager) = setup(&[("A", "B", 10)]);
        let route = path(&topology, "A", "B", 5);
        let claimant = manager.claimant(RequestId::new(), Priority::Normal);
        let set = manager
            .try_reserve(&claimant, &route, Duration::from_secs(5))
            .unwrap();

        // Found due by the scan, then progress lands before the release
        tokio::time::advance(Duration::from_secs(6)).await;
        let scanned_at = Instant::now();
        assert!(manager.mark_progress(&set.id));

        assert_eq!(manager.expire(&set.id, scanned_at), None);
        assert!(manager.reservation(&set.id).is_some());
        assert_eq!(topology.link(&link("A", "B")).unwrap().reserved, 5);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(manager.sweep_expired().len(), 1);
        assert_eq!(topology.link(&link("A", "B")).unwrap().reserved, 0);
    }

    #[test]
    fn test_refill_tops_up_consumed_key() {
        let (topology, manager) = setup(&[("A", "B", 10)]);
        let route = path(&topology, "A", "B", 6);
        let claimant = manager.claimant(RequestId::new(), Priority::Normal);
        let set = manager.try_reserve(&claimant, &route, TTL).unwrap();
        manager.consume(&set.id);

        assert_eq!(manager.refill(Duration::from_secs(4)), 4);
        assert_eq!(topology.link(&link("A", "B")).unwrap().available(), 8);
        assert_eq!(manager.refill(Duration::from_secs(60)), 2);
        assert_eq!(manager.refill(Duration::from_secs(60)), 0);
        assert_eq!(topology.link(&link("A", "B")).unwrap().available(), 10);
    }

    #[test]
    fn test_queue_blocks_lower_ranked_claims() {
        let (topology, manager) = setup(&[("A", "B", 10)]);
        let route = path(&topology, "A", "B", 2);

        let waiting = manager.claimant(RequestId::new(), Priority::Normal);
        let _ticket = QueueTicket::enqueue(&manager, &waiting, &route.links);
        assert_eq!(manager.queued_on(&link("A", "B")), 1);

        // Later arrival at the same priority must wait its turn
        let later = manager.claimant(RequestId::new(), Priority::Normal);
        assert!(matches!(
            manager.try_reserve(&later, &route, TTL),
            Err(ReservationError::Conflict(_))
        ));

        // Higher priority jumps the queue
        let urgent = manager.claimant(RequestId::new(), Priority::Critical);
        assert!(manager.try_reserve(&urgent, &route, TTL).is_ok());

        // The queued request itself is not blocked by its own ticket
        assert!(manager.try_reserve(&waiting, &route, TTL).is_ok());
    }

    #[tokio::test]
    async fn test_queued_reservation_waits_for_release() {
        let (topology, manager) = setup(&[("A", "B", 10)]);
        let manager = Arc::new(manager);
        let route = path(&topology, "A", "B", 6);

        let first = manager.claimant(RequestId::new(), Priority::Normal);
        let held = manager.try_reserve(&first, &route, TTL).unwrap();

        let second = manager.claimant(RequestId::new(), Priority::Normal);
        assert!(matches!(
            manager.try_reserve(&second, &route, TTL),
            Err(ReservationError::CapacityExceeded { .. })
        ));

        let waiter = {
            let manager = manager.clone();
            let route = route.clone();
            tokio::spawn(async move {
                manager
                    .reserve_queued(&second, &route, TTL, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(manager.release(&held.id));

        let granted = waiter.await.unwrap().unwrap();
        assert_eq!(granted.request, second.request);
        assert_eq!(manager.queued_on(&link("A", "B")), 0);
        assert_eq!(topology.link(&link("A", "B")).unwrap().reserved, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_reservation_times_out() {
        let (topology, manager) = setup(&[("A", "B", 10)]);
        let route = path(&topology, "A", "B", 6);
        let first = manager.claimant(RequestId::new(), Priority::Normal);
        manager.try_reserve(&first, &route, TTL).unwrap();

        let second = manager.claimant(RequestId::new(), Priority::Normal);
        let err = manager
            .reserve_queued(&second, &route, TTL, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_contention());
        assert_eq!(manager.queued_on(&link("A", "B")), 0);
    }
}
