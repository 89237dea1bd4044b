//! End-to-end relay scenarios
//!
//! Each test stands up a `NetworkManager` over in-memory agents and drives
//! requests through the public API only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use qsdn_core::{
    AgentError, CancelReason, ControllerEvent, KeyRequest, KeyRequestService, LinkHealth, LinkId,
    LinkSpec, MemoryReporter, MockSiteAgent, PathError, Priority, RelayError, ReportingSink,
    RequestState, Site, SiteAgent, SiteId, SiteStatus,
};
use qsdn_routing::{
    ControllerConfig, NetworkManager, PathFinder, PathPolicy, RelayConfig, ReservationConfig,
    SiteRemoval,
};

struct Network {
    manager: NetworkManager,
    reporter: Arc<MemoryReporter>,
    agents: Vec<Arc<MockSiteAgent>>,
}

impl Network {
    fn agent(&self, site: &str) -> &Arc<MockSiteAgent> {
        self.agents
            .iter()
            .find(|agent| agent.site_id().as_str() == site)
            .unwrap()
    }

    fn link(&self, a: &str, b: &str) -> qsdn_core::LinkState {
        self.manager
            .topology()
            .link(&LinkId::between(a, b).unwrap())
            .unwrap()
    }

    async fn request(&self, source: &str, destination: &str, amount: u64) -> qsdn_core::RequestStatus {
        let id = self
            .manager
            .submit(KeyRequest::new(source.into(), destination.into(), amount, Priority::Normal));
        self.manager.wait_for_terminal(&id).await.unwrap()
    }
}

fn config() -> ControllerConfig {
    ControllerConfig::default()
        .with_relay(
            RelayConfig::default()
                .with_agent_timeout(Duration::from_millis(500))
                .with_backoff(Duration::from_millis(1), Duration::from_millis(10)),
        )
        .with_reservation(ReservationConfig::default().with_queue_timeout(Duration::from_millis(50)))
}

fn network(links: &[(&str, &str, u64)], config: ControllerConfig) -> Network {
    let reporter = Arc::new(MemoryReporter::new());
    let manager =
        NetworkManager::with_reporter(config, Arc::clone(&reporter) as Arc<dyn ReportingSink>).unwrap();

    let mut names: Vec<&str> = links.iter().flat_map(|(a, b, _)| [*a, *b]).collect();
    names.sort();
    names.dedup();

    let agents = names
        .into_iter()
        .map(|name| {
            let agent = Arc::new(MockSiteAgent::new(name));
            manager
                .register_site(Site::new(name), Arc::clone(&agent) as Arc<dyn SiteAgent>)
                .unwrap();
            agent
        })
        .collect();
    for (a, b, capacity) in links {
        manager.add_static_link(LinkSpec::new(*a, *b, *capacity)).unwrap();
    }

    Network {
        manager,
        reporter,
        agents,
    }
}

#[tokio::test]
async fn test_relay_avoids_thin_direct_link() {
    let net = network(&[("A", "B", 10), ("B", "C", 5), ("A", "C", 3)], config());

    let status = net.request("A", "C", 4).await;
    assert!(status.is_completed(), "{:?}", status.cause);
    assert_eq!(
        status.path,
        Some(vec![SiteId::from("A"), SiteId::from("B"), SiteId::from("C")])
    );

    assert_eq!(net.link("A", "B").consumed, 4);
    assert_eq!(net.link("B", "C").consumed, 4);
    assert_eq!(net.link("A", "C").consumed, 0);
    assert_eq!(net.manager.take_key(&status.id).unwrap().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_contended_edge_never_oversold() {
    let net = network(&[("A", "B", 10)], config());

    let first = net.manager.submit(KeyRequest::new("A".into(), "B".into(), 6, Priority::Normal));
    let second = net.manager.submit(KeyRequest::new("A".into(), "B".into(), 6, Priority::Normal));

    let first = net.manager.wait_for_terminal(&first).await.unwrap();
    let second = net.manager.wait_for_terminal(&second).await.unwrap();

    let completed = [&first, &second].iter().filter(|s| s.is_completed()).count();
    assert_eq!(completed, 1);

    let loser = if first.is_completed() { &second } else { &first };
    assert!(
        matches!(
            loser.cause,
            Some(RelayError::Reservation(_)) | Some(RelayError::Path(PathError::NoFeasiblePath { .. }))
        ),
        "{:?}",
        loser.cause
    );

    let ab = net.link("A", "B");
    assert_eq!((ab.reserved, ab.consumed), (0, 6));
    assert_eq!(net.manager.reservations().active_count(), 0);
}

#[tokio::test]
async fn test_site_offline_mid_relay() {
    let net = network(
        &[("A", "B", 10), ("B", "C", 10), ("A", "D", 10), ("D", "C", 10)],
        config().with_relay(
            RelayConfig::default()
                .with_max_attempts(1)
                .with_agent_timeout(Duration::from_millis(500)),
        ),
    );
    net.agent("B").go_offline_at_commit(1);

    let failed = net.request("A", "C", 4).await;
    assert_eq!(
        failed.path,
        Some(vec![SiteId::from("A"), SiteId::from("B"), SiteId::from("C")])
    );
    assert!(matches!(
        failed.cause,
        Some(RelayError::Agent(AgentError::Unreachable(ref site))) if site.as_str() == "B"
    ));

    // Rollback discarded hop 0 and released everything
    assert_eq!(net.agent("A").discards_for(&failed.id), vec![0]);
    assert_eq!(net.link("A", "B").reserved, 0);
    assert_eq!(net.link("B", "C").reserved, 0);
    assert_eq!(net.manager.reservations().active_count(), 0);
    assert_eq!(
        net.manager.topology().site(&"B".into()).unwrap().status,
        SiteStatus::Offline
    );

    let retried = net.request("A", "C", 4).await;
    assert!(retried.is_completed(), "{:?}", retried.cause);
    assert_eq!(
        retried.path,
        Some(vec![SiteId::from("A"), SiteId::from("D"), SiteId::from("C")])
    );
}

#[tokio::test]
async fn test_transient_failure_retries_on_fresh_path() {
    let net = network(
        &[("A", "B", 10), ("B", "C", 10), ("A", "D", 10), ("D", "C", 10)],
        config(),
    );
    net.agent("B").go_offline_at_commit(1);

    let status = net.request("A", "C", 4).await;
    assert!(status.is_completed(), "{:?}", status.cause);
    assert_eq!(status.attempts, 2);
    assert_eq!(
        status.path,
        Some(vec![SiteId::from("A"), SiteId::from("D"), SiteId::from("C")])
    );

    let transitions = net.reporter.transitions_for(&status.id);
    assert_eq!(
        transitions.iter().filter(|state| **state == RequestState::Pathing).count(),
        2
    );
    assert_eq!(net.link("A", "B").consumed, 0);
    assert_eq!(net.link("A", "D").consumed, 4);
}

#[tokio::test]
async fn test_rollback_discards_every_committed_hop() {
    let net = network(
        &[("A", "B", 10), ("B", "C", 10), ("C", "D", 10)],
        config().with_relay(RelayConfig::default().with_max_attempts(1)),
    );
    net.agent("C").revoke_at_commit(2);

    let status = net.request("A", "D", 8).await;
    assert!(status.is_failed());
    assert!(matches!(
        status.cause,
        Some(RelayError::Agent(AgentError::CapacityRevoked { .. }))
    ));

    assert_eq!(net.agent("A").discards_for(&status.id), vec![0]);
    assert_eq!(net.agent("B").discards_for(&status.id), vec![1]);
    for agent in &net.agents {
        assert_eq!(agent.outstanding_tokens(), 0, "{} kept a token", agent.site_id());
    }
    for (a, b) in [("A", "B"), ("B", "C"), ("C", "D")] {
        let link = net.link(a, b);
        assert_eq!((link.reserved, link.consumed), (0, 0));
    }
    assert!(net.manager.take_key(&status.id).unwrap().is_none());
}

#[tokio::test]
async fn test_failed_rollback_quarantines_link() {
    let net = network(
        &[("A", "B", 10), ("B", "C", 10)],
        config().with_relay(RelayConfig::default().with_max_attempts(1)),
    );
    net.agent("A").fail_discards(true);
    net.agent("B").go_offline_at_commit(1);

    let status = net.request("A", "C", 4).await;
    assert!(matches!(status.cause, Some(RelayError::RollbackFailure { .. })));
    assert_eq!(net.link("A", "B").health, LinkHealth::Quarantined);
    assert_eq!(net.manager.reservations().active_count(), 0);

    assert!(net.reporter.events().iter().any(|event| matches!(
        event,
        ControllerEvent::LinkHealthChanged { health: LinkHealth::Quarantined, .. }
    )));

    // Nothing routes over the quarantined link until an operator restores it
    net.agent("B").set_offline(false);
    net.manager
        .report_health(qsdn_core::HealthReport::new("B".into(), SiteStatus::Online))
        .unwrap();
    let blocked = net.request("A", "B", 1).await;
    assert!(matches!(blocked.cause, Some(RelayError::Path(PathError::Unreachable { .. }))));

    net.manager
        .restore_link(&LinkId::between("A", "B").unwrap())
        .unwrap();
    assert!(net.request("A", "B", 1).await.is_completed());
}

#[tokio::test]
async fn test_structural_errors_are_not_retried() {
    let net = network(&[("A", "B", 10)], config());
    net.manager
        .register_site(Site::new("Z"), Arc::new(MockSiteAgent::new("Z")))
        .unwrap();

    let unreachable = net.request("A", "Z", 1).await;
    assert_eq!(unreachable.attempts, 1);
    assert!(matches!(unreachable.cause, Some(RelayError::Path(PathError::Unreachable { .. }))));

    let unknown = net.request("A", "nowhere", 1).await;
    assert!(matches!(unknown.cause, Some(RelayError::Path(PathError::UnknownSite(_)))));

    let oversized = net.request("A", "B", 11).await;
    assert!(matches!(
        oversized.cause,
        Some(RelayError::Path(PathError::NoFeasiblePath { .. }))
    ));
}

#[tokio::test]
async fn test_cancel_through_service() {
    let net = network(
        &[("A", "B", 10), ("B", "C", 10)],
        config().with_relay(RelayConfig::default().with_agent_timeout(Duration::from_secs(60))),
    );
    net.agent("B").set_commit_delay(Duration::from_secs(30));

    let id = net
        .manager
        .submit_key_request("A".into(), "C".into(), 4, Priority::Normal)
        .await
        .unwrap();
    while net.agent("A").commits_for(&id).is_empty() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert!(net.manager.cancel_request(&id).await.unwrap());
    let status = net.manager.wait_for_terminal(&id).await.unwrap();
    assert!(status.is_failed());
    assert_eq!(net.agent("A").discards_for(&id), vec![0]);

    // A finished request cannot be cancelled again
    assert!(!net.manager.cancel_request(&id).await.unwrap());
    assert_eq!(net.manager.get_request_status(&id).unwrap().state, RequestState::Failed);
}

/// Deregisters a site the first time capacity is reserved next to it
struct DeregisterOnReserve {
    events: MemoryReporter,
    site: SiteId,
    fired: AtomicBool,
    manager: OnceLock<Weak<NetworkManager>>,
    removal: Mutex<Option<SiteRemoval>>,
}

impl ReportingSink for DeregisterOnReserve {
    fn report(&self, event: ControllerEvent) {
        let reserved_here = matches!(
            &event,
            ControllerEvent::LinkCapacityChanged { link, reserved, .. }
                if *reserved > 0 && link.touches(&self.site)
        );
        self.events.report(event);

        if reserved_here && !self.fired.swap(true, Ordering::SeqCst) {
            let manager = self.manager.get().and_then(Weak::upgrade).unwrap();
            let removal = manager.unregister_site(&self.site).unwrap();
            *self.removal.lock().unwrap() = Some(removal);
        }
    }
}

#[tokio::test]
async fn test_deregistration_during_reservation_cancels_request() {
    let sink = Arc::new(DeregisterOnReserve {
        events: MemoryReporter::new(),
        site: "B".into(),
        fired: AtomicBool::new(false),
        manager: OnceLock::new(),
        removal: Mutex::new(None),
    });
    let manager = Arc::new(
        NetworkManager::with_reporter(config(), Arc::clone(&sink) as Arc<dyn ReportingSink>).unwrap(),
    );
    sink.manager.set(Arc::downgrade(&manager)).unwrap();

    let mut agents = Vec::new();
    for name in ["A", "B", "C"] {
        let agent = Arc::new(MockSiteAgent::new(name));
        manager
            .register_site(Site::new(name), Arc::clone(&agent) as Arc<dyn SiteAgent>)
            .unwrap();
        agents.push(agent);
    }
    for (a, b) in [("A", "B"), ("B", "C")] {
        manager.add_static_link(LinkSpec::new(a, b, 10)).unwrap();
    }

    let id = manager.submit(KeyRequest::new("A".into(), "C".into(), 4, Priority::Normal));
    let status = manager.wait_for_terminal(&id).await.unwrap();

    // B left while its capacity was held, so removal waited for the release
    assert_eq!(*sink.removal.lock().unwrap(), Some(SiteRemoval::Deferred));
    assert!(status.is_failed());
    assert_eq!(
        status.cause,
        Some(RelayError::Cancelled(CancelReason::SiteDeregistered("B".into())))
    );

    assert!(agents[1].commits_for(&id).is_empty());
    for agent in &agents {
        assert_eq!(agent.outstanding_tokens(), 0, "{} kept a token", agent.site_id());
    }
    assert_eq!(manager.reservations().active_count(), 0);
    assert!(!manager.topology().contains_site(&"B".into()));
    assert_eq!(manager.registered_sites(), vec![SiteId::from("A"), SiteId::from("C")]);
    assert!(manager.take_key(&id).unwrap().is_none());
}

#[tokio::test]
async fn test_reservation_expiry_mid_relay_rolls_back() {
    let net = network(
        &[("A", "B", 10), ("B", "C", 10)],
        config()
            .with_relay(
                RelayConfig::default()
                    .with_max_attempts(1)
                    .with_agent_timeout(Duration::from_secs(2)),
            )
            .with_reservation(
                ReservationConfig::default()
                    .with_ttl(Duration::from_millis(50))
                    .with_sweep_interval(Duration::from_millis(10)),
            ),
    );
    net.agent("B").set_commit_delay(Duration::from_millis(400));
    net.manager.start().unwrap();

    let status = net.request("A", "C", 4).await;
    assert!(status.is_failed());
    assert_eq!(
        status.cause,
        Some(RelayError::Cancelled(CancelReason::ReservationExpired))
    );

    // Hop 0 was committed, hop 1 was abandoned mid-commit
    assert_eq!(net.agent("A").discards_for(&status.id), vec![0]);
    assert_eq!(net.agent("B").discards_for(&status.id), vec![1]);
    for (a, b) in [("A", "B"), ("B", "C")] {
        let link = net.link(a, b);
        assert_eq!((link.reserved, link.consumed), (0, 0), "{}", link.id);
    }
    assert_eq!(net.manager.reservations().active_count(), 0);
    for agent in &net.agents {
        assert_eq!(agent.outstanding_tokens(), 0, "{} kept a token", agent.site_id());
    }

    net.manager.shutdown().await;
}

#[tokio::test]
async fn test_past_deadline_fails_fast() {
    let net = network(&[("A", "B", 10)], config());
    let request = KeyRequest::new("A".into(), "B".into(), 4, Priority::Normal)
        .with_deadline(chrono::Utc::now() - chrono::Duration::seconds(1));

    let id = net.manager.submit(request);
    let status = net.manager.wait_for_terminal(&id).await.unwrap();
    assert!(matches!(status.cause, Some(RelayError::DeadlineExceeded)));
    assert_eq!(net.link("A", "B").reserved, 0);
}

#[test]
fn test_path_ranking_is_deterministic() {
    let net = network(
        &[("A", "B", 10), ("B", "D", 10), ("A", "C", 10), ("C", "D", 10), ("A", "D", 2)],
        ControllerConfig::default(),
    );
    let finder = PathFinder::new(PathPolicy::default());
    let snapshot = net.manager.topology().snapshot();

    let first = finder.find_paths(&snapshot, &"A".into(), &"D".into(), 4).unwrap();
    let again = finder.find_paths(&snapshot, &"A".into(), &"D".into(), 4).unwrap();
    assert_eq!(first, again);

    let ranked: Vec<Vec<SiteId>> = first.into_iter().map(|path| path.sites).collect();
    assert_eq!(
        ranked,
        vec![
            vec!["A".into(), "B".into(), "D".into()],
            vec!["A".into(), "C".into(), "D".into()],
        ]
    );
}
