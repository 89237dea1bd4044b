//! Topology graph
//!
//! Sites are nodes, quantum links are undirected edges carrying live
//! key-pool accounting. The graph itself sits behind a read-write lock;
//! each link's [`LinkState`] sits behind its own mutex so the reservation
//! manager can claim capacity on several links without locking the whole
//! graph.
//!
//! Path searches never look at the live graph. They run against a
//! [`TopologySnapshot`], an immutable copy stamped with the version counter
//! that every mutation bumps.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use qsdn_core::{
    ControllerEvent, LinkHealth, LinkId, LinkParams, LinkState, NullReporter, PoolState,
    ReportingSink, ReservationError, Site, SiteId, SiteStatus, TopologyError,
};
use tracing::{debug, info, instrument, warn};

/// Shared handle to one link's live state
pub type LinkHandle = Arc<Mutex<LinkState>>;

/// Outcome of [`TopologyGraph::remove_site`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteRemoval {
    /// The site and its links are gone
    Removed,
    /// The site is still referenced by reservations; it is offline and will
    /// be deleted when the last one is released
    Deferred,
}

#[derive(Debug)]
struct SiteEntry {
    site: Site,
    /// Live reservations whose path includes this site
    holds: usize,
    removing: bool,
}

#[derive(Debug, Default)]
struct Graph {
    sites: BTreeMap<SiteId, SiteEntry>,
    links: BTreeMap<LinkId, LinkHandle>,
}

impl Graph {
    /// Delete a site and every link touching it
    fn purge_site(&mut self, id: &SiteId) {
        self.sites.remove(id);
        self.links.retain(|link, _| !link.touches(id));
    }
}

/// Process-wide model of the QKD network
pub struct TopologyGraph {
    graph: RwLock<Graph>,
    version: AtomicU64,
    reporter: Arc<dyn ReportingSink>,
}

impl Default for TopologyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyGraph {
    /// Create an empty graph that reports nowhere
    pub fn new() -> Self {
        Self {
            graph: RwLock::new(Graph::default()),
            version: AtomicU64::new(0),
            reporter: Arc::new(NullReporter),
        }
    }

    /// Send topology events to `reporter`
    pub fn with_reporter(mut self, reporter: Arc<dyn ReportingSink>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Current version; bumped by every mutation
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub(crate) fn bump_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn reporter(&self) -> &Arc<dyn ReportingSink> {
        &self.reporter
    }

    /// Add a site, or refresh the capabilities and devices of a known one
    ///
    /// Returns `true` if the site was not known before. Re-adding a site
    /// that is pending removal cancels the removal.
    #[instrument(skip(self, site), fields(site = %site.id))]
    pub fn add_site(&self, site: Site) -> bool {
        let id = site.id.clone();
        let added = {
            let mut graph = self.graph.write();
            match graph.sites.get_mut(&id) {
                Some(entry) => {
                    entry.site = site;
                    entry.removing = false;
                    false
                }
                None => {
                    graph.sites.insert(
                        id.clone(),
                        SiteEntry {
                            site,
                            holds: 0,
                            removing: false,
                        },
                    );
                    true
                }
            }
        };
        self.bump_version();

        if added {
            info!("Site added");
            self.reporter.report(ControllerEvent::site_registered(id));
        } else {
            debug!("Site refreshed");
        }
        added
    }

    /// Remove a site and its links
    ///
    /// A site still referenced by live reservations is marked offline and
    /// deleted once the last of them is released.
    #[instrument(skip(self), fields(site = %id))]
    pub fn remove_site(&self, id: &SiteId) -> Result<SiteRemoval, TopologyError> {
        let outcome = {
            let mut graph = self.graph.write();
            let entry = graph
                .sites
                .get_mut(id)
                .ok_or_else(|| TopologyError::UnknownSite(id.clone()))?;

            if entry.holds > 0 {
                entry.removing = true;
                let changed = entry.site.status != SiteStatus::Offline;
                entry.site.status = SiteStatus::Offline;
                (SiteRemoval::Deferred, changed)
            } else {
                graph.purge_site(id);
                (SiteRemoval::Removed, false)
            }
        };
        self.bump_version();

        match outcome {
            (SiteRemoval::Deferred, changed) => {
                info!("Site removal deferred until its reservations are released");
                if changed {
                    self.reporter
                        .report(ControllerEvent::site_status(id.clone(), SiteStatus::Offline));
                }
                Ok(SiteRemoval::Deferred)
            }
            (SiteRemoval::Removed, _) => {
                info!("Site removed");
                self.reporter.report(ControllerEvent::site_removed(id.clone()));
                Ok(SiteRemoval::Removed)
            }
        }
    }

    /// Update a site's operational status
    ///
    /// Returns `true` if the status changed. A site pending removal stays
    /// offline.
    pub fn set_site_status(&self, id: &SiteId, status: SiteStatus) -> Result<bool, TopologyError> {
        let changed = {
            let mut graph = self.graph.write();
            let entry = graph
                .sites
                .get_mut(id)
                .ok_or_else(|| TopologyError::UnknownSite(id.clone()))?;
            if entry.removing || entry.site.status == status {
                false
            } else {
                entry.site.status = status;
                true
            }
        };

        if changed {
            self.bump_version();
            debug!(site = %id, status = %status, "Site status updated");
            self.reporter
                .report(ControllerEvent::site_status(id.clone(), status));
        }
        Ok(changed)
    }

    pub fn site(&self, id: &SiteId) -> Option<Site> {
        self.graph.read().sites.get(id).map(|entry| entry.site.clone())
    }

    pub fn contains_site(&self, id: &SiteId) -> bool {
        self.graph.read().sites.contains_key(id)
    }

    /// All sites, in id order
    pub fn sites(&self) -> Vec<Site> {
        self.graph
            .read()
            .sites
            .values()
            .map(|entry| entry.site.clone())
            .collect()
    }

    /// Whether a site is waiting for its reservations to drain
    pub fn is_removing(&self, id: &SiteId) -> bool {
        self.graph
            .read()
            .sites
            .get(id)
            .is_some_and(|entry| entry.removing)
    }

    /// Number of live reservations whose path includes `id`
    pub fn holds(&self, id: &SiteId) -> usize {
        self.graph
            .read()
            .sites
            .get(id)
            .map_or(0, |entry| entry.holds)
    }

    /// Add a link, or apply new parameters to an existing one
    ///
    /// New links start active. Existing links keep their health and
    /// accounting; shrinking capacity below the reserved amount fails.
    pub fn add_or_update_link(
        &self,
        a: &SiteId,
        b: &SiteId,
        params: LinkParams,
    ) -> Result<LinkId, TopologyError> {
        self.upsert_link(a, b, params, LinkHealth::Active)
    }

    /// Like [`add_or_update_link`](Self::add_or_update_link), but a newly
    /// created link starts with `health`
    pub fn add_link_with_health(
        &self,
        a: &SiteId,
        b: &SiteId,
        params: LinkParams,
        health: LinkHealth,
    ) -> Result<LinkId, TopologyError> {
        self.upsert_link(a, b, params, health)
    }

    #[instrument(skip(self, params, initial), fields(a = %a, b = %b, capacity = params.capacity))]
    fn upsert_link(
        &self,
        a: &SiteId,
        b: &SiteId,
        params: LinkParams,
        initial: LinkHealth,
    ) -> Result<LinkId, TopologyError> {
        let id = LinkId::new(a.clone(), b.clone()).ok_or_else(|| TopologyError::SelfLoop(a.clone()))?;

        let event = {
            let mut graph = self.graph.write();
            for site in [a, b] {
                match graph.sites.get(site) {
                    None => return Err(TopologyError::UnknownSite(site.clone())),
                    Some(entry) if entry.removing => {
                        return Err(TopologyError::SiteRemoving(site.clone()));
                    }
                    Some(_) => {}
                }
            }

            match graph.links.get(&id) {
                Some(handle) => {
                    let mut state = handle.lock();
                    state
                        .apply_params(params)
                        .map_err(|reserved| TopologyError::CapacityBelowReserved {
                            link: id.clone(),
                            capacity: params.capacity,
                            reserved,
                        })?;
                    debug!("Link updated");
                    ControllerEvent::capacity_changed(&state)
                }
                None => {
                    let mut state = LinkState::new(id.clone(), params);
                    state.health = initial;
                    let event = ControllerEvent::capacity_changed(&state);
                    graph.links.insert(id.clone(), Arc::new(Mutex::new(state)));
                    info!(health = %initial, "Link added");
                    event
                }
            }
        };
        self.bump_version();
        self.reporter.report(event);
        Ok(id)
    }

    /// Change a link's health
    ///
    /// Returns `true` if the health changed.
    pub fn set_link_health(&self, id: &LinkId, health: LinkHealth) -> Result<bool, TopologyError> {
        let handle = self
            .link_handle(id)
            .ok_or_else(|| TopologyError::UnknownLink(id.clone()))?;
        let changed = {
            let mut state = handle.lock();
            if state.health == health {
                false
            } else {
                state.health = health;
                true
            }
        };

        if changed {
            self.bump_version();
            if health == LinkHealth::Quarantined {
                warn!(link = %id, "Link quarantined");
            } else {
                debug!(link = %id, health = %health, "Link health updated");
            }
            self.reporter
                .report(ControllerEvent::link_health(id.clone(), health));
        }
        Ok(changed)
    }

    /// Take rate and latency from an agent's pool report
    ///
    /// Capacity accounting is left alone; the controller is the authority
    /// on what is reserved.
    pub fn update_link_metrics(&self, pool: &PoolState) -> Result<(), TopologyError> {
        let handle = self
            .link_handle(&pool.link)
            .ok_or_else(|| TopologyError::UnknownLink(pool.link.clone()))?;
        {
            let mut state = handle.lock();
            state.rate_bits_per_sec = pool.rate_bits_per_sec.max(0.0);
            state.latency = pool.latency();
        }
        self.bump_version();
        Ok(())
    }

    /// Copy of one link's state
    pub fn link(&self, id: &LinkId) -> Option<LinkState> {
        self.link_handle(id).map(|handle| handle.lock().clone())
    }

    /// Copies of every link's state, in id order
    pub fn links(&self) -> Vec<LinkState> {
        self.link_handles()
            .iter()
            .map(|handle| handle.lock().clone())
            .collect()
    }

    /// Links with `site` as an endpoint
    pub fn links_of(&self, site: &SiteId) -> Vec<LinkId> {
        self.graph
            .read()
            .links
            .keys()
            .filter(|link| link.touches(site))
            .cloned()
            .collect()
    }

    /// Check `reserved + consumed <= capacity` on every link
    pub fn is_consistent(&self) -> bool {
        self.link_handles()
            .iter()
            .all(|handle| handle.lock().is_consistent())
    }

    pub(crate) fn link_handle(&self, id: &LinkId) -> Option<LinkHandle> {
        self.graph.read().links.get(id).cloned()
    }

    pub(crate) fn link_handles(&self) -> Vec<LinkHandle> {
        self.graph.read().links.values().cloned().collect()
    }

    /// Pin every site of a path for the lifetime of a reservation
    pub(crate) fn hold_sites(&self, sites: &[SiteId]) -> Result<(), ReservationError> {
        let mut graph = self.graph.write();
        for site in sites {
            match graph.sites.get(site) {
                Some(entry) if !entry.removing && entry.site.status.is_usable() => {}
                _ => return Err(ReservationError::SiteUnavailable(site.clone())),
            }
        }
        for site in sites {
            if let Some(entry) = graph.sites.get_mut(site) {
                entry.holds += 1;
            }
        }
        Ok(())
    }

    /// Drop the holds taken by [`hold_sites`](Self::hold_sites)
    ///
    /// Completes any removal that was waiting on them and returns the sites
    /// that were deleted.
    pub(crate) fn release_sites(&self, sites: &[SiteId]) -> Vec<SiteId> {
        let removed: Vec<SiteId> = {
            let mut graph = self.graph.write();
            let mut removed = Vec::new();
            for site in sites {
                if let Some(entry) = graph.sites.get_mut(site) {
                    entry.holds = entry.holds.saturating_sub(1);
                    if entry.holds == 0 && entry.removing {
                        removed.push(site.clone());
                    }
                }
            }
            for site in &removed {
                graph.purge_site(site);
            }
            removed
        };

        if !removed.is_empty() {
            self.bump_version();
            for site in &removed {
                info!(site = %site, "Deferred site removal completed");
                self.reporter.report(ControllerEvent::site_removed(site.clone()));
            }
        }
        removed
    }

    /// Immutable, versioned copy of the graph
    pub fn snapshot(&self) -> TopologySnapshot {
        let graph = self.graph.read();
        let version = self.version();

        let sites: BTreeMap<SiteId, Site> = graph
            .sites
            .iter()
            .map(|(id, entry)| (id.clone(), entry.site.clone()))
            .collect();
        let links: BTreeMap<LinkId, LinkState> = graph
            .links
            .iter()
            .map(|(id, handle)| (id.clone(), handle.lock().clone()))
            .collect();

        let mut adjacency: BTreeMap<SiteId, Vec<(SiteId, LinkId)>> =
            sites.keys().map(|id| (id.clone(), Vec::new())).collect();
        for id in links.keys() {
            let (low, high) = id.endpoints();
            if let Some(neighbors) = adjacency.get_mut(low) {
                neighbors.push((high.clone(), id.clone()));
            }
            if let Some(neighbors) = adjacency.get_mut(high) {
                neighbors.push((low.clone(), id.clone()));
            }
        }
        for neighbors in adjacency.values_mut() {
            neighbors.sort();
        }

        TopologySnapshot {
            version,
            sites,
            links,
            adjacency,
        }
    }
}

/// Immutable view of the topology at one version
#[derive(Debug, Clone)]
pub struct TopologySnapshot {
    version: u64,
    sites: BTreeMap<SiteId, Site>,
    links: BTreeMap<LinkId, LinkState>,
    /// Neighbors of each site, sorted by neighbor id
    adjacency: BTreeMap<SiteId, Vec<(SiteId, LinkId)>>,
}

impl TopologySnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn site(&self, id: &SiteId) -> Option<&Site> {
        self.sites.get(id)
    }

    pub fn link(&self, id: &LinkId) -> Option<&LinkState> {
        self.links.get(id)
    }

    pub fn sites(&self) -> impl Iterator<Item = &Site> {
        self.sites.values()
    }

    pub fn links(&self) -> impl Iterator<Item = &LinkState> {
        self.links.values()
    }

    /// Neighbors of `id` with the link reaching each, sorted by neighbor id
    pub fn neighbors<'a>(
        &'a self,
        id: &SiteId,
    ) -> impl Iterator<Item = (&'a SiteId, &'a LinkState)> + use<'a> {
        self.adjacency
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|(neighbor, link)| self.links.get(link).map(|state| (neighbor, state)))
    }
}
