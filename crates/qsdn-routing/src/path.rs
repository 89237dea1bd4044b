//! Relay path computation
//!
//! [`PathFinder`] ranks the simple paths between two sites that can carry a
//! requested amount of key. Paths are ordered by
//!
//! ```text
//! cost = Σ latency_ms + α · hop_count − β · bottleneck
//! ```
//!
//! where the bottleneck is the smallest available capacity along the path.
//! Ties go to the path with fewer hops, then to the lexicographically
//! smallest sequence of site ids.
//!
//! ## Search
//!
//! A best-first search over partial paths, keyed by the cost of the prefix.
//! Extending a prefix never lowers its cost (latency and hops only grow and
//! the bottleneck only shrinks), so complete paths leave the queue already
//! in rank order and the search stops as soon as enough have been found.
//! Edges that cannot carry the amount are pruned on expansion.
//!
//! Before searching, a capacity-blind reachability pass tells a
//! disconnected pair ([`PathError::Unreachable`]) apart from a connected
//! pair with no capacity ([`PathError::NoFeasiblePath`]).

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap, VecDeque};
use std::fmt;

use qsdn_core::{LinkId, LinkState, PathError, Site, SiteId};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use crate::topology::TopologySnapshot;

/// Weights and bounds for path ranking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathPolicy {
    /// Cost per hop, in latency-milliseconds
    pub alpha: f64,
    /// Credit per bit of bottleneck capacity, in latency-milliseconds
    pub beta: f64,
    /// Maximum number of ranked candidates to return
    pub max_candidates: usize,
    /// Longest path considered, in hops
    pub max_hops: usize,
    /// Cap on partial paths expanded per search
    pub max_expansions: usize,
}

impl Default for PathPolicy {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 0.01,
            max_candidates: 4,
            max_hops: 16,
            max_expansions: 100_000,
        }
    }
}

impl PathPolicy {
    pub fn with_weights(mut self, alpha: f64, beta: f64) -> Self {
        self.alpha = alpha;
        self.beta = beta;
        self
    }

    pub fn with_max_candidates(mut self, max_candidates: usize) -> Self {
        self.max_candidates = max_candidates;
        self
    }

    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }
}

/// A ranked candidate path
#[derive(Debug, Clone, PartialEq)]
pub struct RelayPath {
    /// Sites from source to destination
    pub sites: Vec<SiteId>,
    /// `links[i]` joins `sites[i]` and `sites[i + 1]`
    pub links: Vec<LinkId>,
    /// Bits to reserve on every link
    pub amount: u64,
    pub cost: f64,
    pub latency_ms: u64,
    /// Smallest available capacity along the path when it was computed
    pub bottleneck: u64,
}

impl RelayPath {
    pub fn hop_count(&self) -> usize {
        self.links.len()
    }

    pub fn source(&self) -> &SiteId {
        &self.sites[0]
    }

    pub fn destination(&self) -> &SiteId {
        &self.sites[self.sites.len() - 1]
    }

    /// `(from, to, link)` for every hop, in path order
    pub fn hops(&self) -> impl Iterator<Item = (&SiteId, &SiteId, &LinkId)> {
        self.links
            .iter()
            .enumerate()
            .map(|(i, link)| (&self.sites[i], &self.sites[i + 1], link))
    }

    pub fn contains_site(&self, site: &SiteId) -> bool {
        self.sites.contains(site)
    }

    pub fn contains_link(&self, link: &LinkId) -> bool {
        self.links.contains(link)
    }
}

impl fmt::Display for RelayPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, site) in self.sites.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{}", site)?;
        }
        Ok(())
    }
}

/// A partial path waiting in the search frontier
#[derive(Debug, Clone)]
struct Frontier {
    cost: f64,
    sites: Vec<SiteId>,
    links: Vec<LinkId>,
    latency_ms: u64,
    bottleneck: u64,
    complete: bool,
}

impl Frontier {
    fn hops(&self) -> usize {
        self.links.len()
    }

    fn tip(&self) -> &SiteId {
        &self.sites[self.sites.len() - 1]
    }
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Frontier {}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cost
            .total_cmp(&other.cost)
            .then_with(|| self.hops().cmp(&other.hops()))
            .then_with(|| self.sites.cmp(&other.sites))
    }
}

/// Ranked path search over topology snapshots
#[derive(Debug, Clone, Default)]
pub struct PathFinder {
    policy: PathPolicy,
}

impl PathFinder {
    pub fn new(policy: PathPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PathPolicy {
        &self.policy
    }

    fn cost(&self, latency_ms: u64, hops: usize, bottleneck: u64) -> f64 {
        // Negative weights would break the monotone prefix bound
        let alpha = self.policy.alpha.max(0.0);
        let beta = self.policy.beta.max(0.0);
        latency_ms as f64 + alpha * hops as f64 - beta * bottleneck as f64
    }

    /// Rank the feasible simple paths from `source` to `destination`
    ///
    /// Identical snapshots and arguments always produce identical output.
    #[instrument(skip(self, snapshot), fields(version = snapshot.version()))]
    pub fn find_paths(
        &self,
        snapshot: &TopologySnapshot,
        source: &SiteId,
        destination: &SiteId,
        amount: u64,
    ) -> Result<Vec<RelayPath>, PathError> {
        let origin = snapshot
            .site(source)
            .ok_or_else(|| PathError::UnknownSite(source.clone()))?;
        let target = snapshot
            .site(destination)
            .ok_or_else(|| PathError::UnknownSite(destination.clone()))?;
        if source == destination {
            return Err(PathError::InvalidRequest(format!(
                "source and destination are both {}",
                source
            )));
        }
        if amount == 0 {
            return Err(PathError::InvalidRequest("amount must be positive".into()));
        }
        for site in [origin, target] {
            if !site.capabilities.has_key_source {
                return Err(PathError::InvalidRequest(format!(
                    "site {} has no key source",
                    site.id
                )));
            }
        }

        if !self.reachable(snapshot, source, destination) {
            debug!("Destination unreachable");
            return Err(PathError::Unreachable {
                origin: source.clone(),
                destination: destination.clone(),
            });
        }

        let paths = self.search(snapshot, source, destination, amount);
        if paths.is_empty() {
            debug!("No feasible path");
            return Err(PathError::NoFeasiblePath {
                origin: source.clone(),
                destination: destination.clone(),
                amount,
            });
        }

        debug!(candidates = paths.len(), best = %paths[0], "Paths ranked");
        Ok(paths)
    }

    /// Whether a path could be routed through `site` toward `destination`
    fn can_enter(site: &Site, destination: &SiteId) -> bool {
        site.status.is_usable() && (&site.id == destination || site.capabilities.can_relay)
    }

    fn usable_edge(link: &LinkState) -> bool {
        link.is_active()
    }

    /// Capacity-blind breadth-first reachability
    fn reachable(&self, snapshot: &TopologySnapshot, source: &SiteId, destination: &SiteId) -> bool {
        let Some(origin) = snapshot.site(source) else {
            return false;
        };
        if !origin.status.is_usable() {
            return false;
        }

        let mut seen: BTreeSet<&SiteId> = BTreeSet::new();
        let mut queue: VecDeque<&SiteId> = VecDeque::new();
        seen.insert(source);
        queue.push_back(source);

        while let Some(current) = queue.pop_front() {
            if current == destination {
                return true;
            }
            for (neighbor, link) in snapshot.neighbors(current) {
                if seen.contains(neighbor) || !Self::usable_edge(link) {
                    continue;
                }
                let Some(site) = snapshot.site(neighbor) else {
                    continue;
                };
                if Self::can_enter(site, destination) {
                    seen.insert(neighbor);
                    queue.push_back(neighbor);
                }
            }
        }
        false
    }

    fn search(
        &self,
        snapshot: &TopologySnapshot,
        source: &SiteId,
        destination: &SiteId,
        amount: u64,
    ) -> Vec<RelayPath> {
        let mut results = Vec::new();
        let mut heap = BinaryHeap::new();
        heap.push(Reverse(Frontier {
            cost: self.cost(0, 0, u64::MAX),
            sites: vec![source.clone()],
            links: Vec::new(),
            latency_ms: 0,
            bottleneck: u64::MAX,
            complete: false,
        }));

        let mut expansions = 0usize;
        while let Some(Reverse(entry)) = heap.pop() {
            if entry.complete {
                trace!(cost = entry.cost, hops = entry.hops(), "Candidate found");
                results.push(RelayPath {
                    sites: entry.sites,
                    links: entry.links,
                    amount,
                    cost: entry.cost,
                    latency_ms: entry.latency_ms,
                    bottleneck: entry.bottleneck,
                });
                if results.len() >= self.policy.max_candidates {
                    break;
                }
                continue;
            }

            expansions += 1;
            if expansions > self.policy.max_expansions {
                debug!(expansions, "Search budget exhausted");
                break;
            }
            if entry.hops() >= self.policy.max_hops {
                continue;
            }

            for (neighbor, link) in snapshot.neighbors(entry.tip()) {
                if entry.sites.contains(neighbor)
                    || !Self::usable_edge(link)
                    || link.available() < amount
                {
                    continue;
                }
                let Some(site) = snapshot.site(neighbor) else {
                    continue;
                };
                if !Self::can_enter(site, destination) {
                    continue;
                }

                let latency_ms = entry
                    .latency_ms
                    .saturating_add(link.latency.as_millis() as u64);
                let bottleneck = entry.bottleneck.min(link.available());
                let mut sites = entry.sites.clone();
                sites.push(neighbor.clone());
                let mut links = entry.links.clone();
                links.push(link.id.clone());

                heap.push(Reverse(Frontier {
                    cost: self.cost(latency_ms, links.len(), bottleneck),
                    complete: neighbor == destination,
                    sites,
                    links,
                    latency_ms,
                    bottleneck,
                }));
            }
        }
        results
    }
}
