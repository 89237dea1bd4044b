//! Registry of site agents
//!
//! Deregistering a site retires its agent instead of dropping it: a relay
//! that was routed through the site may still need the agent to discard a
//! committed hop. Retired agents are pruned once the topology has let go of
//! the site.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use qsdn_core::{SiteAgent, SiteId};
use tracing::debug;

struct AgentEntry {
    agent: Arc<dyn SiteAgent>,
    registered_at: DateTime<Utc>,
    last_report: Option<DateTime<Utc>>,
    retired: bool,
}

/// Site agents known to the controller
#[derive(Default)]
pub struct AgentRegistry {
    agents: DashMap<SiteId, AgentEntry>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `agent` for its site, replacing any previous agent
    ///
    /// Returns `true` if the site had no live agent before.
    pub fn register(&self, agent: Arc<dyn SiteAgent>) -> bool {
        let site = agent.site_id().clone();
        let previous = self.agents.insert(
            site.clone(),
            AgentEntry {
                agent,
                registered_at: Utc::now(),
                last_report: None,
                retired: false,
            },
        );
        let fresh = previous.is_none_or(|entry| entry.retired);
        debug!(site = %site, fresh, "Agent registered");
        fresh
    }

    /// Stop offering the agent for new work; it stays reachable for cleanup
    pub fn retire(&self, site: &SiteId) -> bool {
        match self.agents.get_mut(site) {
            Some(mut entry) if !entry.retired => {
                entry.retired = true;
                debug!(site = %site, "Agent retired");
                true
            }
            _ => false,
        }
    }

    /// The agent for `site`, retired or not
    pub fn get(&self, site: &SiteId) -> Option<Arc<dyn SiteAgent>> {
        self.agents.get(site).map(|entry| Arc::clone(&entry.agent))
    }

    pub fn is_registered(&self, site: &SiteId) -> bool {
        self.agents.get(site).is_some_and(|entry| !entry.retired)
    }

    /// Sites with a live agent, sorted
    pub fn active_sites(&self) -> Vec<SiteId> {
        let mut sites: Vec<SiteId> = self
            .agents
            .iter()
            .filter(|entry| !entry.retired)
            .map(|entry| entry.key().clone())
            .collect();
        sites.sort();
        sites
    }

    pub fn registered_at(&self, site: &SiteId) -> Option<DateTime<Utc>> {
        self.agents.get(site).map(|entry| entry.registered_at)
    }

    /// Note that the agent of `site` pushed a health report
    pub fn record_report(&self, site: &SiteId) -> bool {
        match self.agents.get_mut(site) {
            Some(mut entry) if !entry.retired => {
                entry.last_report = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    pub fn last_report(&self, site: &SiteId) -> Option<DateTime<Utc>> {
        self.agents.get(site).and_then(|entry| entry.last_report)
    }

    /// Drop retired agents for which `keep` returns `false`
    pub fn prune(&self, keep: impl Fn(&SiteId) -> bool) -> Vec<SiteId> {
        let mut pruned = Vec::new();
        self.agents.retain(|site, entry| {
            let drop = entry.retired && !keep(site);
            if drop {
                pruned.push(site.clone());
            }
            !drop
        });
        if !pruned.is_empty() {
            debug!(count = pruned.len(), "Pruned retired agents");
        }
        pruned
    }

    /// Number of live agents
    pub fn len(&self) -> usize {
        self.agents.iter().filter(|entry| !entry.retired).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
