//! Settings file for the manager binary
//!
//! ```toml
//! [controller]
//! max_concurrent_requests = 32
//!
//! [controller.relay]
//! max_attempts = 3
//!
//! [[sites]]
//! id = "alice"
//! devices = ["qkd-alice-0"]
//!
//! [[links]]
//! a = "alice"
//! b = "relay-1"
//! capacity = 65536
//!
//! [[requests]]
//! source = "alice"
//! destination = "bob"
//! amount = 256
//! ```

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use qsdn_core::{
    DeviceId, KeyRequest, LinkSpec, MockSiteAgent, Priority, Site, SiteCapabilities, SiteId,
};
use qsdn_logging::LogConfig;
use qsdn_routing::ControllerConfig;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub controller: ControllerConfig,
    /// Overrides the logging defaults; command-line flags still win
    pub logging: Option<LogConfig>,
    pub sites: Vec<SiteSettings>,
    pub links: Vec<LinkSpec>,
    pub requests: Vec<RequestSettings>,
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteSettings {
    pub id: SiteId,
    #[serde(default = "enabled")]
    pub can_relay: bool,
    #[serde(default = "enabled")]
    pub has_key_source: bool,
    #[serde(default)]
    pub devices: Vec<DeviceId>,
    /// Key pool per link held by the site's in-process agent; unlimited when unset
    #[serde(default)]
    pub pool_bits: Option<u64>,
}

impl SiteSettings {
    pub fn site(&self) -> Site {
        let mut site = Site::new(self.id.clone()).with_capabilities(SiteCapabilities {
            can_relay: self.can_relay,
            has_key_source: self.has_key_source,
        });
        site.devices = self.devices.clone();
        site
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestSettings {
    pub source: SiteId,
    pub destination: SiteId,
    pub amount: u64,
    #[serde(default)]
    pub priority: Priority,
    /// Relative deadline, counted from submission
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl RequestSettings {
    pub fn to_request(&self) -> KeyRequest {
        let request = KeyRequest::new(
            self.source.clone(),
            self.destination.clone(),
            self.amount,
            self.priority,
        );
        let deadline = self.deadline_ms.and_then(|ms| {
            let ms = i64::try_from(ms).ok()?;
            chrono::Utc::now().checked_add_signed(chrono::Duration::milliseconds(ms))
        });
        match deadline {
            Some(deadline) => request.with_deadline(deadline),
            None => request,
        }
    }
}

impl Settings {
    /// Read and check a settings file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        let settings: Settings =
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.controller.validate().context("invalid [controller] section")?;

        let mut sites = BTreeSet::new();
        for site in &self.sites {
            if !sites.insert(&site.id) {
                bail!("site {} is declared twice", site.id);
            }
        }

        let mut links = BTreeSet::new();
        for link in &self.links {
            let Some(id) = link.link_id() else {
                bail!("link from {} to itself", link.a);
            };
            for end in [&link.a, &link.b] {
                if !sites.contains(end) {
                    bail!("link {} names unknown site {}", id, end);
                }
            }
            if !links.insert(id.clone()) {
                bail!("link {} is declared twice", id);
            }
        }

        for request in &self.requests {
            for end in [&request.source, &request.destination] {
                if !sites.contains(end) {
                    bail!("request names unknown site {}", end);
                }
            }
            if request.amount == 0 {
                bail!(
                    "request {} -> {} asks for no key",
                    request.source,
                    request.destination
                );
            }
        }
        Ok(())
    }

    /// The in-process agent standing in for `site`
    pub fn agent_for(&self, site: &SiteSettings) -> MockSiteAgent {
        let mut agent = MockSiteAgent::new(site.id.clone());
        for link in self.links.iter().filter(|link| link.a == site.id || link.b == site.id) {
            let Some(id) = link.link_id() else {
                continue;
            };
            if let Some(bits) = site.pool_bits {
                agent = agent.with_pool(id.clone(), bits);
            }
            agent = agent.with_metrics(id, link.rate_bits_per_sec, link.latency_ms);
        }
        agent
    }
}
