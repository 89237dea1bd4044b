//! QSDN Manager
//!
//! Centralized controller for a QKD network. Loads sites, links, and key
//! requests from a settings file, stands up in-process agents for the sites,
//! and relays key for every request.

mod settings;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use qsdn_core::{
    KeyRequest, LinkSpec, MockSiteAgent, Priority, RequestId, RequestStatus, Site, SiteAgent,
};
use qsdn_logging::{FileConfig, LogConfig, QsdnSubscriberBuilder, WorkerGuard};
use qsdn_routing::{ControllerConfig, NetworkManager};
use tracing::{info, warn};

use crate::settings::Settings;

#[derive(Parser)]
#[command(
    name = "qsdn-manager",
    about = "Centralized key-relay controller for QKD networks",
    version
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Human-readable console logs instead of JSONL
    #[arg(long, global = true)]
    pretty: bool,

    /// Also write JSONL logs to daily files in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the requests of a settings file and report their outcome
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Check a settings file without running it
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Relay over a built-in triangle, then take the relay site offline
    Demo,
}

impl Commands {
    fn settings_path(&self) -> Option<&Path> {
        match self {
            Self::Run { config } | Self::Check { config } => Some(config.as_path()),
            Self::Demo => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = cli.command.settings_path().map(Settings::load).transpose()?;

    let log_config = settings
        .as_ref()
        .and_then(|settings| settings.logging.clone())
        .unwrap_or_default();
    let _log_guard = init_logging(&cli, log_config)?;

    match (cli.command, settings) {
        (Commands::Check { config }, Some(settings)) => {
            println!(
                "{}: {} sites, {} links, {} requests",
                config.display(),
                settings.sites.len(),
                settings.links.len(),
                settings.requests.len()
            );
        }
        (Commands::Run { .. }, Some(settings)) => run(settings).await?,
        (Commands::Demo, _) => demo().await?,
        (_, None) => bail!("no settings file given"),
    }

    Ok(())
}

fn init_logging(cli: &Cli, config: LogConfig) -> Result<Option<WorkerGuard>> {
    let mut builder = QsdnSubscriberBuilder::new().with_config(config);
    if cli.verbose {
        builder = builder.with_level("debug");
    }
    if cli.pretty {
        builder = builder.with_pretty(true);
    }
    if let Some(dir) = &cli.log_dir {
        builder = builder.with_file_output(FileConfig::new(dir));
    }
    builder.init().context("installing the log subscriber")
}

async fn run(settings: Settings) -> Result<()> {
    let manager = NetworkManager::new(settings.controller.clone())?;

    for site in &settings.sites {
        let agent: Arc<dyn SiteAgent> = Arc::new(settings.agent_for(site));
        manager
            .register_site(site.site(), agent)
            .with_context(|| format!("registering site {}", site.id))?;
    }
    for link in &settings.links {
        manager
            .add_static_link(link.clone())
            .with_context(|| format!("declaring link {} - {}", link.a, link.b))?;
    }
    for state in manager.topology().links() {
        if !state.is_active() {
            warn!(link = %state.id, health = %state.health, "Link not carrying key");
        }
    }

    manager.start()?;
    info!(
        sites = manager.registered_sites().len(),
        links = manager.topology().links().len(),
        requests = settings.requests.len(),
        "Controller running"
    );

    let ids: Vec<RequestId> = settings
        .requests
        .iter()
        .map(|request| manager.submit(request.to_request()))
        .collect();

    let outcome = tokio::select! {
        result = report_all(&manager, &ids) => result,
        _ = tokio::signal::ctrl_c() => {
            println!("Interrupted, cancelling live requests");
            Ok(())
        }
    };

    manager.shutdown().await;
    outcome
}

/// Wait for every request and print one line per request
async fn report_all(manager: &NetworkManager, ids: &[RequestId]) -> Result<()> {
    let mut completed = 0;
    for id in ids {
        let status = manager.wait_for_terminal(id).await?;
        if status.is_completed() {
            completed += 1;
        }
        println!("{}", describe(manager, &status)?);
    }
    println!("{} of {} requests completed", completed, ids.len());
    Ok(())
}

fn describe(manager: &NetworkManager, status: &RequestStatus) -> Result<String> {
    let path = status
        .path
        .as_ref()
        .map(|sites| {
            sites
                .iter()
                .map(|site| site.as_str())
                .collect::<Vec<_>>()
                .join(" -> ")
        })
        .unwrap_or_else(|| "-".to_string());

    let outcome = match &status.cause {
        None => match manager.take_key(&status.id)? {
            Some(key) => format!("key {}", key.fingerprint()),
            None => status.state.to_string(),
        },
        Some(cause) => format!("failed: {}", cause),
    };
    Ok(format!(
        "{}  attempts={}  path={}  {}",
        status.id, status.attempts, path, outcome
    ))
}

/// Triangle A-B-C with a thin direct link and a detour through D
async fn demo() -> Result<()> {
    let manager = NetworkManager::new(ControllerConfig::default())?;

    let mut agents = Vec::new();
    for name in ["A", "B", "C", "D"] {
        let agent = Arc::new(MockSiteAgent::new(name));
        manager.register_site(Site::new(name), Arc::clone(&agent) as Arc<dyn SiteAgent>)?;
        agents.push(agent);
    }
    for (a, b, capacity, latency_ms) in [
        ("A", "B", 10, 1),
        ("B", "C", 10, 1),
        ("A", "C", 3, 1),
        ("A", "D", 64, 5),
        ("D", "C", 64, 5),
    ] {
        manager.add_static_link(LinkSpec::new(a, b, capacity).with_latency_ms(latency_ms))?;
    }
    manager.start()?;

    println!("Topology: A-B 10, B-C 10, A-C 3, A-D 64, D-C 64");
    println!("Requesting 4 bits A -> C (direct link too thin)");
    let first = manager.submit(KeyRequest::new("A".into(), "C".into(), 4, Priority::Normal));
    report_all(&manager, &[first]).await?;

    println!("Site B drops out while committing its hop");
    agents[1].go_offline_at_commit(1);
    let second = manager.submit(KeyRequest::new("A".into(), "C".into(), 4, Priority::Normal));
    report_all(&manager, &[second]).await?;

    manager.shutdown().await;
    Ok(())
}
