//! # QSDN Routing
//!
//! Path computation, capacity reservation, and key relay for the QSDN
//! controller.
//!
//! ## Core Components
//!
//! - [`TopologyGraph`]: sites, links, and per-link key-pool accounting
//! - [`PathFinder`]: ranks loop-free relay paths by cost
//! - [`ReservationManager`]: all-or-nothing capacity holds along a path
//! - [`RelayOrchestrator`]: drives a request hop by hop, with rollback
//! - [`AgentRegistry`]: the site agents the orchestrator talks to
//! - [`NetworkManager`]: ties the above together behind one API
//!
//! ## Relay
//!
//! A request for key between two sites that share no link is served by
//! trusted relay. The path `A - B - C` is reserved as a whole, then each hop
//! is committed at its upstream site: A contributes key from link A-B, B
//! folds in key from link B-C, and C ends up holding the same key as A.
//! Any failure rolls back the committed hops in reverse order and releases
//! the reservation; a hop that cannot be rolled back quarantines its link.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use qsdn_core::{KeyRequest, LinkSpec, Priority, Site};
//! use qsdn_routing::{ControllerConfig, NetworkManager};
//!
//! let manager = NetworkManager::new(ControllerConfig::default())?;
//! manager.register_site(Site::new("A"), agent_a)?;
//! manager.register_site(Site::new("B"), agent_b)?;
//! manager.add_static_link(LinkSpec::new("A", "B", 4096))?;
//! manager.start()?;
//!
//! let id = manager.submit(KeyRequest::new("A".into(), "B".into(), 256, Priority::Normal));
//! let status = manager.wait_for_terminal(&id).await?;
//! ```

pub mod agents;
pub mod config;
pub mod manager;
pub mod orchestrator;
pub mod path;
pub mod reservation;
pub mod topology;

pub use agents::AgentRegistry;
pub use config::{ControllerConfig, RelayConfig, ReservationConfig};
pub use manager::NetworkManager;
pub use orchestrator::RelayOrchestrator;
pub use path::{PathFinder, PathPolicy, RelayPath};
pub use reservation::{Claimant, ExpiredReservation, ReservationManager, ReservationSet};
pub use topology::{SiteRemoval, TopologyGraph, TopologySnapshot};
