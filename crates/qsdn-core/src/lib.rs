//! # QSDN Core
//!
//! Core traits, types, and errors for the QSDN key-relay controller.
//!
//! A QKD network is a set of sites joined by point-to-point quantum links.
//! Adjacent sites share key directly; everyone else needs key relayed hop by
//! hop through trusted intermediate sites. This crate holds the vocabulary
//! shared by the controller and the agents it drives.
//!
//! ## Key Traits
//!
//! - [`SiteAgent`]: the controller's proxy for a remote site
//! - [`ReportingSink`]: passive receiver of controller events
//! - [`KeyRequestService`]: inbound key-request API
//!
//! ## Key Types
//!
//! - [`SiteId`], [`LinkId`], [`RequestId`]: identities
//! - [`LinkState`]: capacity accounting for one quantum link
//! - [`KeyRequest`] and [`RequestState`]: a request and its lifecycle
//! - [`HopCommand`] / [`HopAck`]: one step of a relay
//! - [`ControllerEvent`]: everything the controller reports

pub mod error;
pub mod event;
pub mod identity;
pub mod key;
pub mod link;
pub mod mock_agent;
pub mod reporting;
pub mod request;
pub mod site;
pub mod traits;

// Re-export main types
pub use error::*;
pub use event::*;
pub use identity::*;
pub use key::*;
pub use link::*;
pub use mock_agent::*;
pub use reporting::*;
pub use request::*;
pub use site::*;
pub use traits::*;
