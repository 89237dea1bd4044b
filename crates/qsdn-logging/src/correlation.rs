//! Request correlation for relay tracing
//!
//! A key request fans out into path attempts, and every attempt into one
//! agent call per hop, often on different sites. [`RelayCorrelation`] ties
//! those log lines together: the trace id is the request id, and every
//! attempt and hop opens a child span linked to its parent.

use qsdn_core::RequestId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation context for one key request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCorrelation {
    /// Same for every span of one request
    pub trace_id: Uuid,

    /// Unique to this operation
    pub span_id: Uuid,

    pub parent_span_id: Option<Uuid>,

    /// Short request id, as it appears in the other log lines
    pub request_id: String,

    /// Path attempt, starting at 1; 0 before the first attempt
    pub attempt: u32,

    /// Hop index within the attempt's path
    pub hop: Option<usize>,

    /// Depth below the root context
    pub depth: u32,
}

impl RelayCorrelation {
    /// Root context for a freshly submitted request
    pub fn for_request(request: &RequestId) -> Self {
        Self {
            trace_id: *request.as_uuid(),
            span_id: Uuid::new_v4(),
            parent_span_id: None,
            request_id: request.to_string(),
            attempt: 0,
            hop: None,
            depth: 0,
        }
    }

    /// Child context linked to this one
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: Uuid::new_v4(),
            parent_span_id: Some(self.span_id),
            request_id: self.request_id.clone(),
            attempt: self.attempt,
            hop: self.hop,
            depth: self.depth + 1,
        }
    }

    /// Child context for path attempt number `attempt`
    pub fn attempt(&self, attempt: u32) -> Self {
        let mut child = self.child();
        child.attempt = attempt;
        child.hop = None;
        child
    }

    /// Child context for one hop of the current attempt
    pub fn hop(&self, index: usize) -> Self {
        let mut child = self.child();
        child.hop = Some(index);
        child
    }

    pub fn trace_id_str(&self) -> String {
        self.trace_id.as_simple().to_string()
    }

    pub fn span_id_str(&self) -> String {
        self.span_id.as_simple().to_string()
    }

    pub fn parent_span_id_str(&self) -> Option<String> {
        self.parent_span_id.map(|id| id.as_simple().to_string())
    }
}

/// Helper trait to attach a correlation context to tracing spans
///
/// The span must declare the fields (as `tracing::field::Empty`) for the
/// values to show up.
pub trait CorrelationExt {
    fn record_correlation(&self, ctx: &RelayCorrelation);
}

impl CorrelationExt for tracing::Span {
    fn record_correlation(&self, ctx: &RelayCorrelation) {
        self.record(fields::TRACE_ID, ctx.trace_id_str());
        self.record(fields::SPAN_ID, ctx.span_id_str());
        if let Some(parent) = ctx.parent_span_id_str() {
            self.record(fields::PARENT_SPAN_ID, parent);
        }
        if ctx.attempt > 0 {
            self.record(fields::ATTEMPT, ctx.attempt);
        }
        if let Some(hop) = ctx.hop {
            self.record(fields::HOP, hop);
        }
    }
}

/// Standard field names
pub mod fields {
    pub const TRACE_ID: &str = "trace_id";
    pub const SPAN_ID: &str = "span_id";
    pub const PARENT_SPAN_ID: &str = "parent_span_id";
    pub const REQUEST_ID: &str = "request";
    pub const ATTEMPT: &str = "attempt";
    pub const HOP: &str = "hop";
    pub const SITE_ID: &str = "site";
    pub const LINK_ID: &str = "link";
    pub const SOURCE: &str = "source";
    pub const DESTINATION: &str = "destination";
    pub const AMOUNT: &str = "amount";
    pub const PATH: &str = "path";
    pub const CAUSE: &str = "cause";
    pub const LATENCY_MS: &str = "latency_ms";
}

/// Standard span names, shared by the controller crates
pub mod spans {
    // Request lifecycle
    pub const HANDLE_REQUEST: &str = "handle_request";
    pub const RELAY_ATTEMPT: &str = "relay_attempt";
    pub const RELAY_HOP: &str = "relay_hop";
    pub const ROLLBACK: &str = "rollback";

    // Background tasks
    pub const RESERVATION_SWEEP: &str = "reservation_sweep";
    pub const POOL_REFILL: &str = "pool_refill";
    pub const POLL_POOLS: &str = "poll_pools";

    // Site management
    pub const REGISTER_SITE: &str = "register_site";
    pub const UNREGISTER_SITE: &str = "unregister_site";
}
