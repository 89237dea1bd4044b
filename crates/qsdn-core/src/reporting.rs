//! Reporting sinks
//!
//! - [`TracingReporter`]: turns events into structured log lines
//! - [`BroadcastReporter`]: fans events out over a tokio broadcast channel
//! - [`MemoryReporter`]: records events for assertions in tests
//! - [`FanoutReporter`]: forwards to several sinks

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::event::ControllerEvent;
use crate::identity::RequestId;
use crate::request::RequestState;
use crate::traits::ReportingSink;

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl ReportingSink for NullReporter {
    fn report(&self, _event: ControllerEvent) {}
}

/// Sink that writes events to the `tracing` subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ReportingSink for TracingReporter {
    fn report(&self, event: ControllerEvent) {
        match event {
            ControllerEvent::RequestTransition {
                request,
                from,
                to,
                cause: Some(cause),
                ..
            } => {
                warn!(request = %request, from = %from, to = %to, cause = %cause, "Request transition");
            }
            ControllerEvent::RequestTransition { request, from, to, .. } => {
                info!(request = %request, from = %from, to = %to, "Request transition");
            }
            ControllerEvent::LinkCapacityChanged {
                link,
                capacity,
                reserved,
                consumed,
                available,
                ..
            } => {
                debug!(link = %link, capacity, reserved, consumed, available, "Link capacity changed");
            }
            ControllerEvent::LinkHealthChanged { link, health, .. } => {
                info!(link = %link, health = %health, "Link health changed");
            }
            ControllerEvent::SiteStatusChanged { site, status, .. } => {
                info!(site = %site, status = %status, "Site status changed");
            }
            ControllerEvent::SiteRegistered { site, .. } => {
                info!(site = %site, "Site registered");
            }
            ControllerEvent::SiteRemoved { site, .. } => {
                info!(site = %site, "Site removed");
            }
        }
    }
}

/// Sink that publishes events on a broadcast channel
///
/// Slow subscribers lag and miss events rather than blocking the controller.
#[derive(Debug, Clone)]
pub struct BroadcastReporter {
    tx: broadcast::Sender<ControllerEvent>,
}

impl BroadcastReporter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.tx.subscribe()
    }
}

impl ReportingSink for BroadcastReporter {
    fn report(&self, event: ControllerEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

/// Sink that keeps every event in memory
#[derive(Debug, Default)]
pub struct MemoryReporter {
    events: Mutex<Vec<ControllerEvent>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event recorded so far
    pub fn events(&self) -> Vec<ControllerEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// The sequence of states a request moved through, starting from its
    /// first recorded transition
    pub fn transitions_for(&self, request: &RequestId) -> Vec<RequestState> {
        let events = self.events.lock();
        let mut states = Vec::new();
        for event in events.iter() {
            if let ControllerEvent::RequestTransition {
                request: id, from, to, ..
            } = event
                && id == request
            {
                if states.is_empty() {
                    states.push(*from);
                }
                states.push(*to);
            }
        }
        states
    }
}

impl ReportingSink for MemoryReporter {
    fn report(&self, event: ControllerEvent) {
        self.events.lock().push(event);
    }
}

/// Sink that forwards every event to several others
#[derive(Default, Clone)]
pub struct FanoutReporter {
    sinks: Vec<Arc<dyn ReportingSink>>,
}

impl FanoutReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReportingSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl ReportingSink for FanoutReporter {
    fn report(&self, event: ControllerEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.report(event.clone());
            }
            last.report(event);
        }
    }
}
