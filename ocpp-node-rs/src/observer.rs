//! Diagnostic observers
//!
//! Observers are told about every stage a message goes through. They are
//! notified in registration order; an observer that returns an error or
//! panics is logged and skipped, the protocol path carries on regardless.

use ocpp_core::{Envelope, Frame, ParseError, Request};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};

use crate::forwarding::ForwardingDecision;
use crate::outbound::RequestCompletion;
use crate::transport::ConnectionId;

pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;
pub type ObserverResult = Result<(), ObserverError>;

/// Hooks invoked around inbound and outbound processing. All default to no-ops.
#[allow(unused_variables)]
pub trait Observer: Send + Sync {
    fn name(&self) -> &str {
        "observer"
    }

    fn on_frame_received(&self, connection: &ConnectionId, frame: &Frame) -> ObserverResult {
        Ok(())
    }

    fn on_parse_failed(&self, connection: &ConnectionId, error: &ParseError) -> ObserverResult {
        Ok(())
    }

    fn on_request_received(&self, connection: &ConnectionId, request: &Request) -> ObserverResult {
        Ok(())
    }

    fn on_reply_sent(&self, connection: &ConnectionId, reply: &Envelope) -> ObserverResult {
        Ok(())
    }

    fn on_forwarding_decision(
        &self,
        request: &Request,
        decision: &ForwardingDecision,
    ) -> ObserverResult {
        Ok(())
    }

    fn on_request_sent(&self, connection: &ConnectionId, request: &Request) -> ObserverResult {
        Ok(())
    }

    fn on_request_resolved(&self, completion: &RequestCompletion) -> ObserverResult {
        Ok(())
    }

    fn on_unknown_response(
        &self,
        connection: &ConnectionId,
        envelope: &Envelope,
    ) -> ObserverResult {
        Ok(())
    }
}

/// Ordered observer list with per-observer failure containment
#[derive(Clone, Default)]
pub struct Observers {
    list: Vec<Arc<dyn Observer>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: Arc<dyn Observer>) {
        self.list.push(observer);
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Fan a notification out to every observer
    pub fn notify<F>(&self, stage: &str, f: F)
    where
        F: Fn(&dyn Observer) -> ObserverResult,
    {
        for observer in &self.list {
            match catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Observer '{}' failed at {}: {}", observer.name(), stage, e);
                }
                Err(_) => {
                    error!("Observer '{}' panicked at {}", observer.name(), stage);
                }
            }
        }
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.list.iter().map(|o| o.name()).collect();
        f.debug_struct("Observers").field("list", &names).finish()
    }
}
