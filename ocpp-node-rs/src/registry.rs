//! Action handler registry and failure responses
//!
//! Handlers are registered by action name once, when the node is built. The
//! [`ResponseFactory`] produces the payload sent back when a handler fails or
//! a relay filters a request.

use async_trait::async_trait;
use bytes::Bytes;
use ocpp_core::{Format, NetworkPath, NodeId, Payload, Request};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::transport::ConnectionId;

/// Reason attached to filtered requests when the filter gave none
pub const DEFAULT_FILTERED_REASON: &str = "Filtered by default handler";

/// What a handler knows about the request it is serving
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// This node
    pub node_id: NodeId,
    /// Connection the request arrived on
    pub connection: ConnectionId,
    pub network_path: NetworkPath,
    /// Fires when the node shuts down or the request is abandoned
    pub cancel: CancellationToken,
}

/// Handler failures, turned into a failure response by the dispatcher
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("handler produced no result")]
    NoResult,

    #[error("handler cancelled")]
    Cancelled,

    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

/// Serves one OCPP action
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, request: Request, ctx: RequestContext) -> Result<Payload, HandlerError>;
}

/// Handler backed by an async closure
pub struct FnHandler<F>(F);

/// Wrap an async closure as an [`ActionHandler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Request, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(Request, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: Request, ctx: RequestContext) -> Result<Payload, HandlerError> {
        (self.0)(request, ctx).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("action {0} registered twice")]
    Duplicate(String),
}

/// Action name to handler table, immutable once built
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn builder() -> ActionRegistryBuilder {
        ActionRegistryBuilder::default()
    }

    pub fn get(&self, action: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(action).cloned()
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut actions: Vec<&str> = self.actions().collect();
        actions.sort_unstable();
        f.debug_struct("ActionRegistry").field("actions", &actions).finish()
    }
}

#[derive(Default)]
pub struct ActionRegistryBuilder {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
    duplicates: Vec<String>,
}

impl ActionRegistryBuilder {
    pub fn register(mut self, action: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        let action = action.into();
        if self.handlers.contains_key(&action) {
            self.duplicates.push(action);
        } else {
            self.handlers.insert(action, handler);
        }
        self
    }

    pub fn build(self) -> Result<ActionRegistry, RegistryError> {
        if let Some(action) = self.duplicates.into_iter().next() {
            return Err(RegistryError::Duplicate(action));
        }
        Ok(ActionRegistry {
            handlers: self.handlers,
        })
    }
}

/// Why a failure response is being built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    HandlerFailed,
    Filtered,
}

impl FailureKind {
    pub fn reason_code(&self) -> &'static str {
        match self {
            FailureKind::HandlerFailed => "InternalError",
            FailureKind::Filtered => "Filtered",
        }
    }
}

pub type FailureBuilder = Arc<dyn Fn(&Request, FailureKind, &str) -> Value + Send + Sync>;

/// Builds failure payloads, per action when a builder is registered
#[derive(Clone, Default)]
pub struct ResponseFactory {
    builders: HashMap<String, FailureBuilder>,
}

impl ResponseFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builder<F>(mut self, action: impl Into<String>, builder: F) -> Self
    where
        F: Fn(&Request, FailureKind, &str) -> Value + Send + Sync + 'static,
    {
        self.builders.insert(action.into(), Arc::new(builder));
        self
    }

    /// Failure payload as JSON
    pub fn build(&self, request: &Request, kind: FailureKind, reason: &str) -> Value {
        match self.builders.get(&request.action) {
            Some(builder) => builder(request, kind, reason),
            None => default_failure(kind, reason),
        }
    }

    /// Payload answering a request whose handler failed
    pub fn failed(&self, request: &Request, reason: &str) -> Payload {
        payload_in_format(self.build(request, FailureKind::HandlerFailed, reason), request.format())
    }

    /// Response synthesized for a filtered request
    pub fn filtered(&self, request: &Request, reason: &str) -> Value {
        self.build(request, FailureKind::Filtered, reason)
    }
}

impl std::fmt::Debug for ResponseFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let actions: Vec<&String> = self.builders.keys().collect();
        f.debug_struct("ResponseFactory").field("actions", &actions).finish()
    }
}

fn default_failure(kind: FailureKind, reason: &str) -> Value {
    json!({
        "status": "Rejected",
        "statusInfo": {
            "reasonCode": kind.reason_code(),
            "additionalInfo": reason,
        }
    })
}

/// Carry a JSON value in the framing the request used
pub fn payload_in_format(value: Value, format: Format) -> Payload {
    match format {
        Format::Json => Payload::Json(value),
        Format::Binary => Payload::Binary(Bytes::from(value.to_string())),
    }
}
