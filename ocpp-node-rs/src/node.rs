//! Networking node: IN, OUT and FORWARD wired over one transport

use bytes::Bytes;
use ocpp_core::{Frame, NetworkPath, NodeId, Payload, Request, SendMessage, SignaturePolicy};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::dispatcher::InboundDispatcher;
use crate::forwarding::{ForwardingEngine, ForwardingFilter};
use crate::observer::{Observer, Observers};
use crate::outbound::{OutboundEngine, OutboundError, RequestCompletion};
use crate::registry::{
    ActionHandler, ActionRegistry, ActionRegistryBuilder, FailureKind, RegistryError,
    ResponseFactory,
};
use crate::routing::RoutingTable;
use crate::transport::{ConnectionId, Transport};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("outbound error: {0}")]
    Outbound(#[from] OutboundError),

    #[error("no route to {0}")]
    NoRoute(NodeId),

    #[error("request has no destination")]
    NoDestination,
}

/// One OCPP node: charging station, networking node or CSMS
pub struct NetworkingNode {
    config: NodeConfig,
    routing: Arc<RoutingTable>,
    outbound: Arc<OutboundEngine>,
    forwarding: Arc<ForwardingEngine>,
    dispatcher: Arc<InboundDispatcher>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkingNode {
    pub fn builder(config: NodeConfig, transport: Arc<dyn Transport>) -> NodeBuilder {
        NodeBuilder::new(config, transport)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn outbound(&self) -> &OutboundEngine {
        &self.outbound
    }

    pub fn forwarding(&self) -> &ForwardingEngine {
        &self.forwarding
    }

    /// Start background work (the pending table sweeper)
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            let interval = self.config.outbound.sweep_interval;
            *sweeper = Some(
                self.outbound
                    .spawn_sweeper(interval, self.shutdown.child_token()),
            );
            info!("Node {} started", self.config.node_id);
        }
    }

    /// Cancel running handlers, outbound waits and the sweeper
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.sweeper.lock().take();
        info!("Node {} shut down", self.config.node_id);
    }

    /// A frame arrived on `connection`; processed in its own task
    pub fn on_receive(&self, connection: ConnectionId, frame: Frame) -> JoinHandle<()> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move { dispatcher.handle_frame(connection, frame, cancel).await })
    }

    /// Feed every frame from `frames` into the node until the channel closes
    pub fn spawn_receiver(
        self: &Arc<Self>,
        connection: ConnectionId,
        mut frames: mpsc::Receiver<Frame>,
    ) -> JoinHandle<()> {
        let node = Arc::clone(self);
        node.connection_opened(connection.clone());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = node.shutdown.cancelled() => break,
                    frame = frames.recv() => match frame {
                        Some(frame) => {
                            node.on_receive(connection.clone(), frame);
                        }
                        None => {
                            node.connection_closed(&connection);
                            break;
                        }
                    }
                }
            }
        })
    }

    /// The peer on `connection` is now directly reachable
    pub fn connection_opened(&self, connection: ConnectionId) {
        debug!("{}: connection {} opened", self.config.node_id, connection);
        self.routing.add_route(connection.peer(), connection);
    }

    /// Drop routes over `connection` and fail requests in flight on it
    pub fn connection_closed(&self, connection: &ConnectionId) {
        info!("{}: connection {} closed", self.config.node_id, connection);
        self.routing.remove_connection(connection);
        self.outbound.fail_connection(connection);
    }

    /// Send a request to its destination and wait for the outcome
    pub async fn send_request(&self, request: Request) -> Result<RequestCompletion, NodeError> {
        let timeout = self.config.outbound.request_timeout;
        self.send_request_with_timeout(request, timeout).await
    }

    pub async fn send_request_with_timeout(
        &self,
        mut request: Request,
        timeout: Duration,
    ) -> Result<RequestCompletion, NodeError> {
        let destination = request.destination.clone().ok_or(NodeError::NoDestination)?;
        let connection = self
            .routing
            .next_hop(&destination)
            .ok_or_else(|| NodeError::NoRoute(destination.clone()))?;

        if request.network_path.is_empty() {
            request.network_path = NetworkPath::from_source(self.config.node_id.clone());
        }
        self.send_request_on(&connection, request, timeout).await
    }

    /// Send a request over a specific connection, bypassing routing
    pub async fn send_request_on(
        &self,
        connection: &ConnectionId,
        request: Request,
        timeout: Duration,
    ) -> Result<RequestCompletion, NodeError> {
        let cancel = self.shutdown.child_token();
        Ok(self
            .outbound
            .send_and_await(connection, request, timeout, &cancel)
            .await?)
    }

    /// Send a binary-framed request
    pub async fn send_binary_request(
        &self,
        action: impl Into<String>,
        destination: impl Into<NodeId>,
        data: Bytes,
    ) -> Result<RequestCompletion, NodeError> {
        let request = Request::new(action, Payload::Binary(data)).to(destination);
        self.send_request(request).await
    }

    /// Send a one-way message; nothing comes back
    pub async fn send_message(&self, mut message: SendMessage) -> Result<(), NodeError> {
        let destination = message.destination.clone().ok_or(NodeError::NoDestination)?;
        let connection = self
            .routing
            .next_hop(&destination)
            .ok_or_else(|| NodeError::NoRoute(destination.clone()))?;

        if message.network_path.is_empty() {
            message.network_path = NetworkPath::from_source(self.config.node_id.clone());
        }
        self.outbound.send_message(&connection, message).await?;
        Ok(())
    }
}

impl Drop for NetworkingNode {
    fn drop(&mut self) {
        if !self.shutdown.is_cancelled() {
            self.shutdown.cancel();
        }
    }
}

/// Collects handlers, filters and observers, then wires the node
pub struct NodeBuilder {
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    registry: ActionRegistryBuilder,
    responses: ResponseFactory,
    policy: SignaturePolicy,
    observers: Observers,
    filters: Vec<(Option<String>, Arc<dyn ForwardingFilter>)>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            registry: ActionRegistry::builder(),
            responses: ResponseFactory::new(),
            policy: SignaturePolicy::new(),
            observers: Observers::new(),
            filters: Vec::new(),
        }
    }

    pub fn handler(mut self, action: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        self.registry = self.registry.register(action, handler);
        self
    }

    pub fn policy(mut self, policy: SignaturePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Custom failure payload for one action
    pub fn failure_response<F>(mut self, action: impl Into<String>, builder: F) -> Self
    where
        F: Fn(&Request, FailureKind, &str) -> serde_json::Value + Send + Sync + 'static,
    {
        self.responses = self.responses.with_builder(action, builder);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn filter(mut self, action: impl Into<String>, filter: Arc<dyn ForwardingFilter>) -> Self {
        self.filters.push((Some(action.into()), filter));
        self
    }

    pub fn wildcard_filter(mut self, filter: Arc<dyn ForwardingFilter>) -> Self {
        self.filters.push((None, filter));
        self
    }

    pub fn build(self) -> Result<Arc<NetworkingNode>, NodeError> {
        let registry = Arc::new(self.registry.build()?);
        let responses = Arc::new(self.responses);
        let policy = Arc::new(self.policy);
        let routing = Arc::new(RoutingTable::new());
        let node_id = self.config.node_id.clone();

        let outbound = Arc::new(OutboundEngine::new(
            node_id.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&policy),
            self.observers.clone(),
        ));

        let forwarding = Arc::new(ForwardingEngine::new(
            node_id.clone(),
            self.config.forwarding.clone(),
            self.config.outbound.request_timeout,
            Arc::clone(&responses),
            Arc::clone(&policy),
            self.observers.clone(),
            Arc::clone(&outbound),
            Arc::clone(&routing),
        ));
        let has_filters = !self.filters.is_empty();
        for (action, filter) in self.filters {
            match action {
                Some(action) => forwarding.add_filter(action, filter),
                None => forwarding.add_wildcard_filter(filter),
            }
        }
        if has_filters && !forwarding.is_enabled() {
            warn!("{}: forwarding filters configured but forwarding is disabled", node_id);
        }

        let dispatcher = Arc::new(InboundDispatcher::new(
            node_id.clone(),
            Arc::clone(&registry),
            responses,
            policy,
            self.transport,
            Arc::clone(&outbound),
            Arc::clone(&forwarding),
            self.observers,
        ));

        info!(
            "Node {} built with {} handler(s), forwarding {}",
            node_id,
            registry.len(),
            if forwarding.is_enabled() { "on" } else { "off" }
        );

        Ok(Arc::new(NetworkingNode {
            config: self.config,
            routing,
            outbound,
            forwarding,
            dispatcher,
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }))
    }
}
