//! Inbound dispatcher
//!
//! Turns every frame arriving on a connection into at most one reply:
//!
//! ```text
//! frame ──parse──► Request ──► for another node? ──yes──► ForwardingEngine
//!   │                │                 │no
//!   │                │                 ▼
//!   │                │        registry lookup ─► verify ─► handler task
//!   │                │                                        │
//!   │ parse error    ▼                                        ▼
//!   └──────────► error reply                         response / failure response
//!
//! Response / Error ──► OutboundEngine::resolve
//! Send             ──► handler, never answered
//! ```

use ocpp_core::policy::{sign_message, verify_by_policy};
use ocpp_core::{
    Envelope, ErrorCode, Frame, MessageContext, MessageType, NetworkPath, NodeId, Payload,
    Request, SendMessage, SignaturePolicy,
};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::forwarding::ForwardingEngine;
use crate::observer::Observers;
use crate::outbound::OutboundEngine;
use crate::registry::{ActionHandler, ActionRegistry, HandlerError, RequestContext, ResponseFactory};
use crate::transport::{ConnectionId, Transport};

pub struct InboundDispatcher {
    node_id: NodeId,
    registry: Arc<ActionRegistry>,
    responses: Arc<ResponseFactory>,
    policy: Arc<SignaturePolicy>,
    transport: Arc<dyn Transport>,
    outbound: Arc<OutboundEngine>,
    forwarding: Arc<ForwardingEngine>,
    observers: Observers,
}

impl InboundDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        registry: Arc<ActionRegistry>,
        responses: Arc<ResponseFactory>,
        policy: Arc<SignaturePolicy>,
        transport: Arc<dyn Transport>,
        outbound: Arc<OutboundEngine>,
        forwarding: Arc<ForwardingEngine>,
        observers: Observers,
    ) -> Self {
        Self {
            node_id,
            registry,
            responses,
            policy,
            transport,
            outbound,
            forwarding,
            observers,
        }
    }

    /// Process one frame received on `connection`
    pub async fn handle_frame(
        &self,
        connection: ConnectionId,
        frame: Frame,
        cancel: CancellationToken,
    ) {
        self.observers
            .notify("frame_received", |o| o.on_frame_received(&connection, &frame));

        let envelope = match Envelope::parse(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Unparseable frame from {}: {}", connection, e);
                self.observers
                    .notify("parse_failed", |o| o.on_parse_failed(&connection, &e));
                // Responses and sends are never answered; a broken response
                // leaves its request to time out
                if matches!(frame.message_type(), None | Some(MessageType::Call)) {
                    let reply = Envelope::Error(e.to_error_message(frame.format()));
                    self.send_reply(&connection, reply).await;
                }
                return;
            }
        };

        match envelope {
            Envelope::Request(request) => self.handle_request(connection, request, cancel).await,
            Envelope::Send(message) => self.handle_send(connection, message, cancel).await,
            response => {
                self.outbound.resolve(response, &connection);
            }
        }
    }

    async fn handle_request(
        &self,
        connection: ConnectionId,
        mut request: Request,
        cancel: CancellationToken,
    ) {
        let routed = request.destination.is_some() || !request.network_path.is_empty();
        if request.network_path.is_empty() {
            request.network_path = NetworkPath::from_source(connection.peer());
        }

        debug!(
            "{} [{}] from {} via {}",
            request.action, request.request_id, request.network_path, connection
        );
        self.observers
            .notify("request_received", |o| o.on_request_received(&connection, &request));

        let remote = self.remote_destination(request.destination.as_ref()).cloned();
        let reply = match remote {
            Some(destination) if self.forwarding.is_enabled() => {
                debug!(
                    "{} [{}] is for {}, forwarding",
                    request.action, request.request_id, destination
                );
                self.forwarding.process(request, &connection, &cancel).await
            }
            Some(destination) => {
                warn!(
                    "{} [{}] is for {} but forwarding is disabled, handling locally",
                    request.action, request.request_id, destination
                );
                self.dispatch_local(request, &connection, &cancel).await
            }
            None => self.dispatch_local(request, &connection, &cancel).await,
        };

        let reply = if routed { reply } else { unrouted(reply) };
        self.send_reply(&connection, reply).await;
    }

    async fn handle_send(
        &self,
        connection: ConnectionId,
        mut message: SendMessage,
        cancel: CancellationToken,
    ) {
        if message.network_path.is_empty() {
            message.network_path = NetworkPath::from_source(connection.peer());
        }

        let remote = self.remote_destination(message.destination.as_ref()).is_some();
        if remote && self.forwarding.is_enabled() {
            self.forwarding.relay_message(message).await;
            return;
        }

        let Some(handler) = self.registry.get(&message.action) else {
            warn!("No handler for message {} from {}, ignoring", message.action, connection);
            return;
        };

        let context = MessageContext::message(&message.action);
        if let Err(e) = verify_by_policy(&mut message, &context, &self.policy) {
            warn!("Ignoring {} [{}]: {}", message.action, message.request_id, e);
            return;
        }

        let request = Request {
            request_id: message.request_id,
            action: message.action,
            destination: message.destination,
            network_path: message.network_path,
            payload: message.payload,
            signatures: message.signatures,
            sign_infos: Vec::new(),
        };
        let action = request.action.clone();
        if let Err(e) = self.run_handler(handler, request, &connection, &cancel).await {
            warn!("Handler for message {} failed: {}", action, e);
        }
    }

    /// The destination, when it is some other node
    fn remote_destination<'a>(&self, destination: Option<&'a NodeId>) -> Option<&'a NodeId> {
        destination.filter(|d| !d.as_str().is_empty() && **d != self.node_id)
    }

    /// Run the local handler for `request` and build the reply
    pub async fn dispatch_local(
        &self,
        mut request: Request,
        connection: &ConnectionId,
        cancel: &CancellationToken,
    ) -> Envelope {
        let Some(handler) = self.registry.get(&request.action) else {
            warn!("No handler for {} [{}]", request.action, request.request_id);
            return Envelope::Error(request.error_reply(
                &self.node_id,
                ErrorCode::CouldNotParse,
                format!("Unknown action {}", request.action),
                json!({}),
            ));
        };

        let context = MessageContext::request(&request.action);
        if let Err(e) = verify_by_policy(&mut request, &context, &self.policy) {
            warn!("Signature check failed for {} [{}]: {}", request.action, request.request_id, e);
            return Envelope::Error(request.error_reply(
                &self.node_id,
                ErrorCode::SignatureError,
                e.to_string(),
                json!({}),
            ));
        }

        let payload = match self.run_handler(handler, request.clone(), connection, cancel).await {
            Ok(payload) => payload,
            Err(e) => {
                error!("Handler for {} [{}] failed: {}", request.action, request.request_id, e);
                self.responses.failed(&request, &e.to_string())
            }
        };

        signed_response(&self.node_id, &request, payload, &self.policy)
    }

    async fn run_handler(
        &self,
        handler: Arc<dyn ActionHandler>,
        request: Request,
        connection: &ConnectionId,
        cancel: &CancellationToken,
    ) -> Result<Payload, HandlerError> {
        let token = cancel.child_token();
        let ctx = RequestContext {
            node_id: self.node_id.clone(),
            connection: connection.clone(),
            network_path: request.network_path.clone(),
            cancel: token.clone(),
        };

        let mut task = tokio::spawn(async move { handler.handle(request, ctx).await });
        tokio::select! {
            joined = &mut task => match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(HandlerError::Failed("handler panicked".into())),
                Err(_) => Err(HandlerError::Cancelled),
            },
            _ = token.cancelled() => {
                task.abort();
                Err(HandlerError::Cancelled)
            }
        }
    }

    /// Encode and send a reply, logging rather than failing
    pub async fn send_reply(&self, connection: &ConnectionId, reply: Envelope) {
        let frame = match reply.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Cannot encode reply [{}]: {}", reply.request_id(), e);
                return;
            }
        };

        if let Err(e) = self.transport.send(connection, frame).await {
            warn!("Reply [{}] to {} not delivered: {}", reply.request_id(), connection, e);
            return;
        }

        info!("Replied [{}] to {}", reply.request_id(), connection);
        self.observers
            .notify("reply_sent", |o| o.on_reply_sent(connection, &reply));
    }
}

/// Response to `request` signed per policy; an error if signing fails
pub(crate) fn signed_response(
    node_id: &NodeId,
    request: &Request,
    payload: Payload,
    policy: &SignaturePolicy,
) -> Envelope {
    let mut response = request.reply(node_id, payload);
    let context = MessageContext::response(&request.action);
    match sign_message(&mut response, &context, policy, &[]) {
        Ok(_) => Envelope::Response(response),
        Err(e) => {
            error!("Cannot sign {}: {}", context, e);
            Envelope::Error(request.error_reply(
                node_id,
                ErrorCode::InternalError,
                format!("response signing failed: {}", e),
                json!({}),
            ))
        }
    }
}

/// Strip routing information from a reply to a plain (unrouted) request
fn unrouted(mut reply: Envelope) -> Envelope {
    match &mut reply {
        Envelope::Request(r) => r.destination = None,
        Envelope::Response(r) => r.destination = None,
        Envelope::Error(e) => e.destination = None,
        Envelope::Send(s) => s.destination = None,
    }
    *reply.network_path_mut() = NetworkPath::new();
    reply
}
