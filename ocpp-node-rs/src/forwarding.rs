//! Forwarding engine for relay nodes
//!
//! Requests addressed to another node are decided on in this order:
//!
//! 1. Loop prevention: our own id in the network path means REJECT
//! 2. Anycast scoping: destinations outside the allow-list or on the deny-list are DROPPED
//! 3. Filters for the action, then wildcard filters; first decision wins
//! 4. The configured [`DefaultResult`]
//!
//! Forwarded requests go out through the [`OutboundEngine`] under a fresh
//! request id and with this node appended to the path. Their outcome is
//! relayed back to the sender under the original id.

use ocpp_core::policy::verify_by_policy;
use ocpp_core::{
    Envelope, ErrorCode, ErrorMessage, MessageContext, NetworkPath, NodeId, Request, RequestId,
    Response, SendMessage, SignaturePolicy,
};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::mem::discriminant;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DefaultResult, ForwardingConfig};
use crate::dispatcher::signed_response;
use crate::observer::Observers;
use crate::outbound::{OutboundEngine, OutboundError, RequestOutcome};
use crate::registry::{payload_in_format, ResponseFactory, DEFAULT_FILTERED_REASON};
use crate::routing::RoutingTable;
use crate::transport::ConnectionId;

/// Verdict on a request passing through this node.
///
/// Filters may leave `response` and `reason` empty; the engine fills them in
/// before acting on the decision.
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardingDecision {
    Forward,
    /// Answer the sender with a normal response
    Reject {
        response: Option<Value>,
        reason: Option<String>,
    },
    /// Out of scope; answered like a REJECT, reported as a DROP
    Drop {
        response: Option<Value>,
        reason: Option<String>,
    },
}

impl ForwardingDecision {
    pub fn reject() -> Self {
        ForwardingDecision::Reject {
            response: None,
            reason: None,
        }
    }

    pub fn drop_request() -> Self {
        ForwardingDecision::Drop {
            response: None,
            reason: None,
        }
    }

    /// Attach a reason to a REJECT or DROP
    pub fn because(mut self, why: impl Into<String>) -> Self {
        if let ForwardingDecision::Reject { reason, .. } | ForwardingDecision::Drop { reason, .. } =
            &mut self
        {
            *reason = Some(why.into());
        }
        self
    }

    /// Attach the response sent back instead of the default one
    pub fn with_response(mut self, payload: Value) -> Self {
        if let ForwardingDecision::Reject { response, .. }
        | ForwardingDecision::Drop { response, .. } = &mut self
        {
            *response = Some(payload);
        }
        self
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ForwardingDecision::Forward => "FORWARD",
            ForwardingDecision::Reject { .. } => "REJECT",
            ForwardingDecision::Drop { .. } => "DROP",
        }
    }

    pub fn response(&self) -> Option<&Value> {
        match self {
            ForwardingDecision::Forward => None,
            ForwardingDecision::Reject { response, .. }
            | ForwardingDecision::Drop { response, .. } => response.as_ref(),
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ForwardingDecision::Forward => None,
            ForwardingDecision::Reject { reason, .. } | ForwardingDecision::Drop { reason, .. } => {
                reason.as_deref()
            }
        }
    }
}

impl fmt::Display for ForwardingDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{} ({})", self.kind(), reason),
            None => f.write_str(self.kind()),
        }
    }
}

/// Inspects relayed requests; `None` means no opinion
pub trait ForwardingFilter: Send + Sync {
    fn filter(&self, request: &Request) -> Option<ForwardingDecision>;
}

impl<F> ForwardingFilter for F
where
    F: Fn(&Request) -> Option<ForwardingDecision> + Send + Sync,
{
    fn filter(&self, request: &Request) -> Option<ForwardingDecision> {
        self(request)
    }
}

pub struct ForwardingEngine {
    node_id: NodeId,
    config: ForwardingConfig,
    request_timeout: Duration,
    filters: RwLock<HashMap<String, Vec<Arc<dyn ForwardingFilter>>>>,
    wildcard_filters: RwLock<Vec<Arc<dyn ForwardingFilter>>>,
    responses: Arc<ResponseFactory>,
    policy: Arc<SignaturePolicy>,
    observers: Observers,
    outbound: Arc<OutboundEngine>,
    routing: Arc<RoutingTable>,
}

impl ForwardingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        config: ForwardingConfig,
        request_timeout: Duration,
        responses: Arc<ResponseFactory>,
        policy: Arc<SignaturePolicy>,
        observers: Observers,
        outbound: Arc<OutboundEngine>,
        routing: Arc<RoutingTable>,
    ) -> Self {
        Self {
            node_id,
            config,
            request_timeout,
            filters: RwLock::new(HashMap::new()),
            wildcard_filters: RwLock::new(Vec::new()),
            responses,
            policy,
            observers,
            outbound,
            routing,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Filter requests of one action
    pub fn add_filter(&self, action: impl Into<String>, filter: Arc<dyn ForwardingFilter>) {
        self.filters.write().entry(action.into()).or_default().push(filter);
    }

    /// Filter requests of every action, consulted after the per-action filters
    pub fn add_wildcard_filter(&self, filter: Arc<dyn ForwardingFilter>) {
        self.wildcard_filters.write().push(filter);
    }

    /// Decide what happens to `request`; REJECT and DROP always carry a
    /// response and a reason
    pub fn decide(&self, request: &Request) -> ForwardingDecision {
        let decision = self.raw_decision(request);
        self.complete(request, decision)
    }

    fn raw_decision(&self, request: &Request) -> ForwardingDecision {
        if request.network_path.contains(&self.node_id) {
            return ForwardingDecision::reject().because(format!(
                "loop detected: {} already in {}",
                self.node_id, request.network_path
            ));
        }

        // Never hand a request back to a node it already passed through
        let destination = request.destination.as_ref();
        if let Some(hop) = self.looping_next_hop(destination, &request.network_path) {
            return ForwardingDecision::reject().because(format!(
                "loop detected: next hop {} already in {}",
                hop, request.network_path
            ));
        }

        if let Some(destination) = &request.destination {
            if let Some(allow) = &self.config.anycast_allow {
                if !allow.contains(destination) {
                    return ForwardingDecision::drop_request()
                        .because(format!("destination {} not in anycast allow-list", destination));
                }
            }
            if self.config.anycast_deny.contains(destination) {
                return ForwardingDecision::drop_request()
                    .because(format!("destination {} is denied", destination));
            }
        }

        if let Some(decision) = self.run_filters(request) {
            return decision;
        }

        match self.config.default_result {
            DefaultResult::Forward => ForwardingDecision::Forward,
            DefaultResult::Drop => ForwardingDecision::reject().because(DEFAULT_FILTERED_REASON),
        }
    }

    /// The next hop towards `destination`, if it is already on `path`
    fn looping_next_hop(
        &self,
        destination: Option<&NodeId>,
        path: &NetworkPath,
    ) -> Option<ConnectionId> {
        let hop = self.routing.next_hop(destination?)?;
        path.contains(&hop.peer()).then_some(hop)
    }

    /// Consult every filter; the first decision wins
    fn run_filters(&self, request: &Request) -> Option<ForwardingDecision> {
        let mut filters: Vec<Arc<dyn ForwardingFilter>> = self
            .filters
            .read()
            .get(&request.action)
            .cloned()
            .unwrap_or_default();
        filters.extend(self.wildcard_filters.read().iter().cloned());

        let mut chosen: Option<ForwardingDecision> = None;
        for (index, filter) in filters.iter().enumerate() {
            let decision = match catch_unwind(AssertUnwindSafe(|| filter.filter(request))) {
                Ok(decision) => decision,
                Err(_) => {
                    error!(
                        "Forwarding filter #{} panicked on {} [{}]",
                        index, request.action, request.request_id
                    );
                    None
                }
            };

            match (&chosen, decision) {
                (_, None) => {}
                (None, Some(decision)) => chosen = Some(decision),
                (Some(first), Some(other)) => {
                    if discriminant(first) != discriminant(&other) {
                        warn!(
                            "Filters disagree on {} [{}]: keeping {}, ignoring {}",
                            request.action, request.request_id, first, other
                        );
                    }
                }
            }
        }
        chosen
    }

    fn complete(&self, request: &Request, decision: ForwardingDecision) -> ForwardingDecision {
        match decision {
            ForwardingDecision::Forward => ForwardingDecision::Forward,
            ForwardingDecision::Reject { response, reason } => ForwardingDecision::Reject {
                response: Some(response.unwrap_or_else(|| self.default_response(request))),
                reason: Some(reason.unwrap_or_else(|| DEFAULT_FILTERED_REASON.to_string())),
            },
            ForwardingDecision::Drop { response, reason } => ForwardingDecision::Drop {
                response: Some(response.unwrap_or_else(|| self.default_response(request))),
                reason: Some(reason.unwrap_or_else(|| DEFAULT_FILTERED_REASON.to_string())),
            },
        }
    }

    fn default_response(&self, request: &Request) -> Value {
        self.responses.filtered(request, DEFAULT_FILTERED_REASON)
    }

    /// Decide on `request` and carry the decision out, returning the reply
    /// for the sender
    pub async fn process(
        &self,
        request: Request,
        connection: &ConnectionId,
        cancel: &CancellationToken,
    ) -> Envelope {
        let decision = self.decide(&request);
        info!(
            "{} [{}] from {} to {}: {}",
            request.action,
            request.request_id,
            connection,
            request.destination.as_ref().map(NodeId::as_str).unwrap_or("-"),
            decision
        );
        self.observers
            .notify("forwarding_decision", |o| o.on_forwarding_decision(&request, &decision));

        match decision {
            ForwardingDecision::Forward => self.forward(request, cancel).await,
            // Both answer on behalf of the destination, as a handler would
            ForwardingDecision::Reject { response, .. }
            | ForwardingDecision::Drop { response, .. } => {
                let payload = response.unwrap_or_else(|| self.default_response(&request));
                let payload = payload_in_format(payload, request.format());
                signed_response(&self.node_id, &request, payload, &self.policy)
            }
        }
    }

    async fn forward(&self, mut request: Request, cancel: &CancellationToken) -> Envelope {
        let context = MessageContext::request(&request.action);
        if let Err(e) = verify_by_policy(&mut request, &context, &self.policy) {
            warn!("Not forwarding {} [{}]: {}", request.action, request.request_id, e);
            return self.error_for(&request, ErrorCode::SignatureError, e.to_string());
        }

        let next_hop = match request.destination.as_ref().and_then(|d| self.routing.next_hop(d)) {
            Some(connection) => connection,
            None => {
                warn!(
                    "No route for {} [{}] to {:?}",
                    request.action, request.request_id, request.destination
                );
                return self.error_for(&request, ErrorCode::GenericError, "no route to destination");
            }
        };

        let forwarded = Request {
            request_id: RequestId::random(),
            action: request.action.clone(),
            destination: request.destination.clone(),
            network_path: request.network_path.append_hop(self.node_id.clone()),
            payload: request.payload.clone(),
            signatures: request.signatures.clone(),
            sign_infos: Vec::new(),
        };
        debug!(
            "Relaying {} [{}] as [{}] via {}",
            request.action, request.request_id, forwarded.request_id, next_hop
        );

        let completion = match self
            .outbound
            .send_and_await(&next_hop, forwarded, self.request_timeout, cancel)
            .await
        {
            Ok(completion) => completion,
            Err(OutboundError::Signature(e)) => {
                return self.error_for(&request, ErrorCode::SignatureError, e.to_string());
            }
            Err(e) => {
                error!("Forwarding {} [{}] failed: {}", request.action, request.request_id, e);
                return self.error_for(&request, ErrorCode::InternalError, e.to_string());
            }
        };

        let destination = request.network_path.source().cloned();
        match completion.outcome {
            RequestOutcome::Response(response) => Envelope::Response(Response {
                request_id: request.request_id,
                destination,
                network_path: response.network_path.append_hop(self.node_id.clone()),
                payload: response.payload,
                signatures: response.signatures,
            }),
            RequestOutcome::Error(error) => Envelope::Error(ErrorMessage {
                request_id: request.request_id,
                destination,
                network_path: error.network_path.append_hop(self.node_id.clone()),
                ..error
            }),
            RequestOutcome::Timeout { after } => self.error_for(
                &request,
                ErrorCode::GenericError,
                format!("no response from next hop {} within {:?}", next_hop, after),
            ),
            RequestOutcome::TransmissionFailed(e) => self.error_for(
                &request,
                ErrorCode::InternalError,
                format!("forwarding failed: {}", e),
            ),
            RequestOutcome::Cancelled => {
                self.error_for(&request, ErrorCode::InternalError, "forwarding cancelled")
            }
        }
    }

    /// Relay a one-way message; nothing is answered either way
    pub async fn relay_message(&self, message: SendMessage) {
        if message.network_path.contains(&self.node_id) {
            warn!(
                "Dropping {} [{}]: loop via {}",
                message.action, message.request_id, message.network_path
            );
            return;
        }
        let destination = message.destination.as_ref();
        if let Some(hop) = self.looping_next_hop(destination, &message.network_path) {
            warn!(
                "Dropping {} [{}]: next hop {} already in {}",
                message.action, message.request_id, hop, message.network_path
            );
            return;
        }

        let Some(destination) = message.destination.clone() else {
            return;
        };
        let denied = self.config.anycast_deny.contains(&destination)
            || self
                .config
                .anycast_allow
                .as_ref()
                .is_some_and(|allow| !allow.contains(&destination));
        if denied {
            debug!(
                "Dropping {} [{}] to {}: out of scope",
                message.action, message.request_id, destination
            );
            return;
        }

        let Some(next_hop) = self.routing.next_hop(&destination) else {
            warn!(
                "No route for {} [{}] to {}",
                message.action, message.request_id, destination
            );
            return;
        };

        let forwarded = SendMessage {
            network_path: message.network_path.append_hop(self.node_id.clone()),
            ..message
        };
        if let Err(e) = self.outbound.send_message(&next_hop, forwarded).await {
            warn!("Relaying message to {} failed: {}", destination, e);
        }
    }

    fn error_for(
        &self,
        request: &Request,
        code: ErrorCode,
        description: impl Into<String>,
    ) -> Envelope {
        Envelope::Error(request.error_reply(&self.node_id, code, description, json!({})))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::transport::ChannelTransport;
    use ocpp_core::NetworkPath;

    fn engine(config: NodeConfig) -> ForwardingEngine {
        let transport = Arc::new(ChannelTransport::new());
        let policy = Arc::new(SignaturePolicy::new());
        let outbound = Arc::new(OutboundEngine::new(
            config.node_id.clone(),
            transport,
            policy.clone(),
            Observers::new(),
        ));
        ForwardingEngine::new(
            config.node_id.clone(),
            config.forwarding.clone(),
            config.outbound.request_timeout,
            Arc::new(ResponseFactory::new()),
            policy,
            Observers::new(),
            outbound,
            Arc::new(RoutingTable::new()),
        )
    }

    fn relayed(action: &str) -> Request {
        Request::new(action, json!({"vendorId": "EK"}))
            .to("CS001")
            .with_path(NetworkPath::from_source("CSMS"))
    }

    #[test]
    fn test_default_forward() {
        let engine = engine(NodeConfig::new("NN01").with_forwarding(DefaultResult::Forward));
        assert_eq!(engine.decide(&relayed("Reset")), ForwardingDecision::Forward);
    }

    #[test]
    fn test_default_drop_becomes_reject_with_response() {
        let engine = engine(NodeConfig::new("NN01").with_forwarding(DefaultResult::Drop));
        let decision = engine.decide(&relayed("Reset"));

        assert_eq!(decision.kind(), "REJECT");
        assert!(decision.response().is_some());
    }

    #[test]
    fn test_loop_rejected_regardless_of_filters() {
        let engine = engine(NodeConfig::new("NN01").with_forwarding(DefaultResult::Forward));
        engine.add_wildcard_filter(Arc::new(|_: &Request| Some(ForwardingDecision::Forward)));

        let looped = NetworkPath::from_source("CSMS").append_hop("NN01");
        let request = relayed("Reset").with_path(looped);
        let decision = engine.decide(&request);

        assert_eq!(decision.kind(), "REJECT");
        assert!(decision.reason().unwrap().contains("loop"));
    }

    #[test]
    fn test_anycast_scoping_drops_before_filters() {
        let engine = engine(
            NodeConfig::new("NN01")
                .with_forwarding(DefaultResult::Forward)
                .with_anycast_allow(["CS002"]),
        );
        engine.add_filter("Reset", Arc::new(|_: &Request| Some(ForwardingDecision::Forward)));

        assert_eq!(engine.decide(&relayed("Reset")).kind(), "DROP");
    }

    #[test]
    fn test_first_filter_decision_wins() {
        let engine = engine(NodeConfig::new("NN01").with_forwarding(DefaultResult::Forward));
        engine.add_filter("DataTransfer", Arc::new(|_: &Request| None));
        engine.add_filter(
            "DataTransfer",
            Arc::new(|_: &Request| {
                Some(ForwardingDecision::drop_request().because("vendor blocked"))
            }),
        );
        engine.add_wildcard_filter(Arc::new(|_: &Request| Some(ForwardingDecision::Forward)));

        let decision = engine.decide(&relayed("DataTransfer"));
        assert_eq!(decision.kind(), "DROP");
        assert_eq!(decision.reason(), Some("vendor blocked"));

        assert_eq!(engine.decide(&relayed("Reset")), ForwardingDecision::Forward);
    }

    #[test]
    fn test_panicking_filter_is_skipped() {
        let engine = engine(NodeConfig::new("NN01").with_forwarding(DefaultResult::Forward));
        engine.add_wildcard_filter(Arc::new(|_: &Request| -> Option<ForwardingDecision> {
            panic!("filter bug")
        }));
        engine.add_wildcard_filter(Arc::new(|_: &Request| Some(ForwardingDecision::reject())));

        assert_eq!(engine.decide(&relayed("Reset")).kind(), "REJECT");
    }

    #[test]
    fn test_loop_via_next_hop_rejected() {
        let engine = engine(NodeConfig::new("NN01").with_forwarding(DefaultResult::Forward));
        engine.routing.set_default(Some(ConnectionId::from("CSMS")));

        // CS999 is unknown, so the request would go back up to the CSMS it came from
        let request = relayed("Reset").to("CS999");
        let decision = engine.decide(&request);
        assert_eq!(decision.kind(), "REJECT");
        assert!(decision.reason().unwrap().contains("next hop CSMS"));

        engine.routing.add_route("CS999".into(), ConnectionId::from("CS999"));
        assert_eq!(engine.decide(&request), ForwardingDecision::Forward);
    }

    #[tokio::test]
    async fn test_drop_replies_with_synthesized_response() {
        let engine = engine(
            NodeConfig::new("NN01")
                .with_forwarding(DefaultResult::Forward)
                .with_anycast_deny("CS001"),
        );
        let request = relayed("Reset");

        let reply = engine
            .process(request.clone(), &ConnectionId::from("CSMS"), &CancellationToken::new())
            .await;
        match reply {
            Envelope::Response(r) => {
                let payload = r.payload.as_json().unwrap();
                assert_eq!(r.request_id, request.request_id);
                assert_eq!(r.destination, Some(NodeId::from("CSMS")));
                assert_eq!(payload["status"], "Rejected");
                assert_eq!(payload["statusInfo"]["additionalInfo"], DEFAULT_FILTERED_REASON);
            }
            other => panic!("Expected Response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forward_without_route_is_error() {
        let engine = engine(NodeConfig::new("NN01").with_forwarding(DefaultResult::Forward));
        let reply = engine
            .process(relayed("Reset"), &ConnectionId::from("CSMS"), &CancellationToken::new())
            .await;
        assert!(matches!(reply, Envelope::Error(e) if e.error_code == ErrorCode::GenericError));
    }
}
