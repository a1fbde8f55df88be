//! Outbound request engine
//!
//! Every request sent by this node gets an entry in the pending table before
//! it is written to the transport. The entry is removed exactly once, by
//! whichever of these gets there first:
//!
//! - a response or error with the same request id, arriving on the connection
//!   the request went out on ([`OutboundEngine::resolve`])
//! - the timer inside the awaiting call, or the periodic sweep
//! - a transport failure while sending, or the connection closing
//! - cancellation of the caller's token
//!
//! Removal from the [`DashMap`] is the arbitration point; only the remover
//! completes the request, everyone else finds nothing and backs off.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ocpp_core::policy::sign_message;
use ocpp_core::{
    EncodeError, Envelope, ErrorMessage, MessageContext, NodeId, Request, RequestId, Response,
    SendMessage, SignatureError, SignaturePolicy,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::observer::Observers;
use crate::transport::{ConnectionId, Transport, TransportError};

/// Terminal state of an outbound request
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    Response(Response),
    Error(ErrorMessage),
    Timeout { after: Duration },
    TransmissionFailed(TransportError),
    Cancelled,
}

impl RequestOutcome {
    pub fn is_response(&self) -> bool {
        matches!(self, RequestOutcome::Response(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RequestOutcome::Response(_) => "response",
            RequestOutcome::Error(_) => "error",
            RequestOutcome::Timeout { .. } => "timeout",
            RequestOutcome::TransmissionFailed(_) => "transmission failure",
            RequestOutcome::Cancelled => "cancelled",
        }
    }
}

/// A finished outbound request
#[derive(Debug, Clone)]
pub struct RequestCompletion {
    pub request_id: RequestId,
    pub action: String,
    pub connection: ConnectionId,
    pub outcome: RequestOutcome,
    pub round_trip: Duration,
}

/// Deadline used when `sent_at + timeout` does not fit in an [`Instant`]
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Failures before the request reached the pending table
#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("signing failed: {0}")]
    Signature(#[from] SignatureError),

    #[error("encoding failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("request id {1} already pending on {0}")]
    DuplicateRequestId(ConnectionId, RequestId),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug)]
pub struct PendingRequest {
    pub action: String,
    pub connection: ConnectionId,
    pub sent_at: Instant,
    pub expires_at: Instant,
    completion: oneshot::Sender<RequestOutcome>,
}

impl PendingRequest {
    fn complete(self, outcome: RequestOutcome) {
        // Receiver gone means the caller stopped waiting
        let _ = self.completion.send(outcome);
    }

    fn timeout(&self) -> Duration {
        self.expires_at.saturating_duration_since(self.sent_at)
    }
}

/// Request ids are only unique per connection
pub type PendingKey = (ConnectionId, RequestId);

/// In-flight requests keyed by connection and request id
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: DashMap<PendingKey, PendingRequest>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entry` unless the id is already pending on its connection
    pub fn insert_if_absent(&self, id: RequestId, entry: PendingRequest) -> bool {
        match self.entries.entry((entry.connection.clone(), id)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    pub fn remove(&self, connection: &ConnectionId, id: &RequestId) -> Option<PendingRequest> {
        self.entries
            .remove(&(connection.clone(), id.clone()))
            .map(|(_, entry)| entry)
    }

    /// Remove every entry expired at `now`
    pub fn take_expired(&self, now: Instant) -> Vec<(RequestId, PendingRequest)> {
        let expired: Vec<PendingKey> = self
            .entries
            .iter()
            .filter(|e| e.expires_at <= now)
            .map(|e| e.key().clone())
            .collect();

        self.remove_keys(expired)
    }

    /// Remove every entry sent over `connection`
    pub fn remove_for_connection(
        &self,
        connection: &ConnectionId,
    ) -> Vec<(RequestId, PendingRequest)> {
        let keys: Vec<PendingKey> = self
            .entries
            .iter()
            .filter(|e| &e.key().0 == connection)
            .map(|e| e.key().clone())
            .collect();

        self.remove_keys(keys)
    }

    fn remove_keys(&self, keys: Vec<PendingKey>) -> Vec<(RequestId, PendingRequest)> {
        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .map(|((_, id), entry)| (id, entry))
            .collect()
    }

    pub fn contains(&self, connection: &ConnectionId, id: &RequestId) -> bool {
        self.entries.contains_key(&(connection.clone(), id.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Sends requests and correlates their outcomes
pub struct OutboundEngine {
    node_id: NodeId,
    transport: Arc<dyn Transport>,
    policy: Arc<SignaturePolicy>,
    pending: PendingTable,
    observers: Observers,
}

impl OutboundEngine {
    pub fn new(
        node_id: NodeId,
        transport: Arc<dyn Transport>,
        policy: Arc<SignaturePolicy>,
        observers: Observers,
    ) -> Self {
        Self {
            node_id,
            transport,
            policy,
            pending: PendingTable::new(),
            observers,
        }
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Sign, send and wait for the outcome of `request`.
    ///
    /// Errors are returned only when the request never made it into the
    /// pending table; everything after that is a [`RequestOutcome`].
    pub async fn send_and_await(
        &self,
        connection: &ConnectionId,
        mut request: Request,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<RequestCompletion, OutboundError> {
        let context = MessageContext::request(&request.action);
        sign_message(&mut request, &context, &self.policy, &[])?;
        let frame = Envelope::Request(request.clone()).to_frame()?;

        let id = request.request_id.clone();
        let sent_at = Instant::now();
        let expires_at = sent_at
            .checked_add(timeout)
            .unwrap_or_else(|| sent_at + FAR_FUTURE);
        let (tx, mut rx) = oneshot::channel();
        let entry = PendingRequest {
            action: request.action.clone(),
            connection: connection.clone(),
            sent_at,
            expires_at,
            completion: tx,
        };
        if !self.pending.insert_if_absent(id.clone(), entry) {
            warn!(
                "Refusing to send {}: request id {} already pending on {}",
                request.action, id, connection
            );
            return Err(OutboundError::DuplicateRequestId(connection.clone(), id));
        }

        debug!("Sending {} [{}] via {}", request.action, id, connection);
        self.observers
            .notify("request_sent", |o| o.on_request_sent(connection, &request));

        if let Err(e) = self.transport.send(connection, frame).await {
            warn!("Failed to send {} [{}]: {}", request.action, id, e);
            if let Some(entry) = self.pending.remove(connection, &id) {
                entry.complete(RequestOutcome::TransmissionFailed(e));
            }
        }

        let outcome = tokio::select! {
            resolved = &mut rx => resolved.unwrap_or(RequestOutcome::Cancelled),
            _ = time::sleep_until(expires_at) => {
                match self.pending.remove(connection, &id) {
                    Some(_) => RequestOutcome::Timeout { after: timeout },
                    None => rx.await.unwrap_or(RequestOutcome::Cancelled),
                }
            }
            _ = cancel.cancelled() => {
                match self.pending.remove(connection, &id) {
                    Some(_) => RequestOutcome::Cancelled,
                    None => rx.await.unwrap_or(RequestOutcome::Cancelled),
                }
            }
        };

        let completion = RequestCompletion {
            request_id: id,
            action: request.action,
            connection: connection.clone(),
            outcome,
            round_trip: sent_at.elapsed(),
        };
        info!(
            "{} [{}] finished with {} after {:?}",
            completion.action,
            completion.request_id,
            completion.outcome.kind(),
            completion.round_trip
        );
        self.observers
            .notify("request_resolved", |o| o.on_request_resolved(&completion));

        Ok(completion)
    }

    /// Sign and send a one-way message
    pub async fn send_message(
        &self,
        connection: &ConnectionId,
        mut message: SendMessage,
    ) -> Result<(), OutboundError> {
        let context = MessageContext::message(&message.action);
        sign_message(&mut message, &context, &self.policy, &[])?;
        let frame = Envelope::Send(message).to_frame()?;
        self.transport.send(connection, frame).await?;
        Ok(())
    }

    /// Complete the pending request a response or error belongs to.
    ///
    /// Only a request sent over `connection` can be resolved by it. Returns
    /// false for requests, sends, and unknown or late ids.
    pub fn resolve(&self, envelope: Envelope, connection: &ConnectionId) -> bool {
        let id = envelope.request_id().clone();
        let outcome = match envelope {
            Envelope::Response(response) => RequestOutcome::Response(response),
            Envelope::Error(error) => RequestOutcome::Error(error),
            other => {
                warn!("Not a response: {:?}", other.action());
                return false;
            }
        };

        match self.pending.remove(connection, &id) {
            Some(entry) => {
                entry.complete(outcome);
                true
            }
            None => {
                warn!(
                    "{} for unknown or late request id {} on {}",
                    outcome.kind(),
                    id,
                    connection
                );
                let envelope = match outcome {
                    RequestOutcome::Response(r) => Envelope::Response(r),
                    RequestOutcome::Error(e) => Envelope::Error(e),
                    _ => return false,
                };
                self.observers
                    .notify("unknown_response", |o| o.on_unknown_response(connection, &envelope));
                false
            }
        }
    }

    /// Time out every expired entry, returns how many were expired
    pub fn sweep_expired(&self) -> usize {
        let expired = self.pending.take_expired(Instant::now());
        let count = expired.len();
        for (id, entry) in expired {
            debug!("Request {} [{}] expired", entry.action, id);
            let after = entry.timeout();
            entry.complete(RequestOutcome::Timeout { after });
        }
        count
    }

    /// Periodically sweep the pending table until `cancel` fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = engine.sweep_expired();
                        if expired > 0 {
                            debug!("{}: swept {} expired request(s)", engine.node_id, expired);
                        }
                    }
                }
            }
            debug!("{}: pending sweeper stopped", engine.node_id);
        })
    }

    /// Fail every request in flight on a closed connection
    pub fn fail_connection(&self, connection: &ConnectionId) -> usize {
        let failed = self.pending.remove_for_connection(connection);
        let count = failed.len();
        for (id, entry) in failed {
            debug!("Request {} [{}] lost with connection {}", entry.action, id, connection);
            entry.complete(RequestOutcome::TransmissionFailed(TransportError::ConnectionClosed(
                connection.clone(),
            )));
        }
        if count > 0 {
            warn!("{} request(s) failed: connection {} closed", count, connection);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use serde_json::json;

    fn engine(transport: Arc<ChannelTransport>) -> Arc<OutboundEngine> {
        Arc::new(OutboundEngine::new(
            NodeId::from("CSMS"),
            transport,
            Arc::new(SignaturePolicy::new()),
            Observers::new(),
        ))
    }

    fn entry(
        connection: &str,
        ttl: Duration,
    ) -> (PendingRequest, oneshot::Receiver<RequestOutcome>) {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let entry = PendingRequest {
            action: "Reset".into(),
            connection: ConnectionId::from(connection),
            sent_at: now,
            expires_at: now + ttl,
            completion: tx,
        };
        (entry, rx)
    }

    #[tokio::test]
    async fn test_insert_if_absent_refuses_duplicates() {
        let table = PendingTable::new();
        let (first, _rx1) = entry("CS001", Duration::from_secs(5));
        let (second, _rx2) = entry("CS001", Duration::from_secs(5));

        assert!(table.insert_if_absent(RequestId::from("1"), first));
        assert!(!table.insert_if_absent(RequestId::from("1"), second));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_same_id_pending_on_two_connections() {
        let table = PendingTable::new();
        let (first, _rx1) = entry("CS001", Duration::from_secs(5));
        let (second, _rx2) = entry("CS002", Duration::from_secs(5));

        assert!(table.insert_if_absent(RequestId::from("42"), first));
        assert!(table.insert_if_absent(RequestId::from("42"), second));
        assert_eq!(table.len(), 2);

        let removed = table.remove(&ConnectionId::from("CS002"), &RequestId::from("42"));
        assert_eq!(removed.unwrap().connection, ConnectionId::from("CS002"));
        assert!(table.contains(&ConnectionId::from("CS001"), &RequestId::from("42")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_expired_only_takes_due_entries() {
        let table = PendingTable::new();
        let (short, _rx1) = entry("CS001", Duration::from_secs(1));
        let (long, _rx2) = entry("CS001", Duration::from_secs(60));
        table.insert_if_absent(RequestId::from("short"), short);
        table.insert_if_absent(RequestId::from("long"), long);

        time::advance(Duration::from_secs(2)).await;
        let expired = table.take_expired(Instant::now());

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, RequestId::from("short"));
        assert!(table.contains(&ConnectionId::from("CS001"), &RequestId::from("long")));
    }

    #[tokio::test]
    async fn test_response_resolves_waiting_caller() {
        let transport = Arc::new(ChannelTransport::new());
        let mut peer = transport.attach("CS001");
        let out = engine(transport);
        let conn = ConnectionId::from("CS001");

        let request = Request::new("Reset", json!({"type": "Immediate"})).with_request_id("7");
        let waiter = {
            let out = Arc::clone(&out);
            let conn = conn.clone();
            tokio::spawn(async move {
                out.send_and_await(&conn, request, Duration::from_secs(30), &CancellationToken::new())
                    .await
            })
        };

        let frame = peer.recv().await.unwrap();
        let sent = Envelope::parse(&frame).unwrap();
        assert_eq!(sent.request_id().as_str(), "7");

        let response = Envelope::Response(Response::new("7", json!({"status": "Accepted"})));
        assert!(out.resolve(response.clone(), &conn));
        assert!(!out.resolve(response, &conn));

        let completion = waiter.await.unwrap().unwrap();
        assert!(completion.outcome.is_response());
        assert!(out.pending().is_empty());
    }

    #[tokio::test]
    async fn test_transmission_failure_removes_entry() {
        let transport = Arc::new(ChannelTransport::new());
        let out = engine(transport);

        let completion = out
            .send_and_await(
                &ConnectionId::from("nowhere"),
                Request::new("Reset", json!({})),
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(matches!(
            completion.outcome,
            RequestOutcome::TransmissionFailed(TransportError::UnknownConnection(_))
        ));
        assert!(out.pending().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_removes_entry() {
        let transport = Arc::new(ChannelTransport::new());
        let _peer = transport.attach("CS001");
        let out = engine(transport);
        let cancel = CancellationToken::new();

        let waiter = {
            let out = Arc::clone(&out);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                out.send_and_await(
                    &ConnectionId::from("CS001"),
                    Request::new("Reset", json!({})).with_request_id("c1"),
                    Duration::from_secs(30),
                    &cancel,
                )
                .await
            })
        };

        let conn = ConnectionId::from("CS001");
        while !out.pending().contains(&conn, &RequestId::from("c1")) {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        let completion = waiter.await.unwrap().unwrap();
        assert!(matches!(completion.outcome, RequestOutcome::Cancelled));
        assert!(!out.pending().contains(&conn, &RequestId::from("c1")));
    }

    #[tokio::test]
    async fn test_response_on_other_connection_does_not_resolve() {
        let transport = Arc::new(ChannelTransport::new());
        let mut cs1 = transport.attach("CS001");
        let mut cs2 = transport.attach("CS002");
        let out = engine(transport);
        let (conn1, conn2) = (ConnectionId::from("CS001"), ConnectionId::from("CS002"));

        let mut waiters = Vec::new();
        for conn in [conn1.clone(), conn2.clone()] {
            let out = Arc::clone(&out);
            waiters.push(tokio::spawn(async move {
                let request = Request::new("Reset", json!({})).with_request_id("42");
                let cancel = CancellationToken::new();
                out.send_and_await(&conn, request, Duration::from_secs(30), &cancel)
                    .await
            }));
        }
        cs1.recv().await.unwrap();
        cs2.recv().await.unwrap();
        assert_eq!(out.pending().len(), 2);

        // CS002 answers twice; the second answer must not complete CS001's request
        let response = Envelope::Response(Response::new("42", json!({"status": "Accepted"})));
        assert!(out.resolve(response.clone(), &conn2));
        assert!(!out.resolve(response, &conn2));
        assert!(out.pending().contains(&conn1, &RequestId::from("42")));

        let response = Envelope::Response(Response::new("42", json!({"status": "Rejected"})));
        assert!(out.resolve(response, &conn1));

        let first = waiters.remove(0).await.unwrap().unwrap();
        let second = waiters.remove(0).await.unwrap().unwrap();
        match (first.outcome, second.outcome) {
            (RequestOutcome::Response(a), RequestOutcome::Response(b)) => {
                assert_eq!(a.payload.as_json().unwrap()["status"], "Rejected");
                assert_eq!(b.payload.as_json().unwrap()["status"], "Accepted");
            }
            other => panic!("Expected two responses, got {:?}", other),
        }
        assert!(out.pending().is_empty());
    }

    #[tokio::test]
    async fn test_unbounded_timeout_does_not_overflow() {
        let transport = Arc::new(ChannelTransport::new());
        let mut peer = transport.attach("CS001");
        let out = engine(transport);
        let conn = ConnectionId::from("CS001");

        let waiter = {
            let out = Arc::clone(&out);
            let conn = conn.clone();
            tokio::spawn(async move {
                let request = Request::new("Reset", json!({})).with_request_id("forever");
                out.send_and_await(&conn, request, Duration::MAX, &CancellationToken::new())
                    .await
            })
        };

        peer.recv().await.unwrap();
        assert_eq!(out.sweep_expired(), 0);
        let response = Envelope::Response(Response::new("forever", json!({"status": "Accepted"})));
        assert!(out.resolve(response, &conn));

        let completion = waiter.await.unwrap().unwrap();
        assert!(completion.outcome.is_response());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_reclaims_abandoned_request() {
        let transport = Arc::new(ChannelTransport::new());
        let _peer = transport.attach("CS001");
        let out = engine(transport);
        let cancel = CancellationToken::new();
        let _sweeper = out.spawn_sweeper(Duration::from_secs(1), cancel.clone());

        let caller = {
            let out = Arc::clone(&out);
            tokio::spawn(async move {
                out.send_and_await(
                    &ConnectionId::from("CS001"),
                    Request::new("Reset", json!({})).with_request_id("gone"),
                    Duration::from_secs(5),
                    &CancellationToken::new(),
                )
                .await
            })
        };
        while out.pending().is_empty() {
            tokio::task::yield_now().await;
        }

        // The caller stops waiting; only the sweeper can clean up now
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());
        assert_eq!(out.pending().len(), 1);

        time::sleep(Duration::from_secs(5) + Duration::from_secs(2)).await;
        assert!(out.pending().is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_fail_connection() {
        let transport = Arc::new(ChannelTransport::new());
        let out = engine(transport);
        let (a, rx_a) = entry("CS001", Duration::from_secs(30));
        let (b, _rx_b) = entry("CS002", Duration::from_secs(30));
        out.pending().insert_if_absent(RequestId::from("a"), a);
        out.pending().insert_if_absent(RequestId::from("b"), b);

        assert_eq!(out.fail_connection(&ConnectionId::from("CS001")), 1);
        assert!(matches!(rx_a.await.unwrap(), RequestOutcome::TransmissionFailed(_)));
        assert_eq!(out.pending().len(), 1);
    }
}
