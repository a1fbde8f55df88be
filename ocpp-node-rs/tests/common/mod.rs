//! Shared helpers for node integration tests
#![allow(dead_code)]

use ocpp_core::{Envelope, Frame, Payload, Request};
use ocpp_node::{
    handler_fn, ActionHandler, ChannelTransport, ConnectionId, ForwardingDecision, HandlerError,
    NetworkingNode, NodeBuilder, NodeConfig, Observer, ObserverResult, RequestCompletion,
    RequestContext,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Log to the test output when `RUST_LOG` is set
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct TestNode {
    pub node: Arc<NetworkingNode>,
    pub transport: Arc<ChannelTransport>,
}

/// Build and start a node over an in-memory transport
pub fn spawn_node(config: NodeConfig, setup: impl FnOnce(NodeBuilder) -> NodeBuilder) -> TestNode {
    init_tracing();
    let transport = Arc::new(ChannelTransport::new());
    let node = setup(NetworkingNode::builder(config, transport.clone()))
        .build()
        .unwrap();
    node.start();
    TestNode { node, transport }
}

/// Connect two nodes both ways, each connection named after the peer
pub fn link(a: &TestNode, b: &TestNode) {
    let a_id = ConnectionId::from(a.node.node_id());
    let b_id = ConnectionId::from(b.node.node_id());

    let a_to_b = a.transport.attach(b_id.clone());
    let b_to_a = b.transport.attach(a_id.clone());

    b.node.spawn_receiver(a_id, a_to_b);
    a.node.spawn_receiver(b_id, b_to_a);
}

/// A peer driven by the test itself: frames the node sends arrive on the receiver
pub fn raw_peer(node: &TestNode, peer: &str) -> (ConnectionId, mpsc::Receiver<Frame>) {
    let conn = ConnectionId::from(peer);
    let rx = node.transport.attach(conn.clone());
    node.node.connection_opened(conn.clone());
    (conn, rx)
}

pub async fn inject(node: &TestNode, conn: &ConnectionId, text: &str) {
    node.node
        .on_receive(conn.clone(), Frame::Text(text.to_string()))
        .await
        .unwrap();
}

pub async fn next_envelope(rx: &mut mpsc::Receiver<Frame>) -> Envelope {
    let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no frame within 5s")
        .expect("connection closed");
    Envelope::parse(&frame).expect("unparseable frame")
}

/// Handler answering `{"status": <status>}`
pub fn status_handler(status: &'static str) -> Arc<dyn ActionHandler> {
    Arc::new(handler_fn(move |_req, _ctx| async move {
        Ok(Payload::Json(json!({ "status": status })))
    }))
}

/// Handler echoing the path it saw and the request payload
pub fn echo_handler() -> Arc<dyn ActionHandler> {
    Arc::new(handler_fn(|req: Request, ctx: RequestContext| async move {
        Ok(Payload::Json(json!({
            "status": "Accepted",
            "path": ctx.network_path.to_string(),
            "echo": req.payload.as_json().cloned().unwrap_or_default(),
        })))
    }))
}

pub async fn exploding(_req: Request, _ctx: RequestContext) -> Result<Payload, HandlerError> {
    panic!("handler bug")
}

pub async fn sleepy(_req: Request, _ctx: RequestContext) -> Result<Payload, HandlerError> {
    tokio::time::sleep(Duration::from_secs(3600)).await;
    Ok(Payload::Json(json!({ "status": "Accepted" })))
}

/// Observer counting what it is told about
#[derive(Default)]
pub struct Recorder {
    pub frames: AtomicUsize,
    pub requests: AtomicUsize,
    pub replies: AtomicUsize,
    pub unknown_responses: AtomicUsize,
    pub resolved: AtomicUsize,
    pub decisions: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl Observer for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn on_frame_received(&self, _: &ConnectionId, _: &Frame) -> ObserverResult {
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_request_received(&self, _: &ConnectionId, _: &Request) -> ObserverResult {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_reply_sent(&self, _: &ConnectionId, _: &Envelope) -> ObserverResult {
        self.replies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_forwarding_decision(&self, _: &Request, decision: &ForwardingDecision) -> ObserverResult {
        self.decisions.lock().unwrap().push(decision.kind().to_string());
        Ok(())
    }

    fn on_request_resolved(&self, _: &RequestCompletion) -> ObserverResult {
        self.resolved.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_unknown_response(&self, _: &ConnectionId, _: &Envelope) -> ObserverResult {
        self.unknown_responses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Observer failing at every stage, one way or the other
pub struct Broken {
    pub panics: bool,
}

impl Observer for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    fn on_request_received(&self, _: &ConnectionId, _: &Request) -> ObserverResult {
        if self.panics {
            panic!("observer bug");
        }
        Err("observer failed".into())
    }

    fn on_reply_sent(&self, _: &ConnectionId, _: &Envelope) -> ObserverResult {
        if self.panics {
            panic!("observer bug");
        }
        Err("observer failed".into())
    }
}
