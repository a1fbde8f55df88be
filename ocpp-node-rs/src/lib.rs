//! # OCPP Node
//!
//! Message routing for charging stations, networking nodes and CSMSs.
//!
//! A node receives frames from its transport, answers requests with locally
//! registered handlers, relays requests addressed to other nodes, and
//! correlates responses to the requests it sent itself.
//!
//! ## Architecture
//!
//! ```text
//!           Transport (WebSocket, in-memory)
//!             │ frames in            ▲ frames out
//!             ▼                      │
//! ┌───────────────────────────────────────────────┐
//! │  NetworkingNode                               │
//! │  ┌───────────────────┐   ┌──────────────────┐ │
//! │  │ InboundDispatcher │──►│ ActionRegistry   │ │
//! │  │ (IN)              │   │ ResponseFactory  │ │
//! │  └──┬────────────┬───┘   └──────────────────┘ │
//! │     │responses   │for other nodes             │
//! │     ▼            ▼                            │
//! │  ┌────────────┐ ┌──────────────────┐          │
//! │  │OutboundEng.│◄│ ForwardingEngine │          │
//! │  │(OUT)       │ │ (FORWARD)        │          │
//! │  └────────────┘ └──────────────────┘          │
//! │     pending table · routing table · policy    │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use ocpp_core::{Payload, Request};
//! use ocpp_node::{handler_fn, NetworkingNode, NodeConfig, WebSocketTransport};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::new("CS001");
//!     let transport = WebSocketTransport::new(config.subprotocol.clone());
//!
//!     let node = NetworkingNode::builder(config, transport.clone())
//!         .handler(
//!             "Reset",
//!             Arc::new(handler_fn(|_req, _ctx| async {
//!                 Ok(Payload::Json(json!({"status": "Accepted"})))
//!             })),
//!         )
//!         .build()?;
//!     node.start();
//!
//!     transport
//!         .connect(&node, "ws://localhost:8180/ocpp", "CS001", "CSMS".into())
//!         .await?;
//!
//!     let boot = Request::new("BootNotification", json!({"reason": "PowerUp"})).to("CSMS");
//!     let completion = node.send_request(boot).await?;
//!     println!("{:?}", completion.outcome);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatcher;
pub mod forwarding;
pub mod node;
pub mod observer;
pub mod outbound;
pub mod registry;
pub mod routing;
pub mod transport;
pub mod ws;

pub use config::{DefaultResult, ForwardingConfig, NodeConfig, OutboundConfig};
pub use dispatcher::InboundDispatcher;
pub use forwarding::{ForwardingDecision, ForwardingEngine, ForwardingFilter};
pub use node::{NetworkingNode, NodeBuilder, NodeError};
pub use observer::{Observer, ObserverResult, Observers};
pub use outbound::{OutboundEngine, OutboundError, PendingTable, RequestCompletion, RequestOutcome};
pub use registry::{
    handler_fn, ActionHandler, ActionRegistry, FailureKind, HandlerError, RequestContext,
    ResponseFactory, DEFAULT_FILTERED_REASON,
};
pub use routing::RoutingTable;
pub use transport::{ChannelTransport, ConnectionId, Transport, TransportError};
pub use ws::WebSocketTransport;
