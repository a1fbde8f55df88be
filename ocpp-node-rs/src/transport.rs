//! Transport contract between the node and whatever carries its frames
//!
//! The node only needs "send this frame to connection X"; frames arriving on
//! a connection are pushed into [`crate::NetworkingNode::on_receive`].

use async_trait::async_trait;
use ocpp_core::{Frame, NodeId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Identifier of one transport connection.
///
/// OCPP connections are named after the node on the other end (the station
/// id in the WebSocket URL), so a connection id doubles as the peer's node id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Node id of the peer on this connection
    pub fn peer(&self) -> NodeId {
        NodeId::new(self.0.clone())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&NodeId> for ConnectionId {
    fn from(id: &NodeId) -> Self {
        Self(id.as_str().to_string())
    }
}

/// Errors reported by a transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection {0} closed")]
    ConnectionClosed(ConnectionId),

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Outbound half of a transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one frame to the peer on `connection`
    async fn send(&self, connection: &ConnectionId, frame: Frame) -> Result<(), TransportError>;
}

/// In-process transport backed by tokio channels.
///
/// Each attached connection gets a receiver; whoever holds it plays the peer.
pub struct ChannelTransport {
    connections: RwLock<HashMap<ConnectionId, mpsc::Sender<Frame>>>,
    capacity: usize,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Open a connection and return the peer's end
    pub fn attach(&self, connection: impl Into<ConnectionId>) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.connections.write().insert(connection.into(), tx);
        rx
    }

    /// Close a connection; pending sends to it fail from now on
    pub fn detach(&self, connection: &ConnectionId) -> bool {
        self.connections.write().remove(connection).is_some()
    }

    pub fn is_attached(&self, connection: &ConnectionId) -> bool {
        self.connections.read().contains_key(connection)
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, connection: &ConnectionId, frame: Frame) -> Result<(), TransportError> {
        let tx = self
            .connections
            .read()
            .get(connection)
            .cloned()
            .ok_or_else(|| TransportError::UnknownConnection(connection.clone()))?;

        debug!("Sending {} byte frame to {}", frame.len(), connection);
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed(connection.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_transport_delivers() {
        let transport = ChannelTransport::new();
        let mut rx = transport.attach("CS001");

        transport
            .send(&ConnectionId::from("CS001"), Frame::Text("[2,\"1\",\"Heartbeat\",{}]".into()))
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(Frame::Text("[2,\"1\",\"Heartbeat\",{}]".into())));
    }

    #[tokio::test]
    async fn test_unknown_and_closed_connections() {
        let transport = ChannelTransport::new();
        let conn = ConnectionId::from("CS001");

        let err = transport.send(&conn, Frame::Text("x".into())).await.unwrap_err();
        assert_eq!(err, TransportError::UnknownConnection(conn.clone()));

        let rx = transport.attach("CS001");
        drop(rx);
        let err = transport.send(&conn, Frame::Text("x".into())).await.unwrap_err();
        assert_eq!(err, TransportError::ConnectionClosed(conn.clone()));

        assert!(transport.detach(&conn));
        assert!(!transport.is_attached(&conn));
    }

    #[test]
    fn test_connection_names_peer() {
        assert_eq!(ConnectionId::from("NN01").peer(), NodeId::from("NN01"));
    }
}
