//! WebSocket transport
//!
//! Handles:
//! - Outbound connections with the OCPP subprotocol (`{base_url}/{station_id}`)
//! - Inbound connections, naming each after the station id in the URL path
//! - One receive task and one sender task per connection
//!
//! Text messages carry JSON frames, binary messages carry binary frames.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use ocpp_core::Frame;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    accept_hdr_async, connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        handshake::server::{ErrorResponse, Request as ServerRequest, Response as ServerResponse},
        http::{header, HeaderValue, StatusCode},
        protocol::WebSocketConfig,
        Message,
    },
    WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::node::NetworkingNode;
use crate::transport::{ConnectionId, Transport, TransportError};

/// Frames queued per connection before senders wait
const SEND_QUEUE: usize = 64;

/// WebSocket carrier for one node's connections
pub struct WebSocketTransport {
    subprotocol: String,
    connections: RwLock<HashMap<ConnectionId, mpsc::Sender<Frame>>>,
}

impl WebSocketTransport {
    pub fn new(subprotocol: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            subprotocol: subprotocol.into(),
            connections: RwLock::new(HashMap::new()),
        })
    }

    pub fn subprotocol(&self) -> &str {
        &self.subprotocol
    }

    pub fn is_connected(&self, connection: &ConnectionId) -> bool {
        self.connections.read().contains_key(connection)
    }

    /// Make `sender` the live channel of `connection`, replacing a previous one
    fn register(&self, connection: &ConnectionId, sender: mpsc::Sender<Frame>) {
        if self.connections.write().insert(connection.clone(), sender).is_some() {
            info!("{} reconnected, replacing its previous connection", connection);
        }
    }

    /// Forget `connection` unless a newer connection took its place
    fn release(&self, connection: &ConnectionId, sender: &mpsc::Sender<Frame>) -> bool {
        let mut connections = self.connections.write();
        match connections.get(connection) {
            Some(current) if current.same_channel(sender) => {
                connections.remove(connection);
                true
            }
            _ => false,
        }
    }

    fn ws_config() -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: Some(64 * 1024),
            max_frame_size: Some(16 * 1024),
            ..Default::default()
        }
    }

    /// Connect to `{base_url}/{station_id}` and use the connection as the
    /// node's default route, naming it `peer`
    pub async fn connect(
        self: &Arc<Self>,
        node: &Arc<NetworkingNode>,
        base_url: &str,
        station_id: &str,
        peer: ConnectionId,
    ) -> Result<JoinHandle<()>, TransportError> {
        let url = build_ocpp_url(base_url, station_id);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Handshake(format!("invalid url {}: {}", url, e)))?;
        let protocol = HeaderValue::from_str(&self.subprotocol)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, protocol);

        let (ws_stream, response) =
            connect_async_with_config(request, Some(Self::ws_config()), false)
                .await
                .map_err(|e| {
                    error!("WebSocket connection to {} failed: {}", url, e);
                    TransportError::Handshake(e.to_string())
                })?;

        let accepted = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if accepted != Some(self.subprotocol.as_str()) {
            warn!("{} did not accept subprotocol {}, got: {:?}", url, self.subprotocol, accepted);
        }

        info!("WebSocket connected to {} as {}", url, peer);
        let handle = self.run_connection(node, peer.clone(), ws_stream);
        node.routing().set_default(Some(peer));
        Ok(handle)
    }

    /// Complete the server handshake on `stream`
    pub async fn accept(
        self: &Arc<Self>,
        node: &Arc<NetworkingNode>,
        stream: TcpStream,
    ) -> Result<JoinHandle<()>, TransportError> {
        let subprotocol = self.subprotocol.clone();
        let mut station: Option<String> = None;

        let callback = |req: &ServerRequest, mut response: ServerResponse| {
            station = station_id_from_path(req.uri().path());
            if station.is_none() {
                let mut reject = ErrorResponse::new(Some("station id missing from path".into()));
                *reject.status_mut() = StatusCode::BAD_REQUEST;
                return Err(reject);
            }

            let offered = req
                .headers()
                .get(header::SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if offered.split(',').any(|p| p.trim() == subprotocol) {
                if let Ok(value) = HeaderValue::from_str(&subprotocol) {
                    response.headers_mut().insert(header::SEC_WEBSOCKET_PROTOCOL, value);
                }
            } else {
                warn!("Client offered subprotocols {:?}, expected {}", offered, subprotocol);
            }
            Ok(response)
        };

        let ws_stream = accept_hdr_async(stream, callback)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        let station = station.ok_or_else(|| TransportError::Handshake("no station id".into()))?;
        info!("Accepted WebSocket connection from {}", station);
        Ok(self.run_connection(node, ConnectionId::from(station), ws_stream))
    }

    /// Accept connections on `listener` until `cancel` fires
    pub async fn serve(
        self: Arc<Self>,
        node: Arc<NetworkingNode>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) {
        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("TCP connection from {}", addr);
                        stream
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        continue;
                    }
                }
            };

            let transport = Arc::clone(&self);
            let node = Arc::clone(&node);
            tokio::spawn(async move {
                if let Err(e) = transport.accept(&node, stream).await {
                    warn!("WebSocket handshake failed: {}", e);
                }
            });
        }
        debug!("WebSocket listener stopped");
    }

    /// Register the connection and spawn its receive loop
    fn run_connection<S>(
        self: &Arc<Self>,
        node: &Arc<NetworkingNode>,
        connection: ConnectionId,
        ws_stream: WebSocketStream<S>,
    ) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (send_tx, mut send_rx) = mpsc::channel::<Frame>(SEND_QUEUE);

        let registered = send_tx.clone();
        self.register(&connection, send_tx);
        node.connection_opened(connection.clone());

        let sender_conn = connection.clone();
        let sender_handle = tokio::spawn(async move {
            while let Some(frame) = send_rx.recv().await {
                let message = match frame {
                    Frame::Text(text) => Message::Text(text.into()),
                    Frame::Binary(bytes) => Message::Binary(bytes.to_vec().into()),
                };
                if let Err(e) = ws_tx.send(message).await {
                    error!("Failed to send WebSocket message to {}: {}", sender_conn, e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let transport = Arc::clone(self);
        let node = Arc::clone(node);
        tokio::spawn(async move {
            while let Some(message) = ws_rx.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        debug!("Received from {}: {}", connection, text);
                        node.on_receive(connection.clone(), Frame::Text(text.to_string()));
                    }
                    Ok(Message::Binary(data)) => {
                        debug!("Received {} bytes from {}", data.len(), connection);
                        node.on_receive(connection.clone(), Frame::Binary(Bytes::from(data)));
                    }
                    Ok(Message::Close(_)) => {
                        info!("WebSocket {} closed by peer", connection);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("WebSocket error on {}: {}", connection, e);
                        break;
                    }
                }
            }

            sender_handle.abort();
            if transport.release(&connection, &registered) {
                node.connection_closed(&connection);
            } else {
                debug!("{} already replaced by a newer connection", connection);
            }
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, connection: &ConnectionId, frame: Frame) -> Result<(), TransportError> {
        let tx = self
            .connections
            .read()
            .get(connection)
            .cloned()
            .ok_or_else(|| TransportError::UnknownConnection(connection.clone()))?;

        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed(connection.clone()))
    }
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, station_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), station_id)
}

/// Station id is the last non-empty path segment
pub fn station_id_from_path(path: &str) -> Option<String> {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
