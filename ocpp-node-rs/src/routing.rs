//! Next-hop selection
//!
//! Direct neighbours map to the connection they are reached over; anything
//! else goes to the default route (the uplink towards the CSMS) when one is set.

use ocpp_core::NodeId;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

use crate::transport::ConnectionId;

#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: RwLock<HashMap<NodeId, ConnectionId>>,
    default_route: RwLock<Option<ConnectionId>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reach `node` over `connection`
    pub fn add_route(&self, node: NodeId, connection: ConnectionId) {
        debug!("Route {} via {}", node, connection);
        self.routes.write().insert(node, connection);
    }

    pub fn remove_route(&self, node: &NodeId) -> Option<ConnectionId> {
        self.routes.write().remove(node)
    }

    /// Forget every route going over `connection`
    pub fn remove_connection(&self, connection: &ConnectionId) {
        self.routes.write().retain(|_, c| c != connection);

        let mut default_route = self.default_route.write();
        if default_route.as_ref() == Some(connection) {
            *default_route = None;
        }
    }

    pub fn set_default(&self, connection: Option<ConnectionId>) {
        *self.default_route.write() = connection;
    }

    /// Connection leading towards `destination`
    pub fn next_hop(&self, destination: &NodeId) -> Option<ConnectionId> {
        if let Some(connection) = self.routes.read().get(destination) {
            return Some(connection.clone());
        }
        self.default_route.read().clone()
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}
