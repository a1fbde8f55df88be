//! Configuration for an OCPP networking node
//!
//! Covers the node identity, the outbound request engine and the forwarding
//! behaviour of relay nodes.

use ocpp_core::actions::subprotocols;
use ocpp_core::NodeId;
use std::collections::HashSet;
use std::time::Duration;

/// Complete node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    // Node identity
    pub node_id: NodeId,

    /// WebSocket subprotocol offered and accepted by the transport
    pub subprotocol: String,

    pub outbound: OutboundConfig,

    pub forwarding: ForwardingConfig,
}

/// Outbound request engine settings
#[derive(Debug, Clone)]
pub struct OutboundConfig {
    /// Timeout applied when the caller gives none
    pub request_timeout: Duration,

    /// How often the pending table is swept for expired entries
    pub sweep_interval: Duration,
}

/// What happens to a relayed request no filter has an opinion on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DefaultResult {
    #[default]
    Forward,
    /// Reject locally with a synthesized response
    Drop,
}

/// Relay settings
#[derive(Debug, Clone, Default)]
pub struct ForwardingConfig {
    /// Relay requests addressed to other nodes
    pub enabled: bool,

    pub default_result: DefaultResult,

    /// When set, only these destinations are relayed
    pub anycast_allow: Option<HashSet<NodeId>>,

    /// Destinations never relayed
    pub anycast_deny: HashSet<NodeId>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::from("ocpp-node"),
            subprotocol: subprotocols::OCPP21.to_string(),
            outbound: OutboundConfig::default(),
            forwarding: ForwardingConfig::default(),
        }
    }
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Set the WebSocket subprotocol
    pub fn with_subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.subprotocol = subprotocol.into();
        self
    }

    /// Set the default request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.outbound.request_timeout = timeout;
        self
    }

    /// Set the pending table sweep interval
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.outbound.sweep_interval = interval;
        self
    }

    /// Act as a relay with the given default result
    pub fn with_forwarding(mut self, default_result: DefaultResult) -> Self {
        self.forwarding.enabled = true;
        self.forwarding.default_result = default_result;
        self
    }

    /// Only relay to these destinations
    pub fn with_anycast_allow<I, N>(mut self, destinations: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        self.forwarding.anycast_allow = Some(destinations.into_iter().map(Into::into).collect());
        self
    }

    /// Never relay to `destination`
    pub fn with_anycast_deny(mut self, destination: impl Into<NodeId>) -> Self {
        self.forwarding.anycast_deny.insert(destination.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.subprotocol, "ocpp2.1");
        assert_eq!(config.outbound.request_timeout, Duration::from_secs(30));
        assert!(!config.forwarding.enabled);
        assert_eq!(config.forwarding.default_result, DefaultResult::Forward);
    }

    #[test]
    fn test_config_builder() {
        let config = NodeConfig::new("NN01")
            .with_subprotocol(subprotocols::OCPP201)
            .with_request_timeout(Duration::from_secs(5))
            .with_forwarding(DefaultResult::Drop)
            .with_anycast_allow(["CS001", "CS002"])
            .with_anycast_deny("CS003");

        assert_eq!(config.node_id, NodeId::from("NN01"));
        assert_eq!(config.subprotocol, "ocpp2.0.1");
        assert_eq!(config.outbound.request_timeout, Duration::from_secs(5));
        assert!(config.forwarding.enabled);
        assert_eq!(config.forwarding.default_result, DefaultResult::Drop);
        assert_eq!(config.forwarding.anycast_allow.as_ref().map(|s| s.len()), Some(2));
        assert!(config.forwarding.anycast_deny.contains(&NodeId::from("CS003")));
    }
}
