//! Core identifiers and addressing for OCPP networking

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a charging station, networking node or CSMS
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque correlation id of a request and its response or error
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Id used in error replies when the offending frame carried no readable id
    pub const UNKNOWN: &'static str = "-1";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random UUID v4 request id
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// Ordered list of the nodes a message has traversed.
///
/// The first entry is always the ultimate source. Every relay appends its own
/// id before passing the message one hop further.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkPath(Vec<NodeId>);

impl NetworkPath {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Path of a message that originates at `source`
    pub fn from_source(source: impl Into<NodeId>) -> Self {
        Self(vec![source.into()])
    }

    /// Return a copy of this path with `node` appended
    pub fn append_hop(&self, node: impl Into<NodeId>) -> Self {
        let mut hops = self.0.clone();
        hops.push(node.into());
        Self(hops)
    }

    /// The ultimate source of the message (first entry)
    pub fn source(&self) -> Option<&NodeId> {
        self.0.first()
    }

    /// The node the message was received from (last entry)
    pub fn last_hop(&self) -> Option<&NodeId> {
        self.0.last()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.0.iter().any(|n| n == node)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeId> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[NodeId] {
        &self.0
    }
}

impl From<Vec<NodeId>> for NetworkPath {
    fn from(hops: Vec<NodeId>) -> Self {
        Self(hops)
    }
}

impl fmt::Display for NetworkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hops: Vec<&str> = self.0.iter().map(NodeId::as_str).collect();
        write!(f, "[{}]", hops.join(" -> "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_hop_keeps_source() {
        let path = NetworkPath::from_source("CS001");
        let relayed = path.append_hop("NN01").append_hop("NN02");

        assert_eq!(path.len(), 1);
        assert_eq!(relayed.len(), 3);
        assert_eq!(relayed.source(), Some(&NodeId::from("CS001")));
        assert_eq!(relayed.last_hop(), Some(&NodeId::from("NN02")));
        assert!(relayed.contains(&NodeId::from("NN01")));
        assert!(!path.contains(&NodeId::from("NN01")));
    }

    #[test]
    fn test_empty_path_has_no_source() {
        let path = NetworkPath::new();
        assert!(path.source().is_none());
        assert!(path.is_empty());
    }

    #[test]
    fn test_path_serializes_as_array() {
        let path = NetworkPath::from_source("CS001").append_hop("NN01");
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, r#"["CS001","NN01"]"#);
        assert_eq!(path.to_string(), "[CS001 -> NN01]");
    }

    #[test]
    fn test_request_id_from_number() {
        assert_eq!(RequestId::from(42u64).as_str(), "42");
        assert_ne!(RequestId::random(), RequestId::random());
    }
}
