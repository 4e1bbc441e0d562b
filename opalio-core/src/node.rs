use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    pub node_id: String,
    pub address: String,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NodeStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl NodeInfo {
    pub fn healthy(node_id: &str, address: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            address: address.to_string(),
            status: NodeStatus::Healthy,
        }
    }
}
