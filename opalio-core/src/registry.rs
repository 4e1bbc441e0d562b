//! Node registry: how this node learns which peers exist and where they
//! listen. The messaging layer resolves node and object destinations
//! through it; routing proper is outside this crate.

use crate::error::{OpalError, Result};
use crate::node::NodeInfo;
use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::Mutex;

#[async_trait]
pub trait Registry: Send + Sync {
    /// Register (or refresh) this node's presence.
    async fn register_node(&self, node: &NodeInfo) -> Result<()>;

    /// All currently registered nodes.
    async fn get_nodes(&self) -> Result<Vec<NodeInfo>>;
}

const NODE_TTL_SECONDS: u64 = 60;

/// Redis-backed registry; nodes heartbeat via `register_node` and expire
/// after a minute of silence.
pub struct RedisRegistry {
    conn: Mutex<redis::aio::MultiplexedConnection>,
    prefix: String,
}

impl RedisRegistry {
    pub async fn new(url: &str, namespace: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| OpalError::Config(format!("failed to connect to Redis: {}", e)))?;

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| OpalError::Config(format!("failed to connect to Redis: {}", e)))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| OpalError::Config(format!("Redis ping failed: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
            prefix: format!("opalio:{}", namespace),
        })
    }

    fn node_key(&self, node_id: &str) -> String {
        format!("{}:nodes:{}", self.prefix, node_id)
    }

    fn nodes_pattern(&self) -> String {
        format!("{}:nodes:*", self.prefix)
    }
}

#[async_trait]
impl Registry for RedisRegistry {
    async fn register_node(&self, node: &NodeInfo) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let key = self.node_key(&node.node_id);
        let value = serde_json::to_vec(node)?;

        let _: () = conn
            .set_ex(key, value, NODE_TTL_SECONDS)
            .await
            .map_err(|e| OpalError::Internal(format!("failed to register node: {}", e)))?;

        Ok(())
    }

    async fn get_nodes(&self) -> Result<Vec<NodeInfo>> {
        let mut conn = self.conn.lock().await;
        let keys: Vec<String> = conn
            .keys(self.nodes_pattern())
            .await
            .map_err(|e| OpalError::Internal(format!("failed to list nodes: {}", e)))?;

        let mut nodes: Vec<NodeInfo> = Vec::with_capacity(keys.len());
        for key in keys {
            let value: Option<Vec<u8>> = conn
                .get(&key)
                .await
                .map_err(|e| OpalError::Internal(format!("failed to read node {}: {}", key, e)))?;
            if let Some(data) = value {
                nodes.push(serde_json::from_slice(&data)?);
            }
        }
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }
}

/// Fixed node list, used by tests and single-node deployments.
pub struct StaticRegistry {
    nodes: Vec<NodeInfo>,
}

impl StaticRegistry {
    pub fn new(nodes: Vec<NodeInfo>) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn register_node(&self, _node: &NodeInfo) -> Result<()> {
        Ok(())
    }

    async fn get_nodes(&self) -> Result<Vec<NodeInfo>> {
        Ok(self.nodes.clone())
    }
}
