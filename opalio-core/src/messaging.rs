//! Request/reply messaging and publish/unpublish collaborators.
//!
//! The object store and fragmented object store consume these traits for
//! every cross-node interaction; they do not implement transport or
//! routing. The HTTP binding here resolves destinations through the node
//! registry and assumes the selected node is reachable.

use crate::error::{OpalError, Result};
use crate::node::NodeInfo;
use crate::object_id::ObjectId;
use crate::registry::Registry;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Service names routable through [`Messaging`].
pub mod service {
    pub const FRAGMENTED_OBJECT: &str = "fragmented-object";
    pub const PUBLISH_DAEMON: &str = "publish-daemon";
}

#[async_trait]
pub trait Messaging: Send + Sync {
    /// Send a request to a specific node and await its reply payload.
    async fn send_to_node(
        &self,
        node_id: &str,
        service: &str,
        method: &str,
        payload: Bytes,
    ) -> Result<Bytes>;

    /// Send a request to whichever node is responsible for `object_id`.
    async fn send_to_object(
        &self,
        object_id: ObjectId,
        service: &str,
        method: &str,
        payload: Bytes,
    ) -> Result<Bytes>;
}

/// Routing-layer announcements that this node does or does not host an
/// object id.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, object_id: ObjectId, node_address: &str) -> Result<()>;
    async fn unpublish(&self, object_id: ObjectId, node_address: &str) -> Result<()>;
}

/// Typed remote-exception envelope carried in error replies, so callers
/// can distinguish "definitely absent" from "could not determine".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
    pub object_id: Option<ObjectId>,
}

impl RemoteError {
    pub fn from_error(error: &OpalError) -> Self {
        let (kind, object_id) = match error {
            OpalError::InvalidObject(_) => ("invalid_object", None),
            OpalError::ObjectExists(_) => ("object_exists", None),
            OpalError::NotFound(id) => ("not_found", Some(*id)),
            OpalError::NoSpace { .. } => ("no_space", None),
            OpalError::UnacceptableObject(_) => ("unacceptable_object", None),
            OpalError::DeletedObject(id) => ("deleted_object", Some(*id)),
            OpalError::UnsupportedAlgorithm(_) => ("unsupported_algorithm", None),
            OpalError::NotRecoverable(_) => ("not_recoverable", None),
            OpalError::InsufficientFragments { .. } => ("insufficient_fragments", None),
            _ => ("internal", None),
        };
        Self {
            kind: kind.to_string(),
            message: error.to_string(),
            object_id,
        }
    }

    pub fn into_error(self) -> OpalError {
        match (self.kind.as_str(), self.object_id) {
            ("invalid_object", _) => OpalError::InvalidObject(self.message),
            ("object_exists", _) => OpalError::ObjectExists(self.message),
            ("not_found", Some(id)) => OpalError::NotFound(id),
            ("no_space", _) => OpalError::NoSpace {
                needed: 0,
                available: 0,
            },
            ("unacceptable_object", _) => OpalError::UnacceptableObject(self.message),
            ("deleted_object", Some(id)) => OpalError::DeletedObject(id),
            ("unsupported_algorithm", _) => OpalError::UnsupportedAlgorithm(self.message),
            ("not_recoverable", _) => OpalError::NotRecoverable(self.message),
            (kind, _) => OpalError::Remote(format!("{}: {}", kind, self.message)),
        }
    }
}

/// Pick the registry node responsible for an object id.
///
/// Deterministic hash-mod selection; the real placement function of a DHT
/// is a routing concern this crate only assumes.
pub fn select_node_for(nodes: &[NodeInfo], object_id: ObjectId) -> Result<&NodeInfo> {
    if nodes.is_empty() {
        return Err(OpalError::NoSuchNode(
            "registry reports no nodes".to_string(),
        ));
    }
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&object_id.as_bytes()[..8]);
    let index = (u64::from_be_bytes(prefix) % nodes.len() as u64) as usize;
    Ok(&nodes[index])
}

/// HTTP request/reply messaging over the internal service endpoints.
pub struct HttpMessaging {
    client: reqwest::Client,
    registry: Arc<dyn Registry>,
}

impl HttpMessaging {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            client: reqwest::Client::new(),
            registry,
        }
    }

    async fn resolve_node(&self, node_id: &str) -> Result<NodeInfo> {
        let nodes = self.registry.get_nodes().await?;
        nodes
            .into_iter()
            .find(|node| node.node_id == node_id)
            .ok_or_else(|| OpalError::NoSuchNode(node_id.to_string()))
    }

    async fn post(&self, address: &str, service: &str, method: &str, payload: Bytes) -> Result<Bytes> {
        let url = format!(
            "http://{}/internal/v1/services/{}/{}",
            address, service, method
        );

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(payload)
            .send()
            .await
            .map_err(|error| OpalError::Http(error.to_string()))?;

        if response.status().is_success() {
            let body = response
                .bytes()
                .await
                .map_err(|error| OpalError::Http(error.to_string()))?;
            return Ok(body);
        }

        let status = response.status();
        match response.json::<RemoteError>().await {
            Ok(remote) => Err(remote.into_error()),
            Err(_) => Err(OpalError::Http(format!(
                "request to {} failed: status={}",
                url, status
            ))),
        }
    }
}

#[async_trait]
impl Messaging for HttpMessaging {
    async fn send_to_node(
        &self,
        node_id: &str,
        service: &str,
        method: &str,
        payload: Bytes,
    ) -> Result<Bytes> {
        let node = self.resolve_node(node_id).await?;
        self.post(&node.address, service, method, payload).await
    }

    async fn send_to_object(
        &self,
        object_id: ObjectId,
        service: &str,
        method: &str,
        payload: Bytes,
    ) -> Result<Bytes> {
        let nodes = self.registry.get_nodes().await?;
        let node = select_node_for(&nodes, object_id)?;
        self.post(&node.address, service, method, payload).await
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishNotification {
    pub object_id: ObjectId,
    pub node_address: String,
}

/// Publisher that delivers notifications to the object's root node through
/// the messaging layer.
pub struct RoutingPublisher {
    messaging: Arc<dyn Messaging>,
}

impl RoutingPublisher {
    pub fn new(messaging: Arc<dyn Messaging>) -> Self {
        Self { messaging }
    }

    async fn notify(&self, method: &str, object_id: ObjectId, node_address: &str) -> Result<()> {
        let notification = PublishNotification {
            object_id,
            node_address: node_address.to_string(),
        };
        let payload = Bytes::from(serde_json::to_vec(&notification)?);
        self.messaging
            .send_to_object(object_id, service::PUBLISH_DAEMON, method, payload)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Publisher for RoutingPublisher {
    async fn publish(&self, object_id: ObjectId, node_address: &str) -> Result<()> {
        self.notify("publish", object_id, node_address).await
    }

    async fn unpublish(&self, object_id: ObjectId, node_address: &str) -> Result<()> {
        self.notify("unpublish", object_id, node_address).await
    }
}

/// Publisher for single-node deployments with no routing layer to notify.
pub struct NullPublisher;

#[async_trait]
impl Publisher for NullPublisher {
    async fn publish(&self, _object_id: ObjectId, _node_address: &str) -> Result<()> {
        Ok(())
    }

    async fn unpublish(&self, _object_id: ObjectId, _node_address: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Announcement {
        Publish(ObjectId),
        Unpublish(ObjectId),
    }

    /// Records every publish/unpublish announcement, in order.
    #[derive(Default)]
    pub struct RecordingPublisher {
        pub announcements: Mutex<Vec<Announcement>>,
    }

    impl RecordingPublisher {
        pub fn take(&self) -> Vec<Announcement> {
            std::mem::take(&mut self.announcements.lock().unwrap())
        }
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, object_id: ObjectId, _node_address: &str) -> Result<()> {
            self.announcements
                .lock()
                .unwrap()
                .push(Announcement::Publish(object_id));
            Ok(())
        }

        async fn unpublish(&self, object_id: ObjectId, _node_address: &str) -> Result<()> {
            self.announcements
                .lock()
                .unwrap()
                .push(Announcement::Unpublish(object_id));
            Ok(())
        }
    }
}
