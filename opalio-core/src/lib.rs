//! Opalio Core - Core library for content-addressed object storage nodes
//!
//! A peer-to-peer object store where:
//! - object ids are SHA256-derived and fold together with a hash chain
//! - every object is attested by its content or an explicit voucher
//! - deletion is an anti-object proven by a delete token
//! - redundancy comes from erasure-coded fragments spread across peers

pub mod erasure;
pub mod error;
pub mod fragment_map;
pub mod handler;
pub mod messaging;
pub mod node;
pub mod object;
pub mod object_id;
pub mod object_lock;
pub mod registry;
pub mod storage;

pub use erasure::ErasureCoder;
pub use error::{OpalError, Result};
pub use fragment_map::FragmentMap;
pub use handler::{HandlerRegistry, ObjectHandler, PermissiveHandler};
pub use messaging::{HttpMessaging, Messaging, NullPublisher, Publisher, RoutingPublisher};
pub use node::{NodeInfo, NodeStatus};
pub use object::{Metadata, StoredObject, INFINITE_TIME_TO_LIVE};
pub use object_id::{ObjectId, OBJECT_ID_LEN};
pub use object_lock::{ContextId, LockManager};
pub use registry::{RedisRegistry, Registry, StaticRegistry};
pub use storage::{FragmentStore, ObjectStore};
