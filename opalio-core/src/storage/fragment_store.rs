//! Erasure-coded fragment redundancy over the object store.
//!
//! A fragmented store spreads an object across the system twice over: the
//! whole object lives on one node as the primary replica, and an encoded
//! fragment set lives on the nodes responsible for each fragment id.
//! Retrieval prefers the cheap path (fetch the whole object) and falls
//! back to gathering a minimal fragment subset and reconstructing.

use crate::erasure::ErasureCoder;
use crate::error::{OpalError, Result};
use crate::fragment_map::FragmentMap;
use crate::messaging::{service, Messaging};
use crate::object::{meta, StoredObject};
use crate::object_id::ObjectId;
use crate::storage::object_store::ObjectStore;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Object type tag carried by fragment objects.
pub const FRAGMENT_TYPE: &str = "fragment";

/// Method names of the fragmented-object service.
pub mod method {
    pub const STORE_LOCAL_OBJECT: &str = "storeLocalObject";
    pub const RETRIEVE_LOCAL_OBJECT: &str = "retrieveLocalObject";
    pub const STORE_FRAGMENT: &str = "storeFragment";
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreLocalObjectRequest {
    pub erasure_coder: String,
    pub object: StoredObject,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RetrieveLocalObjectRequest {
    pub object_id: ObjectId,
}

/// The id of fragment `index` of the object `object_id`: derived by
/// chaining the fragment ordinal onto the primary id.
pub fn fragment_id(object_id: ObjectId, index: usize) -> ObjectId {
    object_id.add(&(index as u32).to_be_bytes())
}

pub struct FragmentStore {
    store: Arc<ObjectStore>,
    messaging: Arc<dyn Messaging>,
}

impl FragmentStore {
    pub fn new(store: Arc<ObjectStore>, messaging: Arc<dyn Messaging>) -> Self {
        Self { store, messaging }
    }

    pub fn object_store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    /// Store `object` as a fragmented object homed on `destination`.
    ///
    /// The destination node persists the primary replica, encodes and
    /// spreads the fragments, and replies with the fragment map.
    pub async fn store(
        &self,
        destination: &str,
        coder: &ErasureCoder,
        object: StoredObject,
    ) -> Result<FragmentMap> {
        let request = StoreLocalObjectRequest {
            erasure_coder: coder.spec(),
            object,
        };
        let payload = Bytes::from(serde_json::to_vec(&request)?);
        let reply = self
            .messaging
            .send_to_node(
                destination,
                service::FRAGMENTED_OBJECT,
                method::STORE_LOCAL_OBJECT,
                payload,
            )
            .await?;
        FragmentMap::from_wire(&reply)
    }

    /// Server side of [`FragmentStore::store`]: persist the primary
    /// replica here, then encode and spread the fragments.
    ///
    /// Fragment placement is best-effort per fragment; the store succeeds
    /// once at least the reconstruction minimum landed. The returned map
    /// always lists all fragment ids, reachable or not.
    pub async fn store_local_object(&self, request: StoreLocalObjectRequest) -> Result<FragmentMap> {
        let coder = ErasureCoder::from_spec(&request.erasure_coder)?;

        let stored = self.store.store(request.object).await?;
        let object_id = stored.require_object_id()?;

        let payload = serde_json::to_vec(&stored)?;
        let fragments = coder.encode(&payload)?;

        let mut fragment_ids = Vec::with_capacity(fragments.len());
        let mut placed = 0usize;
        for (index, data) in fragments.into_iter().enumerate() {
            let fragment_id = fragment_id(object_id, index);
            fragment_ids.push(fragment_id);

            let mut fragment = StoredObject::new(FRAGMENT_TYPE, data);
            fragment.metadata.set(meta::ERASURE_CODER, coder.spec());
            fragment.make_signature_verified(fragment_id);

            let body = Bytes::from(serde_json::to_vec(&fragment)?);
            match self
                .messaging
                .send_to_object(
                    fragment_id,
                    service::FRAGMENTED_OBJECT,
                    method::STORE_FRAGMENT,
                    body,
                )
                .await
            {
                Ok(_) => placed += 1,
                Err(error) => {
                    tracing::warn!(
                        object_id = %object_id,
                        fragment_id = %fragment_id,
                        error = %error,
                        "failed to place fragment"
                    );
                }
            }
        }

        if placed < coder.minimum_fragment_count() {
            // Counts, not bytes: too few fragment homes accepted their share.
            return Err(OpalError::NoSpace {
                needed: coder.minimum_fragment_count() as u64,
                available: placed as u64,
            });
        }

        tracing::debug!(
            object_id = %object_id,
            placed,
            total = fragment_ids.len(),
            "stored fragmented object"
        );
        FragmentMap::new(object_id, &coder, fragment_ids)
    }

    /// Server side of fragment placement: persist one fragment object on
    /// this node.
    pub async fn store_fragment(&self, fragment: StoredObject) -> Result<ObjectId> {
        let stored = self.store.store(fragment).await?;
        stored.require_object_id()
    }

    /// Serve an object hosted by this node, deleted or not; the caller
    /// decides what a deleted object means.
    pub async fn retrieve_local_object(&self, object_id: ObjectId) -> Result<StoredObject> {
        self.store.get(None, object_id).await
    }

    /// Fetch a fragmented object from wherever it lives.
    ///
    /// The primary replica is tried first; if it cannot be fetched the
    /// fragments are gathered greedily in map order until the
    /// reconstruction minimum is reached. Any fetch that proves the object
    /// deleted wins over reconstruction.
    pub async fn retrieve_remote_object(&self, map: &FragmentMap) -> Result<StoredObject> {
        let coder = map.coder()?;
        // Maps arrive over the wire; never trust their id count.
        if map.fragment_ids.len() != coder.fragment_count() {
            return Err(OpalError::InvalidRequest(format!(
                "fragment map lists {} ids for coder {}",
                map.fragment_ids.len(),
                coder.spec()
            )));
        }

        match self.fetch_remote(map.object_id).await {
            Ok(object) => return check_deleted(object, map.object_id),
            Err(OpalError::DeletedObject(_)) => {
                return Err(OpalError::DeletedObject(map.object_id));
            }
            Err(error) => {
                tracing::debug!(
                    object_id = %map.object_id,
                    error = %error,
                    "direct fetch failed, reconstructing from fragments"
                );
            }
        }

        let minimum = coder.minimum_fragment_count();
        let mut fragments: Vec<Option<Bytes>> = vec![None; coder.fragment_count()];
        let mut present = 0usize;

        for (index, fragment_id) in map.fragment_ids.iter().enumerate() {
            if present == minimum {
                break;
            }
            match self.fetch_remote(*fragment_id).await {
                Ok(fragment) => {
                    if fragment.is_deleted() {
                        return Err(OpalError::DeletedObject(map.object_id));
                    }
                    fragments[index] = Some(fragment.data);
                    present += 1;
                }
                Err(OpalError::DeletedObject(_)) => {
                    return Err(OpalError::DeletedObject(map.object_id));
                }
                Err(error) => {
                    tracing::debug!(
                        fragment_id = %fragment_id,
                        error = %error,
                        "fragment fetch failed"
                    );
                }
            }
        }

        if present < minimum {
            return Err(OpalError::NotRecoverable(format!(
                "only {} of the {} fragments needed for {} are reachable",
                present, minimum, map.object_id
            )));
        }

        let payload = coder.decode(&fragments).map_err(|error| match error {
            OpalError::InsufficientFragments { required, found } => OpalError::NotRecoverable(
                format!("{} fragments decoded, {} required", found, required),
            ),
            other => other,
        })?;

        let object: StoredObject = serde_json::from_slice(&payload)?;
        if object.compute_object_id()? != map.object_id {
            return Err(OpalError::NotRecoverable(format!(
                "reconstructed object does not verify as {}",
                map.object_id
            )));
        }
        check_deleted(object, map.object_id)
    }

    async fn fetch_remote(&self, object_id: ObjectId) -> Result<StoredObject> {
        let request = RetrieveLocalObjectRequest { object_id };
        let payload = Bytes::from(serde_json::to_vec(&request)?);
        let reply = self
            .messaging
            .send_to_object(
                object_id,
                service::FRAGMENTED_OBJECT,
                method::RETRIEVE_LOCAL_OBJECT,
                payload,
            )
            .await?;
        let object = serde_json::from_slice(&reply)?;
        Ok(object)
    }
}

fn check_deleted(object: StoredObject, object_id: ObjectId) -> Result<StoredObject> {
    if object.is_deleted() {
        return Err(OpalError::DeletedObject(object_id));
    }
    Ok(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerRegistry, PermissiveHandler};
    use crate::messaging::test_support::RecordingPublisher;
    use crate::messaging::Publisher;
    use crate::object_lock::LockManager;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// In-memory stand-in for the rest of the cluster: every remote node's
    /// object store collapses into one map, keyed by object id.
    #[derive(Default)]
    struct ClusterMessaging {
        objects: Mutex<HashMap<ObjectId, StoredObject>>,
        unavailable: Mutex<HashSet<ObjectId>>,
    }

    impl ClusterMessaging {
        fn insert(&self, object: StoredObject) {
            let object_id = object.compute_object_id().unwrap();
            self.objects.lock().unwrap().insert(object_id, object);
        }

        fn mark_unavailable(&self, object_id: ObjectId) {
            self.unavailable.lock().unwrap().insert(object_id);
        }

        fn stored_fragments(&self) -> usize {
            self.objects
                .lock()
                .unwrap()
                .values()
                .filter(|object| object.object_type() == Some(FRAGMENT_TYPE))
                .count()
        }
    }

    #[async_trait]
    impl Messaging for ClusterMessaging {
        async fn send_to_node(
            &self,
            node_id: &str,
            _service: &str,
            _method: &str,
            _payload: Bytes,
        ) -> Result<Bytes> {
            Err(OpalError::NoSuchNode(node_id.to_string()))
        }

        async fn send_to_object(
            &self,
            object_id: ObjectId,
            _service: &str,
            method: &str,
            payload: Bytes,
        ) -> Result<Bytes> {
            if self.unavailable.lock().unwrap().contains(&object_id) {
                return Err(OpalError::Http("node unreachable".to_string()));
            }
            match method {
                method::STORE_FRAGMENT => {
                    let fragment: StoredObject = serde_json::from_slice(&payload)?;
                    let id = fragment.compute_object_id()?;
                    self.objects.lock().unwrap().insert(id, fragment);
                    Ok(Bytes::new())
                }
                method::RETRIEVE_LOCAL_OBJECT => {
                    let request: RetrieveLocalObjectRequest = serde_json::from_slice(&payload)?;
                    let objects = self.objects.lock().unwrap();
                    match objects.get(&request.object_id) {
                        Some(object) => Ok(Bytes::from(serde_json::to_vec(object)?)),
                        None => Err(OpalError::NotFound(request.object_id)),
                    }
                }
                other => Err(OpalError::InvalidRequest(other.to_string())),
            }
        }
    }

    struct Fixture {
        fragment_store: FragmentStore,
        cluster: Arc<ClusterMessaging>,
        publisher: Arc<RecordingPublisher>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut handlers = HandlerRegistry::new();
        handlers.register(PermissiveHandler::new("blob"));
        handlers.register(PermissiveHandler::new(FRAGMENT_TYPE));

        let publisher = Arc::new(RecordingPublisher::default());
        let store = ObjectStore::open(
            dir.path().to_path_buf(),
            1 << 20,
            "127.0.0.1:4000".to_string(),
            handlers,
            publisher.clone() as Arc<dyn Publisher>,
            Arc::new(LockManager::new()),
        )
        .unwrap();

        let cluster = Arc::new(ClusterMessaging::default());
        Fixture {
            fragment_store: FragmentStore::new(store, cluster.clone()),
            cluster,
            publisher,
            _dir: dir,
        }
    }

    fn request(coder: &ErasureCoder, data: &'static [u8]) -> StoreLocalObjectRequest {
        StoreLocalObjectRequest {
            erasure_coder: coder.spec(),
            object: StoredObject::new("blob", Bytes::from_static(data)),
        }
    }

    #[tokio::test]
    async fn test_store_local_object_spreads_fragments() {
        let fx = fixture();
        let coder = ErasureCoder::from_spec("reed-solomon/5/3").unwrap();

        let map = fx
            .fragment_store
            .store_local_object(request(&coder, b"spread me"))
            .await
            .unwrap();

        assert_eq!(map.fragment_ids.len(), 5);
        assert_eq!(map.erasure_coder, "reed-solomon/5/3");
        assert_eq!(fx.cluster.stored_fragments(), 5);
        // The primary replica lives here and was published once.
        assert!(fx
            .fragment_store
            .object_store()
            .contains_object(map.object_id)
            .unwrap());
        assert_eq!(fx.publisher.take().len(), 1);
    }

    #[tokio::test]
    async fn test_store_local_object_needs_minimum_fragment_homes() {
        let fx = fixture();
        let coder = ErasureCoder::from_spec("reed-solomon/5/3").unwrap();

        let object = StoredObject::new("blob", Bytes::from_static(b"unwanted"));
        let object_id = object.compute_object_id().unwrap();
        for index in 0..3 {
            fx.cluster.mark_unavailable(fragment_id(object_id, index));
        }

        let result = fx
            .fragment_store
            .store_local_object(StoreLocalObjectRequest {
                erasure_coder: coder.spec(),
                object,
            })
            .await;
        assert!(matches!(
            result,
            Err(OpalError::NoSpace {
                needed: 3,
                available: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_retrieve_prefers_direct_fetch() {
        let fx = fixture();
        let coder = ErasureCoder::from_spec("reed-solomon/4/2").unwrap();

        let map = fx
            .fragment_store
            .store_local_object(request(&coder, b"direct"))
            .await
            .unwrap();

        // Some node in the cluster hosts the whole object.
        let primary = fx
            .fragment_store
            .retrieve_local_object(map.object_id)
            .await
            .unwrap();
        fx.cluster.insert(primary);

        let fetched = fx.fragment_store.retrieve_remote_object(&map).await.unwrap();
        assert_eq!(fetched.data, Bytes::from_static(b"direct"));
    }

    #[tokio::test]
    async fn test_retrieve_reconstructs_from_fragments() {
        let fx = fixture();
        let coder = ErasureCoder::from_spec("reed-solomon/5/3").unwrap();

        let map = fx
            .fragment_store
            .store_local_object(request(&coder, b"reconstruct me from shards"))
            .await
            .unwrap();

        // No node serves the whole object, and two fragments are gone;
        // three remain, which is exactly the minimum.
        fx.cluster.mark_unavailable(map.fragment_ids[0]);
        fx.cluster.mark_unavailable(map.fragment_ids[3]);

        let fetched = fx.fragment_store.retrieve_remote_object(&map).await.unwrap();
        assert_eq!(fetched.data, Bytes::from_static(b"reconstruct me from shards"));
        assert_eq!(fetched.object_id, Some(map.object_id));
    }

    #[tokio::test]
    async fn test_retrieve_below_minimum_is_not_recoverable() {
        let fx = fixture();
        let coder = ErasureCoder::from_spec("reed-solomon/5/3").unwrap();

        let map = fx
            .fragment_store
            .store_local_object(request(&coder, b"too many losses"))
            .await
            .unwrap();

        for fragment_id in &map.fragment_ids[..3] {
            fx.cluster.mark_unavailable(*fragment_id);
        }

        assert!(matches!(
            fx.fragment_store.retrieve_remote_object(&map).await,
            Err(OpalError::NotRecoverable(_))
        ));
    }

    #[tokio::test]
    async fn test_retrieve_rejects_oversized_fragment_map() {
        let fx = fixture();
        let coder = ErasureCoder::from_spec("reed-solomon/4/2").unwrap();

        let map = fx
            .fragment_store
            .store_local_object(request(&coder, b"bounded"))
            .await
            .unwrap();

        // A map whose id list outgrew its coder must be refused before any
        // fragment is fetched, even when the extra ids resolve.
        let mut oversized = map.clone();
        while oversized.fragment_ids.len() < 8 {
            let index = oversized.fragment_ids.len();
            oversized
                .fragment_ids
                .push(fragment_id(map.object_id, index));
        }

        assert!(matches!(
            fx.fragment_store.retrieve_remote_object(&oversized).await,
            Err(OpalError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_deleted_primary_beats_reconstruction() {
        let fx = fixture();
        let coder = ErasureCoder::from_spec("reed-solomon/4/2").unwrap();

        let token = "delete-secret";
        let mut object = StoredObject::new("blob", Bytes::from_static(b"deletable"));
        object.set_delete_token_id(ObjectId::from_content(token.as_bytes()));

        let map = fx
            .fragment_store
            .store_local_object(StoreLocalObjectRequest {
                erasure_coder: coder.spec(),
                object,
            })
            .await
            .unwrap();

        // The primary some node serves now carries a valid delete token.
        let mut deleted = fx
            .fragment_store
            .retrieve_local_object(map.object_id)
            .await
            .unwrap();
        deleted.expose_delete_token(token);
        fx.cluster.insert(deleted);

        // All fragments are intact, but deletion wins.
        assert!(matches!(
            fx.fragment_store.retrieve_remote_object(&map).await,
            Err(OpalError::DeletedObject(id)) if id == map.object_id
        ));
    }
}
