//! The local object store: the authoritative home of every object this
//! node hosts, and the place where hosting is announced to the rest of
//! the system.
//!
//! Mutations run under the per-object lock and defer their announcement
//! to [`ObjectStore::unlock_object`], which emits exactly one publish or
//! unpublish reflecting the object's state at release time. Reads that
//! discover an object to be absent, expired, or corrupt retract any stale
//! announcement with a best-effort unpublish.

use crate::error::{OpalError, Result};
use crate::handler::HandlerRegistry;
use crate::messaging::Publisher;
use crate::object::{meta, StoredObject};
use crate::object_id::ObjectId;
use crate::object_lock::{ContextId, LockManager};
use crate::storage::index::{IndexEntry, ObjectIndex};
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub struct ObjectStore {
    data_dir: PathBuf,
    index: ObjectIndex,
    locks: Arc<LockManager>,
    publisher: Arc<dyn Publisher>,
    handlers: HandlerRegistry,
    capacity: u64,
    used: AtomicU64,
    node_address: String,
}

impl ObjectStore {
    pub fn open(
        data_dir: PathBuf,
        capacity: u64,
        node_address: String,
        handlers: HandlerRegistry,
        publisher: Arc<dyn Publisher>,
        locks: Arc<LockManager>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(data_dir.join("objects"))?;
        let index = ObjectIndex::open(data_dir.join("index.db"))?;
        let used = AtomicU64::new(index.total_size()?);

        Ok(Arc::new(Self {
            data_dir,
            index,
            locks,
            publisher,
            handlers,
            capacity,
            used,
            node_address,
        }))
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn node_address(&self) -> &str {
        &self.node_address
    }

    pub fn contains_object(&self, object_id: ObjectId) -> Result<bool> {
        self.index.contains(object_id)
    }

    /// Store a new object. The store assigns the object id; an object with
    /// the same id already present is an error. The calling context must
    /// hold the object lock, which serializes duplicate creates.
    ///
    /// Persisting does not announce: publication happens at
    /// `unlock_object`.
    pub async fn create(&self, context: ContextId, mut object: StoredObject) -> Result<StoredObject> {
        self.handlers.admit(&object)?;

        if !object.metadata.contains(meta::CREATED_TIME) {
            object
                .metadata
                .set(meta::CREATED_TIME, chrono::Utc::now().timestamp());
        }

        let object_id = object.compute_object_id()?;
        self.locks.assert_held(context, object_id)?;
        if self.index.contains(object_id)? {
            return Err(OpalError::ObjectExists(object_id.to_string()));
        }

        let size = object.size_bytes();
        self.reserve(size)?;
        if let Err(error) = self.persist(object_id, &object).await {
            self.release(size);
            return Err(error);
        }

        tracing::debug!(object_id = %object_id, size, "created object");
        object.object_id = Some(object_id);
        Ok(object)
    }

    /// Replace the payload and metadata of an object already present,
    /// keeping its id. The calling context must hold the object lock.
    pub async fn update(&self, context: ContextId, mut object: StoredObject) -> Result<StoredObject> {
        self.handlers.admit(&object)?;
        let object_id = object.compute_object_id()?;
        self.locks.assert_held(context, object_id)?;

        let existing = self.index.get(object_id)?.ok_or_else(|| {
            OpalError::ObjectExists(format!("cannot update absent object {}", object_id))
        })?;

        let new_size = object.size_bytes();
        if new_size > existing.size {
            self.reserve(new_size - existing.size)?;
        }
        if let Err(error) = self.persist(object_id, &object).await {
            if new_size > existing.size {
                self.release(new_size - existing.size);
            }
            return Err(error);
        }
        if new_size < existing.size {
            self.release(existing.size - new_size);
        }

        tracing::debug!(object_id = %object_id, size = new_size, "updated object");
        object.object_id = Some(object_id);
        Ok(object)
    }

    /// Create-or-replace under the object lock, announcing the result.
    /// This is the whole-operation form of lock / create / unlock_object.
    pub async fn store(&self, object: StoredObject) -> Result<StoredObject> {
        let object_id = object.compute_object_id()?;
        let context = self.locks.next_context();
        self.locks.lock(context, object_id).await;

        let stored = if self.index.contains(object_id)? {
            self.update(context, object).await
        } else {
            self.create(context, object).await
        };

        match stored {
            Ok(stored) => {
                self.unlock_object(context, object_id).await?;
                Ok(stored)
            }
            Err(error) => {
                // The unlock still announces whatever state the object is
                // actually in.
                if let Err(unlock_error) = self.unlock_object(context, object_id).await {
                    tracing::warn!(
                        object_id = %object_id,
                        error = %unlock_error,
                        "unlock after failed store also failed"
                    );
                }
                Err(error)
            }
        }
    }

    /// Fetch an object. Absent, expired, and corrupt objects all surface
    /// as `NotFound`, after retracting the hosting announcement. When
    /// `object_type` is given, an object of any other type is refused
    /// without touching the announcement.
    pub async fn get(
        &self,
        object_type: Option<&str>,
        object_id: ObjectId,
    ) -> Result<StoredObject> {
        match self.load(object_id).await {
            Ok(object) => {
                if let Some(expected) = object_type {
                    if object.object_type() != Some(expected) {
                        return Err(OpalError::InvalidRequest(format!(
                            "object {} is not of type {}",
                            object_id, expected
                        )));
                    }
                }
                Ok(object)
            }
            Err(OpalError::NotFound(object_id)) => {
                if let Err(error) = self
                    .publisher
                    .unpublish(object_id, &self.node_address)
                    .await
                {
                    tracing::warn!(
                        object_id = %object_id,
                        error = %error,
                        "failed to unpublish absent object"
                    );
                }
                Err(OpalError::NotFound(object_id))
            }
            other => other,
        }
    }

    /// Fetch an object with its lock held by `context`. The lock is
    /// released again if the fetch fails.
    pub async fn get_and_lock(
        &self,
        context: ContextId,
        object_type: Option<&str>,
        object_id: ObjectId,
    ) -> Result<StoredObject> {
        self.locks.lock(context, object_id).await;
        match self.get(object_type, object_id).await {
            Ok(object) => Ok(object),
            Err(error) => {
                if let Err(unlock_error) = self.locks.unlock(context, object_id) {
                    tracing::warn!(object_id = %object_id, error = %unlock_error, "unlock failed");
                }
                Err(error)
            }
        }
    }

    /// Non-blocking variant of `get_and_lock`: `None` when another context
    /// holds the lock.
    pub async fn try_get_and_lock(
        &self,
        context: ContextId,
        object_type: Option<&str>,
        object_id: ObjectId,
    ) -> Result<Option<StoredObject>> {
        if !self.locks.try_lock(context, object_id) {
            return Ok(None);
        }
        match self.get(object_type, object_id).await {
            Ok(object) => Ok(Some(object)),
            Err(error) => {
                if let Err(unlock_error) = self.locks.unlock(context, object_id) {
                    tracing::warn!(object_id = %object_id, error = %unlock_error, "unlock failed");
                }
                Err(error)
            }
        }
    }

    /// Delete the local replica. The calling context must hold the lock;
    /// the unpublish happens at `unlock_object`, which will find the
    /// object absent. Removing an object that is not present is a no-op.
    pub async fn remove(&self, context: ContextId, object_id: ObjectId) -> Result<()> {
        self.locks.assert_held(context, object_id)?;
        self.purge(object_id).await
    }

    /// Release the lock without any announcement.
    pub fn unlock(&self, context: ContextId, object_id: ObjectId) -> Result<()> {
        self.locks.unlock(context, object_id)
    }

    /// Release the lock, announcing the object's current state with
    /// exactly one publish (present) or unpublish (absent).
    ///
    /// A failed publish means nobody can route to this replica, so the
    /// object is removed again before the error propagates.
    pub async fn unlock_object(&self, context: ContextId, object_id: ObjectId) -> Result<()> {
        self.locks.assert_held(context, object_id)?;

        let announced = if self.index.contains(object_id)? {
            match self.publisher.publish(object_id, &self.node_address).await {
                Ok(()) => Ok(()),
                Err(error) => {
                    if let Err(purge_error) = self.purge(object_id).await {
                        tracing::warn!(
                            object_id = %object_id,
                            error = %purge_error,
                            "failed to remove object after publish failure"
                        );
                    }
                    Err(error)
                }
            }
        } else {
            self.publisher.unpublish(object_id, &self.node_address).await
        };

        self.locks.unlock(context, object_id)?;
        announced
    }

    async fn load(&self, object_id: ObjectId) -> Result<StoredObject> {
        let entry = self
            .index
            .get(object_id)?
            .ok_or(OpalError::NotFound(object_id))?;

        let path = self.object_path(object_id);
        let data = match fs::read(&path).await {
            Ok(data) => Bytes::from(data),
            Err(_) => {
                // Index row without a payload file: clean up the row.
                self.purge(object_id).await?;
                return Err(OpalError::NotFound(object_id));
            }
        };

        let object = StoredObject {
            object_id: Some(object_id),
            metadata: entry.metadata,
            data,
        };

        if object.is_expired(chrono::Utc::now().timestamp()) {
            tracing::debug!(object_id = %object_id, "object expired");
            self.purge(object_id).await?;
            return Err(OpalError::NotFound(object_id));
        }

        match object.compute_object_id() {
            Ok(computed) if computed == object_id => Ok(object),
            _ => {
                tracing::warn!(object_id = %object_id, "stored object fails verification");
                self.purge(object_id).await?;
                Err(OpalError::NotFound(object_id))
            }
        }
    }

    async fn persist(&self, object_id: ObjectId, object: &StoredObject) -> Result<()> {
        let path = self.object_path(object_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write to a temporary file first, then rename for atomicity.
        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&object.data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &path).await?;

        self.index.upsert(&IndexEntry {
            object_id,
            object_type: object.object_type().unwrap_or_default().to_string(),
            size: object.size_bytes(),
            created_time: object.created_time().unwrap_or_default(),
            seconds_to_live: object.seconds_to_live(),
            metadata: object.metadata.clone(),
        })?;
        Ok(())
    }

    async fn purge(&self, object_id: ObjectId) -> Result<()> {
        if let Some(entry) = self.index.get(object_id)? {
            self.index.delete(object_id)?;
            self.release(entry.size);
        }
        let path = self.object_path(object_id);
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    fn object_path(&self, object_id: ObjectId) -> PathBuf {
        // First two hex chars as a subdirectory to keep directories small.
        let hex = object_id.to_string();
        self.data_dir.join("objects").join(&hex[..2]).join(hex)
    }

    fn reserve(&self, size: u64) -> Result<()> {
        let mut used = self.used.load(Ordering::Acquire);
        loop {
            let available = self.capacity.saturating_sub(used);
            if size > available {
                return Err(OpalError::NoSpace {
                    needed: size,
                    available,
                });
            }
            match self.used.compare_exchange_weak(
                used,
                used + size,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(current) => used = current,
            }
        }
    }

    fn release(&self, size: u64) {
        self.used.fetch_sub(size, Ordering::AcqRel);
    }
}
