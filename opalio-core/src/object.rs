use crate::error::{OpalError, Result};
use crate::object_id::ObjectId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata property keys persisted with every stored object.
pub mod meta {
    pub const TYPE: &str = "Type";
    pub const OBJECT_ID: &str = "ObjectId";
    pub const REPLICATION_STORE: &str = "Replication.Store";
    pub const REPLICATION_LOW_WATER: &str = "Replication.LowWater";
    pub const REPLICATION_HIGH_WATER: &str = "Replication.HighWater";
    pub const SECONDS_TO_LIVE: &str = "SecondsToLive";
    pub const CREATED_TIME: &str = "CreatedTime";
    pub const DELETE_TOKEN: &str = "DeleteToken";
    pub const DELETE_TOKEN_ID: &str = "DeleteTokenId";
    pub const DATA_HASH: &str = "DataHash";
    pub const VOUCHER: &str = "Voucher";
    pub const UNCACHABLE: &str = "Uncachable";
    pub const ERASURE_CODER: &str = "ErasureCoder";
}

/// Objects without an explicit `SecondsToLive` never expire.
pub const INFINITE_TIME_TO_LIVE: i64 = i64::MAX;

/// String-keyed property bag carried by every stored object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl ToString) -> &mut Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get_object_id(&self, key: &str) -> Option<ObjectId> {
        self.get(key).and_then(|value| value.parse().ok())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|value| value.parse().ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

mod hex_bytes {
    use bytes::Bytes;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map(Bytes::from).map_err(D::Error::custom)
    }
}

/// A unit storable in the object store: payload bytes plus the metadata
/// property bag. The object id is assigned by the store, never before.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredObject {
    pub object_id: Option<ObjectId>,
    pub metadata: Metadata,
    #[serde(with = "hex_bytes")]
    pub data: Bytes,
}

impl StoredObject {
    pub fn new(object_type: &str, data: Bytes) -> Self {
        let mut metadata = Metadata::new();
        metadata.set(meta::TYPE, object_type);
        Self {
            object_id: None,
            metadata,
            data,
        }
    }

    pub fn object_type(&self) -> Option<&str> {
        self.metadata.get(meta::TYPE)
    }

    /// Id the store assigned, or an error if the object was never stored.
    pub fn require_object_id(&self) -> Result<ObjectId> {
        self.object_id
            .ok_or_else(|| OpalError::InvalidObject("object has no assigned id".to_string()))
    }

    pub fn data_hash(&self) -> ObjectId {
        ObjectId::from_content(&self.data)
    }

    /// The id of the delete token authorizing deletion; the zero id when
    /// the object carries none.
    pub fn delete_token_id(&self) -> ObjectId {
        self.metadata
            .get_object_id(meta::DELETE_TOKEN_ID)
            .unwrap_or_else(ObjectId::zero)
    }

    pub fn set_delete_token_id(&mut self, token_id: ObjectId) -> &mut Self {
        self.metadata.set(meta::DELETE_TOKEN_ID, token_id);
        self
    }

    /// Expose the delete token secret, marking the object as deleted once
    /// the token hashes to the recorded token id.
    pub fn expose_delete_token(&mut self, token: &str) -> &mut Self {
        self.metadata.set(meta::DELETE_TOKEN, token);
        self
    }

    /// An object is deleted when its exposed delete token is valid: the
    /// token's content hash equals the recorded delete-token id.
    pub fn is_deleted(&self) -> bool {
        match self.metadata.get(meta::DELETE_TOKEN) {
            Some(token) => ObjectId::from_content(token.as_bytes()) == self.delete_token_id(),
            None => false,
        }
    }

    pub fn seconds_to_live(&self) -> i64 {
        self.metadata
            .get_i64(meta::SECONDS_TO_LIVE)
            .unwrap_or(INFINITE_TIME_TO_LIVE)
    }

    pub fn created_time(&self) -> Option<i64> {
        self.metadata.get_i64(meta::CREATED_TIME)
    }

    /// Whether the object has lived past `created_time + seconds_to_live`.
    pub fn is_expired(&self, now_seconds: i64) -> bool {
        let ttl = self.seconds_to_live();
        if ttl == INFINITE_TIME_TO_LIVE {
            return false;
        }
        match self.created_time() {
            Some(created) => created.saturating_add(ttl) < now_seconds,
            None => false,
        }
    }

    /// Compute the content-derived object id and validate the metadata
    /// attestations.
    ///
    /// When a voucher is present the object carries an explicit id that must
    /// satisfy `delete_token_id.add(object_id).add(data_hash) == voucher`;
    /// otherwise the object is data-verifiable and its id is
    /// `data_hash.add(delete_token_id)`. An exposed delete token that does
    /// not hash to the recorded token id invalidates the object.
    pub fn compute_object_id(&self) -> Result<ObjectId> {
        let data_hash = self.data_hash();
        let delete_token_id = self.delete_token_id();

        if let Some(token) = self.metadata.get(meta::DELETE_TOKEN) {
            if ObjectId::from_content(token.as_bytes()) != delete_token_id {
                return Err(OpalError::InvalidObject(
                    "delete token does not match delete-token id".to_string(),
                ));
            }
        }

        match self.metadata.get_object_id(meta::VOUCHER) {
            Some(voucher) => {
                let object_id = self.metadata.get_object_id(meta::OBJECT_ID).ok_or_else(|| {
                    OpalError::InvalidObject("vouched object missing metadata object id".to_string())
                })?;
                let attested = delete_token_id.add_id(&object_id).add_id(&data_hash);
                if attested != voucher {
                    return Err(OpalError::InvalidObject(format!(
                        "voucher attestation failed for {}",
                        object_id
                    )));
                }
                Ok(object_id)
            }
            None => Ok(data_hash.add_id(&delete_token_id)),
        }
    }

    /// Configure this object to carry an explicit, voucher-attested id.
    pub fn make_signature_verified(&mut self, object_id: ObjectId) {
        let data_hash = self.data_hash();
        let voucher = self.delete_token_id().add_id(&object_id).add_id(&data_hash);
        self.metadata
            .set(meta::OBJECT_ID, object_id)
            .set(meta::DATA_HASH, data_hash)
            .set(meta::VOUCHER, voucher);
        self.object_id = Some(object_id);
    }

    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_verifiable_object_id() {
        let object = StoredObject::new("blob", Bytes::from_static(b"hello"));
        let id = object.compute_object_id().unwrap();
        let expected = ObjectId::from_content(b"hello").add_id(&ObjectId::zero());
        assert_eq!(id, expected);

        // Same content, same id.
        let again = StoredObject::new("blob", Bytes::from_static(b"hello"));
        assert_eq!(again.compute_object_id().unwrap(), id);
    }

    #[test]
    fn test_voucher_attestation() {
        let mut object = StoredObject::new("blob", Bytes::from_static(b"payload"));
        let explicit = ObjectId::from_content(b"name-derived");
        object.make_signature_verified(explicit);
        assert_eq!(object.compute_object_id().unwrap(), explicit);

        // Tampering with the payload breaks the attestation.
        object.data = Bytes::from_static(b"tampered");
        assert!(matches!(
            object.compute_object_id(),
            Err(OpalError::InvalidObject(_))
        ));
    }

    #[test]
    fn test_delete_token_validity() {
        let mut object = StoredObject::new("blob", Bytes::from_static(b"x"));
        let token = "secret-token";
        object.set_delete_token_id(ObjectId::from_content(token.as_bytes()));
        assert!(!object.is_deleted());

        object.expose_delete_token(token);
        assert!(object.is_deleted());

        // A bogus token does not delete the object, it invalidates it.
        let mut bogus = StoredObject::new("blob", Bytes::from_static(b"x"));
        bogus.set_delete_token_id(ObjectId::from_content(token.as_bytes()));
        bogus.expose_delete_token("wrong");
        assert!(!bogus.is_deleted());
        assert!(bogus.compute_object_id().is_err());
    }

    #[test]
    fn test_expiry() {
        let mut object = StoredObject::new("blob", Bytes::from_static(b"x"));
        assert!(!object.is_expired(i64::MAX - 1));

        object.metadata.set(meta::SECONDS_TO_LIVE, 10);
        object.metadata.set(meta::CREATED_TIME, 100);
        assert!(!object.is_expired(105));
        assert!(!object.is_expired(110));
        assert!(object.is_expired(111));
    }

    #[test]
    fn test_serde_roundtrip_preserves_payload() {
        let mut object = StoredObject::new("blob", Bytes::from(vec![0u8, 1, 2, 255]));
        object.metadata.set(meta::REPLICATION_STORE, 3);
        let json = serde_json::to_string(&object).unwrap();
        let back: StoredObject = serde_json::from_str(&json).unwrap();
        assert_eq!(back.data, object.data);
        assert_eq!(back.metadata, object.metadata);
    }
}
