use crate::error::OpalError;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

pub const OBJECT_ID_LEN: usize = 32;

/// Content-derived object identifier.
///
/// Ids are the SHA256 of the originating content and are folded together
/// with [`ObjectId::add`], so equal inputs always produce equal ids. The
/// hex rendering is the canonical wire form.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    /// Derive an id from raw content.
    pub fn from_content(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Fold additional input into this id, producing a new derived id:
    /// `sha256(self || data)`.
    pub fn add(&self, data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Fold another id into this one.
    pub fn add_id(&self, other: &ObjectId) -> Self {
        self.add(&other.0)
    }

    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_LEN] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; OBJECT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// The all-zero id, used as a sentinel for "no delete token".
    pub fn zero() -> Self {
        Self([0u8; OBJECT_ID_LEN])
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({:.12}...)", hex::encode(self.0))
    }
}

impl FromStr for ObjectId {
    type Err = OpalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s)
            .map_err(|e| OpalError::InvalidRequest(format!("invalid object id '{}': {}", s, e)))?;
        let bytes: [u8; OBJECT_ID_LEN] = raw.try_into().map_err(|_| {
            OpalError::InvalidRequest(format!("invalid object id length: {}", s.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
