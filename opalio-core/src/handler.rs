use crate::error::{OpalError, Result};
use crate::object::{meta, StoredObject};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-type admission policy consulted before an object is persisted.
pub trait ObjectHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Reject objects this handler will not host. A rejection surfaces as
    /// `UnacceptableObject`.
    fn validate(&self, object: &StoredObject) -> Result<()>;
}

/// Explicit map from a type tag to its handler, populated at process start.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ObjectHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ObjectHandler>) -> &mut Self {
        self.handlers.insert(handler.name().to_string(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ObjectHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Check the schema invariants and the owning handler's policy.
    pub fn admit(&self, object: &StoredObject) -> Result<()> {
        let object_type = object
            .object_type()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                OpalError::InvalidObject(format!(
                    "object metadata is missing the mandatory '{}' property",
                    meta::TYPE
                ))
            })?;

        let handler = self.get(object_type).ok_or_else(|| {
            OpalError::UnacceptableObject(format!("no handler registered for type {}", object_type))
        })?;

        handler.validate(object)
    }
}

/// Handler that admits every well-formed object of its type.
pub struct PermissiveHandler {
    name: String,
}

impl PermissiveHandler {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
        })
    }
}

impl ObjectHandler for PermissiveHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, _object: &StoredObject) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    struct SizeCappedHandler {
        max_bytes: usize,
    }

    impl ObjectHandler for SizeCappedHandler {
        fn name(&self) -> &str {
            "capped"
        }

        fn validate(&self, object: &StoredObject) -> Result<()> {
            if object.data.len() > self.max_bytes {
                return Err(OpalError::UnacceptableObject(format!(
                    "capped objects may not exceed {} bytes",
                    self.max_bytes
                )));
            }
            Ok(())
        }
    }

    #[test]
    fn test_missing_type_is_invalid() {
        let registry = HandlerRegistry::new();
        let mut object = StoredObject::new("blob", Bytes::from_static(b"x"));
        object.metadata.remove(meta::TYPE);
        assert!(matches!(
            registry.admit(&object),
            Err(OpalError::InvalidObject(_))
        ));
    }

    #[test]
    fn test_unknown_type_is_unacceptable() {
        let registry = HandlerRegistry::new();
        let object = StoredObject::new("mystery", Bytes::from_static(b"x"));
        assert!(matches!(
            registry.admit(&object),
            Err(OpalError::UnacceptableObject(_))
        ));
    }

    #[test]
    fn test_handler_policy_applies() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(SizeCappedHandler { max_bytes: 4 }));

        let small = StoredObject::new("capped", Bytes::from_static(b"ok"));
        assert!(registry.admit(&small).is_ok());

        let big = StoredObject::new("capped", Bytes::from_static(b"too large"));
        assert!(matches!(
            registry.admit(&big),
            Err(OpalError::UnacceptableObject(_))
        ));
    }
}
