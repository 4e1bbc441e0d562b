use crate::erasure::ErasureCoder;
use crate::error::{OpalError, Result};
use crate::object_id::ObjectId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Durable record tying a primary object to its erasure-coded fragments.
///
/// Created once at store time and read-only thereafter; a content change
/// produces a new map under a new object id. The fragment ids are kept in
/// coder order and their count always equals the coder's fragment count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FragmentMap {
    pub object_id: ObjectId,
    pub erasure_coder: String,
    pub fragment_ids: Vec<ObjectId>,
}

impl FragmentMap {
    pub fn new(
        object_id: ObjectId,
        coder: &ErasureCoder,
        fragment_ids: Vec<ObjectId>,
    ) -> Result<Self> {
        if fragment_ids.len() != coder.fragment_count() {
            return Err(OpalError::InvalidObject(format!(
                "fragment map has {} ids for coder {}",
                fragment_ids.len(),
                coder.spec()
            )));
        }
        Ok(Self {
            object_id,
            erasure_coder: coder.spec(),
            fragment_ids,
        })
    }

    pub fn coder(&self) -> Result<ErasureCoder> {
        ErasureCoder::from_spec(&self.erasure_coder)
    }

    /// Byte-oriented wire encoding: each string is an i32 big-endian length
    /// followed by its bytes; fragment ids follow a leading i32 count.
    pub fn to_wire(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.object_id.to_string());
        put_string(&mut buf, &self.erasure_coder);
        buf.put_i32(self.fragment_ids.len() as i32);
        for fragment_id in &self.fragment_ids {
            put_string(&mut buf, &fragment_id.to_string());
        }
        buf.freeze()
    }

    pub fn from_wire(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let object_id = get_string(&mut buf)?.parse()?;
        let erasure_coder = get_string(&mut buf)?;
        if buf.remaining() < 4 {
            return Err(truncated());
        }
        let count = buf.get_i32();
        if count < 0 {
            return Err(OpalError::InvalidRequest(
                "negative fragment count in fragment map".to_string(),
            ));
        }
        let mut fragment_ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            fragment_ids.push(get_string(&mut buf)?.parse()?);
        }

        let coder = ErasureCoder::from_spec(&erasure_coder)?;
        if fragment_ids.len() != coder.fragment_count() {
            return Err(OpalError::InvalidRequest(format!(
                "fragment map lists {} ids for coder {}",
                fragment_ids.len(),
                erasure_coder
            )));
        }

        Ok(Self {
            object_id,
            erasure_coder,
            fragment_ids,
        })
    }
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_i32(value.len() as i32);
    buf.put_slice(value.as_bytes());
}

fn get_string(buf: &mut &[u8]) -> Result<String> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    let len = buf.get_i32();
    if len < 0 || buf.remaining() < len as usize {
        return Err(truncated());
    }
    let (head, tail) = buf.split_at(len as usize);
    let value = String::from_utf8(head.to_vec())
        .map_err(|_| OpalError::InvalidRequest("non-utf8 string in fragment map".to_string()))?;
    *buf = tail;
    Ok(value)
}

fn truncated() -> OpalError {
    OpalError::InvalidRequest("truncated fragment map encoding".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_count_invariant() {
        let coder = ErasureCoder::from_spec("reed-solomon/4/2").unwrap();
        let ids: Vec<ObjectId> = (0u32..3)
            .map(|i| ObjectId::from_content(&i.to_be_bytes()))
            .collect();
        assert!(matches!(
            FragmentMap::new(ObjectId::from_content(b"obj"), &coder, ids),
            Err(OpalError::InvalidObject(_))
        ));
    }

    #[test]
    fn test_wire_encoding() {
        let coder = ErasureCoder::from_spec("reed-solomon/4/2").unwrap();
        let ids: Vec<ObjectId> = (0u32..4)
            .map(|i| ObjectId::from_content(&i.to_be_bytes()))
            .collect();
        let map = FragmentMap::new(ObjectId::from_content(b"obj"), &coder, ids).unwrap();

        let wire = map.to_wire();
        // i32 len + 64 hex chars for the object id.
        assert_eq!(&wire[..4], &64i32.to_be_bytes());
        let decoded = FragmentMap::from_wire(&wire).unwrap();
        assert_eq!(decoded, map);

        assert!(FragmentMap::from_wire(&wire[..10]).is_err());
    }

    #[test]
    fn test_wire_decoding_rejects_wrong_id_count() {
        let ids: Vec<ObjectId> = (0u32..3)
            .map(|i| ObjectId::from_content(&i.to_be_bytes()))
            .collect();
        // Bypasses the constructor check, as a hostile encoder would.
        let map = FragmentMap {
            object_id: ObjectId::from_content(b"obj"),
            erasure_coder: "reed-solomon/4/2".to_string(),
            fragment_ids: ids,
        };
        assert!(matches!(
            FragmentMap::from_wire(&map.to_wire()),
            Err(OpalError::InvalidRequest(_))
        ));
    }
}
