use crate::error::{OpalError, Result};
use bytes::Bytes;
use reed_solomon_erasure::galois_8::ReedSolomon;

const LENGTH_PREFIX: usize = 8;

/// An erasure coder: a pure algorithm producing `fragment_count` fragments
/// from a payload, any `minimum_fragment_count` of which reconstruct it.
///
/// Coders are named by a spec string: `replica/4` stores four full copies
/// (minimum one), `reed-solomon/5/3` produces five shards of which any
/// three suffice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErasureCoder {
    Replica { copies: usize },
    ReedSolomon { fragments: usize, required: usize },
}

impl ErasureCoder {
    /// Parse a coder spec string. Unknown algorithm names and malformed
    /// parameters are configuration errors.
    pub fn from_spec(spec: &str) -> Result<Self> {
        let mut tokens = spec.split('/');
        let name = tokens.next().unwrap_or_default();
        let params: Vec<&str> = tokens.collect();

        match name {
            "replica" => {
                let copies = parse_param(spec, params.first())?;
                if copies == 0 {
                    return Err(OpalError::UnsupportedAlgorithm(spec.to_string()));
                }
                Ok(Self::Replica { copies })
            }
            "reed-solomon" => {
                let fragments = parse_param(spec, params.first())?;
                let required = parse_param(spec, params.get(1))?;
                if required == 0 || required >= fragments {
                    return Err(OpalError::UnsupportedAlgorithm(spec.to_string()));
                }
                Ok(Self::ReedSolomon {
                    fragments,
                    required,
                })
            }
            _ => Err(OpalError::UnsupportedAlgorithm(spec.to_string())),
        }
    }

    /// The canonical spec string for this coder.
    pub fn spec(&self) -> String {
        match self {
            Self::Replica { copies } => format!("replica/{}", copies),
            Self::ReedSolomon {
                fragments,
                required,
            } => format!("reed-solomon/{}/{}", fragments, required),
        }
    }

    /// Number of fragments this coder produces.
    pub fn fragment_count(&self) -> usize {
        match self {
            Self::Replica { copies } => *copies,
            Self::ReedSolomon { fragments, .. } => *fragments,
        }
    }

    /// Minimum number of fragments needed to reconstruct the payload.
    pub fn minimum_fragment_count(&self) -> usize {
        match self {
            Self::Replica { .. } => 1,
            Self::ReedSolomon { required, .. } => *required,
        }
    }

    /// Encode a payload into exactly `fragment_count` fragments.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<Bytes>> {
        match self {
            Self::Replica { copies } => {
                let copy = Bytes::copy_from_slice(payload);
                Ok(vec![copy; *copies])
            }
            Self::ReedSolomon {
                fragments,
                required,
            } => {
                let parity = fragments - required;
                let coder = ReedSolomon::new(*required, parity)
                    .map_err(|e| OpalError::Internal(format!("reed-solomon init: {:?}", e)))?;

                // Length-prefix the payload so decode can strip the padding
                // needed to make all shards equal-sized.
                let total = LENGTH_PREFIX + payload.len();
                let shard_size = total.div_ceil(*required).max(1);
                let mut buffer = vec![0u8; shard_size * required];
                buffer[..LENGTH_PREFIX].copy_from_slice(&(payload.len() as u64).to_be_bytes());
                buffer[LENGTH_PREFIX..total].copy_from_slice(payload);

                let mut shards: Vec<Vec<u8>> = buffer
                    .chunks(shard_size)
                    .map(|chunk| chunk.to_vec())
                    .collect();
                shards.resize(*fragments, vec![0u8; shard_size]);

                coder
                    .encode(&mut shards)
                    .map_err(|e| OpalError::Internal(format!("reed-solomon encode: {:?}", e)))?;

                Ok(shards.into_iter().map(Bytes::from).collect())
            }
        }
    }

    /// Reconstruct the payload from fragments, given in coder order with
    /// `None` marking the ones that could not be fetched.
    pub fn decode(&self, fragments: &[Option<Bytes>]) -> Result<Bytes> {
        if fragments.len() != self.fragment_count() {
            return Err(OpalError::NotRecoverable(format!(
                "fragment list length {} does not match coder {}",
                fragments.len(),
                self.spec()
            )));
        }

        let present = fragments.iter().filter(|f| f.is_some()).count();
        if present < self.minimum_fragment_count() {
            return Err(OpalError::InsufficientFragments {
                required: self.minimum_fragment_count(),
                found: present,
            });
        }

        match self {
            Self::Replica { .. } => {
                let copy = fragments
                    .iter()
                    .flatten()
                    .next()
                    .expect("at least one fragment present");
                Ok(copy.clone())
            }
            Self::ReedSolomon {
                fragments: count,
                required,
            } => {
                let parity = count - required;
                let coder = ReedSolomon::new(*required, parity)
                    .map_err(|e| OpalError::Internal(format!("reed-solomon init: {:?}", e)))?;

                let shard_size = fragments
                    .iter()
                    .flatten()
                    .map(|f| f.len())
                    .next()
                    .expect("at least one fragment present");
                if fragments
                    .iter()
                    .flatten()
                    .any(|f| f.len() != shard_size || f.is_empty())
                {
                    return Err(OpalError::NotRecoverable(
                        "fragments have inconsistent sizes".to_string(),
                    ));
                }

                let mut shards: Vec<Option<Vec<u8>>> = fragments
                    .iter()
                    .map(|f| f.as_ref().map(|b| b.to_vec()))
                    .collect();
                coder
                    .reconstruct(&mut shards)
                    .map_err(|e| OpalError::NotRecoverable(format!("reed-solomon: {:?}", e)))?;

                let mut buffer = Vec::with_capacity(shard_size * required);
                for shard in shards.into_iter().take(*required) {
                    buffer.extend_from_slice(&shard.expect("reconstructed shard"));
                }

                if buffer.len() < LENGTH_PREFIX {
                    return Err(OpalError::NotRecoverable(
                        "reconstructed data shorter than length prefix".to_string(),
                    ));
                }
                let length = u64::from_be_bytes(
                    buffer[..LENGTH_PREFIX].try_into().expect("prefix length"),
                ) as usize;
                if LENGTH_PREFIX + length > buffer.len() {
                    return Err(OpalError::NotRecoverable(format!(
                        "corrupt length prefix: {} exceeds shard data",
                        length
                    )));
                }
                buffer.drain(..LENGTH_PREFIX);
                buffer.truncate(length);
                Ok(Bytes::from(buffer))
            }
        }
    }
}

fn parse_param(spec: &str, token: Option<&&str>) -> Result<usize> {
    token
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| OpalError::UnsupportedAlgorithm(spec.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_bytes(len: usize) -> Vec<u8> {
        // xorshift keeps the test deterministic without a rand dependency.
        let mut state = 0x9e3779b97f4a7c15u64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    #[test]
    fn test_spec_parsing() {
        assert_eq!(
            ErasureCoder::from_spec("replica/3").unwrap(),
            ErasureCoder::Replica { copies: 3 }
        );
        let rs = ErasureCoder::from_spec("reed-solomon/5/3").unwrap();
        assert_eq!(rs.fragment_count(), 5);
        assert_eq!(rs.minimum_fragment_count(), 3);
        assert_eq!(rs.spec(), "reed-solomon/5/3");

        for bad in [
            "fountain/5/3",
            "replica/0",
            "replica/x",
            "reed-solomon/3/3",
            "reed-solomon/3",
            "",
        ] {
            assert!(matches!(
                ErasureCoder::from_spec(bad),
                Err(OpalError::UnsupportedAlgorithm(_))
            ));
        }
    }

    #[test]
    fn test_reed_solomon_roundtrip_any_minimal_subset() {
        let coder = ErasureCoder::from_spec("reed-solomon/5/3").unwrap();
        let payload = random_bytes(1024);
        let fragments = coder.encode(&payload).unwrap();
        assert_eq!(fragments.len(), 5);

        // Fragments {0, 2, 4} suffice.
        let subset: Vec<Option<Bytes>> = fragments
            .iter()
            .enumerate()
            .map(|(i, f)| (i % 2 == 0).then(|| f.clone()))
            .collect();
        assert_eq!(coder.decode(&subset).unwrap(), Bytes::from(payload.clone()));

        // So do the parity-heavy {2, 3, 4}.
        let tail: Vec<Option<Bytes>> = fragments
            .iter()
            .enumerate()
            .map(|(i, f)| (i >= 2).then(|| f.clone()))
            .collect();
        assert_eq!(coder.decode(&tail).unwrap(), Bytes::from(payload));
    }

    #[test]
    fn test_reed_solomon_below_minimum_fails() {
        let coder = ErasureCoder::from_spec("reed-solomon/5/3").unwrap();
        let fragments = coder.encode(&random_bytes(1024)).unwrap();

        let two: Vec<Option<Bytes>> = fragments
            .iter()
            .enumerate()
            .map(|(i, f)| (i == 0 || i == 2).then(|| f.clone()))
            .collect();
        assert!(matches!(
            coder.decode(&two),
            Err(OpalError::InsufficientFragments {
                required: 3,
                found: 2
            })
        ));
    }

    #[test]
    fn test_reed_solomon_empty_and_small_payloads() {
        let coder = ErasureCoder::from_spec("reed-solomon/4/2").unwrap();
        for payload in [vec![], vec![7u8], random_bytes(3)] {
            let fragments = coder.encode(&payload).unwrap();
            let present: Vec<Option<Bytes>> = fragments.iter().cloned().map(Some).collect();
            assert_eq!(coder.decode(&present).unwrap(), Bytes::from(payload));
        }
    }

    #[test]
    fn test_replica_roundtrip() {
        let coder = ErasureCoder::from_spec("replica/4").unwrap();
        let payload = random_bytes(128);
        let fragments = coder.encode(&payload).unwrap();
        assert_eq!(fragments.len(), 4);
        assert_eq!(coder.minimum_fragment_count(), 1);

        let only_last: Vec<Option<Bytes>> = fragments
            .iter()
            .enumerate()
            .map(|(i, f)| (i == 3).then(|| f.clone()))
            .collect();
        assert_eq!(coder.decode(&only_last).unwrap(), Bytes::from(payload));

        let none: Vec<Option<Bytes>> = vec![None; 4];
        assert!(matches!(
            coder.decode(&none),
            Err(OpalError::InsufficientFragments { .. })
        ));
    }

    #[test]
    fn test_inconsistent_fragment_sizes_rejected() {
        let coder = ErasureCoder::from_spec("reed-solomon/4/2").unwrap();
        let mut fragments: Vec<Option<Bytes>> = coder
            .encode(&random_bytes(64))
            .unwrap()
            .into_iter()
            .map(Some)
            .collect();
        fragments[1] = Some(Bytes::from_static(b"short"));
        assert!(matches!(
            coder.decode(&fragments),
            Err(OpalError::NotRecoverable(_))
        ));
    }
}
