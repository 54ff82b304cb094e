//! Resource identity and the sender-side resource store.

use sha2::{Digest, Sha256};

use crate::block::{block_count, block_size, BlockId};
use crate::error::ProtoError;
use crate::fec::BLOCK_SIZE;

/// Identifies a resource: a 128-bit content hash plus the byte length.
///
/// Rendered as 32 hex characters for the hash followed by 16 for the
/// length, the format the server prints for each served file. The
/// hash-only short form denotes a zero-length resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId {
    pub hash: [u8; 16],
    pub length: u64,
}

impl ResourceId {
    /// Derives the id of the given resource bytes.
    ///
    /// The hash is the leading 128 bits of the SHA-256 digest.
    pub fn for_data(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut hash = [0u8; 16];
        hash.copy_from_slice(&digest[..16]);
        ResourceId { hash, length: data.len() as u64 }
    }

    /// Number of blocks this resource occupies.
    pub fn block_count(&self) -> u64 {
        block_count(self.length)
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{:016x}", hex::encode(self.hash), self.length)
    }
}

impl std::str::FromStr for ResourceId {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.is_ascii() {
            return Err(ProtoError::InvalidResourceId(s.to_string()));
        }
        let (hash_hex, length) = match s.len() {
            32 => (s, 0),
            48 => {
                let length = u64::from_str_radix(&s[32..], 16)
                    .map_err(|_| ProtoError::InvalidResourceId(s.to_string()))?;
                (&s[..32], length)
            }
            _ => return Err(ProtoError::InvalidResourceId(s.to_string())),
        };

        let bytes = hex::decode(hash_hex).map_err(|_| ProtoError::InvalidResourceId(s.to_string()))?;
        let mut hash = [0u8; 16];
        hash.copy_from_slice(&bytes);
        Ok(ResourceId { hash, length })
    }
}

/// A resource held in memory on the sender, sliced into blocks.
#[derive(Debug)]
pub struct Resource {
    id: ResourceId,
    data: Vec<u8>,
}

impl Resource {
    pub fn new(data: Vec<u8>) -> Self {
        let id = ResourceId::for_data(&data);
        Resource { id, data }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn length(&self) -> u64 {
        self.id.length
    }

    pub fn block_count(&self) -> u64 {
        self.id.block_count()
    }

    /// The source bytes of one block, or `None` for an out-of-range id.
    pub fn block(&self, id: BlockId) -> Option<&[u8]> {
        let len = block_size(self.id.length, id)?;
        let start = (id * BLOCK_SIZE) as usize;
        Some(&self.data[start..start + len as usize])
    }
}
