//! Block header records.
//!
//! A [`HeaderRecord`] carries the chain-visible header fields together with
//! an optional node-local section (height, status, accumulated work) that is
//! recomputed when headers are re-imported in bulk.

use serde::{Deserialize, Serialize};

use super::{BlockHash, Hash32, Height};

/// Classification of a stored header relative to the local chain view.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum HeaderStatus {
    /// Part of a chain reachable from some tip.
    Normal,
    /// Matches a configured checkpoint.
    Checkpoint,
    /// Known to be off the best chain.
    Disconnected,
}

/// Node-local header metadata.
///
/// This section is cleared when a header enters the store via bulk import
/// so that chain work and height are recomputed from the parent chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HeaderLocal {
    pub height: Height,
    pub status: HeaderStatus,
    /// Work contributed by this header alone.
    pub work: u128,
    /// Total work inherited through the parent chain.
    pub inherited_work: u128,
}

/// A serialized block header plus local metadata.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HeaderRecord {
    pub hash: BlockHash,
    pub parent: BlockHash,
    pub merkle_root: Hash32,
    pub version: i32,
    pub bits: u32,
    pub nonce: u32,
    pub timestamp: u32,
    pub local: Option<HeaderLocal>,
}

impl HeaderRecord {
    /// Returns a copy with the node-local section removed.
    pub fn without_local(&self) -> Self {
        Self {
            local: None,
            ..self.clone()
        }
    }

    /// Height if the local section is present, otherwise `None`.
    pub fn height(&self) -> Option<Height> {
        self.local.map(|l| l.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HASH_LEN;

    fn record() -> HeaderRecord {
        HeaderRecord {
            hash: BlockHash(Hash32([1u8; HASH_LEN])),
            parent: BlockHash(Hash32([2u8; HASH_LEN])),
            merkle_root: Hash32([3u8; HASH_LEN]),
            version: 4,
            bits: 0x1d00ffff,
            nonce: 42,
            timestamp: 1_700_000_000,
            local: Some(HeaderLocal {
                height: 10,
                status: HeaderStatus::Normal,
                work: 100,
                inherited_work: 1_000,
            }),
        }
    }

    #[test]
    fn without_local_strips_metadata_only() {
        let full = record();
        let stripped = full.without_local();

        assert!(stripped.local.is_none());
        assert_eq!(stripped.hash, full.hash);
        assert_eq!(stripped.parent, full.parent);
        assert_eq!(full.height(), Some(10));
        assert_eq!(stripped.height(), None);
    }
}
