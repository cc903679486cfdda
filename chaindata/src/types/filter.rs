//! Compact filter records.
//!
//! A [`GcsFilter`] is the stored form of a golomb-coded set summarizing the
//! script elements of one block. The set construction and matching live
//! with the wire layer; the data plane only needs the parameter block, the
//! element count, and the encoded bytes, plus the hash chaining used to
//! anchor filters to their predecessors.

use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::util;

use super::{FilterHash, FilterHeader};

/// Stored golomb-coded-set filter.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GcsFilter {
    /// SipHash key the set was built with (derived from the block hash).
    pub key: [u8; 16],
    /// Golomb-Rice coding parameter.
    pub bits: u8,
    /// False-positive rate parameter (`M`).
    pub fp_rate: u32,
    /// Number of elements in the set.
    pub element_count: u32,
    /// Golomb-coded element stream.
    pub compressed: Vec<u8>,
}

impl GcsFilter {
    /// Serializes the filter body the way it travels on the wire: the
    /// element count as a compact-size integer followed by the coded
    /// stream.
    pub fn encoded(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + self.compressed.len());
        util::write_compact_size(self.element_count as u64, &mut out);
        out.extend_from_slice(&self.compressed);
        out
    }

    /// Double-SHA256 of the wire-serialized filter.
    pub fn hash(&self) -> FilterHash {
        FilterHash(crypto::sha256d(&self.encoded()))
    }

    /// Filter header obtained by chaining this filter onto `previous`.
    pub fn header(&self, previous: &FilterHeader) -> FilterHeader {
        crypto::next_filter_header(&self.hash(), previous)
    }
}

/// Stored filter header record, co-indexed with the filter of the same
/// block.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CfheaderRecord {
    pub version: u32,
    pub header: FilterHeader,
    pub hash: FilterHash,
}

impl CfheaderRecord {
    pub const VERSION: u32 = 1;

    pub fn new(header: FilterHeader, hash: FilterHash) -> Self {
        Self {
            version: Self::VERSION,
            header,
            hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HASH_LEN, Hash32};

    fn filter() -> GcsFilter {
        GcsFilter {
            key: [9u8; 16],
            bits: 19,
            fp_rate: 784_931,
            element_count: 2,
            compressed: vec![0x9d, 0xfc, 0xa8],
        }
    }

    #[test]
    fn encoded_prefixes_element_count() {
        let f = filter();
        let encoded = f.encoded();
        assert_eq!(encoded[0], 2);
        assert_eq!(&encoded[1..], &f.compressed[..]);
    }

    #[test]
    fn hash_is_stable_and_chains() {
        let f = filter();
        let h1 = f.hash();
        let h2 = f.hash();
        assert_eq!(h1, h2);

        let genesis_prev = FilterHeader(Hash32([0u8; HASH_LEN]));
        let header = f.header(&genesis_prev);
        assert_ne!(header.0, h1.0);
        assert_eq!(header, crypto::next_filter_header(&h1, &genesis_prev));
    }
}
