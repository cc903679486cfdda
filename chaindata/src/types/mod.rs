//! Core domain types used by the data plane
//!
//! This module defines strongly-typed hashes, chain identifiers, positions,
//! and index fingerprints shared across the storage and oracle layers. The
//! goal is to avoid "naked" byte buffers in public APIs and instead use
//! domain-specific newtypes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Block header records and their node-local metadata.
pub mod header;

/// Compact filter and filter header records.
pub mod filter;

/// Peer records and their classification enums.
pub mod peer;

pub use filter::{CfheaderRecord, GcsFilter};
pub use header::{HeaderLocal, HeaderRecord, HeaderStatus};
pub use peer::{Peer, PeerId, Protocol, Service, Transport};

/// Length in bytes of all 256-bit hash types used in this module.
pub const HASH_LEN: usize = 32;

/// Strongly-typed 256-bit hash wrapper.
///
/// This type is the backing representation for all fixed-size identifiers
/// in the data plane (block hashes, filter hashes, transaction ids, chained
/// filter headers). Equality and ordering are byte-wise.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Hash32(pub [u8; HASH_LEN]);

impl Hash32 {
    /// Returns the underlying 32-byte hash as a borrowed array.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Builds a hash from a byte slice, returning `None` unless the slice
    /// is exactly [`HASH_LEN`] bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != HASH_LEN {
            return None;
        }
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(bytes);
        Some(Hash32(out))
    }

    /// Returns `true` if every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

macro_rules! hash_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone,
            Copy,
            Default,
            Eq,
            PartialEq,
            Ord,
            PartialOrd,
            Hash,
            Serialize,
            Deserialize,
        )]
        pub struct $name(pub Hash32);

        impl $name {
            /// Returns the raw 32 bytes backing this identifier.
            pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
                self.0.as_bytes()
            }

            /// Builds the identifier from a byte slice of exactly 32 bytes.
            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                Hash32::from_slice(bytes).map($name)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

hash_newtype! {
    /// Block hash (double-SHA256 of the serialized header).
    BlockHash
}

hash_newtype! {
    /// Compact filter hash (double-SHA256 of the serialized filter).
    FilterHash
}

hash_newtype! {
    /// Chained filter header anchoring a filter to its predecessor.
    FilterHeader
}

hash_newtype! {
    /// Transaction identifier.
    Txid
}

hash_newtype! {
    /// Opaque contact identifier.
    ContactId
}

/// Chain height. `-1` denotes "no tip / pre-genesis".
pub type Height = i64;

/// Height value meaning "nothing stored yet".
pub const NO_TIP: Height = -1;

/// A `(height, block hash)` pair: the canonical "where in a chain".
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Position {
    pub height: Height,
    pub hash: BlockHash,
}

impl Position {
    pub fn new(height: Height, hash: BlockHash) -> Self {
        Self { height, hash }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.hash, self.height)
    }
}

/// Supported blockchain networks.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Chain {
    Bitcoin,
    BitcoinTestnet,
    BitcoinCash,
    BitcoinCashTestnet,
    UnitTest,
}

impl Chain {
    /// Stable numeric identifier used in integer-keyed tables.
    pub fn id(&self) -> u32 {
        match self {
            Chain::Bitcoin => 0,
            Chain::BitcoinTestnet => 1,
            Chain::BitcoinCash => 2,
            Chain::BitcoinCashTestnet => 3,
            Chain::UnitTest => 99,
        }
    }

    /// Reverse of [`Chain::id`].
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(Chain::Bitcoin),
            1 => Some(Chain::BitcoinTestnet),
            2 => Some(Chain::BitcoinCash),
            3 => Some(Chain::BitcoinCashTestnet),
            99 => Some(Chain::UnitTest),
            _ => None,
        }
    }

    /// Every chain this build knows about, including the test chain.
    pub fn defined() -> &'static [Chain] {
        &[
            Chain::Bitcoin,
            Chain::BitcoinTestnet,
            Chain::BitcoinCash,
            Chain::BitcoinCashTestnet,
            Chain::UnitTest,
        ]
    }

    /// Chains eligible for production sync streams.
    pub fn supported() -> &'static [Chain] {
        &[
            Chain::Bitcoin,
            Chain::BitcoinTestnet,
            Chain::BitcoinCash,
            Chain::BitcoinCashTestnet,
        ]
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Chain::Bitcoin => "bitcoin",
            Chain::BitcoinTestnet => "bitcoin_testnet",
            Chain::BitcoinCash => "bitcoin_cash",
            Chain::BitcoinCashTestnet => "bitcoin_cash_testnet",
            Chain::UnitTest => "unit_test",
        };
        write!(f, "{name}")
    }
}

/// Compact filter flavor.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum FilterType {
    /// BIP-158 basic filter.
    BasicBip158,
    /// Bitcoin Cash variant of the basic filter.
    BasicBchVariant,
    /// Extended filter covering additional script elements.
    Es,
}

impl FilterType {
    pub fn id(&self) -> u32 {
        match self {
            FilterType::BasicBip158 => 0,
            FilterType::BasicBchVariant => 1,
            FilterType::Es => 2,
        }
    }
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterType::BasicBip158 => "basic",
            FilterType::BasicBchVariant => "basic_bch",
            FilterType::Es => "es",
        };
        write!(f, "{name}")
    }
}

/// How much raw block data the database retains.
///
/// The ordering is meaningful: a stored policy is never downgraded by a
/// weaker startup argument.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum StoragePolicy {
    /// Keep no raw blocks.
    None,
    /// Keep recently used blocks only.
    Cache,
    /// Keep every downloaded block.
    All,
}

impl StoragePolicy {
    pub fn id(&self) -> u32 {
        match self {
            StoragePolicy::None => 0,
            StoragePolicy::Cache => 1,
            StoragePolicy::All => 2,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(StoragePolicy::None),
            1 => Some(StoragePolicy::Cache),
            2 => Some(StoragePolicy::All),
            _ => None,
        }
    }
}

/// 8-byte SipHash-2-4 fingerprint of a script element under the
/// database-wide key.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PatternId(pub u64);

/// Reference to a transaction output: `(txid, output index)`.
///
/// Ordering is lexicographic by txid, then numeric by index, which matches
/// the 36-byte wire encoding with a little-endian index.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Outpoint {
    pub txid: Txid,
    pub index: u32,
}

impl Outpoint {
    pub const ENCODED_LEN: usize = HASH_LEN + 4;

    pub fn new(txid: Txid, index: u32) -> Self {
        Self { txid, index }
    }

    /// Serializes to the 36-byte wire form.
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..HASH_LEN].copy_from_slice(self.txid.as_bytes());
        out[HASH_LEN..].copy_from_slice(&self.index.to_le_bytes());
        out
    }

    /// Parses the 36-byte wire form.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        let txid = Txid::from_slice(&bytes[..HASH_LEN])?;
        let index = u32::from_le_bytes(bytes[HASH_LEN..].try_into().ok()?);
        Some(Self { txid, index })
    }
}

/// A serialized transaction held in the wallet store.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub txid: Txid,
    pub chain: Chain,
    /// Canonical serialized transaction bytes.
    pub raw: Vec<u8>,
}

/// A contact known to the wallet, carrying the script elements attributed
/// to it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Contact {
    pub id: ContactId,
    pub elements: std::collections::BTreeSet<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> Hash32 {
        Hash32([byte; HASH_LEN])
    }

    #[test]
    fn hash_from_slice_enforces_length() {
        assert!(Hash32::from_slice(&[0u8; 31]).is_none());
        assert!(Hash32::from_slice(&[0u8; 33]).is_none());
        assert_eq!(Hash32::from_slice(&[7u8; 32]), Some(hash(7)));
    }

    #[test]
    fn outpoint_roundtrip_and_ordering() {
        let a = Outpoint::new(Txid(hash(1)), 5);
        let b = Outpoint::new(Txid(hash(1)), 6);
        let c = Outpoint::new(Txid(hash(2)), 0);

        assert!(a < b);
        assert!(b < c);

        let encoded = a.encode();
        assert_eq!(encoded.len(), Outpoint::ENCODED_LEN);
        assert_eq!(Outpoint::decode(&encoded), Some(a));
    }

    #[test]
    fn storage_policy_is_ordered() {
        assert!(StoragePolicy::None < StoragePolicy::Cache);
        assert!(StoragePolicy::Cache < StoragePolicy::All);
        assert_eq!(StoragePolicy::from_id(2), Some(StoragePolicy::All));
    }

    #[test]
    fn chain_id_roundtrip() {
        for chain in Chain::defined() {
            assert_eq!(Chain::from_id(chain.id()), Some(*chain));
        }
        assert_eq!(Chain::from_id(42), None);
    }
}
