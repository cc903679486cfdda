//! Hashing primitives used by the data plane.
//!
//! Block and filter identities are double-SHA256; index fingerprints and
//! sync-stream checksums are SipHash-2-4. Signing, script evaluation, and
//! proof-of-work live outside this crate.

use std::hash::Hasher;

use rand::RngCore;
use sha2::{Digest, Sha256};
use siphasher::sip::SipHasher24;

use crate::types::{FilterHash, FilterHeader, HASH_LEN, Hash32, PatternId};

/// Length of a SipHash key.
pub const SIPHASH_KEY_LEN: usize = 16;

/// Key used for sync-stream checksums. Sync records are integrity-checked,
/// not authenticated, so the key is fixed.
pub const SYNC_CHECKSUM_KEY: [u8; SIPHASH_KEY_LEN] = [0u8; SIPHASH_KEY_LEN];

/// Double-SHA256.
pub fn sha256d(data: &[u8]) -> Hash32 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&second);
    Hash32(out)
}

/// SipHash-2-4 of `data` under `key`.
pub fn siphash24(key: &[u8; SIPHASH_KEY_LEN], data: &[u8]) -> u64 {
    let mut hasher = SipHasher24::new_with_key(key);
    hasher.write(data);
    hasher.finish()
}

/// Fingerprint of a script element under the database-wide key.
pub fn pattern_id(key: &[u8; SIPHASH_KEY_LEN], element: &[u8]) -> PatternId {
    PatternId(siphash24(key, element))
}

/// Checksum protecting a stored sync packet.
pub fn sync_checksum(payload: &[u8]) -> u64 {
    siphash24(&SYNC_CHECKSUM_KEY, payload)
}

/// Generates a fresh random SipHash key. Called once per database.
pub fn random_siphash_key() -> [u8; SIPHASH_KEY_LEN] {
    let mut key = [0u8; SIPHASH_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// SipHash key a block's filter is constructed with: the first 16 bytes of
/// the block hash.
pub fn filter_key(block_hash: &Hash32) -> [u8; SIPHASH_KEY_LEN] {
    let mut key = [0u8; SIPHASH_KEY_LEN];
    key.copy_from_slice(&block_hash.as_bytes()[..SIPHASH_KEY_LEN]);
    key
}

/// Chains a filter hash onto the previous filter header:
/// `sha256d(filter_hash || previous)`.
pub fn next_filter_header(filter_hash: &FilterHash, previous: &FilterHeader) -> FilterHeader {
    let mut preimage = [0u8; HASH_LEN * 2];
    preimage[..HASH_LEN].copy_from_slice(filter_hash.as_bytes());
    preimage[HASH_LEN..].copy_from_slice(previous.as_bytes());
    FilterHeader(sha256d(&preimage))
}
