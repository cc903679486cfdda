//! Per-chain sync packet stream.
//!
//! Each chain has an integer-keyed table of height → `IndexEntry ||
//! checksum` records whose payloads (serialized sync envelopes) live in a
//! dedicated bulk store. Heights are strictly contiguous from 0 to the
//! chain tip; a store overlapping the existing stream reorgs first, and a
//! checksum mismatch discovered while serving a read truncates the stream
//! back to the last good height so the caller refetches.

use std::path::Path;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use crate::bulk::{Bulk, BulkError, IndexEntry};
use crate::crypto;
use crate::database::config::ConfigKey;
use crate::kv::{Dir, Kv, Table};
use crate::params;
use crate::types::{Chain, FilterType, Height, NO_TIP};
use crate::util::{self, int_key};

/// Reads stop growing the response once this many payload bytes are
/// buffered.
const LOAD_LIMIT: u64 = 4 * 1024 * 1024;

/// Stored record: 16-byte index entry plus the payload checksum.
const RECORD_LEN: usize = IndexEntry::ENCODED_LEN + 8;

/// One height of the sync stream: everything a light client needs to
/// advance past a block.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SyncPacket {
    pub chain: Chain,
    pub height: Height,
    pub filter_type: FilterType,
    pub filter_element_count: u32,
    /// Serialized chain header.
    pub header: Vec<u8>,
    /// Compressed filter bytes.
    pub filter: Vec<u8>,
}

impl SyncPacket {
    pub fn encode(&self) -> Option<Vec<u8>> {
        match bincode::serde::encode_to_vec(self, bincode::config::standard()) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!("failed to serialize sync packet: {e}");
                None
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        match bincode::serde::decode_from_slice::<SyncPacket, _>(bytes, bincode::config::standard())
        {
            Ok((packet, _)) => Some(packet),
            Err(e) => {
                error!("failed to deserialize sync packet: {e}");
                None
            }
        }
    }
}

type Tips = std::collections::BTreeMap<Chain, Height>;

pub struct SyncStore {
    kv: Arc<Kv>,
    bulk: Bulk,
    tips: RwLock<Tips>,
}

impl SyncStore {
    /// Opens the stream store, restoring per-chain tips and importing the
    /// genesis packet for every chain that has none yet.
    pub fn new(kv: Arc<Kv>, dir: &Path) -> Result<Self, BulkError> {
        let bulk = Bulk::new(kv.clone(), dir, "sync", ConfigKey::NextSyncAddress)?;

        let mut tips = Tips::new();
        for chain in Chain::defined() {
            tips.insert(*chain, NO_TIP);
        }
        let read = kv.read(Table::SyncTips, Dir::Forward, |key, value| {
            let Some(id) = util::read_int_key(key) else {
                return true;
            };
            let (Some(chain), Some(height)) = (
                Chain::from_id(id as u32),
                value.try_into().ok().map(i64::from_le_bytes),
            ) else {
                error!("ignoring malformed sync tip row");
                return true;
            };
            tips.insert(chain, height);
            true
        });
        if let Err(e) = read {
            error!("failed to restore sync tips: {e}");
        }

        let store = Self {
            kv,
            bulk,
            tips: RwLock::new(tips),
        };

        for chain in Chain::supported() {
            store.import_genesis(*chain);
        }
        store.import_genesis(Chain::UnitTest);

        Ok(store)
    }

    /// The last height for which [`SyncStore::load`] returns a packet.
    pub fn tip(&self, chain: Chain) -> Height {
        *self.tips.read().get(&chain).unwrap_or(&NO_TIP)
    }

    /// Appends packets to the chain's stream. Heights must be strictly
    /// ascending; if the first item overlaps the stored stream the store
    /// reorgs back to its parent first. One transaction covers every
    /// record and the tip update.
    pub fn store(&self, chain: Chain, items: &[SyncPacket]) -> bool {
        if items.is_empty() {
            return true;
        }

        let mut tips = self.tips.write();
        let tip = *tips.get(&chain).unwrap_or(&NO_TIP);

        if items[0].height <= tip {
            let parent = items[0].height - 1;
            if !self.reorg_locked(&mut tips, chain, parent) {
                error!("reorg error");
                return false;
            }
        }

        let mut previous = *tips.get(&chain).unwrap_or(&NO_TIP);
        trace!("previous tip height: {previous}");
        let table = Table::Sync(chain);
        let txn = self.kv.txn_rw();
        {
            let mut guard = self.bulk.lock();
            for item in items {
                previous += 1;
                if item.height != previous {
                    error!("sequence error. Got {} expected {previous}", item.height);
                    drop(guard);
                    txn.finalize(false);
                    return false;
                }

                let Some(payload) = item.encode() else {
                    drop(guard);
                    txn.finalize(false);
                    return false;
                };

                let (index, mut view) = match self.bulk.write_view(
                    &mut guard,
                    &txn,
                    &IndexEntry::default(),
                    payload.len() as u64,
                ) {
                    Ok(out) => out,
                    Err(e) => {
                        error!("failed to allocate space for writing: {e}");
                        drop(guard);
                        txn.finalize(false);
                        return false;
                    }
                };
                view.copy_from_slice(&payload);

                let mut record = [0u8; RECORD_LEN];
                record[..IndexEntry::ENCODED_LEN].copy_from_slice(&index.encode());
                record[IndexEntry::ENCODED_LEN..]
                    .copy_from_slice(&crypto::sync_checksum(&payload).to_le_bytes());

                if !self
                    .kv
                    .store_in(&txn, table, &int_key(item.height as u64), &record)
                {
                    error!("failed to update index");
                    drop(guard);
                    txn.finalize(false);
                    return false;
                }
            }
        }

        let tip = items[items.len() - 1].height;
        if !self.kv.store_in(
            &txn,
            Table::SyncTips,
            &int_key(chain.id() as u64),
            &tip.to_le_bytes(),
        ) {
            error!("failed to update tip");
            txn.finalize(false);
            return false;
        }

        if !txn.finalize(true) {
            error!("finalize error");
            return false;
        }

        tips.insert(chain, tip);
        true
    }

    /// Appends stored payloads with height > `after` to `out`, stopping
    /// after roughly [`LOAD_LIMIT`] bytes. Returns whether at least one
    /// packet was delivered. A checksum mismatch truncates the stream back
    /// to the last good height and ends the read early.
    pub fn load(&self, chain: Chain, after: Height, out: &mut Vec<Vec<u8>>) -> bool {
        let start = (after + 1).max(0) as u64;
        let table = Table::Sync(chain);

        let tips = self.tips.upgradable_read();

        let mut records: Vec<(Height, IndexEntry, u64)> = Vec::new();
        let mut planned = 0u64;
        let scan = self
            .kv
            .read_from(table, &int_key(start), Dir::Forward, |key, value| {
                let Some(height) = util::read_int_key(key) else {
                    error!("invalid key");
                    return false;
                };
                if value.len() != RECORD_LEN {
                    // Record damaged in place: deliver nothing past it.
                    records.push((height as Height, IndexEntry::default(), 0));
                    return false;
                }
                let index = IndexEntry::decode(&value[..IndexEntry::ENCODED_LEN])
                    .expect("record length checked");
                let checksum = util::read_u64_le(&value[IndexEntry::ENCODED_LEN..])
                    .expect("record length checked");
                planned += index.length;
                records.push((height as Height, index, checksum));
                planned < LOAD_LIMIT
            });
        if let Err(e) = scan {
            error!("sync record scan failed: {e}");
            return false;
        }

        let mut have_one = false;
        for (height, index, checksum) in records {
            let payload = if index.is_empty() {
                None
            } else {
                match self.bulk.read_view(&index) {
                    Ok(view) => {
                        if crypto::sync_checksum(&view) == checksum {
                            Some(view.to_vec())
                        } else {
                            None
                        }
                    }
                    Err(e) => {
                        error!("failed to load sync packet: {e}");
                        None
                    }
                }
            };

            match payload {
                Some(payload) => {
                    out.push(payload);
                    have_one = true;
                }
                None => {
                    error!("checksum failure at height {height}, truncating stream");
                    let mut tips = RwLockUpgradableReadGuard::upgrade(tips);
                    self.reorg_locked(&mut tips, chain, height - 1);
                    return have_one;
                }
            }
        }

        have_one
    }

    /// Deletes every record above `height` and makes it the new tip.
    pub fn reorg(&self, chain: Chain, height: Height) -> bool {
        let mut tips = self.tips.write();
        self.reorg_locked(&mut tips, chain, height)
    }

    fn reorg_locked(&self, tips: &mut RwLockWriteGuard<'_, Tips>, chain: Chain, height: Height) -> bool {
        if height < NO_TIP {
            error!("invalid height");
            return false;
        }

        let tip = *tips.get(&chain).unwrap_or(&NO_TIP);
        let table = Table::Sync(chain);
        let txn = self.kv.txn_rw();

        let mut key = height + 1;
        while key <= tip {
            if !self.kv.delete_in(&txn, table, &int_key(key as u64), None) {
                error!("delete error");
                txn.finalize(false);
                return false;
            }
            key += 1;
        }

        if !self.kv.store_in(
            &txn,
            Table::SyncTips,
            &int_key(chain.id() as u64),
            &height.to_le_bytes(),
        ) {
            error!("failed to update tip");
            txn.finalize(false);
            return false;
        }

        if !txn.finalize(true) {
            error!("finalize error");
            return false;
        }

        tips.insert(chain, height);
        debug!("{chain} sync stream truncated to {height}");
        true
    }

    /// Flushes the packet segments to disk.
    pub fn flush(&self) -> Result<(), BulkError> {
        self.bulk.flush()
    }

    fn import_genesis(&self, chain: Chain) {
        if self.tip(chain) >= 0 {
            return;
        }

        let params = params::chain_params(chain);
        let packet = SyncPacket {
            chain,
            height: 0,
            filter_type: params.sync_filter_type,
            filter_element_count: params.genesis_filter_elements,
            header: params.genesis_header(),
            filter: params.genesis_filter(),
        };
        if !self.store(chain, &[packet]) {
            error!("failed to import {chain} genesis sync packet");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open() -> (TempDir, Arc<Kv>, SyncStore) {
        let tmp = TempDir::new().expect("tempdir");
        let kv = Arc::new(Kv::open(&tmp.path().join("kv")).expect("open kv"));
        let dir = tmp.path().join("common");
        std::fs::create_dir_all(&dir).expect("create dir");
        let store = SyncStore::new(kv.clone(), &dir).expect("open sync store");
        (tmp, kv, store)
    }

    fn packet(height: Height, fill: u8) -> SyncPacket {
        SyncPacket {
            chain: Chain::UnitTest,
            height,
            filter_type: FilterType::Es,
            filter_element_count: 1,
            header: vec![fill; 80],
            filter: vec![fill; 16],
        }
    }

    fn packets(range: std::ops::RangeInclusive<Height>, fill: u8) -> Vec<SyncPacket> {
        range.map(|h| packet(h, fill)).collect()
    }

    #[test]
    fn genesis_is_imported_for_every_chain() {
        let (_tmp, _kv, store) = open();
        for chain in Chain::supported() {
            assert_eq!(store.tip(*chain), 0);
        }
        assert_eq!(store.tip(Chain::UnitTest), 0);

        let mut sink = Vec::new();
        assert!(store.load(Chain::Bitcoin, NO_TIP, &mut sink));
        assert_eq!(sink.len(), 1);
        let genesis = SyncPacket::decode(&sink[0]).expect("decodable");
        assert_eq!(genesis.height, 0);
        assert_eq!(genesis.header.len(), 80);
    }

    #[test]
    fn import_then_read_back() {
        let (_tmp, _kv, store) = open();
        let chain = Chain::UnitTest;

        assert!(store.store(chain, &packets(0..=9, 7)));
        assert_eq!(store.tip(chain), 9);

        let mut sink = Vec::new();
        assert!(store.load(chain, 0, &mut sink));
        assert_eq!(sink.len(), 9);
        let first = SyncPacket::decode(&sink[0]).expect("decodable");
        assert_eq!(first.height, 1);

        let mut all = Vec::new();
        assert!(store.load(chain, NO_TIP, &mut all));
        assert_eq!(all.len(), 10);
    }

    #[test]
    fn out_of_sequence_items_are_rejected() {
        let (_tmp, _kv, store) = open();
        let chain = Chain::UnitTest;

        let mut items = packets(1..=3, 1);
        items[2].height = 5;
        assert!(!store.store(chain, &items));
        assert_eq!(store.tip(chain), 0);
    }

    #[test]
    fn empty_store_is_a_noop() {
        let (_tmp, _kv, store) = open();
        assert!(store.store(Chain::UnitTest, &[]));
        assert_eq!(store.tip(Chain::UnitTest), 0);
    }

    #[test]
    fn overlapping_store_reorgs_first() {
        let (_tmp, _kv, store) = open();
        let chain = Chain::UnitTest;

        assert!(store.store(chain, &packets(1..=9, 1)));
        assert_eq!(store.tip(chain), 9);

        // A competing branch replaces heights 5 and up, extending to 12.
        assert!(store.store(chain, &packets(5..=12, 2)));
        assert_eq!(store.tip(chain), 12);

        let mut sink = Vec::new();
        assert!(store.load(chain, 4, &mut sink));
        let heights: Vec<Height> = sink
            .iter()
            .map(|raw| SyncPacket::decode(raw).expect("decodable").height)
            .collect();
        assert_eq!(heights, (5..=12).collect::<Vec<_>>());
        for raw in &sink {
            let packet = SyncPacket::decode(raw).expect("decodable");
            assert_eq!(packet.header, vec![2; 80]);
        }
    }

    #[test]
    fn explicit_reorg_truncates() {
        let (_tmp, _kv, store) = open();
        let chain = Chain::UnitTest;

        assert!(store.store(chain, &packets(1..=9, 3)));
        assert!(store.reorg(chain, 4));
        assert_eq!(store.tip(chain), 4);

        let mut sink = Vec::new();
        assert!(store.load(chain, NO_TIP, &mut sink));
        assert_eq!(sink.len(), 5);

        assert!(!store.reorg(chain, -2));
    }

    #[test]
    fn checksum_failure_truncates_to_last_good_height() {
        let (_tmp, kv, store) = open();
        let chain = Chain::UnitTest;

        assert!(store.store(chain, &packets(1..=3, 4)));

        // Corrupt the stored record for height 2 by breaking its checksum.
        let record = kv
            .load(Table::Sync(chain), &int_key(2), |v| v.to_vec())
            .expect("record exists");
        let mut broken = record.clone();
        broken[IndexEntry::ENCODED_LEN] ^= 0xff;
        assert!(kv.store(Table::Sync(chain), &int_key(2), &broken));

        let mut sink = Vec::new();
        // Heights 0 and 1 are fine, height 2 fails and truncates.
        assert!(store.load(chain, NO_TIP, &mut sink));
        assert_eq!(sink.len(), 2);
        assert_eq!(store.tip(chain), 1);

        let mut sink = Vec::new();
        assert!(store.load(chain, NO_TIP, &mut sink));
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn tips_survive_reopen() {
        let tmp = TempDir::new().expect("tempdir");
        let kv = Arc::new(Kv::open(&tmp.path().join("kv")).expect("open kv"));
        let dir = tmp.path().join("common");
        std::fs::create_dir_all(&dir).expect("create dir");

        {
            let store = SyncStore::new(kv.clone(), &dir).expect("open");
            assert!(store.store(Chain::UnitTest, &packets(1..=5, 9)));
        }

        let store = SyncStore::new(kv, &dir).expect("reopen");
        assert_eq!(store.tip(Chain::UnitTest), 5);

        let mut sink = Vec::new();
        assert!(store.load(Chain::UnitTest, 3, &mut sink));
        assert_eq!(sink.len(), 2);
    }
}
