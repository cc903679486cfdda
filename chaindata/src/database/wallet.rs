//! Wallet-facing transaction and index store.
//!
//! Serialized transactions live in the bulk store keyed by txid. The
//! pattern index (script-element fingerprint ↔ txid) and the contact index
//! (contact ↔ script element) are in-memory maps behind one mutex,
//! checkpointed into the `wallet_index` table periodically and restored on
//! open. Losing the tail of a checkpoint window only costs a rescan.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, trace};

use crate::bulk::{Bulk, IndexEntry};
use crate::crypto;
use crate::kv::{Kv, Table};
use crate::types::{Contact, ContactId, PatternId, TransactionRecord, Txid};

/// Mutations between checkpoints of the in-memory maps.
const CHECKPOINT_INTERVAL: u32 = 256;

const INDEX_KEY: &[u8] = b"maps";

#[derive(Default, Serialize, Deserialize)]
struct WalletMaps {
    contact_to_element: BTreeMap<ContactId, BTreeSet<Vec<u8>>>,
    element_to_contact: BTreeMap<Vec<u8>, BTreeSet<ContactId>>,
    transaction_to_patterns: BTreeMap<Txid, BTreeSet<PatternId>>,
    pattern_to_transactions: BTreeMap<PatternId, BTreeSet<Txid>>,
    #[serde(skip)]
    dirty: u32,
}

pub struct Wallet {
    kv: Arc<Kv>,
    bulk: Arc<Bulk>,
    siphash_key: [u8; crypto::SIPHASH_KEY_LEN],
    maps: Mutex<WalletMaps>,
}

impl Wallet {
    pub fn new(kv: Arc<Kv>, bulk: Arc<Bulk>, siphash_key: [u8; crypto::SIPHASH_KEY_LEN]) -> Self {
        let maps = Self::restore(&kv);
        Self {
            kv,
            bulk,
            siphash_key,
            maps: Mutex::new(maps),
        }
    }

    /// Fingerprints a script element under the database-wide key.
    pub fn index_element(&self, element: &[u8]) -> PatternId {
        crypto::pattern_id(&self.siphash_key, element)
    }

    /// Replaces the set of patterns associated with `txid`, updating the
    /// reverse index for additions and removals. Idempotent.
    pub fn associate_transaction(&self, txid: &Txid, patterns: &[PatternId]) -> bool {
        let incoming: BTreeSet<PatternId> = patterns.iter().copied().collect();
        trace!("transaction {txid} is associated with {} patterns", incoming.len());

        let mut maps = self.maps.lock();
        let existing = maps.transaction_to_patterns.entry(*txid).or_default();
        let added: Vec<PatternId> = incoming.difference(existing).copied().collect();
        let removed: Vec<PatternId> = existing.difference(&incoming).copied().collect();
        *existing = incoming;

        for pattern in added {
            maps.pattern_to_transactions
                .entry(pattern)
                .or_default()
                .insert(*txid);
        }
        for pattern in removed {
            let emptied = match maps.pattern_to_transactions.get_mut(&pattern) {
                Some(txids) => {
                    txids.remove(txid);
                    txids.is_empty()
                }
                None => false,
            };
            if emptied {
                maps.pattern_to_transactions.remove(&pattern);
            }
        }

        self.touch(&mut maps);
        true
    }

    /// Transactions known to touch `pattern`.
    pub fn lookup_transactions(&self, pattern: PatternId) -> Vec<Txid> {
        let maps = self.maps.lock();
        maps.pattern_to_transactions
            .get(&pattern)
            .map(|txids| txids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Contacts attributed to a script element.
    pub fn lookup_contact(&self, element: &[u8]) -> BTreeSet<ContactId> {
        let maps = self.maps.lock();
        maps.element_to_contact
            .get(element)
            .cloned()
            .unwrap_or_default()
    }

    /// Applies a contact's current element set, returning every txid that
    /// touches an element which was added or removed (for reindexing).
    pub fn update_contact(&self, contact: &Contact) -> Vec<Txid> {
        let mut maps = self.maps.lock();
        let existing = maps
            .contact_to_element
            .remove(&contact.id)
            .unwrap_or_default();
        let affected = self.apply_contact_diff(&mut maps, &existing, &contact.elements, contact.id);
        maps.contact_to_element
            .insert(contact.id, contact.elements.clone());
        self.touch(&mut maps);
        affected
    }

    /// Merges `child` into `parent`: the child's mappings are dropped, the
    /// parent's element set replaces its previous one, and every affected
    /// txid is returned.
    pub fn update_merged_contact(&self, parent: &Contact, child: &Contact) -> Vec<Txid> {
        let mut maps = self.maps.lock();
        maps.contact_to_element.remove(&child.id);

        let existing = maps
            .contact_to_element
            .remove(&parent.id)
            .unwrap_or_default();
        let mut affected =
            self.apply_contact_diff(&mut maps, &existing, &parent.elements, parent.id);

        for element in &child.elements {
            let emptied = match maps.element_to_contact.get_mut(element) {
                Some(contacts) => {
                    contacts.remove(&child.id);
                    contacts.is_empty()
                }
                None => false,
            };
            if emptied {
                maps.element_to_contact.remove(element);
            }
            let pattern = self.index_element(element);
            if let Some(txids) = maps.pattern_to_transactions.get(&pattern) {
                affected.extend(txids.iter().copied());
            }
        }

        maps.contact_to_element
            .insert(parent.id, parent.elements.clone());
        self.touch(&mut maps);

        affected.sort();
        affected.dedup();
        affected
    }

    fn apply_contact_diff(
        &self,
        maps: &mut WalletMaps,
        existing: &BTreeSet<Vec<u8>>,
        incoming: &BTreeSet<Vec<u8>>,
        contact: ContactId,
    ) -> Vec<Txid> {
        let mut affected = Vec::new();

        for element in existing.difference(incoming) {
            let emptied = match maps.element_to_contact.get_mut(element) {
                Some(contacts) => {
                    contacts.remove(&contact);
                    contacts.is_empty()
                }
                None => false,
            };
            if emptied {
                maps.element_to_contact.remove(element);
            }
            let pattern = self.index_element(element);
            if let Some(txids) = maps.pattern_to_transactions.get(&pattern) {
                affected.extend(txids.iter().copied());
            }
        }

        for element in incoming.difference(existing) {
            maps.element_to_contact
                .entry(element.clone())
                .or_default()
                .insert(contact);
            let pattern = self.index_element(element);
            if let Some(txids) = maps.pattern_to_transactions.get(&pattern) {
                affected.extend(txids.iter().copied());
            }
        }

        affected.sort();
        affected.dedup();
        affected
    }

    /// Loads a stored transaction.
    pub fn load_transaction(&self, txid: &Txid) -> Option<TransactionRecord> {
        let index = self
            .kv
            .load(Table::Transactions, txid.as_bytes(), |raw| {
                IndexEntry::decode(raw)
            })
            .flatten()?;
        if index.is_empty() {
            trace!("transaction {txid} not found");
            return None;
        }

        let view = match self.bulk.read_view(&index) {
            Ok(view) => view,
            Err(e) => {
                error!("transaction {txid} has a dangling index entry: {e}");
                return None;
            }
        };

        match bincode::serde::decode_from_slice::<TransactionRecord, _>(
            &view,
            bincode::config::standard(),
        ) {
            Ok((record, _)) => Some(record),
            Err(e) => {
                error!("transaction {txid} failed to deserialize: {e}");
                None
            }
        }
    }

    /// Stores a serialized transaction keyed by its txid.
    pub fn store_transaction(&self, record: &TransactionRecord) -> bool {
        let txid = record.txid;
        let encoded = match bincode::serde::encode_to_vec(record, bincode::config::standard()) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to serialize transaction {txid}: {e}");
                return false;
            }
        };

        let existing = self
            .kv
            .load(Table::Transactions, txid.as_bytes(), |raw| {
                IndexEntry::decode(raw)
            })
            .flatten()
            .unwrap_or_default();

        let txn = self.kv.txn_rw();
        let (index, mut view) = match self.bulk.write(&txn, &existing, encoded.len() as u64) {
            Ok(out) => out,
            Err(e) => {
                error!("failed to get write position for transaction {txid}: {e}");
                txn.finalize(false);
                return false;
            }
        };
        view.copy_from_slice(&encoded);

        if !self
            .kv
            .store_in(&txn, Table::Transactions, txid.as_bytes(), &index.encode())
        {
            error!("failed to update index for transaction {txid}");
            txn.finalize(false);
            return false;
        }

        if !txn.finalize(true) {
            error!("database update error");
            return false;
        }
        true
    }

    /// Persists the in-memory maps now. Called on shutdown and every
    /// [`CHECKPOINT_INTERVAL`] mutations.
    pub fn checkpoint(&self) -> bool {
        let maps = self.maps.lock();
        self.write_checkpoint(&maps)
    }

    fn touch(&self, maps: &mut WalletMaps) {
        maps.dirty += 1;
        if maps.dirty >= CHECKPOINT_INTERVAL {
            if self.write_checkpoint(maps) {
                maps.dirty = 0;
            }
        }
    }

    fn write_checkpoint(&self, maps: &WalletMaps) -> bool {
        let encoded = match bincode::serde::encode_to_vec(maps, bincode::config::standard()) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to serialize wallet index: {e}");
                return false;
            }
        };
        self.kv.store(Table::WalletIndex, INDEX_KEY, &encoded)
    }

    fn restore(kv: &Kv) -> WalletMaps {
        kv.load(Table::WalletIndex, INDEX_KEY, |raw| {
            match bincode::serde::decode_from_slice::<WalletMaps, _>(
                raw,
                bincode::config::standard(),
            ) {
                Ok((maps, _)) => Some(maps),
                Err(e) => {
                    error!("wallet index checkpoint failed to deserialize: {e}");
                    None
                }
            }
        })
        .flatten()
        .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::config::ConfigKey;
    use crate::types::{Chain, HASH_LEN, Hash32};
    use tempfile::TempDir;

    fn open() -> (TempDir, Wallet) {
        let tmp = TempDir::new().expect("tempdir");
        let wallet = reopen(&tmp);
        (tmp, wallet)
    }

    fn reopen(tmp: &TempDir) -> Wallet {
        let kv = Arc::new(Kv::open(&tmp.path().join("kv")).expect("open kv"));
        let dir = tmp.path().join("blocks");
        std::fs::create_dir_all(&dir).expect("create dir");
        let bulk = Arc::new(
            Bulk::new(kv.clone(), &dir, "blk", ConfigKey::NextBlockAddress).expect("open bulk"),
        );
        Wallet::new(kv, bulk, [7u8; crypto::SIPHASH_KEY_LEN])
    }

    fn txid(byte: u8) -> Txid {
        Txid(Hash32([byte; HASH_LEN]))
    }

    fn contact(byte: u8, elements: &[&[u8]]) -> Contact {
        Contact {
            id: ContactId(Hash32([byte; HASH_LEN])),
            elements: elements.iter().map(|e| e.to_vec()).collect(),
        }
    }

    #[test]
    fn associate_replaces_pattern_set() {
        let (_tmp, wallet) = open();
        let tx = txid(1);
        let (p1, p2, p3) = (PatternId(1), PatternId(2), PatternId(3));

        assert!(wallet.associate_transaction(&tx, &[p1, p2]));
        assert_eq!(wallet.lookup_transactions(p1), vec![tx]);
        assert_eq!(wallet.lookup_transactions(p2), vec![tx]);

        assert!(wallet.associate_transaction(&tx, &[p2, p3]));
        assert!(wallet.lookup_transactions(p1).is_empty());
        assert_eq!(wallet.lookup_transactions(p2), vec![tx]);
        assert_eq!(wallet.lookup_transactions(p3), vec![tx]);
    }

    #[test]
    fn associate_is_idempotent() {
        let (_tmp, wallet) = open();
        let tx = txid(2);
        let p = PatternId(10);

        assert!(wallet.associate_transaction(&tx, &[p, p]));
        assert!(wallet.associate_transaction(&tx, &[p]));
        assert_eq!(wallet.lookup_transactions(p), vec![tx]);
    }

    #[test]
    fn transaction_roundtrip() {
        let (_tmp, wallet) = open();
        let record = TransactionRecord {
            txid: txid(3),
            chain: Chain::UnitTest,
            raw: vec![1, 2, 3, 4, 5],
        };

        assert!(wallet.load_transaction(&record.txid).is_none());
        assert!(wallet.store_transaction(&record));
        assert_eq!(wallet.load_transaction(&record.txid), Some(record));
    }

    #[test]
    fn update_contact_tracks_elements_and_affected_txids() {
        let (_tmp, wallet) = open();
        let element_a: &[u8] = b"script-element-a";
        let element_b: &[u8] = b"script-element-b";

        // A transaction touching element A.
        let tx = txid(4);
        let pattern = wallet.index_element(element_a);
        assert!(wallet.associate_transaction(&tx, &[pattern]));

        let c = contact(1, &[element_a]);
        let affected = wallet.update_contact(&c);
        assert_eq!(affected, vec![tx]);
        assert!(wallet.lookup_contact(element_a).contains(&c.id));

        // Swap the contact's elements: the removed element's txids are
        // reported again.
        let c2 = contact(1, &[element_b]);
        let affected = wallet.update_contact(&c2);
        assert_eq!(affected, vec![tx]);
        assert!(wallet.lookup_contact(element_a).is_empty());
        assert!(wallet.lookup_contact(element_b).contains(&c.id));
    }

    #[test]
    fn merged_contact_absorbs_child() {
        let (_tmp, wallet) = open();
        let shared: &[u8] = b"shared-element";

        let tx = txid(5);
        let pattern = wallet.index_element(shared);
        assert!(wallet.associate_transaction(&tx, &[pattern]));

        let child = contact(2, &[shared]);
        wallet.update_contact(&child);
        assert!(wallet.lookup_contact(shared).contains(&child.id));

        let parent = contact(3, &[shared]);
        let affected = wallet.update_merged_contact(&parent, &child);
        assert_eq!(affected, vec![tx]);

        let contacts = wallet.lookup_contact(shared);
        assert!(contacts.contains(&parent.id));
        assert!(!contacts.contains(&child.id));
    }

    #[test]
    fn checkpoint_survives_reopen() {
        let tmp = TempDir::new().expect("tempdir");
        let tx = txid(6);
        let p = PatternId(99);
        {
            let wallet = reopen(&tmp);
            assert!(wallet.associate_transaction(&tx, &[p]));
            assert!(wallet.checkpoint());
        }

        let wallet = reopen(&tmp);
        assert_eq!(wallet.lookup_transactions(p), vec![tx]);
    }
}
