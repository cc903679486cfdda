//! Block header store.
//!
//! Headers are keyed by block hash. The serialized record carries a
//! node-local section (height, status, work) that bulk imports clear so the
//! header chain can be re-evaluated from scratch.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{error, trace};

use crate::bulk::{Bulk, BulkGuard, IndexEntry};
use crate::kv::{Kv, Table, Txn};
use crate::types::{BlockHash, HeaderRecord};

pub struct BlockHeaders {
    kv: Arc<Kv>,
    bulk: Arc<Bulk>,
}

impl BlockHeaders {
    pub fn new(kv: Arc<Kv>, bulk: Arc<Bulk>) -> Self {
        Self { kv, bulk }
    }

    pub fn exists(&self, hash: &BlockHash) -> bool {
        self.kv.exists(Table::BlockHeaders, hash.as_bytes())
    }

    /// Loads a header, or `None` if it was never stored or its index row is
    /// unreadable.
    pub fn load(&self, hash: &BlockHash) -> Option<HeaderRecord> {
        let index = self
            .kv
            .load(Table::BlockHeaders, hash.as_bytes(), |raw| {
                IndexEntry::decode(raw)
            })??;

        let view = match self.bulk.read_view(&index) {
            Ok(view) => view,
            Err(e) => {
                error!("header {hash} has a dangling index entry: {e}");
                return None;
            }
        };

        match bincode::serde::decode_from_slice::<HeaderRecord, _>(&view, bincode::config::standard())
        {
            Ok((record, _)) => Some(record),
            Err(e) => {
                error!("header {hash} failed to deserialize: {e}");
                None
            }
        }
    }

    /// Stores one header, preserving its local metadata.
    pub fn store(&self, header: &HeaderRecord) -> bool {
        let txn = self.kv.txn_rw();
        {
            let mut guard = self.bulk.lock();
            if !self.store_one(&mut guard, &txn, header, false) {
                drop(guard);
                txn.finalize(false);
                return false;
            }
        }

        if txn.finalize(true) {
            return true;
        }
        error!("database update error");
        false
    }

    /// Stores a batch of headers under one transaction and one bulk-lock
    /// acquisition. Entries flagged as new have their local metadata
    /// cleared so downstream consumers recompute height and work.
    pub fn store_many(&self, headers: &BTreeMap<BlockHash, (HeaderRecord, bool)>) -> bool {
        let txn = self.kv.txn_rw();
        {
            let mut guard = self.bulk.lock();
            for (hash, (header, is_new)) in headers {
                if !is_new {
                    continue;
                }
                debug_assert_eq!(*hash, header.hash);
                if !self.store_one(&mut guard, &txn, header, true) {
                    drop(guard);
                    txn.finalize(false);
                    return false;
                }
            }
        }

        if txn.finalize(true) {
            return true;
        }
        error!("database update error");
        false
    }

    fn store_one(
        &self,
        guard: &mut BulkGuard<'_>,
        txn: &Txn<'_>,
        header: &HeaderRecord,
        clear_local: bool,
    ) -> bool {
        let hash = header.hash;
        let record = if clear_local {
            header.without_local()
        } else {
            header.clone()
        };

        let encoded = match bincode::serde::encode_to_vec(&record, bincode::config::standard()) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to serialize header {hash}: {e}");
                return false;
            }
        };

        let existing = self
            .kv
            .load(Table::BlockHeaders, hash.as_bytes(), |raw| {
                IndexEntry::decode(raw)
            })
            .flatten()
            .unwrap_or_default();

        let (index, mut view) =
            match self
                .bulk
                .write_view(guard, txn, &existing, encoded.len() as u64)
            {
                Ok(out) => out,
                Err(e) => {
                    error!("failed to get write position for header {hash}: {e}");
                    return false;
                }
            };
        view.copy_from_slice(&encoded);

        if !self
            .kv
            .store_in(txn, Table::BlockHeaders, hash.as_bytes(), &index.encode())
        {
            error!("failed to update index for block header {hash}");
            return false;
        }
        trace!("stored header {hash}");
        true
    }
}
