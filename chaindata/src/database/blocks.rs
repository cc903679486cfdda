//! Raw block storage.
//!
//! Blocks are opaque byte payloads in the bulk store, keyed by hash. Each
//! block has an associated reader/writer lock held by the returned handle,
//! so long-running scans can read a block concurrently while writes to the
//! same block stay exclusive.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use tracing::{error, trace};

use crate::bulk::{Bulk, IndexEntry, ReadView, WriteView};
use crate::kv::{Kv, Table};
use crate::types::BlockHash;

type BlockLock = Arc<RwLock<()>>;

/// Shared-mode handle to a stored block's bytes.
pub struct BlockReader<'a> {
    view: ReadView<'a>,
    _guard: ArcRwLockReadGuard<RawRwLock, ()>,
}

impl Deref for BlockReader<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.view
    }
}

/// Exclusive-mode handle to a freshly reserved block payload. The caller
/// fills it before dropping; readers of the same block block until then.
pub struct BlockWriter<'a> {
    view: WriteView<'a>,
    _guard: ArcRwLockWriteGuard<RawRwLock, ()>,
}

impl Deref for BlockWriter<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.view
    }
}

impl DerefMut for BlockWriter<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.view
    }
}

pub struct Blocks {
    kv: Arc<Kv>,
    bulk: Arc<Bulk>,
    locks: Mutex<HashMap<BlockHash, BlockLock>>,
}

impl Blocks {
    pub fn new(kv: Arc<Kv>, bulk: Arc<Bulk>) -> Self {
        Self {
            kv,
            bulk,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn exists(&self, block: &BlockHash) -> bool {
        self.kv.exists(Table::Blocks, block.as_bytes())
    }

    fn lock_for(&self, block: &BlockHash) -> BlockLock {
        self.locks
            .lock()
            .entry(*block)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Opens a block for reading. Waits for any in-progress write of the
    /// same block to finish.
    pub fn load(&self, block: &BlockHash) -> Option<BlockReader<'_>> {
        let index = self
            .kv
            .load(Table::Blocks, block.as_bytes(), |raw| IndexEntry::decode(raw))
            .flatten()
            .unwrap_or_default();

        if index.is_empty() {
            trace!("block {block} not found in index");
            return None;
        }

        let guard = self.lock_for(block).read_arc();
        match self.bulk.read_view(&index) {
            Ok(view) => Some(BlockReader {
                view,
                _guard: guard,
            }),
            Err(e) => {
                error!("block {block} has a dangling index entry: {e}");
                None
            }
        }
    }

    /// Reserves `bytes` of storage for a block and returns the writable
    /// handle. The index row commits before the payload is written; the
    /// exclusive lock carried by the handle keeps readers out until the
    /// caller finishes.
    pub fn store(&self, block: &BlockHash, bytes: u64) -> Option<BlockWriter<'_>> {
        if bytes == 0 {
            error!("block {block} invalid block size");
            return None;
        }

        let guard = self.lock_for(block).write_arc();

        let existing = self
            .kv
            .load(Table::Blocks, block.as_bytes(), |raw| IndexEntry::decode(raw))
            .flatten()
            .unwrap_or_default();

        let txn = self.kv.txn_rw();
        let (index, view) = match self.bulk.write(&txn, &existing, bytes) {
            Ok(out) => out,
            Err(e) => {
                error!("failed to get write position for block {block}: {e}");
                txn.finalize(false);
                return None;
            }
        };

        if !self
            .kv
            .store_in(&txn, Table::Blocks, block.as_bytes(), &index.encode())
        {
            error!("failed to update index for block {block}");
            txn.finalize(false);
            return None;
        }

        if !txn.finalize(true) {
            error!("database error");
            return None;
        }

        Some(BlockWriter {
            view,
            _guard: guard,
        })
    }
}
