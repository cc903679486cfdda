//! Transactional key/value substrate.
//!
//! This module wraps a RocksDB transaction database with the typed table
//! registry the rest of the data plane works against. Tables are column
//! families with stable names; integer-keyed tables use fixed-width
//! big-endian keys so cursor order equals numeric order, and duplicate-value
//! tables are emulated with composite `logical key || value` keys and empty
//! values, scanned by prefix.
//!
//! Legacy tables from retired schemas are opened only so their contents can
//! be dropped.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DB, MultiThreaded, Options, Transaction,
    TransactionDB, TransactionDBOptions,
};
use tracing::{debug, error, trace};

use crate::types::Chain;

/// Cursor direction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Dir {
    Forward,
    Backward,
}

/// Typed table registry.
///
/// Every table name is a stable string; renaming one is a schema change.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Table {
    BlockHeaders,
    Peers,
    PeerChainIndex,
    PeerProtocolIndex,
    PeerServiceIndex,
    PeerNetworkIndex,
    PeerConnectedIndex,
    FilterHeadersBasic,
    FilterHeadersBch,
    FilterHeadersEs,
    Config,
    Blocks,
    EnabledChains,
    SyncTips,
    ConfigMulti,
    FiltersBasic,
    FiltersBch,
    FiltersEs,
    Transactions,
    WalletIndex,
    Sync(Chain),
}

impl Table {
    /// Stable on-disk name.
    pub fn name(&self) -> &'static str {
        match self {
            Table::BlockHeaders => "block_headers_2",
            Table::Peers => "peers",
            Table::PeerChainIndex => "peer_chain_index",
            Table::PeerProtocolIndex => "peer_protocol_index",
            Table::PeerServiceIndex => "peer_service_index",
            Table::PeerNetworkIndex => "peer_network_index",
            Table::PeerConnectedIndex => "peer_connected_index",
            Table::FilterHeadersBasic => "block_filter_headers_basic",
            Table::FilterHeadersBch => "block_filter_headers_bch",
            Table::FilterHeadersEs => "block_filter_headers_opentxs",
            Table::Config => "config",
            Table::Blocks => "blocks",
            Table::EnabledChains => "enabled_chains_2",
            Table::SyncTips => "sync_tips",
            Table::ConfigMulti => "config_multiple_values",
            Table::FiltersBasic => "block_filters_basic_2",
            Table::FiltersBch => "block_filters_bch_2",
            Table::FiltersEs => "block_filters_opentxs_2",
            Table::Transactions => "transactions",
            Table::WalletIndex => "wallet_index",
            Table::Sync(chain) => match chain {
                Chain::Bitcoin => "sync_bitcoin",
                Chain::BitcoinTestnet => "sync_bitcoin_testnet",
                Chain::BitcoinCash => "sync_bitcoin_cash",
                Chain::BitcoinCashTestnet => "sync_bitcoin_cash_testnet",
                Chain::UnitTest => "sync_unit_test",
            },
        }
    }

    /// Length of the logical key for duplicate-value tables, `None` for
    /// plain tables.
    fn dup_prefix_len(&self) -> Option<usize> {
        match self {
            Table::PeerChainIndex
            | Table::PeerProtocolIndex
            | Table::PeerServiceIndex
            | Table::PeerNetworkIndex
            | Table::PeerConnectedIndex => Some(8),
            Table::ConfigMulti => Some(4),
            _ => None,
        }
    }

    fn is_dup(&self) -> bool {
        self.dup_prefix_len().is_some()
    }

    /// Every live table this build declares.
    pub fn all() -> Vec<Table> {
        let mut out = vec![
            Table::BlockHeaders,
            Table::Peers,
            Table::PeerChainIndex,
            Table::PeerProtocolIndex,
            Table::PeerServiceIndex,
            Table::PeerNetworkIndex,
            Table::PeerConnectedIndex,
            Table::FilterHeadersBasic,
            Table::FilterHeadersBch,
            Table::FilterHeadersEs,
            Table::Config,
            Table::Blocks,
            Table::EnabledChains,
            Table::SyncTips,
            Table::ConfigMulti,
            Table::FiltersBasic,
            Table::FiltersBch,
            Table::FiltersEs,
            Table::Transactions,
            Table::WalletIndex,
        ];
        for chain in Chain::defined() {
            out.push(Table::Sync(*chain));
        }
        out
    }

    /// Names of retired tables whose rows are discarded on open.
    pub fn legacy_names() -> &'static [&'static str] {
        &[
            "block_headers",
            "block_filters_basic",
            "block_filters_bch",
            "block_filters_opentxs",
        ]
    }
}

/// Substrate-level error type.
#[derive(Debug)]
pub enum KvError {
    /// Underlying RocksDB error.
    RocksDb(rocksdb::Error),
    /// Required column family was not found.
    MissingColumnFamily(&'static str),
    /// A fixed-size value had the wrong length.
    CorruptValue(&'static str),
}

impl From<rocksdb::Error> for KvError {
    fn from(e: rocksdb::Error) -> Self {
        KvError::RocksDb(e)
    }
}

impl std::fmt::Display for KvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KvError::RocksDb(e) => write!(f, "kv error: {e}"),
            KvError::MissingColumnFamily(name) => write!(f, "missing table: {name}"),
            KvError::CorruptValue(what) => write!(f, "corrupt value: {what}"),
        }
    }
}

impl std::error::Error for KvError {}

type Db = TransactionDB<MultiThreaded>;

/// Typed wrapper around the embedded transaction database.
///
/// Reads may proceed concurrently; write transactions are serialized by an
/// internal mutex so the store behaves like a single-writer environment.
pub struct Kv {
    db: Db,
    write_lock: Mutex<()>,
}

/// An explicit read-write transaction.
///
/// Must be finished with [`Txn::finalize`]; dropping an unfinalized
/// transaction aborts it.
pub struct Txn<'a> {
    inner: Option<Transaction<'a, Db>>,
    _write: MutexGuard<'a, ()>,
}

/// A read-only snapshot transaction.
pub struct ReadTxn<'a> {
    snapshot: rocksdb::SnapshotWithThreadMode<'a, Db>,
}

impl<'a> Txn<'a> {
    fn raw(&self) -> &Transaction<'a, Db> {
        self.inner.as_ref().expect("transaction already finalized")
    }

    /// Commits (`true`) or aborts (`false`) the transaction. Returns
    /// whether the requested outcome was applied.
    pub fn finalize(mut self, commit: bool) -> bool {
        let txn = self.inner.take().expect("transaction already finalized");
        if commit {
            match txn.commit() {
                Ok(()) => true,
                Err(e) => {
                    error!("transaction commit failed: {e}");
                    false
                }
            }
        } else {
            if let Err(e) = txn.rollback() {
                error!("transaction rollback failed: {e}");
            }
            true
        }
    }
}

impl Kv {
    /// Opens (or creates) the environment at `path`, declaring every live
    /// table and dropping the rows of retired ones.
    pub fn open(path: &Path) -> Result<Self, KvError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        // The database refuses to open unless every existing column family
        // is declared, so merge what is on disk with what we need.
        let existing: HashSet<String> = DB::list_cf(&opts, path)
            .unwrap_or_else(|_| vec!["default".to_string()])
            .into_iter()
            .collect();

        let mut names: Vec<String> = vec!["default".to_string()];
        for table in Table::all() {
            names.push(table.name().to_string());
        }
        for name in existing {
            if !names.iter().any(|n| *n == name) {
                names.push(name);
            }
        }

        let cfs: Vec<ColumnFamilyDescriptor> = names
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(name.clone(), Options::default()))
            .collect();

        let db: Db =
            TransactionDB::open_cf_descriptors(&opts, &TransactionDBOptions::default(), path, cfs)?;

        let kv = Self {
            db,
            write_lock: Mutex::new(()),
        };
        kv.drop_legacy_rows()?;

        Ok(kv)
    }

    fn drop_legacy_rows(&self) -> Result<(), KvError> {
        for name in Table::legacy_names() {
            let Some(cf) = self.db.cf_handle(name) else {
                continue;
            };

            let keys: Vec<Vec<u8>> = {
                let mut iter = self.db.raw_iterator_cf(&cf);
                let mut out = Vec::new();
                iter.seek_to_first();
                while iter.valid() {
                    if let Some(key) = iter.key() {
                        out.push(key.to_vec());
                    }
                    iter.next();
                }
                out
            };

            if keys.is_empty() {
                continue;
            }

            debug!("discarding {} rows from retired table {name}", keys.len());
            let txn = self.db.transaction();
            for key in keys {
                txn.delete_cf(&cf, key)?;
            }
            txn.commit()?;
        }

        Ok(())
    }

    fn cf(&self, table: Table) -> Result<Arc<BoundColumnFamily<'_>>, KvError> {
        self.db
            .cf_handle(table.name())
            .ok_or(KvError::MissingColumnFamily(table.name()))
    }

    /// Begins a read-write transaction. Blocks until any other write
    /// transaction finishes.
    pub fn txn_rw(&self) -> Txn<'_> {
        let guard = self.write_lock.lock();
        Txn {
            inner: Some(self.db.transaction()),
            _write: guard,
        }
    }

    /// Begins a read-only transaction: a point-in-time snapshot that is
    /// unaffected by concurrent commits. Dropped when done; nothing to
    /// finalize.
    pub fn txn_ro(&self) -> ReadTxn<'_> {
        ReadTxn {
            snapshot: self.db.snapshot(),
        }
    }

    /// [`Kv::load`] against a read-only snapshot.
    pub fn load_at<R>(
        &self,
        txn: &ReadTxn<'_>,
        table: Table,
        key: &[u8],
        cb: impl FnOnce(&[u8]) -> R,
    ) -> Option<R> {
        let cf = self.cf(table).ok()?;
        match txn.snapshot.get_cf(&cf, key) {
            Ok(Some(value)) => Some(cb(&value)),
            Ok(None) => None,
            Err(e) => {
                error!("snapshot load from {} failed: {e}", table.name());
                None
            }
        }
    }

    /// Returns whether `key` is present in `table`.
    pub fn exists(&self, table: Table, key: &[u8]) -> bool {
        if table.is_dup() {
            let mut found = false;
            let _ = self.read_prefix(table, key, |_| {
                found = true;
                false
            });
            return found;
        }

        let Ok(cf) = self.cf(table) else {
            return false;
        };
        matches!(self.db.get_pinned_cf(&cf, key), Ok(Some(_)))
    }

    /// Invokes `cb` with the value stored under `key`, if any. The borrow
    /// is only valid for the duration of the callback.
    pub fn load<R>(&self, table: Table, key: &[u8], cb: impl FnOnce(&[u8]) -> R) -> Option<R> {
        if table.is_dup() {
            let mut out = None;
            let mut cb = Some(cb);
            let _ = self.read_prefix(table, key, |value| {
                if let Some(cb) = cb.take() {
                    out = Some(cb(value));
                }
                false
            });
            return out;
        }

        let cf = self.cf(table).ok()?;
        match self.db.get_pinned_cf(&cf, key) {
            Ok(Some(value)) => Some(cb(&value)),
            Ok(None) => {
                trace!("key not found in {}", table.name());
                None
            }
            Err(e) => {
                error!("load from {} failed: {e}", table.name());
                None
            }
        }
    }

    /// [`Kv::load`] reading through an open transaction, so the callback
    /// observes writes staged in it.
    pub fn load_in<R>(
        &self,
        txn: &Txn<'_>,
        table: Table,
        key: &[u8],
        cb: impl FnOnce(&[u8]) -> R,
    ) -> Option<R> {
        let cf = self.cf(table).ok()?;
        match txn.raw().get_pinned_cf(&cf, key) {
            Ok(Some(value)) => Some(cb(&value)),
            Ok(None) => None,
            Err(e) => {
                error!("load from {} failed: {e}", table.name());
                None
            }
        }
    }

    /// Stores `value` under `key` in its own transaction. Overwrites for
    /// plain tables, inserts another value for duplicate-value tables.
    pub fn store(&self, table: Table, key: &[u8], value: &[u8]) -> bool {
        let txn = self.txn_rw();
        if !self.store_in(&txn, table, key, value) {
            txn.finalize(false);
            return false;
        }
        txn.finalize(true)
    }

    /// Stages a store into an open transaction.
    pub fn store_in(&self, txn: &Txn<'_>, table: Table, key: &[u8], value: &[u8]) -> bool {
        let Ok(cf) = self.cf(table) else {
            return false;
        };

        let result = if table.is_dup() {
            let mut composite = Vec::with_capacity(key.len() + value.len());
            composite.extend_from_slice(key);
            composite.extend_from_slice(value);
            txn.raw().put_cf(&cf, composite, b"")
        } else {
            txn.raw().put_cf(&cf, key, value)
        };

        if let Err(e) = result {
            error!("store into {} failed: {e}", table.name());
            return false;
        }
        true
    }

    /// Deletes `key` (or one `(key, value)` pair of a duplicate-value
    /// table) inside an open transaction.
    pub fn delete_in(
        &self,
        txn: &Txn<'_>,
        table: Table,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> bool {
        let Ok(cf) = self.cf(table) else {
            return false;
        };

        let result = match (table.is_dup(), value) {
            (true, Some(value)) => {
                let mut composite = Vec::with_capacity(key.len() + value.len());
                composite.extend_from_slice(key);
                composite.extend_from_slice(value);
                txn.raw().delete_cf(&cf, composite)
            }
            (true, None) => {
                let mut composites = Vec::new();
                let _ = self.read_prefix(table, key, |value| {
                    let mut composite = Vec::with_capacity(key.len() + value.len());
                    composite.extend_from_slice(key);
                    composite.extend_from_slice(value);
                    composites.push(composite);
                    true
                });
                composites
                    .into_iter()
                    .try_for_each(|composite| txn.raw().delete_cf(&cf, composite))
            }
            (false, _) => txn.raw().delete_cf(&cf, key),
        };

        if let Err(e) = result {
            error!("delete from {} failed: {e}", table.name());
            return false;
        }
        true
    }

    /// Deletes in its own transaction.
    pub fn delete(&self, table: Table, key: &[u8], value: Option<&[u8]>) -> bool {
        let txn = self.txn_rw();
        if !self.delete_in(&txn, table, key, value) {
            txn.finalize(false);
            return false;
        }
        txn.finalize(true)
    }

    /// Cursor iteration over an entire table. `cb` receives `(key, value)`
    /// pairs (logical key and value for duplicate-value tables) and stops
    /// the scan by returning `false`.
    pub fn read(
        &self,
        table: Table,
        dir: Dir,
        mut cb: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), KvError> {
        let cf = self.cf(table)?;
        let mut iter = self.db.raw_iterator_cf(&cf);
        match dir {
            Dir::Forward => iter.seek_to_first(),
            Dir::Backward => iter.seek_to_last(),
        }
        self.drive(table, dir, &mut iter, &mut cb)
    }

    /// Cursor iteration starting at the least key `>= start` (forward) or
    /// the greatest key `<= start` (backward).
    pub fn read_from(
        &self,
        table: Table,
        start: &[u8],
        dir: Dir,
        mut cb: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), KvError> {
        let cf = self.cf(table)?;
        let mut iter = self.db.raw_iterator_cf(&cf);
        match dir {
            Dir::Forward => iter.seek(start),
            Dir::Backward => iter.seek_for_prev(start),
        }
        self.drive(table, dir, &mut iter, &mut cb)
    }

    fn drive(
        &self,
        table: Table,
        dir: Dir,
        iter: &mut rocksdb::DBRawIteratorWithThreadMode<'_, Db>,
        cb: &mut impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), KvError> {
        let split = table.dup_prefix_len();
        while iter.valid() {
            let (key, value) = match (iter.key(), iter.value()) {
                (Some(k), Some(v)) => (k, v),
                _ => break,
            };

            let proceed = match split {
                Some(p) if key.len() >= p => cb(&key[..p], &key[p..]),
                Some(_) => return Err(KvError::CorruptValue("composite key too short")),
                None => cb(key, value),
            };
            if !proceed {
                break;
            }

            match dir {
                Dir::Forward => iter.next(),
                Dir::Backward => iter.prev(),
            }
        }
        Ok(())
    }

    /// Iterates the values stored under one logical key of a
    /// duplicate-value table.
    pub fn read_prefix(
        &self,
        table: Table,
        prefix: &[u8],
        mut cb: impl FnMut(&[u8]) -> bool,
    ) -> Result<(), KvError> {
        debug_assert!(table.is_dup());
        let cf = self.cf(table)?;
        let mut iter = self.db.raw_iterator_cf(&cf);
        iter.seek(prefix);
        while iter.valid() {
            let Some(key) = iter.key() else { break };
            if !key.starts_with(prefix) {
                break;
            }
            if !cb(&key[prefix.len()..]) {
                break;
            }
            iter.next();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::int_key;
    use tempfile::TempDir;

    fn open_kv() -> (TempDir, Kv) {
        let tmp = TempDir::new().expect("create temp dir");
        let kv = Kv::open(tmp.path()).expect("open kv");
        (tmp, kv)
    }

    #[test]
    fn store_load_delete_roundtrip() {
        let (_tmp, kv) = open_kv();

        assert!(!kv.exists(Table::Config, b"k"));
        assert!(kv.store(Table::Config, b"k", b"v"));
        assert!(kv.exists(Table::Config, b"k"));
        assert_eq!(kv.load(Table::Config, b"k", |v| v.to_vec()), Some(b"v".to_vec()));

        assert!(kv.store(Table::Config, b"k", b"v2"));
        assert_eq!(
            kv.load(Table::Config, b"k", |v| v.to_vec()),
            Some(b"v2".to_vec())
        );

        assert!(kv.delete(Table::Config, b"k", None));
        assert!(!kv.exists(Table::Config, b"k"));
    }

    #[test]
    fn aborted_transaction_leaves_no_trace() {
        let (_tmp, kv) = open_kv();

        let txn = kv.txn_rw();
        assert!(kv.store_in(&txn, Table::Config, b"a", b"1"));
        assert!(txn.finalize(false));

        assert!(!kv.exists(Table::Config, b"a"));

        let txn = kv.txn_rw();
        assert!(kv.store_in(&txn, Table::Config, b"a", b"1"));
        assert!(txn.finalize(true));
        assert!(kv.exists(Table::Config, b"a"));
    }

    #[test]
    fn transaction_reads_its_own_writes() {
        let (_tmp, kv) = open_kv();

        let txn = kv.txn_rw();
        assert!(kv.store_in(&txn, Table::Config, b"x", b"y"));
        assert_eq!(
            kv.load_in(&txn, Table::Config, b"x", |v| v.to_vec()),
            Some(b"y".to_vec())
        );
        txn.finalize(true);
    }

    #[test]
    fn read_from_respects_integer_order() {
        let (_tmp, kv) = open_kv();
        let table = Table::Sync(Chain::UnitTest);

        for height in [0u64, 1, 2, 5, 10, 300] {
            assert!(kv.store(table, &int_key(height), &height.to_le_bytes()));
        }

        let mut seen = Vec::new();
        kv.read_from(table, &int_key(2), Dir::Forward, |key, _| {
            seen.push(crate::util::read_int_key(key).unwrap());
            true
        })
        .expect("cursor");

        assert_eq!(seen, vec![2, 5, 10, 300]);
    }

    #[test]
    fn dup_table_holds_multiple_values_per_key() {
        let (_tmp, kv) = open_kv();
        let table = Table::PeerChainIndex;
        let key = int_key(7);

        assert!(kv.store(table, &key, b"peer-a"));
        assert!(kv.store(table, &key, b"peer-b"));
        assert!(kv.store(table, &key, b"peer-b"));

        let mut values = Vec::new();
        kv.read_prefix(table, &key, |v| {
            values.push(v.to_vec());
            true
        })
        .expect("prefix scan");
        assert_eq!(values, vec![b"peer-a".to_vec(), b"peer-b".to_vec()]);

        assert!(kv.delete(table, &key, Some(b"peer-a")));
        let mut values = Vec::new();
        kv.read_prefix(table, &key, |v| {
            values.push(v.to_vec());
            true
        })
        .expect("prefix scan");
        assert_eq!(values, vec![b"peer-b".to_vec()]);

        assert!(kv.delete(table, &key, None));
        assert!(!kv.exists(table, &key));
    }

    #[test]
    fn reopen_preserves_rows() {
        let tmp = TempDir::new().expect("create temp dir");
        {
            let kv = Kv::open(tmp.path()).expect("open");
            assert!(kv.store(Table::Blocks, b"h", b"payload"));
        }
        let kv = Kv::open(tmp.path()).expect("reopen");
        assert_eq!(
            kv.load(Table::Blocks, b"h", |v| v.to_vec()),
            Some(b"payload".to_vec())
        );
    }
}
