//! Shared storage container.
//!
//! [`Database`] owns the key/value environment, the block bulk store, the
//! database-wide SipHash key, and the block storage policy, and constructs
//! the typed sub-stores on top of them. On-disk layout:
//!
//! ```text
//! <data>/blockchain/version.1          presence marker
//! <data>/blockchain/common/            KV environment + sync segments
//! <data>/blockchain/common/blocks/     block bulk segments
//! ```
//!
//! A `blockchain/` directory without the version marker is a v0 layout,
//! which is unsupported and purged on open.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::bulk::{Bulk, BulkError};
use crate::crypto;
use crate::kv::{Dir, Kv, KvError, Table};
use crate::types::{Chain, StoragePolicy};

pub mod blocks;
pub mod config;
pub mod filters;
pub mod headers;
pub mod peers;
pub mod sync;
pub mod wallet;

pub use blocks::{BlockReader, BlockWriter, Blocks};
pub use config::{ConfigKey, ConfigStore};
pub use filters::{BlockFilter, CfheaderParams, CfilterParams};
pub use headers::BlockHeaders;
pub use peers::Peers;
pub use sync::{SyncPacket, SyncStore};
pub use wallet::Wallet;

/// Storage policy used when neither the caller nor the database has an
/// opinion.
const DEFAULT_STORAGE_POLICY: StoragePolicy = StoragePolicy::Cache;

const VERSION_MARKER: &str = "version.1";

/// Container-level error type.
#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    Kv(KvError),
    Bulk(BulkError),
    Corrupt(&'static str),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

impl From<KvError> for StorageError {
    fn from(e: KvError) -> Self {
        StorageError::Kv(e)
    }
}

impl From<BulkError> for StorageError {
    fn from(e: BulkError) -> Self {
        StorageError::Bulk(e)
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "storage io error: {e}"),
            StorageError::Kv(e) => write!(f, "{e}"),
            StorageError::Bulk(e) => write!(f, "{e}"),
            StorageError::Corrupt(what) => write!(f, "corrupt database: {what}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// The assembled data plane storage stack.
pub struct Database {
    blockchain_path: PathBuf,
    kv: Arc<Kv>,
    bulk: Arc<Bulk>,
    policy: StoragePolicy,
    siphash_key: [u8; crypto::SIPHASH_KEY_LEN],
    pub headers: BlockHeaders,
    pub peers: Peers,
    pub filters: BlockFilter,
    pub blocks: Blocks,
    pub sync: SyncStore,
    pub wallet: Wallet,
    pub config: ConfigStore,
}

impl Database {
    /// Opens (or creates) the database under `<data_dir>/blockchain`.
    ///
    /// `requested_policy` is the caller's preference; the effective policy
    /// is the stronger of it (or the compiled default) and whatever the
    /// database already recorded, and is persisted back.
    pub fn open(
        data_dir: &Path,
        requested_policy: Option<StoragePolicy>,
    ) -> Result<Self, StorageError> {
        let blockchain_path = init_storage_path(data_dir)?;
        let common_path = init_folder(&blockchain_path, "common")?;
        let blocks_path = init_folder(&common_path, "blocks")?;

        let kv = Arc::new(Kv::open(&common_path)?);
        let bulk = Arc::new(Bulk::new(
            kv.clone(),
            &blocks_path,
            "blk",
            ConfigKey::NextBlockAddress,
        )?);

        let policy = resolve_storage_policy(&kv, requested_policy);
        let siphash_key = siphash_key(&kv)?;

        let headers = BlockHeaders::new(kv.clone(), bulk.clone());
        let peers = Peers::new(kv.clone());
        let filters = BlockFilter::new(kv.clone(), bulk.clone());
        let blocks = Blocks::new(kv.clone(), bulk.clone());
        let sync = SyncStore::new(kv.clone(), &common_path)?;
        let wallet = Wallet::new(kv.clone(), bulk.clone(), siphash_key);
        let config = ConfigStore::new(kv.clone());

        Ok(Self {
            blockchain_path,
            kv,
            bulk,
            policy,
            siphash_key,
            headers,
            peers,
            filters,
            blocks,
            sync,
            wallet,
            config,
        })
    }

    /// Effective block storage policy for this database.
    pub fn block_policy(&self) -> StoragePolicy {
        self.policy
    }

    /// The database-wide SipHash key for pattern fingerprints.
    pub fn hash_key(&self) -> &[u8; crypto::SIPHASH_KEY_LEN] {
        &self.siphash_key
    }

    /// Creates (if needed) and returns `<blockchain>/<name>` for sibling
    /// subsystems that keep their own files.
    pub fn allocate_storage_folder(&self, name: &str) -> Result<PathBuf, StorageError> {
        init_folder(&self.blockchain_path, name)
    }

    /// Marks a chain enabled, remembering its seed node.
    pub fn enable_chain(&self, chain: Chain, seed_node: &str) -> bool {
        let mut value = Vec::with_capacity(1 + seed_node.len());
        value.push(1u8);
        value.extend_from_slice(seed_node.as_bytes());
        self.kv
            .store(Table::EnabledChains, &chain.id().to_le_bytes(), &value)
    }

    /// Marks a chain disabled.
    pub fn disable_chain(&self, chain: Chain) -> bool {
        self.kv
            .store(Table::EnabledChains, &chain.id().to_le_bytes(), &[0u8])
    }

    /// Lists the enabled chains with their recorded seed nodes.
    pub fn load_enabled_chains(&self) -> Vec<(Chain, String)> {
        let mut out = Vec::new();
        let scan = self.kv.read(Table::EnabledChains, Dir::Forward, |key, value| {
            if value.is_empty() {
                return true;
            }
            let Some(chain) = crate::util::read_u32_le(key).and_then(Chain::from_id) else {
                warn!("ignoring unknown chain id in enabled table");
                return true;
            };
            if value[0] == 1 {
                let seed = String::from_utf8_lossy(&value[1..]).to_string();
                out.push((chain, seed));
            }
            true
        });
        if let Err(e) = scan {
            error!("failed to list enabled chains: {e}");
        }
        out
    }

    /// Flushes in-memory state (wallet index checkpoint, bulk segments).
    /// Called on orderly shutdown; safe to call repeatedly.
    pub fn flush(&self) -> Result<(), StorageError> {
        if !self.wallet.checkpoint() {
            return Err(StorageError::Corrupt("wallet checkpoint failed"));
        }
        self.bulk.flush()?;
        self.sync.flush()?;
        Ok(())
    }
}

fn init_storage_path(data_dir: &Path) -> Result<PathBuf, StorageError> {
    let base = data_dir.join("blockchain");
    let marker = base.join(VERSION_MARKER);

    if base.exists() {
        if marker.exists() {
            info!("existing blockchain data directory already updated to v1");
        } else {
            error!("existing blockchain data directory is v0 and must be purged");
            std::fs::remove_dir_all(&base)?;
        }
    } else {
        info!("initializing new blockchain data directory");
    }

    std::fs::create_dir_all(&base)?;
    std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&marker)?;

    Ok(base)
}

fn init_folder(parent: &Path, child: &str) -> Result<PathBuf, StorageError> {
    let path = parent.join(child);
    std::fs::create_dir_all(&path)?;
    Ok(path)
}

fn resolve_storage_policy(kv: &Kv, requested: Option<StoragePolicy>) -> StoragePolicy {
    let mut output = requested.unwrap_or(DEFAULT_STORAGE_POLICY);

    let stored = kv
        .load(Table::Config, &ConfigKey::BlockStoragePolicy.bytes(), |v| {
            crate::util::read_u32_le(v).and_then(StoragePolicy::from_id)
        })
        .flatten();

    if let Some(stored) = stored {
        output = output.max(stored);
    }

    if stored != Some(output)
        && !kv.store(
            Table::Config,
            &ConfigKey::BlockStoragePolicy.bytes(),
            &output.id().to_le_bytes(),
        )
    {
        error!("failed to persist block storage policy");
    }

    output
}

fn siphash_key(kv: &Kv) -> Result<[u8; crypto::SIPHASH_KEY_LEN], StorageError> {
    let configured = kv
        .load(Table::Config, &ConfigKey::SiphashKey.bytes(), |v| {
            <[u8; crypto::SIPHASH_KEY_LEN]>::try_from(v).ok()
        })
        .flatten();

    if let Some(key) = configured {
        return Ok(key);
    }

    let key = crypto::random_siphash_key();
    if !kv.store(Table::Config, &ConfigKey::SiphashKey.bytes(), &key) {
        return Err(StorageError::Corrupt("failed to persist siphash key"));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_creates_v1_layout() {
        let tmp = TempDir::new().expect("tempdir");
        let db = Database::open(tmp.path(), None).expect("open");

        assert!(tmp.path().join("blockchain").join(VERSION_MARKER).exists());
        assert!(tmp.path().join("blockchain").join("common").exists());
        assert!(
            tmp.path()
                .join("blockchain")
                .join("common")
                .join("blocks")
                .exists()
        );
        assert_eq!(db.block_policy(), DEFAULT_STORAGE_POLICY);
    }

    #[test]
    fn v0_layout_is_purged() {
        let tmp = TempDir::new().expect("tempdir");
        let base = tmp.path().join("blockchain");
        std::fs::create_dir_all(base.join("some-old-dir")).expect("create v0 dirs");
        std::fs::write(base.join("some-old-dir").join("stale"), b"bytes").expect("write");

        let _db = Database::open(tmp.path(), None).expect("open");
        assert!(!base.join("some-old-dir").exists());
        assert!(base.join(VERSION_MARKER).exists());
    }

    #[test]
    fn storage_policy_never_downgrades() {
        let tmp = TempDir::new().expect("tempdir");
        {
            let db = Database::open(tmp.path(), Some(StoragePolicy::All)).expect("open");
            assert_eq!(db.block_policy(), StoragePolicy::All);
        }
        {
            let db = Database::open(tmp.path(), Some(StoragePolicy::Cache)).expect("reopen");
            assert_eq!(db.block_policy(), StoragePolicy::All);
        }
        {
            let db = Database::open(tmp.path(), None).expect("reopen");
            assert_eq!(db.block_policy(), StoragePolicy::All);
        }
    }

    #[test]
    fn siphash_key_is_generated_once() {
        let tmp = TempDir::new().expect("tempdir");
        let first = {
            let db = Database::open(tmp.path(), None).expect("open");
            *db.hash_key()
        };
        let second = {
            let db = Database::open(tmp.path(), None).expect("reopen");
            *db.hash_key()
        };
        assert_eq!(first, second);
    }

    #[test]
    fn enabled_chains_roundtrip() {
        let tmp = TempDir::new().expect("tempdir");
        let db = Database::open(tmp.path(), None).expect("open");

        assert!(db.enable_chain(Chain::Bitcoin, "seed.example:8333"));
        assert!(db.enable_chain(Chain::UnitTest, ""));
        assert!(db.disable_chain(Chain::UnitTest));

        let enabled = db.load_enabled_chains();
        assert_eq!(enabled, vec![(Chain::Bitcoin, "seed.example:8333".to_string())]);
    }

    #[test]
    fn storage_folder_allocation() {
        let tmp = TempDir::new().expect("tempdir");
        let db = Database::open(tmp.path(), None).expect("open");

        let path = db.allocate_storage_folder("peers").expect("allocate");
        assert!(path.exists());
        assert_eq!(path, tmp.path().join("blockchain").join("peers"));
    }

    #[test]
    fn end_to_end_block_storage() {
        let tmp = TempDir::new().expect("tempdir");
        let db = Database::open(tmp.path(), Some(StoragePolicy::All)).expect("open");

        let hash = crate::types::BlockHash(crate::types::Hash32([0xcd; 32]));
        {
            let mut writer = db.blocks.store(&hash, 1000).expect("reserve");
            writer.fill(0xcd);
        }
        assert!(db.blocks.exists(&hash));
        let reader = db.blocks.load(&hash).expect("block stored");
        assert_eq!(reader.len(), 1000);
        assert!(reader.iter().all(|b| *b == 0xcd));

        db.flush().expect("flush");
    }
}
