//! Persistent configuration keys.
//!
//! Single-valued keys live in the `config` table under little-endian `u32`
//! identifiers; multi-valued keys (currently only the sync-server list)
//! live in the duplicate-value `config_multiple_values` table. Unknown key
//! ids encountered on disk are ignored on read and left untouched on write.

use std::sync::Arc;

use tracing::error;

use crate::kv::{Kv, Table, Txn};

/// Identifier of a single-valued configuration entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConfigKey {
    BlockStoragePolicy,
    SiphashKey,
    NextBlockAddress,
    NextSyncAddress,
}

impl ConfigKey {
    pub fn id(&self) -> u32 {
        match self {
            ConfigKey::BlockStoragePolicy => 0,
            ConfigKey::SiphashKey => 1,
            ConfigKey::NextBlockAddress => 2,
            ConfigKey::NextSyncAddress => 3,
        }
    }

    /// On-disk key encoding (little-endian `u32`).
    pub fn bytes(&self) -> [u8; 4] {
        self.id().to_le_bytes()
    }
}

/// Identifier of a multi-valued configuration entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
enum MultiKey {
    SyncServers,
}

impl MultiKey {
    fn bytes(&self) -> [u8; 4] {
        match self {
            MultiKey::SyncServers => 0u32.to_le_bytes(),
        }
    }
}

/// Typed facade over the configuration tables.
pub struct ConfigStore {
    kv: Arc<Kv>,
}

impl ConfigStore {
    pub fn new(kv: Arc<Kv>) -> Self {
        Self { kv }
    }

    /// Reads the raw value of a single-valued key.
    pub fn get(&self, key: ConfigKey) -> Option<Vec<u8>> {
        self.kv.load(Table::Config, &key.bytes(), |v| v.to_vec())
    }

    /// Stores the raw value of a single-valued key.
    pub fn set(&self, key: ConfigKey, value: &[u8]) -> bool {
        self.kv.store(Table::Config, &key.bytes(), value)
    }

    /// Stages a single-valued key into an open transaction.
    pub fn set_in(&self, txn: &Txn<'_>, key: ConfigKey, value: &[u8]) -> bool {
        self.kv.store_in(txn, Table::Config, &key.bytes(), value)
    }

    /// Registers a sync-server endpoint. Idempotent.
    pub fn add_sync_server(&self, endpoint: &str) -> bool {
        if endpoint.is_empty() {
            return false;
        }
        self.kv.store(
            Table::ConfigMulti,
            &MultiKey::SyncServers.bytes(),
            endpoint.as_bytes(),
        )
    }

    /// Removes a sync-server endpoint.
    pub fn delete_sync_server(&self, endpoint: &str) -> bool {
        if endpoint.is_empty() {
            return false;
        }
        self.kv.delete(
            Table::ConfigMulti,
            &MultiKey::SyncServers.bytes(),
            Some(endpoint.as_bytes()),
        )
    }

    /// Lists the registered sync-server endpoints.
    pub fn get_sync_servers(&self) -> Vec<String> {
        let mut out = Vec::new();
        let result = self
            .kv
            .read_prefix(Table::ConfigMulti, &MultiKey::SyncServers.bytes(), |value| {
                match std::str::from_utf8(value) {
                    Ok(endpoint) => out.push(endpoint.to_string()),
                    Err(_) => error!("discarding non-utf8 sync server endpoint"),
                }
                true
            });
        if let Err(e) = result {
            error!("failed to list sync servers: {e}");
        }
        out
    }
}
