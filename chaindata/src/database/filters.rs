//! Compact filter and filter header store.
//!
//! For every filter type there is a filter table (block hash → bulk index
//! of the serialized filter) and a header table (block hash → serialized
//! [`CfheaderRecord`]). The combined store writes both under one
//! transaction and one bulk-lock acquisition; serialization happens before
//! any lock is taken.

use std::sync::Arc;

use tracing::{error, trace};

use crate::bulk::{Bulk, IndexEntry};
use crate::kv::{Kv, Table, Txn};
use crate::types::{BlockHash, CfheaderRecord, FilterHash, FilterHeader, FilterType, GcsFilter};

/// `(block, filter)` pair queued for storage.
#[derive(Clone, Debug)]
pub struct CfilterParams {
    pub block: BlockHash,
    pub filter: GcsFilter,
}

/// `(block, header, filter hash)` triple queued for storage.
#[derive(Clone, Debug)]
pub struct CfheaderParams {
    pub block: BlockHash,
    pub header: FilterHeader,
    pub hash: FilterHash,
}

pub struct BlockFilter {
    kv: Arc<Kv>,
    bulk: Arc<Bulk>,
}

fn filter_table(filter_type: FilterType) -> Table {
    match filter_type {
        FilterType::BasicBip158 => Table::FiltersBasic,
        FilterType::BasicBchVariant => Table::FiltersBch,
        FilterType::Es => Table::FiltersEs,
    }
}

fn header_table(filter_type: FilterType) -> Table {
    match filter_type {
        FilterType::BasicBip158 => Table::FilterHeadersBasic,
        FilterType::BasicBchVariant => Table::FilterHeadersBch,
        FilterType::Es => Table::FilterHeadersEs,
    }
}

impl BlockFilter {
    pub fn new(kv: Arc<Kv>, bulk: Arc<Bulk>) -> Self {
        Self { kv, bulk }
    }

    pub fn have_filter(&self, filter_type: FilterType, block: &BlockHash) -> bool {
        self.kv.exists(filter_table(filter_type), block.as_bytes())
    }

    pub fn have_filter_header(&self, filter_type: FilterType, block: &BlockHash) -> bool {
        self.kv.exists(header_table(filter_type), block.as_bytes())
    }

    fn load_filter_index(&self, filter_type: FilterType, block: &BlockHash) -> Option<IndexEntry> {
        let index = self
            .kv
            .load(filter_table(filter_type), block.as_bytes(), |raw| {
                IndexEntry::decode(raw)
            })??;
        if index.is_empty() { None } else { Some(index) }
    }

    /// Loads the filter stored for `block`.
    pub fn load_filter(&self, filter_type: FilterType, block: &BlockHash) -> Option<GcsFilter> {
        let index = self.load_filter_index(filter_type, block)?;
        let view = match self.bulk.read_view(&index) {
            Ok(view) => view,
            Err(e) => {
                error!("cfilter for {block} has a dangling index entry: {e}");
                return None;
            }
        };

        match bincode::serde::decode_from_slice::<GcsFilter, _>(&view, bincode::config::standard()) {
            Ok((filter, _)) => Some(filter),
            Err(e) => {
                error!("cfilter for {block} failed to deserialize: {e}");
                None
            }
        }
    }

    /// Loads filters for a run of blocks, stopping at the first gap. The
    /// index rows are read under one snapshot so a concurrent sync batch
    /// cannot interleave.
    pub fn load_filters(&self, filter_type: FilterType, blocks: &[BlockHash]) -> Vec<GcsFilter> {
        let table = filter_table(filter_type);
        let snapshot = self.kv.txn_ro();
        let mut indices = Vec::with_capacity(blocks.len());
        for block in blocks {
            let index = self
                .kv
                .load_at(&snapshot, table, block.as_bytes(), |raw| {
                    IndexEntry::decode(raw)
                })
                .flatten()
                .filter(|index| !index.is_empty());
            match index {
                Some(index) => indices.push(index),
                None => {
                    trace!("cfilter run stops at {block}");
                    break;
                }
            }
        }
        drop(snapshot);

        let mut out = Vec::with_capacity(indices.len());
        for index in indices {
            let Ok(view) = self.bulk.read_view(&index) else {
                break;
            };
            match bincode::serde::decode_from_slice::<GcsFilter, _>(
                &view,
                bincode::config::standard(),
            ) {
                Ok((filter, _)) => out.push(filter),
                Err(_) => break,
            }
        }
        out
    }

    /// Returns the hash recorded in the cfheader row for `block`.
    pub fn load_filter_hash(&self, filter_type: FilterType, block: &BlockHash) -> Option<FilterHash> {
        self.load_cfheader(filter_type, block).map(|r| r.hash)
    }

    /// Returns the chained header recorded for `block`.
    pub fn load_filter_header(
        &self,
        filter_type: FilterType,
        block: &BlockHash,
    ) -> Option<FilterHeader> {
        self.load_cfheader(filter_type, block).map(|r| r.header)
    }

    fn load_cfheader(&self, filter_type: FilterType, block: &BlockHash) -> Option<CfheaderRecord> {
        self.kv
            .load(header_table(filter_type), block.as_bytes(), |raw| {
                match bincode::serde::decode_from_slice::<CfheaderRecord, _>(
                    raw,
                    bincode::config::standard(),
                ) {
                    Ok((record, _)) => Some(record),
                    Err(e) => {
                        error!("cfheader for {block} failed to deserialize: {e}");
                        None
                    }
                }
            })?
    }

    /// Stores cfheader records under one transaction.
    pub fn store_filter_headers(
        &self,
        filter_type: FilterType,
        headers: &[CfheaderParams],
    ) -> bool {
        let table = header_table(filter_type);
        let txn = self.kv.txn_rw();

        for params in headers {
            let record = CfheaderRecord::new(params.header, params.hash);
            let encoded = match bincode::serde::encode_to_vec(&record, bincode::config::standard())
            {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("failed to serialize cfheader for {}: {e}", params.block);
                    txn.finalize(false);
                    return false;
                }
            };
            if !self
                .kv
                .store_in(&txn, table, params.block.as_bytes(), &encoded)
            {
                txn.finalize(false);
                return false;
            }
        }

        txn.finalize(true)
    }

    /// Stores filters under one transaction and one bulk-lock acquisition.
    pub fn store_filters(&self, filter_type: FilterType, filters: &[CfilterParams]) -> bool {
        let encoded = match Self::serialize_filters(filters) {
            Some(encoded) => encoded,
            None => return false,
        };

        let txn = self.kv.txn_rw();
        {
            let mut guard = self.bulk.lock();
            for (params, bytes) in filters.iter().zip(&encoded) {
                if !self.store_one(&mut guard, &txn, filter_type, &params.block, bytes) {
                    drop(guard);
                    txn.finalize(false);
                    return false;
                }
            }
        }
        txn.finalize(true)
    }

    /// Stores matching cfheader and cfilter runs together. This is the
    /// preferred call during sync: headers and filters for the same blocks
    /// commit atomically and the bulk lock is held only while bytes are
    /// copied.
    pub fn store_filters_and_headers(
        &self,
        filter_type: FilterType,
        headers: &[CfheaderParams],
        filters: &[CfilterParams],
    ) -> bool {
        if headers.len() != filters.len() {
            error!(
                "wrong number of filters ({}) compared to headers ({})",
                filters.len(),
                headers.len()
            );
            return false;
        }

        // Do as much work as possible before taking any lock.
        let encoded_filters = match Self::serialize_filters(filters) {
            Some(encoded) => encoded,
            None => return false,
        };
        let mut encoded_headers = Vec::with_capacity(headers.len());
        for params in headers {
            let record = CfheaderRecord::new(params.header, params.hash);
            match bincode::serde::encode_to_vec(&record, bincode::config::standard()) {
                Ok(bytes) => encoded_headers.push(bytes),
                Err(e) => {
                    error!("failed to serialize cfheader for {}: {e}", params.block);
                    return false;
                }
            }
        }

        let h_table = header_table(filter_type);
        let txn = self.kv.txn_rw();
        {
            let mut guard = self.bulk.lock();
            for ((filter_params, filter_bytes), (header_params, header_bytes)) in filters
                .iter()
                .zip(&encoded_filters)
                .zip(headers.iter().zip(&encoded_headers))
            {
                if !self.store_one(
                    &mut guard,
                    &txn,
                    filter_type,
                    &filter_params.block,
                    filter_bytes,
                ) {
                    drop(guard);
                    txn.finalize(false);
                    return false;
                }
                if !self.kv.store_in(
                    &txn,
                    h_table,
                    header_params.block.as_bytes(),
                    header_bytes,
                ) {
                    drop(guard);
                    txn.finalize(false);
                    return false;
                }
            }
        }
        txn.finalize(true)
    }

    fn serialize_filters(filters: &[CfilterParams]) -> Option<Vec<Vec<u8>>> {
        let mut out = Vec::with_capacity(filters.len());
        for params in filters {
            match bincode::serde::encode_to_vec(&params.filter, bincode::config::standard()) {
                Ok(bytes) => out.push(bytes),
                Err(e) => {
                    error!("failed to serialize cfilter for {}: {e}", params.block);
                    return None;
                }
            }
        }
        Some(out)
    }

    fn store_one(
        &self,
        guard: &mut crate::bulk::BulkGuard<'_>,
        txn: &Txn<'_>,
        filter_type: FilterType,
        block: &BlockHash,
        encoded: &[u8],
    ) -> bool {
        let table = filter_table(filter_type);
        let existing = self
            .kv
            .load(table, block.as_bytes(), |raw| IndexEntry::decode(raw))
            .flatten()
            .unwrap_or_default();

        let (index, mut view) =
            match self
                .bulk
                .write_view(guard, txn, &existing, encoded.len() as u64)
            {
                Ok(out) => out,
                Err(e) => {
                    error!("failed to get write position for cfilter: {e}");
                    return false;
                }
            };
        view.copy_from_slice(encoded);

        if !self
            .kv
            .store_in(txn, table, block.as_bytes(), &index.encode())
        {
            error!("failed to update index for cfilter of {block}");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::config::ConfigKey;
    use crate::types::{HASH_LEN, Hash32};
    use tempfile::TempDir;

    fn open() -> (TempDir, BlockFilter) {
        let tmp = TempDir::new().expect("tempdir");
        let kv = Arc::new(Kv::open(&tmp.path().join("kv")).expect("open kv"));
        let dir = tmp.path().join("blocks");
        std::fs::create_dir_all(&dir).expect("create dir");
        let bulk = Arc::new(
            Bulk::new(kv.clone(), &dir, "blk", ConfigKey::NextBlockAddress).expect("open bulk"),
        );
        (tmp, BlockFilter::new(kv, bulk))
    }

    fn block(byte: u8) -> BlockHash {
        BlockHash(Hash32([byte; HASH_LEN]))
    }

    fn gcs(byte: u8) -> GcsFilter {
        GcsFilter {
            key: [byte; 16],
            bits: 19,
            fp_rate: 784_931,
            element_count: byte as u32 + 1,
            compressed: vec![byte; 8],
        }
    }

    fn params(byte: u8) -> (CfheaderParams, CfilterParams) {
        let filter = gcs(byte);
        let hash = filter.hash();
        let header = filter.header(&FilterHeader::default());
        (
            CfheaderParams {
                block: block(byte),
                header,
                hash,
            },
            CfilterParams {
                block: block(byte),
                filter,
            },
        )
    }

    #[test]
    fn filter_roundtrip_per_type() {
        let (_tmp, store) = open();
        let filter = gcs(1);

        for filter_type in [
            FilterType::BasicBip158,
            FilterType::BasicBchVariant,
            FilterType::Es,
        ] {
            assert!(!store.have_filter(filter_type, &block(1)));
            assert!(store.store_filters(
                filter_type,
                &[CfilterParams {
                    block: block(1),
                    filter: filter.clone(),
                }],
            ));
            assert!(store.have_filter(filter_type, &block(1)));
            assert_eq!(store.load_filter(filter_type, &block(1)), Some(filter.clone()));
        }
    }

    #[test]
    fn cfheader_roundtrip() {
        let (_tmp, store) = open();
        let (header_params, _) = params(3);

        assert!(store.store_filter_headers(FilterType::Es, std::slice::from_ref(&header_params)));
        assert!(store.have_filter_header(FilterType::Es, &header_params.block));
        assert_eq!(
            store.load_filter_hash(FilterType::Es, &header_params.block),
            Some(header_params.hash)
        );
        assert_eq!(
            store.load_filter_header(FilterType::Es, &header_params.block),
            Some(header_params.header)
        );
    }

    #[test]
    fn combined_store_rejects_mismatched_lengths() {
        let (_tmp, store) = open();
        let (header_params, filter_params) = params(4);

        assert!(!store.store_filters_and_headers(
            FilterType::Es,
            &[header_params.clone()],
            &[],
        ));

        // Nothing was written.
        assert!(!store.have_filter(FilterType::Es, &header_params.block));
        assert!(!store.have_filter_header(FilterType::Es, &header_params.block));

        assert!(store.store_filters_and_headers(
            FilterType::Es,
            &[header_params.clone()],
            &[filter_params],
        ));
        assert!(store.have_filter(FilterType::Es, &header_params.block));
        assert!(store.have_filter_header(FilterType::Es, &header_params.block));
    }

    #[test]
    fn load_filters_stops_at_first_gap() {
        let (_tmp, store) = open();
        for byte in [1u8, 2, 4] {
            let (_, filter_params) = params(byte);
            assert!(store.store_filters(FilterType::Es, &[filter_params]));
        }

        let run = store.load_filters(
            FilterType::Es,
            &[block(1), block(2), block(3), block(4)],
        );
        assert_eq!(run.len(), 2);
        assert_eq!(run[0], gcs(1));
        assert_eq!(run[1], gcs(2));
    }

    #[test]
    fn types_are_isolated() {
        let (_tmp, store) = open();
        let (_, filter_params) = params(7);
        assert!(store.store_filters(FilterType::BasicBip158, &[filter_params]));

        assert!(store.have_filter(FilterType::BasicBip158, &block(7)));
        assert!(!store.have_filter(FilterType::Es, &block(7)));
        assert!(!store.have_filter(FilterType::BasicBchVariant, &block(7)));
    }
}
