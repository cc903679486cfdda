//! Append-only bulk payload storage over memory-mapped segment files.
//!
//! Variable-length payloads (headers, filters, transactions, sync packets,
//! raw blocks) live in fixed-size segment files named
//! `<prefix>NNNNN.dat`, mapped read-write for the lifetime of the store and
//! never unmapped before shutdown. The key/value layer holds 16-byte
//! [`IndexEntry`] pointers into these segments plus a single cursor (the
//! next free byte of the logical stream) under a config key, updated in the
//! same transaction as the caller's own index rows.
//!
//! A reservation never straddles a segment boundary: if it would, it moves
//! to the start of the next segment and the trailing bytes of the previous
//! one become unreferenced slack. Payload bytes are immutable once written;
//! aborted transactions leave orphaned bytes that nothing references.

use std::fs::OpenOptions;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::{MmapOptions, MmapRaw};
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, trace};

use crate::database::config::ConfigKey;
use crate::kv::{Kv, KvError, Table, Txn};
use crate::util;

/// Size of one mapped segment file.
#[cfg(target_pointer_width = "64")]
pub const SEGMENT_SIZE: u64 = 1 << 30;
#[cfg(not(target_pointer_width = "64"))]
pub const SEGMENT_SIZE: u64 = 1 << 28;

/// Locates a payload in the bulk store. Stored little-endian in 16 bytes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IndexEntry {
    pub segment: u32,
    pub offset: u32,
    pub length: u64,
}

impl IndexEntry {
    pub const ENCODED_LEN: usize = 16;

    /// Serializes to `u32 segment || u32 offset || u64 length`, all
    /// little-endian.
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..4].copy_from_slice(&self.segment.to_le_bytes());
        out[4..8].copy_from_slice(&self.offset.to_le_bytes());
        out[8..].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        Some(Self {
            segment: util::read_u32_le(&bytes[..4])?,
            offset: util::read_u32_le(&bytes[4..8])?,
            length: util::read_u64_le(&bytes[8..])?,
        })
    }

    /// An entry that has never pointed at a payload.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// Bulk-store error type.
#[derive(Debug)]
pub enum BulkError {
    Io(io::Error),
    Kv(KvError),
    /// Caller bug: zero size, oversized payload, or similar.
    InvalidInput(&'static str),
    /// Index entry points outside the allocated segments.
    Corrupt(&'static str),
}

impl From<io::Error> for BulkError {
    fn from(e: io::Error) -> Self {
        BulkError::Io(e)
    }
}

impl From<KvError> for BulkError {
    fn from(e: KvError) -> Self {
        BulkError::Kv(e)
    }
}

impl std::fmt::Display for BulkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BulkError::Io(e) => write!(f, "bulk io error: {e}"),
            BulkError::Kv(e) => write!(f, "bulk index error: {e}"),
            BulkError::InvalidInput(what) => write!(f, "invalid bulk request: {what}"),
            BulkError::Corrupt(what) => write!(f, "corrupt bulk index: {what}"),
        }
    }
}

impl std::error::Error for BulkError {}

/// Borrowed view of a stored payload. Valid for as long as the store is
/// alive; segments are only unmapped on drop.
pub struct ReadView<'a> {
    bytes: &'a [u8],
}

impl Deref for ReadView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

/// Writable view of a fresh reservation. The caller fills it before the
/// enclosing transaction's index rows become visible to readers.
pub struct WriteView<'a> {
    bytes: &'a mut [u8],
}

impl Deref for WriteView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

impl DerefMut for WriteView<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.bytes
    }
}

/// Guard over the write cursor. Writers hold it across a batch of
/// reservations; readers never take it.
pub struct BulkGuard<'a> {
    cursor: MutexGuard<'a, u64>,
}

/// The mapped-segment store.
pub struct Bulk {
    kv: Arc<Kv>,
    dir: PathBuf,
    prefix: &'static str,
    anchor: ConfigKey,
    segment_size: u64,
    segments: RwLock<Vec<MmapRaw>>,
    cursor: Mutex<u64>,
}

impl Bulk {
    /// Opens the store in `dir`, restoring the write cursor from the config
    /// table (storing zero on first run) and mapping every segment the
    /// cursor implies.
    pub fn new(kv: Arc<Kv>, dir: &Path, prefix: &'static str, anchor: ConfigKey) -> Result<Self, BulkError> {
        Self::with_segment_size(kv, dir, prefix, anchor, SEGMENT_SIZE)
    }

    pub(crate) fn with_segment_size(
        kv: Arc<Kv>,
        dir: &Path,
        prefix: &'static str,
        anchor: ConfigKey,
        segment_size: u64,
    ) -> Result<Self, BulkError> {
        let position = match kv.load(Table::Config, &anchor.bytes(), |v| util::read_u64_le(v)) {
            Some(Some(position)) => position,
            Some(None) => return Err(BulkError::Corrupt("write cursor has wrong size")),
            None => {
                if !kv.store(Table::Config, &anchor.bytes(), &0u64.to_le_bytes()) {
                    return Err(BulkError::Corrupt("failed to initialize write cursor"));
                }
                0
            }
        };

        let count = file_count(position, segment_size);
        let mut segments = Vec::with_capacity(count as usize);
        for index in 0..count {
            segments.push(create_or_load(dir, prefix, index, segment_size)?);
        }
        trace!("bulk store at {position} across {count} segment(s)");

        Ok(Self {
            kv,
            dir: dir.to_path_buf(),
            prefix,
            anchor,
            segment_size,
            segments: RwLock::new(segments),
            cursor: Mutex::new(position),
        })
    }

    /// Acquires the coarse writer lock protecting cursor advancement.
    pub fn lock(&self) -> BulkGuard<'_> {
        BulkGuard {
            cursor: self.cursor.lock(),
        }
    }

    /// Resolves an index entry into a borrow of the mapped payload.
    pub fn read_view(&self, index: &IndexEntry) -> Result<ReadView<'_>, BulkError> {
        if index.is_empty() {
            return Err(BulkError::InvalidInput("empty index entry"));
        }
        let end = index.offset as u64 + index.length;
        if end > self.segment_size {
            return Err(BulkError::Corrupt("entry exceeds segment size"));
        }

        let segments = self.segments.read();
        let Some(segment) = segments.get(index.segment as usize) else {
            return Err(BulkError::Corrupt("entry names unallocated segment"));
        };

        // Mapped memory stays valid for the lifetime of `self`; segments are
        // only dropped when the store is.
        let bytes = unsafe {
            std::slice::from_raw_parts(
                segment.as_ptr().add(index.offset as usize),
                index.length as usize,
            )
        };
        Ok(ReadView { bytes })
    }

    /// Reserves `size` bytes and stages the advanced cursor into `txn`.
    ///
    /// Returns the entry describing the reservation and a view to fill. If
    /// `existing` already points at a payload of exactly `size` bytes the
    /// reservation is reused in place and the cursor does not move. If the
    /// transaction later aborts, the persisted cursor is unchanged and the
    /// written bytes stay orphaned.
    pub fn write_view<'a>(
        &'a self,
        guard: &mut BulkGuard<'_>,
        txn: &Txn<'_>,
        existing: &IndexEntry,
        size: u64,
    ) -> Result<(IndexEntry, WriteView<'a>), BulkError> {
        if size == 0 {
            return Err(BulkError::InvalidInput("zero-length reservation"));
        }
        if size > self.segment_size {
            return Err(BulkError::InvalidInput("payload exceeds segment size"));
        }

        if !existing.is_empty() && existing.length == size {
            debug!("replacing existing item in place");
            let entry = *existing;
            let view = self.view_mut(entry)?;
            return Ok((entry, view));
        }

        let position = *guard.cursor;
        let (mut segment, mut offset) = (position / self.segment_size, position % self.segment_size);
        if offset + size > self.segment_size {
            segment += 1;
            offset = 0;
        }

        self.ensure_segment(segment)?;

        let next = segment * self.segment_size + offset + size;
        if !self.kv.store_in(
            txn,
            Table::Config,
            &self.anchor.bytes(),
            &next.to_le_bytes(),
        ) {
            error!("failed to stage next write position");
            return Err(BulkError::Corrupt("cursor update rejected"));
        }
        *guard.cursor = next;

        let entry = IndexEntry {
            segment: segment as u32,
            offset: offset as u32,
            length: size,
        };
        trace!("reserved {size} bytes at segment {segment} offset {offset}");
        let view = self.view_mut(entry)?;
        Ok((entry, view))
    }

    /// One-shot variant of [`Bulk::write_view`] for callers storing a
    /// single payload.
    pub fn write<'a>(
        &'a self,
        txn: &Txn<'_>,
        existing: &IndexEntry,
        size: u64,
    ) -> Result<(IndexEntry, WriteView<'a>), BulkError> {
        let mut guard = self.lock();
        self.write_view(&mut guard, txn, existing, size)
    }

    /// Flushes every mapped segment to disk.
    pub fn flush(&self) -> Result<(), BulkError> {
        for segment in self.segments.read().iter() {
            segment.flush()?;
        }
        Ok(())
    }

    fn view_mut(&self, entry: IndexEntry) -> Result<WriteView<'_>, BulkError> {
        let segments = self.segments.read();
        let Some(segment) = segments.get(entry.segment as usize) else {
            return Err(BulkError::Corrupt("entry names unallocated segment"));
        };

        // Reservations are disjoint (cursor) or exclusive (per-payload
        // locks held by callers), so handing out a mutable borrow of this
        // range does not alias another live view.
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(
                segment.as_mut_ptr().add(entry.offset as usize),
                entry.length as usize,
            )
        };
        Ok(WriteView { bytes })
    }

    fn ensure_segment(&self, index: u64) -> Result<(), BulkError> {
        {
            let segments = self.segments.read();
            if (index as usize) < segments.len() {
                return Ok(());
            }
        }

        let mut segments = self.segments.write();
        while segments.len() <= index as usize {
            let next = segments.len() as u64;
            segments.push(create_or_load(
                &self.dir,
                self.prefix,
                next,
                self.segment_size,
            )?);
        }
        Ok(())
    }
}

impl Drop for Bulk {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!("bulk flush on shutdown failed: {e}");
        }
    }
}

fn segment_file_name(prefix: &str, index: u64) -> String {
    format!("{prefix}{index:05}.dat")
}

fn file_count(position: u64, segment_size: u64) -> u64 {
    let bytes = position + 1;
    (bytes / segment_size + u64::from(bytes % segment_size != 0)).max(1)
}

fn create_or_load(
    dir: &Path,
    prefix: &str,
    index: u64,
    segment_size: u64,
) -> Result<MmapRaw, BulkError> {
    let path = dir.join(segment_file_name(prefix, index));
    trace!("initializing segment file {}", path.display());

    if let Ok(meta) = std::fs::metadata(&path) {
        if meta.len() != segment_size {
            error!("incorrect size for {}, recreating", path.display());
            std::fs::remove_file(&path)?;
        }
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;
    if file.metadata()?.len() != segment_size {
        file.set_len(segment_size)?;
    }

    Ok(MmapOptions::new().map_raw(&file)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::Kv;
    use tempfile::TempDir;

    const SEG: u64 = 4096;

    fn open_bulk(tmp: &TempDir) -> (Arc<Kv>, Bulk) {
        let kv = Arc::new(Kv::open(&tmp.path().join("kv")).expect("open kv"));
        let dir = tmp.path().join("bulk");
        std::fs::create_dir_all(&dir).expect("create bulk dir");
        let bulk = Bulk::with_segment_size(kv.clone(), &dir, "blk", ConfigKey::NextBlockAddress, SEG)
            .expect("open bulk");
        (kv, bulk)
    }

    fn cursor(kv: &Kv) -> u64 {
        kv.load(Table::Config, &ConfigKey::NextBlockAddress.bytes(), |v| {
            util::read_u64_le(v).unwrap()
        })
        .unwrap()
    }

    #[test]
    fn index_entry_roundtrip() {
        let entry = IndexEntry {
            segment: 3,
            offset: 512,
            length: 1000,
        };
        let encoded = entry.encode();
        assert_eq!(encoded.len(), IndexEntry::ENCODED_LEN);
        assert_eq!(IndexEntry::decode(&encoded), Some(entry));
        assert!(IndexEntry::decode(&encoded[..15]).is_none());
    }

    #[test]
    fn write_then_read_roundtrip() {
        let tmp = TempDir::new().expect("tempdir");
        let (kv, bulk) = open_bulk(&tmp);

        let payload = b"hello bulk storage";
        let entry = {
            let txn = kv.txn_rw();
            let (entry, mut view) = bulk
                .write(&txn, &IndexEntry::default(), payload.len() as u64)
                .expect("reserve");
            view.copy_from_slice(payload);
            assert!(txn.finalize(true));
            entry
        };

        assert_eq!(entry.segment, 0);
        assert_eq!(entry.offset, 0);
        assert_eq!(entry.length, payload.len() as u64);

        let view = bulk.read_view(&entry).expect("read");
        assert_eq!(&*view, payload);
        assert_eq!(cursor(&kv), payload.len() as u64);
    }

    #[test]
    fn cursor_is_monotonic_across_commits() {
        let tmp = TempDir::new().expect("tempdir");
        let (kv, bulk) = open_bulk(&tmp);

        let mut last = cursor(&kv);
        for size in [10u64, 100, 1, 50] {
            let txn = kv.txn_rw();
            let (_, mut view) = bulk
                .write(&txn, &IndexEntry::default(), size)
                .expect("reserve");
            view.fill(0xab);
            assert!(txn.finalize(true));

            let now = cursor(&kv);
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn aborted_write_leaves_cursor_untouched() {
        let tmp = TempDir::new().expect("tempdir");
        let (kv, bulk) = open_bulk(&tmp);

        let before = cursor(&kv);
        {
            let txn = kv.txn_rw();
            let (_, mut view) = bulk
                .write(&txn, &IndexEntry::default(), 64)
                .expect("reserve");
            view.fill(0xff);
            assert!(txn.finalize(false));
        }
        assert_eq!(cursor(&kv), before);
    }

    #[test]
    fn reservations_never_straddle_segments() {
        let tmp = TempDir::new().expect("tempdir");
        let (kv, bulk) = open_bulk(&tmp);

        // Fill most of the first segment.
        let txn = kv.txn_rw();
        let (first, mut view) = bulk
            .write(&txn, &IndexEntry::default(), SEG - 100)
            .expect("reserve");
        view.fill(1);
        assert!(txn.finalize(true));
        assert_eq!(first.segment, 0);

        // The next reservation cannot fit and must move to segment 1.
        let txn = kv.txn_rw();
        let (second, mut view) = bulk
            .write(&txn, &IndexEntry::default(), 200)
            .expect("reserve");
        view.fill(2);
        assert!(txn.finalize(true));

        assert_eq!(second.segment, 1);
        assert_eq!(second.offset, 0);
        assert_eq!(cursor(&kv), SEG + 200);

        let view = bulk.read_view(&second).expect("read");
        assert!(view.iter().all(|b| *b == 2));
    }

    #[test]
    fn same_size_write_replaces_in_place() {
        let tmp = TempDir::new().expect("tempdir");
        let (kv, bulk) = open_bulk(&tmp);

        let txn = kv.txn_rw();
        let (entry, mut view) = bulk
            .write(&txn, &IndexEntry::default(), 32)
            .expect("reserve");
        view.fill(1);
        assert!(txn.finalize(true));
        let before = cursor(&kv);

        let txn = kv.txn_rw();
        let (replaced, mut view) = bulk.write(&txn, &entry, 32).expect("replace");
        view.fill(2);
        assert!(txn.finalize(true));

        assert_eq!(replaced, entry);
        assert_eq!(cursor(&kv), before);
        let view = bulk.read_view(&entry).expect("read");
        assert!(view.iter().all(|b| *b == 2));
    }

    #[test]
    fn cursor_survives_reopen() {
        let tmp = TempDir::new().expect("tempdir");
        let entry;
        let kv;
        {
            let (kv_inner, bulk) = open_bulk(&tmp);
            kv = kv_inner;
            let txn = kv.txn_rw();
            let (e, mut view) = bulk
                .write(&txn, &IndexEntry::default(), 8)
                .expect("reserve");
            view.copy_from_slice(b"persist!");
            assert!(txn.finalize(true));
            entry = e;
        }

        let dir = tmp.path().join("bulk");
        let bulk =
            Bulk::with_segment_size(kv.clone(), &dir, "blk", ConfigKey::NextBlockAddress, SEG)
                .expect("reopen bulk");
        let view = bulk.read_view(&entry).expect("read");
        assert_eq!(&*view, b"persist!");
    }

    #[test]
    fn zero_size_reservation_is_rejected() {
        let tmp = TempDir::new().expect("tempdir");
        let (kv, bulk) = open_bulk(&tmp);

        let txn = kv.txn_rw();
        let result = bulk.write(&txn, &IndexEntry::default(), 0);
        assert!(matches!(result, Err(BulkError::InvalidInput(_))));
        txn.finalize(false);
    }
}
