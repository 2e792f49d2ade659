//! SSTable: sorted, immutable on-disk segment of records.
//!
//! File layout:
//! ```text
//! [records...]      u32 key_len | key | u64 timestamp_ms | i32 value_len | value?
//! [index]           u64 file offset per record, ascending key order
//! [footer]          u64 index_offset | u64 record_count | magic
//! ```
//!
//! All integers are little-endian. `value_len = -1` marks a tombstone with no
//! value bytes; zero is a legal empty value.
//!
//! Creation is crash-safe: records are written to a `tmp_<n>` file, synced,
//! then atomically renamed to `sst_<n>` followed by a parent-directory fsync.
//! Readers discover segments by directory scan ordered by numeric suffix and
//! delete any leftover temporaries.

mod iter;

pub use iter::SstRangeIter;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use memmap2::Mmap;

use crate::record::Record;

#[derive(Debug, thiserror::Error)]
pub enum SstError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sstable corrupt: {0}")]
    Corrupt(&'static str),
}

const MAGIC: &[u8; 8] = b"QRTZSST1";
const FOOTER_SIZE: usize = 8 + 8 + MAGIC.len();

pub const SST_PREFIX: &str = "sst_";
pub const TMP_PREFIX: &str = "tmp_";

pub fn sst_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{SST_PREFIX}{seq}"))
}

pub fn file_seq_from_path(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix(SST_PREFIX)?.parse().ok()
}

/// Streams sorted records into a new segment file.
pub struct SstWriter {
    file: std::fs::File,
    path_tmp: PathBuf,
    path_final: PathBuf,
    offsets: Vec<u64>,
    written: u64,
    last_key: Option<Bytes>,
    buf: Vec<u8>,
}

impl SstWriter {
    pub fn create(dir: &Path, seq: u64) -> Result<Self, SstError> {
        std::fs::create_dir_all(dir)?;
        let path_tmp = dir.join(format!("{TMP_PREFIX}{seq}"));
        let path_final = sst_path(dir, seq);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path_tmp)?;
        Ok(Self {
            file,
            path_tmp,
            path_final,
            offsets: Vec::new(),
            written: 0,
            last_key: None,
            buf: Vec::with_capacity(256),
        })
    }

    pub fn add(&mut self, record: &Record) -> Result<(), SstError> {
        if let Some(last) = &self.last_key {
            if record.key() <= last {
                return Err(SstError::Corrupt("records must be added in ascending key order"));
            }
        }
        self.last_key = Some(record.key().clone());

        self.buf.clear();
        let key_len: u32 = record
            .key()
            .len()
            .try_into()
            .map_err(|_| SstError::Corrupt("key too large"))?;
        self.buf.extend_from_slice(&key_len.to_le_bytes());
        self.buf.extend_from_slice(record.key());
        self.buf
            .extend_from_slice(&record.timestamp_ms().to_le_bytes());
        match record.value() {
            Some(value) => {
                let value_len: i32 = value
                    .len()
                    .try_into()
                    .map_err(|_| SstError::Corrupt("value too large"))?;
                self.buf.extend_from_slice(&value_len.to_le_bytes());
                self.buf.extend_from_slice(value);
            }
            None => {
                self.buf.extend_from_slice(&(-1i32).to_le_bytes());
            }
        }

        self.offsets.push(self.written);
        self.file.write_all(&self.buf)?;
        self.written += self.buf.len() as u64;
        Ok(())
    }

    pub fn record_count(&self) -> usize {
        self.offsets.len()
    }

    /// Writes index and footer, syncs, and atomically publishes the segment.
    pub fn finish(mut self) -> Result<PathBuf, SstError> {
        let index_offset = self.written;
        let mut tail = Vec::with_capacity(self.offsets.len() * 8 + FOOTER_SIZE);
        for offset in &self.offsets {
            tail.extend_from_slice(&offset.to_le_bytes());
        }
        tail.extend_from_slice(&index_offset.to_le_bytes());
        tail.extend_from_slice(&(self.offsets.len() as u64).to_le_bytes());
        tail.extend_from_slice(MAGIC);
        self.file.write_all(&tail)?;
        self.file.sync_data()?;
        drop(self.file);

        std::fs::rename(&self.path_tmp, &self.path_final)?;
        fsync_parent_dir(&self.path_final)?;
        Ok(self.path_final)
    }
}

/// A finalized, memory-mapped segment.
pub struct SsTable {
    path: PathBuf,
    seq: u64,
    mmap: Mmap,
    offsets: Vec<u64>,
    index_offset: u64,
}

impl SsTable {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SstError> {
        let path = path.as_ref().to_path_buf();
        let seq = file_seq_from_path(&path).ok_or(SstError::Corrupt("bad segment file name"))?;
        let file = std::fs::File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < FOOTER_SIZE {
            return Err(SstError::Corrupt("file too small"));
        }

        let footer_start = mmap.len() - FOOTER_SIZE;
        if &mmap[(mmap.len() - MAGIC.len())..] != MAGIC {
            return Err(SstError::Corrupt("bad magic"));
        }
        let index_offset = u64::from_le_bytes(
            mmap[footer_start..(footer_start + 8)]
                .try_into()
                .expect("footer slice"),
        );
        let record_count = u64::from_le_bytes(
            mmap[(footer_start + 8)..(footer_start + 16)]
                .try_into()
                .expect("footer slice"),
        ) as usize;

        let index_start = index_offset as usize;
        let index_end = index_start + record_count * 8;
        if index_end != footer_start {
            return Err(SstError::Corrupt("index does not line up with footer"));
        }

        let mut offsets = Vec::with_capacity(record_count);
        let mut last = None;
        for i in 0..record_count {
            let at = index_start + i * 8;
            let offset =
                u64::from_le_bytes(mmap[at..(at + 8)].try_into().expect("index slice"));
            if offset >= index_offset || last.map(|prev| offset <= prev).unwrap_or(false) {
                return Err(SstError::Corrupt("index offsets out of order"));
            }
            last = Some(offset);
            offsets.push(offset);
        }

        Ok(Self {
            path,
            seq,
            mmap,
            offsets,
            index_offset,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn file_bytes(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub(crate) fn record_at(&self, index: usize) -> Result<Record, SstError> {
        let start = self.offsets[index] as usize;
        let end = self.index_offset as usize;
        let region = &self.mmap[..end];

        if start + 4 > region.len() {
            return Err(SstError::Corrupt("truncated key length"));
        }
        let key_len =
            u32::from_le_bytes(region[start..(start + 4)].try_into().expect("slice")) as usize;
        let key_start = start + 4;
        let ts_start = key_start + key_len;
        if ts_start + 8 + 4 > region.len() {
            return Err(SstError::Corrupt("truncated record header"));
        }
        let key = Bytes::copy_from_slice(&region[key_start..ts_start]);
        let timestamp_ms =
            u64::from_le_bytes(region[ts_start..(ts_start + 8)].try_into().expect("slice"));
        let len_start = ts_start + 8;
        let value_len = i32::from_le_bytes(
            region[len_start..(len_start + 4)]
                .try_into()
                .expect("slice"),
        );

        match value_len {
            -1 => Ok(Record::tombstone(key, timestamp_ms)),
            n if n >= 0 => {
                let value_start = len_start + 4;
                let value_end = value_start + n as usize;
                if value_end > region.len() {
                    return Err(SstError::Corrupt("truncated value bytes"));
                }
                let value = Bytes::copy_from_slice(&region[value_start..value_end]);
                Ok(Record::put(key, value, timestamp_ms))
            }
            _ => Err(SstError::Corrupt("negative value length")),
        }
    }

    fn key_at(&self, index: usize) -> Result<&[u8], SstError> {
        let start = self.offsets[index] as usize;
        let end = self.index_offset as usize;
        let region = &self.mmap[..end];
        if start + 4 > region.len() {
            return Err(SstError::Corrupt("truncated key length"));
        }
        let key_len =
            u32::from_le_bytes(region[start..(start + 4)].try_into().expect("slice")) as usize;
        let key_start = start + 4;
        if key_start + key_len > region.len() {
            return Err(SstError::Corrupt("truncated key bytes"));
        }
        Ok(&region[key_start..(key_start + key_len)])
    }

    /// Index of the first record with key >= `key`.
    pub(crate) fn lower_bound(&self, key: &[u8]) -> Result<usize, SstError> {
        let mut lo = 0usize;
        let mut hi = self.offsets.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key_at(mid)? < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Newest record for `key` in this segment, tombstones included.
    pub fn get(&self, key: &[u8]) -> Result<Option<Record>, SstError> {
        let pos = self.lower_bound(key)?;
        if pos >= self.len() || self.key_at(pos)? != key {
            return Ok(None);
        }
        self.record_at(pos).map(Some)
    }
}

/// Scans a data directory: deletes temporaries, opens finalized segments
/// ordered oldest first, and returns them with the next free sequence number.
pub fn discover(dir: &Path) -> Result<(Vec<Arc<SsTable>>, u64), SstError> {
    let mut numbered: Vec<(u64, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if name.starts_with(TMP_PREFIX) {
            tracing::warn!(path = %path.display(), "removing leftover temporary segment");
            std::fs::remove_file(&path)?;
            continue;
        }
        if let Some(seq) = file_seq_from_path(&path) {
            numbered.push((seq, path));
        }
    }

    numbered.sort_by_key(|(seq, _)| *seq);
    let next_seq = numbered.last().map(|(seq, _)| seq + 1).unwrap_or(0);
    let mut tables = Vec::with_capacity(numbered.len());
    for (_, path) in numbered {
        tables.push(Arc::new(SsTable::open(&path)?));
    }
    Ok((tables, next_seq))
}

fn fsync_parent_dir(path: &Path) -> Result<(), SstError> {
    let parent = path
        .parent()
        .ok_or(SstError::Corrupt("segment has no parent directory"))?;
    let dir = std::fs::File::open(parent)?;
    dir.sync_all()?;
    Ok(())
}
