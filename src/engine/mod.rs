//! LSM storage engine.
//!
//! One `Dao` exclusively owns a data directory. Writes land in the mutable
//! memtable; when it reaches the configured size it is rotated out and
//! flushed to a new segment. Reads merge the memtables with a copy-on-write
//! snapshot of the segment list, so in-flight iterators keep their view while
//! flushes and compactions publish new lists atomically.
//!
//! Lock discipline: the write gate serializes upserts and is held only for
//! the map mutation and the rotate decision; the maintenance gate serializes
//! flush and compaction publishing. Neither is held across a range scan and
//! the write gate is never held across disk I/O.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::config::EngineOptions;
use crate::memtable::{MemTable, MemTableManager};
use crate::merge::{MergeIter, RecordSource};
use crate::record::Record;
use crate::sstable::{self, SsTable, SstRangeIter, SstWriter};

pub struct Dao {
    dir: PathBuf,
    options: EngineOptions,
    memtables: MemTableManager,
    /// Segments in ascending sequence order; oldest first.
    tables: RwLock<Arc<Vec<Arc<SsTable>>>>,
    next_seq: AtomicU64,
    write_gate: Mutex<()>,
    maintenance_gate: Mutex<()>,
    closed: AtomicBool,
}

impl Dao {
    pub fn open(dir: impl AsRef<Path>, options: EngineOptions) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create data dir {}", dir.display()))?;
        let (tables, next_seq) = sstable::discover(&dir)
            .with_context(|| format!("discover segments in {}", dir.display()))?;
        tracing::info!(
            dir = %dir.display(),
            segments = tables.len(),
            "opened storage engine"
        );
        Ok(Self {
            dir,
            options,
            memtables: MemTableManager::new(),
            tables: RwLock::new(Arc::new(tables)),
            next_seq: AtomicU64::new(next_seq),
            write_gate: Mutex::new(()),
            maintenance_gate: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Inserts or overwrites a record, flushing the memtable first if the
    /// insert pushed it past the configured limit.
    pub fn upsert(&self, record: Record) -> anyhow::Result<()> {
        self.ensure_open()?;
        let rotated = {
            let _gate = self.write_gate.lock();
            // Re-check under the gate: a concurrent close rotates while
            // holding it, and writes after that rotation would never flush.
            self.ensure_open()?;
            let mutable = self.memtables.mutable();
            mutable.upsert(record);
            if mutable.approximate_bytes() >= self.options.memtable_bytes {
                Some(self.memtables.rotate())
            } else {
                None
            }
        };
        if let Some(table) = rotated {
            self.flush_table(table)
                .context("flush rotated memtable")?;
        }
        Ok(())
    }

    /// Newest record for `key` across all layers, tombstones included.
    ///
    /// Replica-side reads need tombstone visibility so the coordinator can
    /// merge deletions by timestamp.
    pub fn newest(&self, key: &[u8]) -> anyhow::Result<Option<Record>> {
        self.ensure_open()?;
        let mut best: Option<Record> = None;
        let mut consider = |candidate: Record| {
            let replace = match &best {
                Some(current) => candidate.wins_over(current),
                None => true,
            };
            if replace {
                best = Some(candidate);
            }
        };

        for mem in self.memtables.snapshot() {
            if let Some(record) = mem.get(key) {
                consider(record);
            }
        }
        let tables = self.tables.read().clone();
        for table in tables.iter().rev() {
            if let Some(record) = table.get(key).context("segment point read")? {
                consider(record);
            }
        }
        Ok(best)
    }

    /// Lazy iterator over live records with keys in `[from, to)`; `None`
    /// bounds are unbounded. Observes a consistent snapshot of the segment
    /// list plus the memtables at the moment of the call.
    pub fn range(
        &self,
        from: Option<&Bytes>,
        to: Option<&Bytes>,
    ) -> anyhow::Result<MergeIter> {
        self.ensure_open()?;
        let mut sources = Vec::new();
        for mem in self.memtables.snapshot() {
            sources.push(RecordSource::Mem(mem.collect_range(from, to).into_iter()));
        }
        let tables = self.tables.read().clone();
        for table in tables.iter().rev() {
            sources.push(RecordSource::Sst(
                SstRangeIter::range(table.clone(), from, to).context("segment range scan")?,
            ));
        }
        MergeIter::live(sources)
    }

    /// Merges every segment plus the memtables into one new segment, then
    /// deletes the superseded files. Tombstones shadow nothing after a full
    /// merge and are dropped. The engine stays usable afterward; concurrent
    /// upserts go to a fresh memtable and are preserved.
    pub fn compact(&self) -> anyhow::Result<()> {
        self.ensure_open()?;
        let _gate = self.maintenance_gate.lock();

        {
            let _write = self.write_gate.lock();
            self.memtables.rotate();
        }
        let mems: Vec<Arc<MemTable>> = self
            .memtables
            .snapshot()
            .into_iter()
            .skip(1)
            .collect();
        let old_tables = self.tables.read().clone();

        let mut sources = Vec::new();
        for mem in &mems {
            sources.push(RecordSource::Mem(mem.collect_all().into_iter()));
        }
        for table in old_tables.iter().rev() {
            sources.push(RecordSource::Sst(SstRangeIter::scan(table.clone())));
        }
        let merged = MergeIter::live(sources).context("build compaction merge")?;

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut writer =
            SstWriter::create(&self.dir, seq).context("create compaction segment")?;
        for record in merged {
            writer
                .add(&record.context("merge during compaction")?)
                .context("write compaction segment")?;
        }
        let records = writer.record_count();
        let path = writer.finish().context("finalize compaction segment")?;
        let table = Arc::new(SsTable::open(&path).context("open compaction segment")?);

        *self.tables.write() = Arc::new(vec![table]);
        for mem in &mems {
            self.memtables.drop_immutable(mem);
        }
        for old in old_tables.iter() {
            if let Err(err) = std::fs::remove_file(old.path()) {
                tracing::warn!(
                    path = %old.path().display(),
                    error = %err,
                    "failed to delete superseded segment"
                );
            }
        }
        tracing::info!(
            seq,
            records,
            replaced = old_tables.len(),
            "compaction finished"
        );
        Ok(())
    }

    /// Flushes any buffered writes as a final segment and marks the engine
    /// closed. Idempotent; `Drop` calls it as a safety net.
    pub fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let _write = self.write_gate.lock();
            if !self.memtables.mutable().is_empty() {
                self.memtables.rotate();
            }
        }
        // Oldest rotation first so segment order matches write order.
        let pending: Vec<Arc<MemTable>> = self
            .memtables
            .snapshot()
            .into_iter()
            .skip(1)
            .rev()
            .collect();
        for table in pending {
            self.flush_table(table).context("flush on close")?;
        }
        tracing::info!(dir = %self.dir.display(), "closed storage engine");
        Ok(())
    }

    pub fn sstable_count(&self) -> usize {
        self.tables.read().len()
    }

    pub fn sstable_bytes(&self) -> u64 {
        self.tables.read().iter().map(|t| t.file_bytes()).sum()
    }

    pub fn memtable_bytes(&self) -> u64 {
        self.memtables.mutable_approximate_bytes()
    }

    fn flush_table(&self, table: Arc<MemTable>) -> anyhow::Result<()> {
        let _gate = self.maintenance_gate.lock();
        if !self.memtables.contains(&table) {
            // A concurrent compaction already persisted this table.
            return Ok(());
        }
        if table.is_empty() {
            self.memtables.drop_immutable(&table);
            return Ok(());
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut writer = SstWriter::create(&self.dir, seq).context("create segment")?;
        for record in table.collect_all() {
            writer.add(&record).context("write segment record")?;
        }
        let records = writer.record_count();
        let path = writer.finish().context("finalize segment")?;
        let sst = Arc::new(SsTable::open(&path).context("open flushed segment")?);

        {
            let mut tables = self.tables.write();
            let mut next = tables.as_ref().clone();
            next.push(sst);
            *tables = Arc::new(next);
        }
        self.memtables.drop_immutable(&table);
        tracing::debug!(seq, records, "flushed memtable to segment");
        Ok(())
    }

    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("storage engine is closed");
        }
        Ok(())
    }
}

impl Drop for Dao {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "flush on drop failed");
        }
    }
}
