//! Maintenance tools for a quartzdb data directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use quartzdb::config::EngineOptions;
use quartzdb::engine::Dao;
use quartzdb::record::Record;
use quartzdb::sstable::{SsTable, SstRangeIter};

#[derive(Debug, Parser)]
#[command(name = "quartzdb")]
#[command(about = "quartzdb maintenance tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print every record in one segment file.
    SstDump {
        #[arg(long)]
        sst: PathBuf,
    },
    /// Open a data directory and report per-segment and total statistics.
    DbCheck {
        #[arg(long)]
        db: PathBuf,
    },
    /// Scan live records in `[start, end)`.
    Scan {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
    },
    Get {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        key: String,
    },
    Put {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        key: String,
        #[arg(long)]
        value: String,
    },
    Delete {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        key: String,
    },
    /// Merge all segments plus the memtable into a single segment.
    Compact {
        #[arg(long)]
        db: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Command::SstDump { sst } => sst_dump(&sst),
        Command::DbCheck { db } => db_check(&db),
        Command::Scan { db, start, end } => scan_cmd(&db, start.as_deref(), end.as_deref()),
        Command::Get { db, key } => get_cmd(&db, &key),
        Command::Put { db, key, value } => put_cmd(&db, &key, &value),
        Command::Delete { db, key } => delete_cmd(&db, &key),
        Command::Compact { db } => compact_cmd(&db),
    }
}

fn sst_dump(path: &Path) -> anyhow::Result<()> {
    let table = Arc::new(SsTable::open(path).context("open segment")?);
    println!(
        "segment seq={} records={} bytes={}",
        table.seq(),
        table.len(),
        table.file_bytes()
    );
    for (idx, record) in SstRangeIter::scan(table.clone()).enumerate() {
        let record = record.context("decode record")?;
        match record.value() {
            Some(value) => println!(
                "#{idx}: key={:?} ts={} value_len={}",
                record.key(),
                record.timestamp_ms(),
                value.len()
            ),
            None => println!(
                "#{idx}: key={:?} ts={} tombstone",
                record.key(),
                record.timestamp_ms()
            ),
        }
    }
    Ok(())
}

fn db_check(db: &Path) -> anyhow::Result<()> {
    let (tables, next_seq) = quartzdb::sstable::discover(db).context("discover segments")?;
    let mut total_records = 0usize;
    let mut total_bytes = 0u64;
    for table in &tables {
        let scanned: Result<Vec<_>, _> = SstRangeIter::scan(table.clone()).collect();
        let scanned = scanned.with_context(|| format!("scan segment {}", table.seq()))?;
        println!(
            "segment seq={} records={} bytes={}",
            table.seq(),
            scanned.len(),
            table.file_bytes()
        );
        total_records += scanned.len();
        total_bytes += table.file_bytes();
    }
    println!(
        "ok: segments={} records={} bytes={} next_seq={}",
        tables.len(),
        total_records,
        total_bytes,
        next_seq
    );
    Ok(())
}

fn scan_cmd(db: &Path, start: Option<&str>, end: Option<&str>) -> anyhow::Result<()> {
    let dao = open_dao(db)?;
    let from = start.map(|s| Bytes::copy_from_slice(s.as_bytes()));
    let to = end.map(|s| Bytes::copy_from_slice(s.as_bytes()));
    let mut count = 0usize;
    for record in dao.range(from.as_ref(), to.as_ref())? {
        let record = record?;
        println!(
            "key={:?} ts={} value_len={}",
            record.key(),
            record.timestamp_ms(),
            record.value().map(|v| v.len()).unwrap_or(0)
        );
        count += 1;
    }
    println!("{count} live records");
    Ok(())
}

fn get_cmd(db: &Path, key: &str) -> anyhow::Result<()> {
    let dao = open_dao(db)?;
    match dao.newest(key.as_bytes())? {
        Some(record) if !record.is_tombstone() => {
            println!(
                "ts={} value={}",
                record.timestamp_ms(),
                String::from_utf8_lossy(record.value().expect("non-tombstone value"))
            );
        }
        Some(record) => println!("tombstone ts={}", record.timestamp_ms()),
        None => println!("absent"),
    }
    Ok(())
}

fn put_cmd(db: &Path, key: &str, value: &str) -> anyhow::Result<()> {
    let dao = open_dao(db)?;
    let ts = quartzdb::clock::WallClock::new().now_ms();
    dao.upsert(Record::put(
        Bytes::copy_from_slice(key.as_bytes()),
        Bytes::copy_from_slice(value.as_bytes()),
        ts,
    ))?;
    dao.close()?;
    println!("ok ts={ts}");
    Ok(())
}

fn delete_cmd(db: &Path, key: &str) -> anyhow::Result<()> {
    let dao = open_dao(db)?;
    let ts = quartzdb::clock::WallClock::new().now_ms();
    dao.upsert(Record::tombstone(Bytes::copy_from_slice(key.as_bytes()), ts))?;
    dao.close()?;
    println!("ok ts={ts}");
    Ok(())
}

fn compact_cmd(db: &Path) -> anyhow::Result<()> {
    let dao = open_dao(db)?;
    dao.compact()?;
    println!(
        "compacted: segments={} bytes={}",
        dao.sstable_count(),
        dao.sstable_bytes()
    );
    Ok(())
}

fn open_dao(db: &Path) -> anyhow::Result<Dao> {
    Dao::open(db, EngineOptions::default()).context("open data directory")
}
