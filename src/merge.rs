//! K-way merge across record sources.
//!
//! Sources are ordered newest first (memtables, then segments newest to
//! oldest), each yielding records in ascending key order. For every key the
//! last-write-wins winner is emitted once and all losing sources advance
//! past the key. Source order breaks full ties, so identical timestamps in
//! different layers resolve to the newest layer.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use bytes::Bytes;

use crate::record::Record;
use crate::sstable::SstRangeIter;

/// One sorted input to the merge.
pub enum RecordSource {
    Mem(std::vec::IntoIter<Record>),
    Sst(SstRangeIter),
}

impl RecordSource {
    fn next(&mut self) -> Option<anyhow::Result<Record>> {
        match self {
            Self::Mem(iter) => iter.next().map(Ok),
            Self::Sst(iter) => iter.next().map(|res| res.map_err(Into::into)),
        }
    }
}

struct SourceState {
    source: RecordSource,
    peeked: Option<Record>,
}

/// Merged, deduplicated iterator over all sources.
pub struct MergeIter {
    sources: Vec<SourceState>,
    // Min-heap on (current key, source rank); rank 0 is the newest source.
    heap: BinaryHeap<Reverse<(Bytes, usize)>>,
    suppress_tombstones: bool,
    done: bool,
}

impl MergeIter {
    /// Live view: tombstones are filtered from the output.
    pub fn live(sources: Vec<RecordSource>) -> anyhow::Result<Self> {
        Self::build(sources, true)
    }

    /// Raw view: per-key winners including tombstones, for compaction.
    pub fn raw(sources: Vec<RecordSource>) -> anyhow::Result<Self> {
        Self::build(sources, false)
    }

    fn build(sources: Vec<RecordSource>, suppress_tombstones: bool) -> anyhow::Result<Self> {
        let mut merged = Self {
            sources: sources
                .into_iter()
                .map(|source| SourceState {
                    source,
                    peeked: None,
                })
                .collect(),
            heap: BinaryHeap::new(),
            suppress_tombstones,
            done: false,
        };
        for rank in 0..merged.sources.len() {
            merged.advance(rank)?;
        }
        Ok(merged)
    }

    fn advance(&mut self, rank: usize) -> anyhow::Result<()> {
        let state = &mut self.sources[rank];
        match state.source.next().transpose()? {
            Some(record) => {
                self.heap.push(Reverse((record.key().clone(), rank)));
                state.peeked = Some(record);
            }
            None => state.peeked = None,
        }
        Ok(())
    }

    fn next_winner(&mut self) -> anyhow::Result<Option<Record>> {
        loop {
            let Reverse((key, first_rank)) = match self.heap.pop() {
                Some(entry) => entry,
                None => return Ok(None),
            };

            // Gather every source currently positioned at this key; the pop
            // order is rank-ascending, so the first entry is the newest layer.
            let mut ranks = vec![first_rank];
            while let Some(Reverse((next_key, _))) = self.heap.peek() {
                if *next_key != key {
                    break;
                }
                let Reverse((_, rank)) = self.heap.pop().expect("peeked heap entry");
                ranks.push(rank);
            }

            let mut winner_rank = ranks[0];
            for &rank in &ranks[1..] {
                let candidate = self.sources[rank]
                    .peeked
                    .as_ref()
                    .expect("heap entry implies peeked record");
                let current = self.sources[winner_rank]
                    .peeked
                    .as_ref()
                    .expect("heap entry implies peeked record");
                if candidate.wins_over(current) {
                    winner_rank = rank;
                }
            }

            let mut winner = None;
            for rank in ranks {
                let record = self.sources[rank]
                    .peeked
                    .take()
                    .expect("heap entry implies peeked record");
                if rank == winner_rank {
                    winner = Some(record);
                }
                self.advance(rank)?;
            }
            let winner = winner.expect("winner rank was gathered");

            if self.suppress_tombstones && winner.is_tombstone() {
                continue;
            }
            return Ok(Some(winner));
        }
    }
}

impl Iterator for MergeIter {
    type Item = anyhow::Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_winner() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &str, value: &str, ts: u64) -> Record {
        Record::put(
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
            ts,
        )
    }

    fn del(key: &str, ts: u64) -> Record {
        Record::tombstone(Bytes::copy_from_slice(key.as_bytes()), ts)
    }

    fn mem(records: Vec<Record>) -> RecordSource {
        RecordSource::Mem(records.into_iter())
    }

    fn collect_live(sources: Vec<RecordSource>) -> Vec<Record> {
        MergeIter::live(sources)
            .expect("build merge")
            .collect::<anyhow::Result<Vec<_>>>()
            .expect("merge")
    }

    #[test]
    fn merges_disjoint_sources_in_key_order() {
        let got = collect_live(vec![
            mem(vec![put("b", "2", 1), put("d", "4", 1)]),
            mem(vec![put("a", "1", 1), put("c", "3", 1)]),
        ]);
        let keys: Vec<_> = got.iter().map(|r| r.key().clone()).collect();
        assert_eq!(
            keys,
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c"),
                Bytes::from_static(b"d"),
            ]
        );
    }

    #[test]
    fn duplicate_keys_resolve_to_highest_timestamp() {
        let got = collect_live(vec![
            mem(vec![put("k", "newer", 7)]),
            mem(vec![put("k", "older", 3)]),
        ]);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].value(), Some(&Bytes::from_static(b"newer")));
    }

    #[test]
    fn stale_record_in_newer_layer_loses() {
        // Cross-coordinator skew: the newer layer holds the older timestamp.
        let got = collect_live(vec![
            mem(vec![put("k", "stale", 3)]),
            mem(vec![put("k", "fresh", 9)]),
        ]);
        assert_eq!(got[0].value(), Some(&Bytes::from_static(b"fresh")));
    }

    #[test]
    fn equal_timestamps_prefer_newest_source() {
        let got = collect_live(vec![
            mem(vec![put("k", "new-layer", 5)]),
            mem(vec![put("k", "old-layer", 5)]),
        ]);
        assert_eq!(got[0].value(), Some(&Bytes::from_static(b"new-layer")));
    }

    #[test]
    fn tombstones_suppress_older_values() {
        let got = collect_live(vec![
            mem(vec![del("k", 5)]),
            mem(vec![put("k", "old", 3), put("z", "kept", 1)]),
        ]);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].key(), &Bytes::from_static(b"z"));
    }

    #[test]
    fn tombstone_loses_to_newer_value() {
        let got = collect_live(vec![
            mem(vec![del("k", 5)]),
            mem(vec![put("k", "resurrected", 8)]),
        ]);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].value(), Some(&Bytes::from_static(b"resurrected")));
    }

    #[test]
    fn raw_view_keeps_winning_tombstones() {
        let got = MergeIter::raw(vec![
            mem(vec![del("k", 5)]),
            mem(vec![put("k", "old", 3)]),
        ])
        .expect("build merge")
        .collect::<anyhow::Result<Vec<_>>>()
        .expect("merge");
        assert_eq!(got.len(), 1);
        assert!(got[0].is_tombstone());
    }

    #[test]
    fn three_way_merge_emits_each_key_once() {
        let got = collect_live(vec![
            mem(vec![put("a", "2", 2), put("b", "2", 2)]),
            mem(vec![put("a", "1", 1), put("c", "1", 1)]),
            mem(vec![put("b", "0", 0), put("c", "0", 0), put("d", "0", 0)]),
        ]);
        let pairs: Vec<(Bytes, u64)> = got
            .iter()
            .map(|r| (r.key().clone(), r.timestamp_ms()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                (Bytes::from_static(b"a"), 2),
                (Bytes::from_static(b"b"), 2),
                (Bytes::from_static(b"c"), 1),
                (Bytes::from_static(b"d"), 0),
            ]
        );
    }
}
