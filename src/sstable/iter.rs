use std::sync::Arc;

use bytes::Bytes;

use super::{SsTable, SstError};
use crate::record::Record;

/// Lazy cursor over a segment's records, bounded above by an exclusive key.
///
/// Holds its segment alive, so an iterator stays valid after the engine has
/// swapped the segment list.
pub struct SstRangeIter {
    table: Arc<SsTable>,
    pos: usize,
    end: Option<Bytes>,
}

impl SstRangeIter {
    /// Binary-searches the index for `from` and scans up to `to` (exclusive).
    pub fn range(
        table: Arc<SsTable>,
        from: Option<&Bytes>,
        to: Option<&Bytes>,
    ) -> Result<Self, SstError> {
        let pos = match from {
            Some(key) => table.lower_bound(key)?,
            None => 0,
        };
        Ok(Self {
            table,
            pos,
            end: to.cloned(),
        })
    }

    /// Full scan.
    pub fn scan(table: Arc<SsTable>) -> Self {
        Self {
            table,
            pos: 0,
            end: None,
        }
    }
}

impl Iterator for SstRangeIter {
    type Item = Result<Record, SstError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.table.len() {
            return None;
        }
        let record = match self.table.record_at(self.pos) {
            Ok(record) => record,
            Err(err) => {
                self.pos = self.table.len();
                return Some(Err(err));
            }
        };
        if let Some(end) = &self.end {
            if record.key() >= end {
                self.pos = self.table.len();
                return None;
            }
        }
        self.pos += 1;
        Some(Ok(record))
    }
}
