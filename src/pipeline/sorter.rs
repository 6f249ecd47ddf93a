//! Bounded sorter stage.
//!
//! Keeps the best `cap` rows in a binary heap whose top is the worst row kept
//! so far, so a new row only has to beat the top to get in. Once upstream is
//! exhausted the heap is drained into output order.

use super::lookup::KeyId;
use super::processor::{ExecCtx, ProcessorKind, Pull, ResultProcessor, Upstream};
use super::row::Row;
use super::value::Value;
use crate::error::Result;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

/// Maximum number of sort keys (one bit each in the ascending map)
pub const MAX_SORT_KEYS: usize = 64;

/// What rows are ordered by
#[derive(Debug, Clone, PartialEq)]
pub enum SortBy {
    /// Score, highest first
    Score,
    /// Field values; bit `i` of `asc_map` set means key `i` sorts ascending
    Keys { keys: Vec<KeyId>, asc_map: u64 },
}

struct HeapEntry {
    sort_values: Vec<Option<Value>>,
    asc_map: u64,
    score: f64,
    /// Arrival order, breaks ties in favor of the earlier row
    seq: u64,
    row: Row,
}

impl HeapEntry {
    /// `Less` means `self` is output before `other`
    fn rank(&self, other: &Self) -> Ordering {
        for (i, (a, b)) in self.sort_values.iter().zip(other.sort_values.iter()).enumerate() {
            let asc = self.asc_map & (1u64 << i) != 0;
            let ord = match (a, b) {
                (None, None) => Ordering::Equal,
                // Missing values always go last
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(x), Some(y)) => {
                    let ord = x.compare(y);
                    if asc {
                        ord
                    } else {
                        ord.reverse()
                    }
                }
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        if self.sort_values.is_empty() {
            let ord = other
                .score
                .partial_cmp(&self.score)
                .unwrap_or(Ordering::Equal);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.seq.cmp(&other.seq)
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Max-heap on rank: the top is the row that would be output last
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank(other)
    }
}

/// Top-`cap` sorter
pub struct Sorter {
    by: SortBy,
    cap: usize,
    heap: BinaryHeap<HeapEntry>,
    seq: u64,
    output: Option<VecDeque<Row>>,
}

impl Sorter {
    /// `cap == 0` keeps every row
    pub fn new(by: SortBy, cap: usize) -> Self {
        Self {
            by,
            cap,
            heap: BinaryHeap::with_capacity(cap.min(1024) + 1),
            seq: 0,
            output: None,
        }
    }

    pub fn by_score(cap: usize) -> Self {
        Self::new(SortBy::Score, cap)
    }

    fn entry(&mut self, row: Row) -> HeapEntry {
        let (sort_values, asc_map) = match &self.by {
            SortBy::Score => (Vec::new(), 0),
            SortBy::Keys { keys, asc_map } => (
                keys.iter().map(|k| row.get(*k).cloned()).collect(),
                *asc_map,
            ),
        };
        self.seq += 1;
        HeapEntry {
            sort_values,
            asc_map,
            score: row.score,
            seq: self.seq,
            row,
        }
    }

    fn try_insert(&mut self, row: Row) {
        let entry = self.entry(row);
        if self.cap == 0 || self.heap.len() < self.cap {
            self.heap.push(entry);
            return;
        }
        let beats_worst = self
            .heap
            .peek()
            .is_some_and(|worst| entry.rank(worst) == Ordering::Less);
        if beats_worst {
            self.heap.pop();
            self.heap.push(entry);
        }
    }

    fn finish(&mut self) {
        let heap = std::mem::take(&mut self.heap);
        let sorted = heap.into_sorted_vec();
        self.output = Some(sorted.into_iter().map(|e| e.row).collect());
    }
}

impl ResultProcessor for Sorter {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Sorter
    }

    fn next(&mut self, up: &mut Upstream<'_>, ctx: &mut ExecCtx<'_>) -> Result<Pull> {
        if self.output.is_none() {
            loop {
                match up.pull(ctx)? {
                    Pull::Row(row) => self.try_insert(row),
                    // Partial input: emit what was collected
                    Pull::Eof | Pull::TimedOut => break,
                }
            }
            self.finish();
        }
        let next = self.output.as_mut().and_then(|rows| rows.pop_front());
        Ok(next.map(Pull::Row).unwrap_or(Pull::Eof))
    }
}
