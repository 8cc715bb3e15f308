//! Append-only in-memory log queue.
//!
//! Entries carry gap-free, 1-based indices. The queue keeps everything in
//! `(offset_index, last_index]`; truncation only moves `offset_index` forward.
//! `last_index` keeps counting after truncation so numbering never restarts
//! except through `reset`/`reset_to`.

use std::collections::VecDeque;

/// Item stored in a `LogQueue`.
pub trait Indexed {
    fn index(&self) -> u64;
    fn set_index(&mut self, index: u64);
    /// Approximate encoded size used for byte-capped slicing.
    fn size(&self) -> usize;
}

#[derive(Debug)]
pub struct LogQueue<T> {
    entries: VecDeque<T>,
    offset_index: u64,
    last_index: u64,
}

impl<T> Default for LogQueue<T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            offset_index: 0,
            last_index: 0,
        }
    }
}

impl<T: Indexed + Clone> LogQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next index to `entry`, store it, and return the index.
    pub fn append(&mut self, mut entry: T) -> u64 {
        self.last_index += 1;
        entry.set_index(self.last_index);
        self.entries.push_back(entry);
        self.last_index
    }

    /// Entries with `index ∈ [start, end)` in order. When `max_bytes > 0`
    /// the result stops before the entry that would exceed the budget, but
    /// always contains at least one entry if any are in range.
    ///
    /// A `start` past `last_index + 1` (or below the truncation offset) is
    /// clamped rather than rejected.
    pub fn slice_with_size(&self, start: u64, end: u64, max_bytes: u64) -> Vec<T> {
        let start = start.max(self.offset_index + 1);
        let end = end.min(self.last_index + 1);
        if start >= end {
            return Vec::new();
        }

        let from = (start - self.offset_index - 1) as usize;
        let to = (end - self.offset_index - 1) as usize;
        let mut out = Vec::with_capacity(to - from);
        let mut bytes = 0u64;
        for entry in self.entries.range(from..to) {
            let size = entry.size() as u64;
            if max_bytes > 0 && !out.is_empty() && bytes + size > max_bytes {
                break;
            }
            bytes += size;
            out.push(entry.clone());
        }
        out
    }

    /// Discard entries with `index < index`. Idempotent; never moves the
    /// offset backwards or past `last_index`.
    pub fn truncate_to(&mut self, index: u64) {
        let new_offset = index.saturating_sub(1).min(self.last_index);
        if new_offset <= self.offset_index {
            return;
        }
        let drop = (new_offset - self.offset_index) as usize;
        self.entries.drain(..drop.min(self.entries.len()));
        self.offset_index = new_offset;
    }

    pub fn reset(&mut self) {
        self.reset_to(0);
    }

    /// Drop everything and continue numbering after `index`.
    pub fn reset_to(&mut self, index: u64) {
        self.entries.clear();
        self.offset_index = index;
        self.last_index = index;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    pub fn offset_index(&self) -> u64 {
        self.offset_index
    }

    /// Anything left in `(offset_index, last_index]`.
    pub fn has_ready(&self) -> bool {
        self.offset_index < self.last_index
    }
}
