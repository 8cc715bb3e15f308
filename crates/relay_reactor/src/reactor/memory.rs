//! In-memory `Storage` with fault injection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail};

use super::queue::Indexed;
use super::types::{LogEntry, RaftState, Storage, Term, TermStartIndex};

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
    fail_appends: AtomicBool,
    fail_applies: AtomicBool,
}

#[derive(Default)]
struct Inner {
    logs: Vec<LogEntry>,
    term_starts: BTreeMap<Term, u64>,
    applied_index: u64,
    applied_ranges: Vec<(u64, u64)>,
}

impl Inner {
    fn last_index(&self) -> u64 {
        self.logs.last().map(|e| e.index).unwrap_or(0)
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `append_logs` fail until cleared.
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::Release);
    }

    /// Make every later `apply` fail until cleared.
    pub fn fail_applies(&self, fail: bool) {
        self.fail_applies.store(fail, Ordering::Release);
    }

    /// `[start, end)` ranges passed to `apply`, in call order.
    pub fn applied_ranges(&self) -> Vec<(u64, u64)> {
        self.lock().map(|g| g.applied_ranges.clone()).unwrap_or_default()
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.lock().map(|g| g.logs.clone()).unwrap_or_default()
    }

    pub fn term_starts(&self) -> Vec<TermStartIndex> {
        self.lock()
            .map(|g| {
                g.term_starts
                    .iter()
                    .map(|(term, index)| TermStartIndex {
                        term: *term,
                        index: *index,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("memory storage lock poisoned"))
    }
}

impl Storage for MemoryStorage {
    fn append_logs(
        &self,
        logs: &[LogEntry],
        term_start: Option<TermStartIndex>,
    ) -> anyhow::Result<()> {
        if self.fail_appends.load(Ordering::Acquire) {
            bail!("injected append failure");
        }
        let mut inner = self.lock()?;
        let mut next = inner.last_index() + 1;
        for entry in logs {
            if entry.index != next {
                bail!("non-contiguous append: got index {}, expected {next}", entry.index);
            }
            next += 1;
        }
        inner.logs.extend_from_slice(logs);
        if let Some(marker) = term_start {
            inner.term_starts.insert(marker.term, marker.index);
        }
        Ok(())
    }

    fn get_logs(&self, start: u64, end: u64, max_size: u64) -> anyhow::Result<Vec<LogEntry>> {
        let inner = self.lock()?;
        let mut out = Vec::new();
        let mut bytes = 0u64;
        for entry in inner.logs.iter().filter(|e| e.index >= start) {
            if end != 0 && entry.index >= end {
                break;
            }
            let size = entry.size() as u64;
            if max_size > 0 && !out.is_empty() && bytes + size > max_size {
                break;
            }
            bytes += size;
            out.push(entry.clone());
        }
        Ok(out)
    }

    fn get_state(&self) -> anyhow::Result<RaftState> {
        let inner = self.lock()?;
        Ok(RaftState {
            last_log_index: inner.last_index(),
            last_term: inner.logs.last().map(|e| e.term).unwrap_or(0),
            applied_index: inner.applied_index,
        })
    }

    fn get_term_start_index(&self, term: Term) -> anyhow::Result<u64> {
        Ok(self.lock()?.term_starts.get(&term).copied().unwrap_or(0))
    }

    fn truncate_log_to(&self, index: u64) -> anyhow::Result<()> {
        let mut inner = self.lock()?;
        if index < inner.applied_index {
            bail!(
                "refusing to truncate to {index} below applied index {}",
                inner.applied_index
            );
        }
        inner.logs.retain(|e| e.index <= index);
        Ok(())
    }

    fn delete_leader_term_start_index_greater_than_term(&self, term: Term) -> anyhow::Result<()> {
        self.lock()?.term_starts.retain(|t, _| *t <= term);
        Ok(())
    }

    fn apply(&self, start: u64, end: u64) -> anyhow::Result<()> {
        if self.fail_applies.load(Ordering::Acquire) {
            bail!("injected apply failure");
        }
        let mut inner = self.lock()?;
        if start > end || end.saturating_sub(1) > inner.last_index() {
            bail!("apply range [{start}, {end}) outside stored log");
        }
        inner.applied_index = inner.applied_index.max(end.saturating_sub(1));
        inner.applied_ranges.push((start, end));
        Ok(())
    }
}
