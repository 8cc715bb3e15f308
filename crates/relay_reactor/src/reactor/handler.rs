//! Group handler: one replicated log and everything the loop tracks for it.
//!
//! External callers only touch the `Inbox` (proposals, received messages and
//! wait handles). Everything in `HandlerCore` is mutated by the owning
//! sub-reactor alone; the lock exists so observability accessors can read it.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::error::ReactorError;
use super::replica::Replica;
use super::sub::{SyncState, SyncStatus};
use super::task::Task;
use super::types::{HardState, LogEntry, Message, NodeId, Storage, Term};

/// Index assigned to one proposed entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposeResult {
    pub id: u64,
    pub index: u64,
}

pub(crate) type WaitResult = Result<Vec<ProposeResult>, ReactorError>;

pub(crate) struct ProposeReq {
    pub(crate) key: u64,
    pub(crate) logs: Vec<LogEntry>,
}

struct Waiter {
    ids: Vec<u64>,
    indices: Vec<u64>,
    tx: oneshot::Sender<WaitResult>,
}

impl Waiter {
    fn last_index(&self) -> u64 {
        self.indices.last().copied().unwrap_or(0)
    }
}

#[derive(Default)]
struct Inbox {
    proposes: VecDeque<ProposeReq>,
    messages: Vec<Message>,
    waiters: HashMap<u64, Waiter>,
    /// Set once the handler stops taking work; every later call sees it.
    closed: Option<ReactorError>,
}

pub(crate) struct HandlerCore {
    pub(crate) replica: Box<dyn Replica>,
    pub(crate) init_task: Option<Task>,
    /// Init failed; retried on the next tick rather than immediately.
    pub(crate) init_backoff: bool,
    /// Append and truncate tasks, drained head-first.
    pub(crate) append_tasks: VecDeque<Task>,
    pub(crate) apply_tasks: VecDeque<Task>,
    /// Log fetches for followers keyed by (requester, start index).
    pub(crate) get_tasks: BTreeMap<(NodeId, u64), Task>,
    /// Term start lookups keyed by requester.
    pub(crate) term_tasks: BTreeMap<NodeId, Task>,
    pub(crate) sync: SyncState,
    pub(crate) sync_resp: Option<Message>,
}

pub struct Handler {
    key: String,
    storage: Arc<dyn Storage>,
    inbox: Mutex<Inbox>,
    core: Mutex<HandlerCore>,
    next_proposal: AtomicU64,
    prepared: AtomicBool,
    last_index: AtomicU64,
    applied_index: AtomicU64,
    leader_id: AtomicU64,
    term: AtomicU32,
    failure: Mutex<Option<ReactorError>>,
}

impl Handler {
    pub fn new(key: impl Into<String>, replica: impl Replica, storage: Arc<dyn Storage>) -> Self {
        Self {
            key: key.into(),
            storage,
            inbox: Mutex::new(Inbox::default()),
            core: Mutex::new(HandlerCore {
                replica: Box::new(replica),
                init_task: None,
                init_backoff: false,
                append_tasks: VecDeque::new(),
                apply_tasks: VecDeque::new(),
                get_tasks: BTreeMap::new(),
                term_tasks: BTreeMap::new(),
                sync: SyncState::default(),
                sync_resp: None,
            }),
            next_proposal: AtomicU64::new(1),
            prepared: AtomicBool::new(false),
            last_index: AtomicU64::new(0),
            applied_index: AtomicU64::new(0),
            leader_id: AtomicU64::new(0),
            term: AtomicU32::new(0),
            failure: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Last durably appended index.
    pub fn last_index(&self) -> u64 {
        self.last_index.load(Ordering::Acquire)
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::Acquire)
    }

    pub fn leader_id(&self) -> NodeId {
        self.leader_id.load(Ordering::Acquire)
    }

    pub fn term(&self) -> Term {
        self.term.load(Ordering::Acquire)
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.load(Ordering::Acquire)
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.core().sync.status()
    }

    /// Storage failure that halted this handler, if any.
    pub fn failure(&self) -> Option<ReactorError> {
        self.failure.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub(crate) fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    pub(crate) fn core(&self) -> MutexGuard<'_, HandlerCore> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn inbox(&self) -> MutexGuard<'_, Inbox> {
        self.inbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a batch for index assignment. When `tx` is given it is resolved
    /// once every entry of the batch is applied. Fails once the handler is
    /// closed.
    pub(crate) fn add_propose(
        &self,
        logs: Vec<LogEntry>,
        tx: Option<oneshot::Sender<WaitResult>>,
    ) -> Result<u64, ReactorError> {
        let mut inbox = self.inbox();
        if let Some(err) = &inbox.closed {
            return Err(err.clone());
        }
        let key = self.next_proposal.fetch_add(1, Ordering::Relaxed);
        if let Some(tx) = tx {
            let ids = logs.iter().map(|e| e.id).collect();
            inbox.waiters.insert(
                key,
                Waiter {
                    ids,
                    indices: Vec::new(),
                    tx,
                },
            );
        }
        inbox.proposes.push_back(ProposeReq { key, logs });
        Ok(key)
    }

    /// Pop queued batches, at least one, until `max_logs` entries are taken
    /// (0 = no limit).
    pub(crate) fn pop_proposes(&self, max_logs: usize) -> Vec<ProposeReq> {
        let mut inbox = self.inbox();
        let mut out = Vec::new();
        let mut taken = 0usize;
        while let Some(front) = inbox.proposes.front() {
            if max_logs > 0 && !out.is_empty() && taken + front.logs.len() > max_logs {
                break;
            }
            taken += front.logs.len();
            if let Some(req) = inbox.proposes.pop_front() {
                out.push(req);
            }
        }
        out
    }

    /// Bind assigned indices to a batch's wait handle.
    pub(crate) fn did_propose(&self, key: u64, indices: Vec<u64>) {
        if let Some(waiter) = self.inbox().waiters.get_mut(&key) {
            waiter.indices = indices;
        }
    }

    pub(crate) fn remove_wait(&self, key: u64) {
        self.inbox().waiters.remove(&key);
    }

    /// Resolve every wait handle whose batch is fully applied.
    pub(crate) fn resolve_applied(&self, applied: u64) {
        let mut inbox = self.inbox();
        let done: Vec<u64> = inbox
            .waiters
            .iter()
            .filter(|(_, w)| w.last_index() != 0 && w.last_index() <= applied)
            .map(|(key, _)| *key)
            .collect();
        for key in done {
            if let Some(waiter) = inbox.waiters.remove(&key) {
                let results = waiter
                    .ids
                    .iter()
                    .zip(&waiter.indices)
                    .map(|(id, index)| ProposeResult {
                        id: *id,
                        index: *index,
                    })
                    .collect();
                let _ = waiter.tx.send(Ok(results));
            }
        }
    }

    pub(crate) fn fail_waiter(&self, key: u64, err: ReactorError) {
        if let Some(waiter) = self.inbox().waiters.remove(&key) {
            let _ = waiter.tx.send(Err(err));
        }
    }

    /// Stop taking work: queued proposals and messages are dropped, waiters
    /// get `err`, and later proposals fail with it. The first close wins.
    pub(crate) fn close(&self, err: ReactorError) {
        let mut inbox = self.inbox();
        if inbox.closed.is_none() {
            inbox.closed = Some(err.clone());
        }
        inbox.proposes.clear();
        inbox.messages.clear();
        for (_, waiter) in inbox.waiters.drain() {
            let _ = waiter.tx.send(Err(err.clone()));
        }
    }

    /// Returns false if the handler is closed and the message was dropped.
    pub(crate) fn add_message(&self, msg: Message) -> bool {
        let mut inbox = self.inbox();
        if inbox.closed.is_some() {
            return false;
        }
        inbox.messages.push(msg);
        true
    }

    pub(crate) fn take_messages(&self) -> Vec<Message> {
        std::mem::take(&mut self.inbox().messages)
    }

    pub(crate) fn set_prepared(&self) {
        self.prepared.store(true, Ordering::Release);
    }

    pub(crate) fn set_last_index(&self, index: u64) {
        self.last_index.store(index, Ordering::Release);
    }

    pub(crate) fn set_applied_index(&self, index: u64) {
        self.applied_index.fetch_max(index, Ordering::AcqRel);
    }

    pub(crate) fn set_hard_state(&self, hs: HardState) {
        self.term.store(hs.term, Ordering::Release);
        self.leader_id.store(hs.leader_id, Ordering::Release);
    }

    /// Halt the handler after a storage failure.
    pub(crate) fn fail(&self, err: ReactorError) {
        if let Ok(mut slot) = self.failure.lock() {
            if slot.is_none() {
                *slot = Some(err.clone());
            }
        }
        self.close(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::memory::MemoryStorage;
    use crate::reactor::replica::LogReplica;
    use crate::reactor::types::ReplicaConfig;

    fn handler() -> Handler {
        let replica = LogReplica::new(ReplicaConfig::new(1, vec![1])).unwrap();
        Handler::new("ch-1", replica, Arc::new(MemoryStorage::new()))
    }

    fn logs(ids: &[u64]) -> Vec<LogEntry> {
        ids.iter().map(|id| LogEntry::new(*id, "x")).collect()
    }

    #[test]
    fn proposes_pop_fifo_within_the_entry_cap() {
        let h = handler();
        let a = h.add_propose(logs(&[1, 2]), None).unwrap();
        let b = h.add_propose(logs(&[3, 4]), None).unwrap();
        let c = h.add_propose(logs(&[5]), None).unwrap();

        let first = h.pop_proposes(3);
        assert_eq!(first.iter().map(|r| r.key).collect::<Vec<_>>(), vec![a]);
        let rest = h.pop_proposes(0);
        assert_eq!(rest.iter().map(|r| r.key).collect::<Vec<_>>(), vec![b, c]);
        assert!(h.pop_proposes(0).is_empty());
    }

    #[test]
    fn oversized_batch_still_makes_progress() {
        let h = handler();
        h.add_propose(logs(&[1, 2, 3, 4]), None).unwrap();
        assert_eq!(h.pop_proposes(2).len(), 1);
    }

    #[tokio::test]
    async fn wait_resolves_once_batch_is_applied() {
        let h = handler();
        let (tx, rx) = oneshot::channel();
        let key = h.add_propose(logs(&[7, 8, 9]), Some(tx)).unwrap();
        h.did_propose(key, vec![1, 2, 3]);

        h.resolve_applied(2);
        h.resolve_applied(3);
        let results = rx.await.unwrap().unwrap();
        assert_eq!(
            results,
            vec![
                ProposeResult { id: 7, index: 1 },
                ProposeResult { id: 8, index: 2 },
                ProposeResult { id: 9, index: 3 },
            ]
        );
    }

    #[tokio::test]
    async fn unassigned_batches_are_not_resolved() {
        let h = handler();
        let (tx, mut rx) = oneshot::channel();
        h.add_propose(logs(&[1]), Some(tx)).unwrap();
        h.resolve_applied(100);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failure_fails_waiters_and_closes_the_inbox() {
        let h = handler();
        let (tx1, rx1) = oneshot::channel();
        h.add_propose(logs(&[1]), Some(tx1)).unwrap();
        h.add_propose(logs(&[2]), None).unwrap();
        assert!(h.add_message(Message::default()));

        let err = ReactorError::Storage {
            key: "ch-1".into(),
            reason: "disk".into(),
        };
        h.fail(err.clone());
        assert_eq!(rx1.await.unwrap(), Err(err.clone()));
        assert_eq!(h.failure(), Some(err.clone()));
        assert!(h.pop_proposes(0).is_empty());
        assert!(h.take_messages().is_empty());

        let (tx2, rx2) = oneshot::channel();
        assert_eq!(h.add_propose(logs(&[3]), Some(tx2)), Err(err.clone()));
        assert!(rx2.await.is_err(), "rejected waiter is never registered");
        assert!(!h.add_message(Message::default()));
        assert!(h.take_messages().is_empty());
    }

    #[tokio::test]
    async fn first_close_reason_sticks() {
        let h = handler();
        h.close(ReactorError::HandlerNotFound("ch-1".into()));
        h.close(ReactorError::Stopped);
        assert_eq!(
            h.add_propose(logs(&[1]), None),
            Err(ReactorError::HandlerNotFound("ch-1".into()))
        );
        assert!(h.failure().is_none(), "removal is not a storage failure");
    }
}
