//! Sub-reactor: one cooperative event loop driving a shard of handlers.
//!
//! The loop body is `ready_events` followed by a single wait on the tick
//! interval, the advance signal or the stop token. Storage work leaves the
//! loop as `Task`s and is only ever polled here, never awaited.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::error::ReactorError;
use super::handler::{Handler, HandlerCore};
use super::registry::HandlerRegistry;
use super::task::{Advance, Task, TaskKind, TaskOutput};
use super::types::{Envelope, Message, MsgType, RaftState, ReactorConfig, Term, Transport};

/// Progress of the follower-side sync handshake.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncStatus {
    #[default]
    None,
    Syncing,
    Synced,
}

/// Deduplicates outbound `Sync` messages for one handler.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncState {
    status: SyncStatus,
    syncing_index: u64,
    started_at: Option<Instant>,
}

impl SyncState {
    pub fn status(&self) -> SyncStatus {
        self.status
    }

    pub fn syncing_index(&self) -> u64 {
        self.syncing_index
    }

    /// Decide whether a `Sync` for `index` goes out now. While syncing, only a
    /// higher index or an expired timeout gets through; both restart the
    /// timer. `Synced` suppresses everything until `reset`.
    pub fn should_send(&mut self, index: u64, now: Instant, timeout: Duration) -> bool {
        let send = match self.status {
            SyncStatus::None => true,
            SyncStatus::Syncing => {
                let expired = self
                    .started_at
                    .map(|at| now.saturating_duration_since(at) >= timeout)
                    .unwrap_or(true);
                index > self.syncing_index || expired
            }
            SyncStatus::Synced => false,
        };
        if send {
            self.status = SyncStatus::Syncing;
            self.syncing_index = index;
            self.started_at = Some(now);
        }
        send
    }

    pub fn mark_synced(&mut self) {
        self.status = SyncStatus::Synced;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// The leader is ahead of us. Only reopens a finished handshake; an
    /// in-flight one still waits for progress or its timeout.
    pub fn gap_detected(&mut self) {
        if self.status == SyncStatus::Synced {
            self.reset();
        }
    }
}

/// Passes per wake-up before the loop yields to its timer and stop token.
const MAX_READY_PASSES: usize = 8;

pub(crate) struct SubReactor {
    index: usize,
    cfg: ReactorConfig,
    pub(crate) handlers: HandlerRegistry,
    transport: Arc<dyn Transport>,
    pub(crate) advance: Advance,
    tick_requested: AtomicBool,
    stop: CancellationToken,
}

impl SubReactor {
    pub(crate) fn new(
        index: usize,
        cfg: ReactorConfig,
        transport: Arc<dyn Transport>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            index,
            cfg,
            handlers: HandlerRegistry::default(),
            transport,
            advance: Advance::new(),
            tick_requested: AtomicBool::new(false),
            stop,
        }
    }

    /// Ask the loop to tick every handler on its next wake-up.
    pub(crate) fn request_tick(&self) {
        self.tick_requested.store(true, Ordering::Release);
        self.advance.signal();
    }

    pub(crate) async fn run(self: Arc<Self>) {
        let mut interval = time::interval(self.cfg.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut snapshot = Vec::new();
        tracing::debug!(sub_reactor = self.index, "sub-reactor started");

        loop {
            if self.ready_events(&mut snapshot) {
                // Leftover work; come straight back after the tick and stop
                // checks below.
                self.advance.signal();
            }
            tokio::select! {
                _ = interval.tick() => self.tick_handlers(&mut snapshot),
                _ = self.advance.notified() => {}
                _ = self.stop.cancelled() => break,
            }
            if self.tick_requested.swap(false, Ordering::AcqRel) {
                self.tick_handlers(&mut snapshot);
            }
        }

        self.handlers.snapshot(&mut snapshot);
        for handler in &snapshot {
            handler.close(ReactorError::Stopped);
        }
        tracing::debug!(sub_reactor = self.index, "sub-reactor stopped");
    }

    fn tick_handlers(&self, snapshot: &mut Vec<Arc<Handler>>) {
        self.handlers.snapshot(snapshot);
        for handler in snapshot.iter() {
            if handler.failure().is_some() {
                continue;
            }
            let mut core = handler.core();
            core.init_backoff = false;
            if handler.is_prepared() {
                core.replica.tick();
            }
        }
    }

    /// Process every handler until a pass produces no new work, for at most
    /// `MAX_READY_PASSES` passes. Returns true if work is left over.
    pub(crate) fn ready_events(&self, snapshot: &mut Vec<Arc<Handler>>) -> bool {
        for _ in 0..MAX_READY_PASSES {
            if self.stop.is_cancelled() {
                return false;
            }
            let mut has_event = false;
            self.handlers.snapshot(snapshot);
            for handler in snapshot.iter() {
                if handler.failure().is_some() {
                    continue;
                }
                let mut core = handler.core();
                if !handler.is_prepared() && !self.prepare(handler, &mut core) {
                    continue;
                }
                self.handle_ready(handler, &mut core);
                if self.handle_event(handler, &mut core) {
                    has_event = true;
                }
            }
            if !has_event {
                return false;
            }
        }
        true
    }

    /// Drive the init task. Returns true once the handler is prepared.
    fn prepare(&self, handler: &Handler, core: &mut HandlerCore) -> bool {
        match core.init_task.as_ref().map(Task::is_finished) {
            None => {
                if core.init_backoff {
                    return false;
                }
                let storage = handler.storage();
                let mut task = Task::new(TaskKind::Init, 0, move || {
                    let state = storage.get_state()?;
                    Ok(TaskOutput::wake(Message {
                        index: state.last_log_index,
                        term: state.last_term,
                        applied_index: state.applied_index,
                        ..Message::default()
                    }))
                });
                task.start(&self.advance);
                core.init_task = Some(task);
                false
            }
            Some(true) => {
                let outcome = core.init_task.take().and_then(|task| task.take_outcome());
                match outcome {
                    Some(Ok(state)) => {
                        core.replica.recover(RaftState {
                            last_log_index: state.index,
                            last_term: state.term,
                            applied_index: state.applied_index,
                        });
                        handler.set_last_index(state.index);
                        handler.set_applied_index(state.applied_index);
                        handler.set_prepared();
                        tracing::debug!(
                            handler = %handler.key(),
                            last_index = state.index,
                            applied_index = state.applied_index,
                            "handler prepared"
                        );
                        true
                    }
                    Some(Err(err)) => {
                        tracing::warn!(error = ?err, handler = %handler.key(), "handler init failed");
                        core.init_backoff = true;
                        false
                    }
                    None => false,
                }
            }
            Some(false) => false,
        }
    }

    fn handle_ready(&self, handler: &Handler, core: &mut HandlerCore) {
        let rd = core.replica.ready();
        if let Some(hs) = rd.hard_state {
            if hs.term != handler.term() || hs.leader_id != handler.leader_id() {
                core.sync.reset();
            }
            handler.set_hard_state(hs);
        }

        for msg in rd.messages {
            if msg.to == self.cfg.node_id {
                self.handle_local_msg(handler, core, msg);
                continue;
            }
            if msg.to == 0 {
                tracing::warn!(
                    handler = %handler.key(),
                    msg_type = ?msg.msg_type,
                    "message has no destination, dropping"
                );
                continue;
            }
            if msg.msg_type == MsgType::Sync
                && !core
                    .sync
                    .should_send(msg.index, Instant::now(), self.cfg.sync_timeout)
            {
                continue;
            }
            let envelope = Envelope {
                handler_key: handler.key().to_string(),
                message: msg,
            };
            if let Err(err) = self.transport.send(envelope) {
                tracing::warn!(error = ?err, handler = %handler.key(), "send failed");
            }
        }

        start_head(&mut core.append_tasks, &self.advance);
        start_head(&mut core.apply_tasks, &self.advance);
        for task in core.get_tasks.values_mut().chain(core.term_tasks.values_mut()) {
            if !task.is_started() {
                task.start(&self.advance);
            }
        }
    }

    /// Turn a self-addressed message into the matching storage task.
    fn handle_local_msg(&self, handler: &Handler, core: &mut HandlerCore, msg: Message) {
        let storage = handler.storage();
        let node_id = self.cfg.node_id;
        match msg.msg_type {
            MsgType::StoreAppend => {
                let index = msg.index;
                core.append_tasks.push_back(Task::new(TaskKind::Append, index, move || {
                    storage.append_logs(&msg.logs, msg.term_start)?;
                    Ok(TaskOutput::wake(Message {
                        msg_type: MsgType::StoreAppendResp,
                        from: node_id,
                        to: node_id,
                        index,
                        ..Message::default()
                    }))
                }));
            }
            MsgType::Truncate => {
                let (index, term) = (msg.index, msg.term);
                core.append_tasks.push_back(Task::new(TaskKind::Truncate, index, move || {
                    storage.truncate_log_to(index)?;
                    storage.delete_leader_term_start_index_greater_than_term(term)?;
                    let state = storage.get_state()?;
                    Ok(TaskOutput::wake(Message {
                        msg_type: MsgType::TruncateResp,
                        from: node_id,
                        to: node_id,
                        index: state.last_log_index,
                        term: state.last_term,
                        ..Message::default()
                    }))
                }));
            }
            MsgType::ApplyLogsReq => {
                let (applying, committed) = (msg.applying_index, msg.committed_index);
                if applying >= committed {
                    return;
                }
                core.apply_tasks.push_back(Task::new(TaskKind::Apply, committed, move || {
                    storage.apply(applying + 1, committed + 1)?;
                    Ok(TaskOutput::wake(Message {
                        msg_type: MsgType::ApplyLogsResp,
                        from: node_id,
                        to: node_id,
                        applied_index: committed,
                        ..Message::default()
                    }))
                }));
            }
            MsgType::SyncGet => {
                let key = (msg.from, msg.index);
                if core.get_tasks.contains_key(&key) {
                    return;
                }
                let limit = core.replica.sync_limit_size();
                let task = Task::new(TaskKind::GetLogs, msg.index, move || {
                    let logs = storage.get_logs(key.1, 0, limit)?;
                    Ok(TaskOutput {
                        wake: !logs.is_empty(),
                        resp: Message {
                            msg_type: MsgType::SyncGetResp,
                            from: node_id,
                            to: key.0,
                            index: key.1,
                            logs,
                            ..Message::default()
                        },
                    })
                });
                core.get_tasks.insert(key, task);
            }
            MsgType::TermStartIndexGet => {
                let requester = msg.from;
                if core.term_tasks.contains_key(&requester) {
                    return;
                }
                let asked: Term = msg.term;
                let task = Task::new(TaskKind::TermStartIndex, 0, move || {
                    let index = storage.get_term_start_index(asked + 1)?;
                    Ok(TaskOutput::wake(Message {
                        msg_type: MsgType::TermStartIndexGetResp,
                        from: node_id,
                        to: requester,
                        term: asked,
                        index,
                        ..Message::default()
                    }))
                });
                core.term_tasks.insert(requester, task);
            }
            _ => {
                if let Err(err) = core.replica.step(msg) {
                    tracing::warn!(error = %err, handler = %handler.key(), "local step failed");
                }
            }
        }
    }

    /// Drain pending work in priority order. Returns true if anything was
    /// consumed.
    fn handle_event(&self, handler: &Handler, core: &mut HandlerCore) -> bool {
        let mut has_event = false;
        let mut phase = PhaseTimer::new(self.cfg.enable_lazy_catch_up, handler.key());

        has_event |= self.handle_proposes(handler, core);
        phase.lap("proposes");

        match self.handle_append_tasks(handler, core) {
            Ok(progressed) => has_event |= progressed,
            Err(err) => {
                self.fail_handler(handler, core, err);
                return true;
            }
        }
        phase.lap("append");

        has_event |= self.handle_recv_messages(handler, core);
        phase.lap("recv");

        has_event |= self.handle_sync_resp(handler, core);
        phase.lap("sync_resp");

        has_event |= self.handle_get_tasks(handler, core);
        phase.lap("get_logs");

        match self.handle_apply_tasks(handler, core) {
            Ok(progressed) => has_event |= progressed,
            Err(err) => {
                self.fail_handler(handler, core, err);
                return true;
            }
        }
        phase.lap("apply");

        has_event
    }

    fn handle_proposes(&self, handler: &Handler, core: &mut HandlerCore) -> bool {
        let reqs = handler.pop_proposes(self.cfg.max_propose_log_count);
        if reqs.is_empty() {
            return false;
        }
        for mut req in reqs {
            let (last_index, term) = core.replica.last_log_index_and_term();
            let mut indices = Vec::with_capacity(req.logs.len());
            for (i, entry) in req.logs.iter_mut().enumerate() {
                entry.index = last_index + 1 + i as u64;
                entry.term = term;
                indices.push(entry.index);
            }
            let msg = Message {
                msg_type: MsgType::Propose,
                from: self.cfg.node_id,
                to: self.cfg.node_id,
                term,
                logs: req.logs,
                ..Message::default()
            };
            match core.replica.step(msg) {
                Ok(()) => handler.did_propose(req.key, indices),
                Err(err) => {
                    tracing::warn!(error = %err, handler = %handler.key(), "propose rejected");
                    handler.fail_waiter(req.key, err);
                }
            }
        }
        true
    }

    fn handle_append_tasks(
        &self,
        handler: &Handler,
        core: &mut HandlerCore,
    ) -> Result<bool, ReactorError> {
        let mut progressed = false;
        while core.append_tasks.front().is_some_and(Task::is_finished) {
            let Some(task) = core.append_tasks.pop_front() else {
                break;
            };
            let Some(outcome) = task.take_outcome() else {
                continue;
            };
            let resp = outcome.map_err(|err| {
                tracing::error!(
                    error = ?err,
                    handler = %handler.key(),
                    kind = ?task.kind(),
                    index = task.index(),
                    "storage write failed"
                );
                ReactorError::storage(handler.key(), &err)
            })?;
            handler.set_last_index(resp.index);
            if let Err(err) = core.replica.step(resp) {
                tracing::warn!(error = %err, handler = %handler.key(), "append step failed");
            }
            progressed = true;
        }
        start_head(&mut core.append_tasks, &self.advance);
        Ok(progressed)
    }

    fn handle_recv_messages(&self, handler: &Handler, core: &mut HandlerCore) -> bool {
        let msgs = handler.take_messages();
        if msgs.is_empty() {
            return false;
        }
        for msg in msgs {
            match msg.msg_type {
                MsgType::SyncResp => core.sync_resp = Some(msg),
                _ => {
                    if msg.msg_type == MsgType::Ping
                        && msg.index > core.replica.last_log_index_and_term().0
                    {
                        core.sync.gap_detected();
                    }
                    if let Err(err) = core.replica.step(msg) {
                        tracing::warn!(error = %err, handler = %handler.key(), "step failed");
                    }
                }
            }
        }
        true
    }

    fn handle_sync_resp(&self, handler: &Handler, core: &mut HandlerCore) -> bool {
        let Some(resp) = core.sync_resp.take() else {
            return false;
        };
        if resp.logs.is_empty() {
            core.sync.mark_synced();
        }
        if let Err(err) = core.replica.step(resp) {
            tracing::warn!(error = %err, handler = %handler.key(), "sync response rejected");
        }
        true
    }

    fn handle_get_tasks(&self, handler: &Handler, core: &mut HandlerCore) -> bool {
        let mut progressed = false;
        let done: Vec<_> = core
            .get_tasks
            .iter()
            .filter(|(_, t)| t.is_finished())
            .map(|(k, _)| *k)
            .collect();
        for key in done {
            if let Some(task) = core.get_tasks.remove(&key) {
                progressed |= self.step_task_outcome(handler, core, &task);
            }
        }
        let done: Vec<_> = core
            .term_tasks
            .iter()
            .filter(|(_, t)| t.is_finished())
            .map(|(k, _)| *k)
            .collect();
        for key in done {
            if let Some(task) = core.term_tasks.remove(&key) {
                progressed |= self.step_task_outcome(handler, core, &task);
            }
        }
        progressed
    }

    /// Step a read-only task result. Failures are logged; the request is
    /// retried when the peer asks again.
    fn step_task_outcome(&self, handler: &Handler, core: &mut HandlerCore, task: &Task) -> bool {
        match task.take_outcome() {
            Some(Ok(resp)) => {
                if let Err(err) = core.replica.step(resp) {
                    tracing::warn!(error = %err, handler = %handler.key(), "task result rejected");
                }
                true
            }
            Some(Err(err)) => {
                tracing::warn!(
                    error = ?err,
                    handler = %handler.key(),
                    kind = ?task.kind(),
                    index = task.index(),
                    "storage read failed"
                );
                true
            }
            None => false,
        }
    }

    fn handle_apply_tasks(
        &self,
        handler: &Handler,
        core: &mut HandlerCore,
    ) -> Result<bool, ReactorError> {
        let mut progressed = false;
        while core.apply_tasks.front().is_some_and(Task::is_finished) {
            let Some(task) = core.apply_tasks.pop_front() else {
                break;
            };
            let Some(outcome) = task.take_outcome() else {
                continue;
            };
            let resp = outcome.map_err(|err| {
                tracing::error!(
                    error = ?err,
                    handler = %handler.key(),
                    index = task.index(),
                    "apply failed"
                );
                ReactorError::storage(handler.key(), &err)
            })?;
            let applied = resp.applied_index;
            if let Err(err) = core.replica.step(resp) {
                tracing::warn!(error = %err, handler = %handler.key(), "apply step failed");
            }
            handler.set_applied_index(applied);
            handler.resolve_applied(applied);
            progressed = true;
        }
        start_head(&mut core.apply_tasks, &self.advance);
        Ok(progressed)
    }

    fn fail_handler(&self, handler: &Handler, core: &mut HandlerCore, err: ReactorError) {
        core.append_tasks.clear();
        core.apply_tasks.clear();
        core.get_tasks.clear();
        core.term_tasks.clear();
        handler.fail(err);
    }
}

fn start_head(tasks: &mut VecDeque<Task>, advance: &Advance) {
    if let Some(head) = tasks.front_mut() {
        if !head.is_started() {
            head.start(advance);
        }
    }
}

/// Logs phases of one handler pass that take longer than a millisecond.
struct PhaseTimer<'a> {
    enabled: bool,
    key: &'a str,
    last: Instant,
}

impl<'a> PhaseTimer<'a> {
    fn new(enabled: bool, key: &'a str) -> Self {
        Self {
            enabled,
            key,
            last: Instant::now(),
        }
    }

    fn lap(&mut self, phase: &'static str) {
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last);
        if elapsed > Duration::from_millis(1) {
            tracing::info!(handler = %self.key, phase, elapsed = ?elapsed, "slow reactor phase");
        }
        self.last = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::memory::MemoryStorage;
    use crate::reactor::replica::LogReplica;
    use crate::reactor::transport::ChannelTransport;
    use crate::reactor::types::{LogEntry, ReplicaConfig, Storage};

    #[test]
    fn sync_state_dedupes_until_progress_or_timeout() {
        let timeout = Duration::from_secs(2);
        let t0 = Instant::now();
        let mut sync = SyncState::default();

        assert!(sync.should_send(5, t0, timeout));
        assert_eq!(sync.status(), SyncStatus::Syncing);
        assert!(!sync.should_send(5, t0 + Duration::from_millis(500), timeout));
        assert!(!sync.should_send(4, t0 + Duration::from_millis(900), timeout));

        // Retry after the timeout restarts the timer.
        let t1 = t0 + Duration::from_secs(3);
        assert!(sync.should_send(5, t1, timeout));
        assert!(!sync.should_send(5, t1 + Duration::from_secs(1), timeout));

        // Progress always goes through.
        assert!(sync.should_send(6, t1 + Duration::from_secs(1), timeout));
        assert_eq!(sync.syncing_index(), 6);
    }

    #[test]
    fn synced_suppresses_until_reset() {
        let timeout = Duration::from_secs(2);
        let t0 = Instant::now();
        let mut sync = SyncState::default();
        assert!(sync.should_send(1, t0, timeout));
        sync.mark_synced();
        assert!(!sync.should_send(2, t0 + Duration::from_secs(10), timeout));
        sync.reset();
        assert_eq!(sync.status(), SyncStatus::None);
        assert!(sync.should_send(2, t0 + Duration::from_secs(10), timeout));
    }

    #[test]
    fn gap_only_reopens_a_finished_handshake() {
        let timeout = Duration::from_secs(5);
        let t0 = Instant::now();
        let mut sync = SyncState::default();
        assert!(sync.should_send(1, t0, timeout));

        sync.gap_detected();
        assert_eq!(sync.status(), SyncStatus::Syncing);
        assert!(!sync.should_send(1, t0 + Duration::from_millis(50), timeout));

        sync.mark_synced();
        sync.gap_detected();
        assert_eq!(sync.status(), SyncStatus::None);
        assert!(sync.should_send(1, t0 + Duration::from_millis(100), timeout));
    }

    fn leader_handler(storage: Arc<MemoryStorage>) -> Arc<Handler> {
        let mut replica = LogReplica::new(ReplicaConfig::new(1, vec![1, 2])).unwrap();
        replica.become_leader(1);
        Arc::new(Handler::new("ch", replica, storage))
    }

    fn sub() -> SubReactor {
        let (transport, _rx) = ChannelTransport::new();
        SubReactor::new(
            0,
            ReactorConfig::new(1),
            Arc::new(transport),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn empty_sync_get_does_not_signal_advance() {
        let sub = sub();
        let handler = leader_handler(Arc::new(MemoryStorage::new()));
        let mut core = handler.core();
        sub.handle_local_msg(
            &handler,
            &mut core,
            Message {
                msg_type: MsgType::SyncGet,
                from: 2,
                to: 1,
                index: 10,
                ..Message::default()
            },
        );
        let task = core.get_tasks.get_mut(&(2, 10)).expect("get task queued");
        task.start(&sub.advance);

        for _ in 0..200 {
            if task.is_finished() {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        let resp = task.take_outcome().expect("finished").expect("ok");
        assert_eq!(resp.msg_type, MsgType::SyncGetResp);
        assert_eq!((resp.to, resp.index), (2, 10));
        assert!(resp.logs.is_empty());
        assert!(!sub.advance.is_pending());
    }

    #[tokio::test]
    async fn non_empty_sync_get_signals_advance() {
        let storage = Arc::new(MemoryStorage::new());
        let mut entry = LogEntry::new(1, "a");
        entry.index = 1;
        entry.term = 1;
        storage.append_logs(&[entry], None).unwrap();

        let sub = sub();
        let handler = leader_handler(storage);
        let mut core = handler.core();
        sub.handle_local_msg(
            &handler,
            &mut core,
            Message {
                msg_type: MsgType::SyncGet,
                from: 2,
                to: 1,
                index: 1,
                ..Message::default()
            },
        );
        let task = core.get_tasks.get_mut(&(2, 1)).expect("get task queued");
        task.start(&sub.advance);
        time::timeout(Duration::from_secs(1), sub.advance.notified())
            .await
            .expect("non-empty result wakes the loop");
        assert_eq!(task.take_outcome().unwrap().unwrap().logs.len(), 1);
    }

    #[test]
    fn apply_request_with_nothing_new_is_skipped() {
        let sub = sub();
        let handler = leader_handler(Arc::new(MemoryStorage::new()));
        let mut core = handler.core();
        sub.handle_local_msg(
            &handler,
            &mut core,
            Message {
                msg_type: MsgType::ApplyLogsReq,
                to: 1,
                applying_index: 4,
                committed_index: 3,
                ..Message::default()
            },
        );
        assert!(core.apply_tasks.is_empty());
    }

    #[tokio::test]
    async fn propose_assigns_indices_from_last_log_index_and_term() {
        let sub = sub();
        let handler = leader_handler(Arc::new(MemoryStorage::new()));
        let mut snapshot = Vec::new();
        sub.handlers.add(handler.clone());
        // First pass spawns the init task; wait for it to report back.
        sub.ready_events(&mut snapshot);
        time::timeout(Duration::from_secs(1), sub.advance.notified())
            .await
            .expect("init completes");
        sub.ready_events(&mut snapshot);
        assert!(handler.is_prepared());

        handler
            .add_propose(vec![LogEntry::new(10, "a"), LogEntry::new(11, "b")], None)
            .unwrap();
        let mut core = handler.core();
        assert!(sub.handle_proposes(&handler, &mut core));
        assert_eq!(core.replica.last_log_index_and_term(), (2, 1));
    }

    #[tokio::test]
    async fn ready_events_yields_after_a_bounded_number_of_passes() {
        let (transport, _rx) = ChannelTransport::new();
        let mut cfg = ReactorConfig::new(1);
        cfg.max_propose_log_count = 1;
        let stop = CancellationToken::new();
        let sub = SubReactor::new(0, cfg, Arc::new(transport), stop.clone());
        let handler = leader_handler(Arc::new(MemoryStorage::new()));
        let mut snapshot = Vec::new();
        sub.handlers.add(handler.clone());
        sub.ready_events(&mut snapshot);
        time::timeout(Duration::from_secs(1), sub.advance.notified())
            .await
            .expect("init completes");
        sub.ready_events(&mut snapshot);
        assert!(handler.is_prepared());

        for id in 0..20 {
            handler.add_propose(vec![LogEntry::new(id, "x")], None).unwrap();
        }
        assert!(sub.ready_events(&mut snapshot), "work left over");
        let assigned = handler.core().replica.last_log_index_and_term().0;
        assert_eq!(assigned, MAX_READY_PASSES as u64);

        stop.cancel();
        assert!(!sub.ready_events(&mut snapshot));
        assert_eq!(handler.core().replica.last_log_index_and_term().0, assigned);
    }
}
