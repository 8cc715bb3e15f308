//! Replication substrate driven by the event loop.
//!
//! `Replica` is the step/ready contract the sub-reactor drives. `LogReplica`
//! is the bundled implementation: a leader/follower log with externally
//! assigned leadership, follower-driven (pull) sync, and commit by ack mode.
//! It never touches storage itself; every durable operation leaves as a local
//! message (`StoreAppend`, `ApplyLogsReq`, `Truncate`, ...) and comes back as
//! the matching response once the reactor's task has run.

use std::collections::{HashMap, VecDeque};

use super::error::ReactorError;
use super::queue::{Indexed, LogQueue};
use super::types::{
    AckMode, HardState, LogEntry, Message, MsgType, NodeId, RaftState, Ready, ReplicaConfig,
    Term, TermStartIndex,
};

/// Consensus state machine driven by a sub-reactor.
///
/// All methods are called from the owning loop only.
pub trait Replica: Send + 'static {
    fn step(&mut self, msg: Message) -> Result<(), ReactorError>;
    /// Drain pending hard-state changes and outbound messages.
    fn ready(&mut self) -> Ready;
    fn tick(&mut self);
    /// Last log index and current term, used to number new proposals.
    fn last_log_index_and_term(&self) -> (u64, Term);
    /// Seed in-memory state from storage once the handler is prepared.
    fn recover(&mut self, state: RaftState);
    fn leader_id(&self) -> NodeId;
    fn is_leader(&self) -> bool;
    /// Byte budget for a single sync response (0 = unbounded).
    fn sync_limit_size(&self) -> u64 {
        0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Unassigned,
    Leader,
    Follower,
}

pub struct LogReplica {
    cfg: ReplicaConfig,
    role: Role,
    term: Term,
    leader_id: NodeId,
    /// Entries not yet confirmed durable.
    log: LogQueue<LogEntry>,
    last_term: Term,
    append_sent_index: u64,
    stored_index: u64,
    committed_index: u64,
    /// Follower view of the leader's commit index.
    leader_committed_index: u64,
    applied_index: u64,
    applying: bool,
    term_start_marker: Option<TermStartIndex>,
    leader_term_start_index: u64,
    /// Leader view of each follower's durable index.
    matched: HashMap<NodeId, u64>,
    uncommitted: VecDeque<(u64, u64)>,
    uncommitted_size: u64,
    sync_pending: bool,
    reconciled: bool,
    reconcile_requested: bool,
    reconcile_term: Term,
    truncating: bool,
    heartbeat_elapsed: u32,
    hard_state_dirty: bool,
    msgs: Vec<Message>,
}

impl LogReplica {
    pub fn new(cfg: ReplicaConfig) -> anyhow::Result<Self> {
        cfg.validate()?;
        anyhow::ensure!(
            !cfg.election_on,
            "LogReplica only supports externally assigned leadership (election_on must be false)"
        );
        Ok(Self {
            cfg,
            role: Role::Unassigned,
            term: 0,
            leader_id: 0,
            log: LogQueue::new(),
            last_term: 0,
            append_sent_index: 0,
            stored_index: 0,
            committed_index: 0,
            leader_committed_index: 0,
            applied_index: 0,
            applying: false,
            term_start_marker: None,
            leader_term_start_index: 0,
            matched: HashMap::new(),
            uncommitted: VecDeque::new(),
            uncommitted_size: 0,
            sync_pending: false,
            reconciled: true,
            reconcile_requested: false,
            reconcile_term: 0,
            truncating: false,
            heartbeat_elapsed: 0,
            hard_state_dirty: false,
            msgs: Vec::new(),
        })
    }

    pub fn become_leader(&mut self, term: Term) {
        self.role = Role::Leader;
        self.term = term;
        self.leader_id = self.cfg.node_id;
        self.matched = self.cfg.peers().into_iter().map(|id| (id, 0)).collect();
        self.mark_term_start();
        self.sync_pending = false;
        self.reconciled = true;
        self.truncating = false;
        self.heartbeat_elapsed = 0;
        self.hard_state_dirty = true;
        self.send_ping();
    }

    pub fn become_follower(&mut self, term: Term, leader_id: NodeId) {
        self.role = Role::Follower;
        self.term = term;
        self.leader_id = leader_id;
        self.matched.clear();
        self.term_start_marker = None;
        self.reconciled = self.last_log_index() == 0;
        self.reconcile_requested = false;
        self.sync_pending = true;
        self.heartbeat_elapsed = 0;
        self.hard_state_dirty = true;
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn stored_index(&self) -> u64 {
        self.stored_index
    }

    pub fn committed_index(&self) -> u64 {
        self.committed_index
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    fn mark_term_start(&mut self) {
        self.leader_term_start_index = self.last_log_index() + 1;
        self.term_start_marker = Some(TermStartIndex {
            term: self.term,
            index: self.leader_term_start_index,
        });
    }

    fn msg(&self, msg_type: MsgType, to: NodeId) -> Message {
        Message {
            msg_type,
            from: self.cfg.node_id,
            to,
            term: self.term,
            ..Message::default()
        }
    }

    fn send_ping(&mut self) {
        for peer in self.cfg.peers() {
            let mut ping = self.msg(MsgType::Ping, peer);
            ping.index = self.last_log_index();
            ping.committed_index = self.committed_index;
            self.msgs.push(ping);
        }
    }

    /// Reject messages from older terms; follow a leader from a newer one.
    fn check_leader_term(&mut self, msg: &Message) -> Result<(), ReactorError> {
        if msg.term < self.term {
            return Err(ReactorError::substrate(
                msg.msg_type,
                format!("stale term {} < {}", msg.term, self.term),
            ));
        }
        if msg.term > self.term || self.role != Role::Follower || self.leader_id != msg.from {
            self.become_follower(msg.term, msg.from);
        }
        Ok(())
    }

    fn require_leader(&self, msg: &Message) -> Result<(), ReactorError> {
        if self.role != Role::Leader {
            return Err(ReactorError::substrate(msg.msg_type, "not leader"));
        }
        if msg.term > self.term {
            return Err(ReactorError::substrate(
                msg.msg_type,
                format!("peer term {} ahead of leader term {}", msg.term, self.term),
            ));
        }
        Ok(())
    }

    fn step_propose(&mut self, msg: Message) -> Result<(), ReactorError> {
        if self.role != Role::Leader {
            return Err(ReactorError::substrate(msg.msg_type, "not leader"));
        }
        let Some(first) = msg.logs.first() else {
            return Ok(());
        };
        let expected = self.last_log_index() + 1;
        if first.index != expected {
            return Err(ReactorError::substrate(
                msg.msg_type,
                format!("proposal starts at {} but next index is {expected}", first.index),
            ));
        }
        let size = msg.logs_size() as u64;
        if self.uncommitted_size + size > self.cfg.max_uncommitted_log_size {
            return Err(ReactorError::ProposalRejected(format!(
                "uncommitted log size {} + {size} exceeds {}",
                self.uncommitted_size, self.cfg.max_uncommitted_log_size
            )));
        }
        for entry in msg.logs {
            let entry_size = entry.size() as u64;
            let index = self.log.append(entry);
            self.uncommitted.push_back((index, entry_size));
        }
        self.uncommitted_size += size;
        self.last_term = self.term;
        Ok(())
    }

    fn step_store_append_resp(&mut self, index: u64) {
        let index = index.min(self.last_log_index());
        if index <= self.stored_index {
            return;
        }
        self.stored_index = index;
        self.log.truncate_to(index + 1);
        match self.role {
            Role::Leader => self.maybe_commit_leader(),
            Role::Follower => {
                self.sync_pending = true;
                self.maybe_commit_follower();
            }
            Role::Unassigned => {}
        }
    }

    fn step_sync(&mut self, msg: Message) -> Result<(), ReactorError> {
        self.require_leader(&msg)?;
        let Some(matched) = self.matched.get_mut(&msg.from) else {
            return Err(ReactorError::substrate(
                msg.msg_type,
                format!("node {} is not a replica", msg.from),
            ));
        };
        *matched = (*matched).max(msg.index.saturating_sub(1));
        self.maybe_commit_leader();

        let mut get = self.msg(MsgType::SyncGet, self.cfg.node_id);
        get.from = msg.from;
        get.index = msg.index;
        self.msgs.push(get);
        Ok(())
    }

    fn step_sync_get_resp(&mut self, msg: Message) -> Result<(), ReactorError> {
        if self.role != Role::Leader {
            return Err(ReactorError::substrate(msg.msg_type, "not leader"));
        }
        let mut resp = self.msg(MsgType::SyncResp, msg.to);
        resp.index = msg.index;
        resp.committed_index = self.committed_index;
        resp.logs = msg.logs;
        self.msgs.push(resp);
        Ok(())
    }

    fn step_sync_resp(&mut self, msg: Message) -> Result<(), ReactorError> {
        self.check_leader_term(&msg)?;
        self.leader_committed_index = self.leader_committed_index.max(msg.committed_index);
        if !self.reconciled || self.truncating {
            return Ok(());
        }
        if msg.logs.is_empty() {
            self.sync_pending = false;
        } else {
            self.sync_pending = true;
            let last = self.last_log_index();
            let mut fresh = msg.logs.into_iter().filter(|e| e.index > last).peekable();
            if let Some(first) = fresh.peek() {
                if first.index != last + 1 {
                    return Err(ReactorError::substrate(
                        MsgType::SyncResp,
                        format!("sync starts at {} but next index is {}", first.index, last + 1),
                    ));
                }
            }
            for entry in fresh {
                self.last_term = entry.term;
                self.log.append(entry);
            }
        }
        self.maybe_commit_follower();
        Ok(())
    }

    fn step_ping(&mut self, msg: Message) -> Result<(), ReactorError> {
        self.check_leader_term(&msg)?;
        self.leader_committed_index = self.leader_committed_index.max(msg.committed_index);
        if msg.index > self.last_log_index() {
            self.sync_pending = true;
        }
        self.maybe_commit_follower();
        Ok(())
    }

    fn step_term_start_req(&mut self, msg: Message) -> Result<(), ReactorError> {
        self.require_leader(&msg)?;
        let mut get = self.msg(MsgType::TermStartIndexGet, self.cfg.node_id);
        get.from = msg.from;
        get.term = msg.index as Term;
        self.msgs.push(get);
        Ok(())
    }

    fn step_term_start_get_resp(&mut self, msg: Message) -> Result<(), ReactorError> {
        if self.role != Role::Leader {
            return Err(ReactorError::substrate(msg.msg_type, "not leader"));
        }
        // `msg.term` is the follower's last log term; nothing after it is
        // recorded locally, so the current term's start is the first
        // divergence point.
        let index = if msg.index > 0 || msg.term >= self.term {
            msg.index
        } else {
            self.leader_term_start_index
        };
        let mut resp = self.msg(MsgType::LeaderTermStartIndexResp, msg.to);
        resp.index = index;
        self.msgs.push(resp);
        Ok(())
    }

    fn step_term_start_resp(&mut self, msg: Message) -> Result<(), ReactorError> {
        self.check_leader_term(&msg)?;
        if self.reconciled || self.truncating {
            return Ok(());
        }
        if msg.index > 0 && msg.index <= self.last_log_index() {
            self.truncating = true;
            let mut truncate = self.msg(MsgType::Truncate, self.cfg.node_id);
            truncate.index = msg.index - 1;
            truncate.term = self.reconcile_term;
            self.msgs.push(truncate);
        } else {
            self.reconciled = true;
            self.sync_pending = true;
        }
        Ok(())
    }

    fn step_truncate_resp(&mut self, msg: Message) {
        self.log.reset_to(msg.index);
        self.append_sent_index = msg.index;
        self.stored_index = msg.index;
        self.last_term = msg.term;
        self.truncating = false;
        self.reconciled = true;
        self.sync_pending = true;
    }

    fn maybe_commit_leader(&mut self) {
        let mut acked: Vec<u64> = self
            .cfg
            .peers()
            .iter()
            .map(|id| self.matched.get(id).copied().unwrap_or(0))
            .collect();
        acked.push(self.stored_index);

        let candidate = match self.cfg.ack_mode {
            AckMode::None => self.stored_index,
            AckMode::All => acked.iter().copied().min().unwrap_or(0),
            AckMode::Majority => {
                acked.sort_unstable_by(|a, b| b.cmp(a));
                let quorum = acked.len() / 2 + 1;
                acked[quorum - 1]
            }
        };
        // Entries from earlier terms only commit together with one of ours.
        let current_term_ok =
            self.cfg.ack_mode == AckMode::None || candidate >= self.leader_term_start_index;
        if candidate > self.committed_index && current_term_ok {
            self.set_committed(candidate);
        }
    }

    fn maybe_commit_follower(&mut self) {
        let candidate = self.leader_committed_index.min(self.stored_index);
        if candidate > self.committed_index {
            self.set_committed(candidate);
        }
    }

    fn set_committed(&mut self, index: u64) {
        self.committed_index = index;
        while let Some(&(idx, size)) = self.uncommitted.front() {
            if idx > index {
                break;
            }
            self.uncommitted.pop_front();
            self.uncommitted_size = self.uncommitted_size.saturating_sub(size);
        }
    }
}

impl Replica for LogReplica {
    fn step(&mut self, msg: Message) -> Result<(), ReactorError> {
        match msg.msg_type {
            MsgType::Propose => self.step_propose(msg),
            MsgType::StoreAppendResp => {
                self.step_store_append_resp(msg.index);
                Ok(())
            }
            MsgType::Sync => self.step_sync(msg),
            MsgType::SyncGetResp => self.step_sync_get_resp(msg),
            MsgType::SyncResp => self.step_sync_resp(msg),
            MsgType::Ping => self.step_ping(msg),
            MsgType::ApplyLogsResp => {
                self.applied_index = self.applied_index.max(msg.applied_index);
                self.applying = false;
                Ok(())
            }
            MsgType::LeaderTermStartIndexReq => self.step_term_start_req(msg),
            MsgType::TermStartIndexGetResp => self.step_term_start_get_resp(msg),
            MsgType::LeaderTermStartIndexResp => self.step_term_start_resp(msg),
            MsgType::TruncateResp => {
                self.step_truncate_resp(msg);
                Ok(())
            }
            other => Err(ReactorError::substrate(other, "unexpected message")),
        }
    }

    fn ready(&mut self) -> Ready {
        let mut rd = Ready::default();
        if self.hard_state_dirty {
            self.hard_state_dirty = false;
            rd.hard_state = Some(HardState {
                term: self.term,
                leader_id: self.leader_id,
            });
        }

        let append_idle = self.append_sent_index == self.stored_index && !self.truncating;
        if append_idle && self.last_log_index() > self.append_sent_index {
            let logs = self.log.slice_with_size(
                self.append_sent_index + 1,
                self.last_log_index() + 1,
                0,
            );
            if let Some(last) = logs.last() {
                self.append_sent_index = last.index;
                let mut append = self.msg(MsgType::StoreAppend, self.cfg.node_id);
                append.index = last.index;
                append.logs = logs;
                if self.role == Role::Leader {
                    append.term_start = self.term_start_marker.take();
                }
                self.msgs.push(append);
            }
        }

        let append_idle = self.append_sent_index == self.stored_index && !self.truncating;
        if self.role == Role::Follower && self.leader_id != 0 && append_idle {
            if !self.reconciled {
                if !self.reconcile_requested {
                    self.reconcile_requested = true;
                    self.reconcile_term = self.last_term;
                    let mut req = self.msg(MsgType::LeaderTermStartIndexReq, self.leader_id);
                    req.index = u64::from(self.last_term);
                    self.msgs.push(req);
                }
            } else if self.sync_pending {
                self.sync_pending = false;
                let mut sync = self.msg(MsgType::Sync, self.leader_id);
                sync.index = self.stored_index + 1;
                self.msgs.push(sync);
            }
        }

        if self.committed_index > self.applied_index && !self.applying {
            self.applying = true;
            let mut apply = self.msg(MsgType::ApplyLogsReq, self.cfg.node_id);
            apply.applying_index = self.applied_index;
            apply.committed_index = self.committed_index;
            self.msgs.push(apply);
        }

        rd.messages = std::mem::take(&mut self.msgs);
        rd
    }

    fn tick(&mut self) {
        if self.role == Role::Unassigned {
            return;
        }
        self.heartbeat_elapsed += 1;
        if self.heartbeat_elapsed < self.cfg.heartbeat_timeout_ticks {
            return;
        }
        self.heartbeat_elapsed = 0;
        match self.role {
            Role::Leader => self.send_ping(),
            Role::Follower => {
                self.sync_pending = true;
                // Re-ask if the reconcile answer was lost.
                if !self.reconciled && !self.truncating {
                    self.reconcile_requested = false;
                }
            }
            Role::Unassigned => {}
        }
    }

    fn last_log_index_and_term(&self) -> (u64, Term) {
        (self.last_log_index(), self.term)
    }

    fn recover(&mut self, state: RaftState) {
        self.log.reset_to(state.last_log_index);
        self.append_sent_index = state.last_log_index;
        self.stored_index = state.last_log_index;
        self.last_term = state.last_term;
        self.applied_index = state.applied_index;
        self.committed_index = self.committed_index.max(state.applied_index);
        self.uncommitted.clear();
        self.uncommitted_size = 0;
        match self.role {
            Role::Leader => self.mark_term_start(),
            Role::Follower => {
                self.reconciled = state.last_log_index == 0;
                self.reconcile_requested = false;
            }
            Role::Unassigned => {}
        }
    }

    fn leader_id(&self) -> NodeId {
        self.leader_id
    }

    fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    fn sync_limit_size(&self) -> u64 {
        self.cfg.sync_limit_size
    }
}
