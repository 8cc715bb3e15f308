//! Shared types for the reactor.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by the event loop, the replication substrate, and the storage and
//! transport layers alike.

use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::queue::Indexed;

/// Logical node identifier. `0` means "unknown / no node".
pub type NodeId = u64;
/// Replication term.
pub type Term = u32;

/// Fixed per-entry overhead counted against byte budgets (id, index, term).
const LOG_ENTRY_OVERHEAD: usize = 20;

/// One entry of a handler's replicated log.
///
/// `index` and `term` are zero until the owning handler assigns them at
/// propose time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub index: u64,
    pub term: Term,
    pub data: Bytes,
}

impl LogEntry {
    pub fn new(id: u64, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            index: 0,
            term: 0,
            data: data.into(),
        }
    }
}

impl Indexed for LogEntry {
    fn index(&self) -> u64 {
        self.index
    }

    fn set_index(&mut self, index: u64) {
        self.index = index;
    }

    fn size(&self) -> usize {
        self.data.len() + LOG_ENTRY_OVERHEAD
    }
}

/// Marker persisted atomically with the first entry a leader writes in a term.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermStartIndex {
    pub term: Term,
    pub index: u64,
}

/// Durable log state loaded when a handler is prepared.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RaftState {
    pub last_log_index: u64,
    pub last_term: Term,
    pub applied_index: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgType {
    #[default]
    Unknown,
    /// Local: proposed entries with freshly assigned indices.
    Propose,
    /// Local: persist `logs` (optionally with a term start marker).
    StoreAppend,
    /// Local: entries up to `index` are durable.
    StoreAppendResp,
    /// Follower -> leader: "send me entries starting at `index`".
    Sync,
    /// Local on leader: fetch entries from `index` for follower `from`.
    SyncGet,
    /// Local on leader: fetched entries for follower `to`.
    SyncGetResp,
    /// Leader -> follower: entries starting at `index` plus commit progress.
    SyncResp,
    /// Leader -> follower heartbeat carrying last and committed index.
    Ping,
    /// Local: apply `(applying_index, committed_index]`.
    ApplyLogsReq,
    /// Local: entries up to `applied_index` are applied.
    ApplyLogsResp,
    /// Follower -> leader: start index of the term after `term`.
    LeaderTermStartIndexReq,
    /// Local on leader: look up the term start index for follower `from`.
    TermStartIndexGet,
    /// Local on leader: looked-up term start index for follower `to`.
    TermStartIndexGetResp,
    /// Leader -> follower: answer to `LeaderTermStartIndexReq`.
    LeaderTermStartIndexResp,
    /// Local on follower: drop entries after `index`.
    Truncate,
    /// Local on follower: truncation to `index` is durable.
    TruncateResp,
}

/// Replication message exchanged between the substrate, the event loop and
/// peer nodes. Unused fields stay at their zero value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: MsgType,
    pub from: NodeId,
    pub to: NodeId,
    pub term: Term,
    pub index: u64,
    pub committed_index: u64,
    pub applying_index: u64,
    pub applied_index: u64,
    pub logs: Vec<LogEntry>,
    pub term_start: Option<TermStartIndex>,
}

impl Message {
    pub fn logs_size(&self) -> usize {
        self.logs.iter().map(Indexed::size).sum()
    }
}

/// Persisted-state delta reported by the substrate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HardState {
    pub term: Term,
    pub leader_id: NodeId,
}

impl HardState {
    pub fn is_empty(&self) -> bool {
        self.term == 0 && self.leader_id == 0
    }
}

/// Everything a substrate is prepared to emit after a round of steps.
#[derive(Clone, Debug, Default)]
pub struct Ready {
    pub hard_state: Option<HardState>,
    pub messages: Vec<Message>,
}

impl Ready {
    pub fn is_empty(&self) -> bool {
        self.hard_state.is_none() && self.messages.is_empty()
    }
}

/// A message bound to the handler it belongs to, as carried by `Transport`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub handler_key: String,
    pub message: Message,
}

/// User-facing message fanned out through an `OutboundQueue`.
///
/// `to_node == 0` broadcasts to every tracked replica; any other value is a
/// point-to-point forward.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub id: u64,
    pub index: u64,
    pub to_node: NodeId,
    pub uid: String,
    pub payload: Bytes,
}

impl UserMessage {
    pub fn broadcast(id: u64, uid: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            index: 0,
            to_node: 0,
            uid: uid.into(),
            payload: payload.into(),
        }
    }

    pub fn to_node(id: u64, to_node: NodeId, uid: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            to_node,
            ..Self::broadcast(id, uid, payload)
        }
    }
}

impl Indexed for UserMessage {
    fn index(&self) -> u64 {
        self.index
    }

    fn set_index(&mut self, index: u64) {
        self.index = index;
    }

    fn size(&self) -> usize {
        self.payload.len() + self.uid.len()
    }
}

/// How many durable acknowledgements the substrate needs before committing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckMode {
    /// Commit as soon as the leader has the entry durably.
    None,
    /// Commit once a majority of replicas (leader included) has it.
    #[default]
    Majority,
    /// Commit once every replica has it.
    All,
}

impl FromStr for AckMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "majority" => Ok(Self::Majority),
            "all" => Ok(Self::All),
            other => anyhow::bail!("unknown ack mode `{other}` (expected none|majority|all)"),
        }
    }
}

/// Per-handler replication settings.
#[derive(Clone, Debug)]
pub struct ReplicaConfig {
    pub node_id: NodeId,
    /// Every node holding a copy of the log, the local node included.
    pub replicas: Vec<NodeId>,
    pub ack_mode: AckMode,
    /// Proposals are rejected while this many bytes are proposed but
    /// not yet committed.
    pub max_uncommitted_log_size: u64,
    /// Byte budget for one sync response.
    pub sync_limit_size: u64,
    pub replica_max_count: usize,
    /// Elections are out of scope for the bundled substrate; leadership is
    /// assigned externally when this is false.
    pub election_on: bool,
    pub election_timeout_ticks: u32,
    /// Ticks between leader heartbeats and follower sync polls.
    pub heartbeat_timeout_ticks: u32,
}

impl ReplicaConfig {
    pub fn new(node_id: NodeId, replicas: Vec<NodeId>) -> Self {
        Self {
            node_id,
            replicas,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.node_id != 0, "node id must be non-zero");
        anyhow::ensure!(
            self.replicas.contains(&self.node_id),
            "replica set {:?} does not contain local node {}",
            self.replicas,
            self.node_id
        );
        anyhow::ensure!(
            self.replicas.len() <= self.replica_max_count,
            "replica set has {} members, max is {}",
            self.replicas.len(),
            self.replica_max_count
        );
        anyhow::ensure!(
            self.heartbeat_timeout_ticks > 0,
            "heartbeat timeout must be at least one tick"
        );
        Ok(())
    }

    /// Replicas other than the local node.
    pub fn peers(&self) -> Vec<NodeId> {
        self.replicas
            .iter()
            .copied()
            .filter(|id| *id != self.node_id)
            .collect()
    }
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            replicas: Vec::new(),
            ack_mode: AckMode::Majority,
            max_uncommitted_log_size: 1024 * 1024 * 1024,
            sync_limit_size: 1024 * 1024 * 20,
            replica_max_count: 3,
            election_on: false,
            election_timeout_ticks: 10,
            heartbeat_timeout_ticks: 2,
        }
    }
}

/// Reactor-wide configuration.
#[derive(Clone, Debug)]
pub struct ReactorConfig {
    pub node_id: NodeId,
    /// Number of sub-reactor loops sharing all handlers.
    pub sub_reactor_count: usize,
    /// Period of the loop tick that drives heartbeats and liveness.
    pub tick_interval: Duration,
    /// Upper bound on proposed entries converted per handler per loop pass
    /// (0 = unlimited).
    pub max_propose_log_count: usize,
    /// An unanswered sync to a peer is re-sent after this long.
    pub sync_timeout: Duration,
    /// Log per-phase timings slower than 1ms. Diagnostics only.
    pub enable_lazy_catch_up: bool,
}

impl ReactorConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.node_id != 0, "node id must be non-zero");
        anyhow::ensure!(
            self.sub_reactor_count > 0,
            "at least one sub-reactor is required"
        );
        anyhow::ensure!(!self.tick_interval.is_zero(), "tick interval must be non-zero");
        Ok(())
    }
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            sub_reactor_count: 4,
            tick_interval: Duration::from_millis(150),
            max_propose_log_count: 0,
            sync_timeout: Duration::from_secs(2),
            enable_lazy_catch_up: false,
        }
    }
}

/// Durable log store for one handler.
///
/// Calls for a given handler are issued serially from blocking worker
/// threads, never from the event loop itself. Implementations shared by many
/// handlers must be safe to call concurrently across handlers.
pub trait Storage: Send + Sync + 'static {
    /// Append entries; when `term_start` is set it must be stored atomically
    /// with them.
    fn append_logs(&self, logs: &[LogEntry], term_start: Option<TermStartIndex>)
        -> anyhow::Result<()>;
    /// Entries with index in `[start, end)` (`end == 0` means unbounded),
    /// capped at `max_size` bytes (`0` means unbounded). At least one entry is
    /// returned when any exist in range.
    fn get_logs(&self, start: u64, end: u64, max_size: u64) -> anyhow::Result<Vec<LogEntry>>;
    fn get_state(&self) -> anyhow::Result<RaftState>;
    /// Start index recorded for `term`, or 0 when none is recorded.
    fn get_term_start_index(&self, term: Term) -> anyhow::Result<u64>;
    /// Keep entries with index `<= index`, drop the rest.
    fn truncate_log_to(&self, index: u64) -> anyhow::Result<()>;
    fn delete_leader_term_start_index_greater_than_term(&self, term: Term) -> anyhow::Result<()>;
    /// Apply the committed range `[start, end)` to materialized state.
    fn apply(&self, start: u64, end: u64) -> anyhow::Result<()>;
}

/// Outbound network seam used by the event loop.
///
/// `send` is called on the loop and must not block; implementations enqueue
/// and deliver elsewhere.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, envelope: Envelope) -> anyhow::Result<()>;
}
