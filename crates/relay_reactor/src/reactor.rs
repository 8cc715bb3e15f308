//! Reactor module wiring.
//!
//! `engine` owns the pool of sub-reactors, `sub` is the per-shard event loop,
//! `handler` and `replica` hold per-group state and the replication
//! substrate, `task` is the off-loop I/O pipeline, and `outbound`/`outbox`
//! implement the all-ack forwarding queue. `types` defines the shared
//! message, config and trait contracts (storage, transport).

mod engine;
mod error;
mod handler;
mod memory;
mod outbound;
mod outbox;
mod queue;
mod registry;
mod replica;
mod sub;
mod task;
mod transport;
mod types;

pub use engine::Reactor;
pub use error::ReactorError;
pub use handler::{Handler, ProposeResult};
pub use memory::MemoryStorage;
pub use outbound::{OutboundBatch, OutboundConfig, OutboundQueue, ReplicaState};
pub use outbox::{OutboundForwarder, Outbox};
pub use queue::{Indexed, LogQueue};
pub use replica::{LogReplica, Replica, Role};
pub use sub::{SyncState, SyncStatus};
pub use task::Advance;
pub use transport::ChannelTransport;
pub use types::{
    AckMode, Envelope, HardState, LogEntry, Message, MsgType, NodeId, RaftState, ReactorConfig,
    Ready, ReplicaConfig, Storage, Term, TermStartIndex, Transport, UserMessage,
};
