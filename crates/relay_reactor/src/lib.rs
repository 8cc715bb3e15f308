//! Replicated-log reactor crate.
//!
//! This crate multiplexes many independent replication groups ("handlers",
//! one per channel, slot or user outbox) onto a small pool of single-task
//! event loops. Higher layers supply a `Storage` and a `Transport`, register
//! handlers, and drive proposals through `Reactor`. The `Outbox` half covers
//! fan-out of already-decided user messages to peer nodes.

pub mod reactor;
