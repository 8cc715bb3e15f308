//! Outbound replication queue for user-message fan-out.
//!
//! One local queue plus liveness state per destination node. Commit is the
//! minimum acknowledged index over every tracked replica: each destination
//! must receive every message, so there is no majority shortcut. A replica
//! that stops heartbeating is evicted after a fixed number of ticks, which is
//! the only way a dead peer stops holding back commit.

use std::collections::BTreeMap;

use super::queue::LogQueue;
use super::types::{NodeId, UserMessage};

#[derive(Clone, Debug)]
pub struct OutboundConfig {
    pub node_id: NodeId,
    /// Ticks to wait before re-forwarding to a replica that has not acked.
    pub forward_interval_ticks: u32,
    /// Ticks without a heartbeat before a replica is evicted.
    pub heartbeat_timeout_ticks: u32,
}

impl OutboundConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Self::default()
        }
    }
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            forward_interval_ticks: 1,
            heartbeat_timeout_ticks: 10,
        }
    }
}

/// Liveness and progress of one destination node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaState {
    pub node_id: NodeId,
    /// Highest index this node has acknowledged.
    pub outbound_forwarded_index: u64,
    pub forward_idle_tick: u32,
    pub heartbeat_idle_tick: u32,
}

/// Messages bound for one destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundBatch {
    pub from: NodeId,
    pub to: NodeId,
    pub messages: Vec<UserMessage>,
}

pub struct OutboundQueue {
    cfg: OutboundConfig,
    queue: LogQueue<UserMessage>,
    replicas: BTreeMap<NodeId, ReplicaState>,
    commit_index: u64,
    /// Everything at or below this index has been handed out by `ready`.
    sent_index: u64,
}

impl OutboundQueue {
    pub fn new(cfg: OutboundConfig) -> Self {
        Self {
            cfg,
            queue: LogQueue::new(),
            replicas: BTreeMap::new(),
            commit_index: 0,
            sent_index: 0,
        }
    }

    /// Assign the next local index to `msg` and return it.
    pub fn append(&mut self, msg: UserMessage) -> u64 {
        self.queue.append(msg)
    }

    /// Start tracking `node_id`. An already tracked node keeps its state.
    pub fn add_replica(&mut self, node_id: NodeId) {
        if node_id == self.cfg.node_id {
            return;
        }
        let commit_index = self.commit_index;
        let cooldown = self.cfg.forward_interval_ticks;
        self.replicas.entry(node_id).or_insert_with(|| ReplicaState {
            node_id,
            outbound_forwarded_index: commit_index,
            forward_idle_tick: cooldown,
            heartbeat_idle_tick: 0,
        });
    }

    pub fn remove_replica(&mut self, node_id: NodeId) -> Option<ReplicaState> {
        let removed = self.replicas.remove(&node_id);
        if removed.is_some() {
            self.check_commit();
        }
        removed
    }

    /// True if some replica is off cooldown and behind the local log.
    pub fn has(&self) -> bool {
        let last = self.queue.last_index();
        self.replicas.values().any(|r| {
            r.forward_idle_tick >= self.cfg.forward_interval_ticks
                && r.outbound_forwarded_index >= self.commit_index
                && r.outbound_forwarded_index < last
        })
    }

    /// Drain every entry not yet handed out: one batch per destination,
    /// point-to-point entries only to their target, the rest to everyone.
    pub fn ready(&mut self) -> Vec<OutboundBatch> {
        let last = self.queue.last_index();
        if self.sent_index >= last {
            return Vec::new();
        }
        let msgs = self.queue.slice_with_size(self.sent_index + 1, last + 1, 0);
        self.sent_index = last;
        self.queue.truncate_to(last + 1);

        let mut batches: BTreeMap<NodeId, Vec<UserMessage>> = BTreeMap::new();
        for msg in msgs {
            if msg.to_node != 0 {
                if self.replicas.contains_key(&msg.to_node) {
                    batches.entry(msg.to_node).or_default().push(msg);
                } else {
                    tracing::warn!(
                        to_node = msg.to_node,
                        index = msg.index,
                        "outbound destination not tracked, dropping"
                    );
                }
                continue;
            }
            for node_id in self.replicas.keys() {
                batches.entry(*node_id).or_default().push(msg.clone());
            }
        }
        for node_id in batches.keys() {
            if let Some(replica) = self.replicas.get_mut(node_id) {
                replica.forward_idle_tick = 0;
            }
        }
        batches
            .into_iter()
            .filter(|(_, messages)| !messages.is_empty())
            .map(|(to, messages)| OutboundBatch {
                from: self.cfg.node_id,
                to,
                messages,
            })
            .collect()
    }

    /// Record an ack from `node_id`. Regressions are ignored.
    pub fn update_replica_index(&mut self, node_id: NodeId, index: u64) {
        let last = self.queue.last_index();
        let Some(replica) = self.replicas.get_mut(&node_id) else {
            tracing::debug!(node_id, index, "ack from untracked replica");
            return;
        };
        replica.forward_idle_tick = 0;
        let index = index.min(last);
        if index > replica.outbound_forwarded_index {
            replica.outbound_forwarded_index = index;
            self.check_commit();
        }
    }

    pub fn update_replica_heartbeat(&mut self, node_id: NodeId) {
        if let Some(replica) = self.replicas.get_mut(&node_id) {
            replica.heartbeat_idle_tick = 0;
        }
    }

    /// Advance idle counters and evict replicas that stopped heartbeating.
    pub fn tick(&mut self) {
        let timeout = self.cfg.heartbeat_timeout_ticks;
        let mut evicted = Vec::new();
        for replica in self.replicas.values_mut() {
            replica.forward_idle_tick = replica.forward_idle_tick.saturating_add(1);
            replica.heartbeat_idle_tick = replica.heartbeat_idle_tick.saturating_add(1);
            if replica.heartbeat_idle_tick >= timeout {
                evicted.push(replica.node_id);
            }
        }
        if evicted.is_empty() {
            return;
        }
        for node_id in &evicted {
            self.replicas.remove(node_id);
            tracing::info!(node_id, "outbound replica evicted after heartbeat timeout");
        }
        self.check_commit();
    }

    /// Forget the queue, replicas and indices.
    pub fn reset(&mut self) {
        self.queue.reset();
        self.replicas.clear();
        self.commit_index = 0;
        self.sent_index = 0;
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_index(&self) -> u64 {
        self.queue.last_index()
    }

    /// Entries appended but not yet drained by `ready`.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn replica_ids(&self) -> Vec<NodeId> {
        self.replicas.keys().copied().collect()
    }

    pub fn replica(&self, node_id: NodeId) -> Option<&ReplicaState> {
        self.replicas.get(&node_id)
    }

    fn check_commit(&mut self) {
        let Some(min) = self
            .replicas
            .values()
            .map(|r| r.outbound_forwarded_index)
            .min()
        else {
            return;
        };
        let candidate = min.min(self.queue.last_index());
        if candidate > self.commit_index {
            self.commit_index = candidate;
            self.sent_index = self.sent_index.max(candidate);
            self.queue.truncate_to(candidate + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(replicas: &[NodeId]) -> OutboundQueue {
        let mut q = OutboundQueue::new(OutboundConfig {
            node_id: 1,
            forward_interval_ticks: 1,
            heartbeat_timeout_ticks: 3,
        });
        for id in replicas {
            q.add_replica(*id);
        }
        q
    }

    fn fill(q: &mut OutboundQueue, n: u64) {
        for i in 0..n {
            q.append(UserMessage::broadcast(i, "u1", "hi"));
        }
    }

    #[test]
    fn commit_waits_for_slowest_replica_until_evicted() {
        let mut q = queue(&[2, 3, 4]);
        fill(&mut q, 5);
        q.update_replica_index(2, 5);
        q.update_replica_index(3, 5);
        q.update_replica_index(4, 2);
        assert_eq!(q.commit_index(), 2);

        // 2 and 3 keep heartbeating, 4 goes dark.
        for _ in 0..3 {
            q.update_replica_heartbeat(2);
            q.update_replica_heartbeat(3);
            q.tick();
        }
        assert_eq!(q.replica_ids(), vec![2, 3]);
        assert_eq!(q.commit_index(), 5);
    }

    #[test]
    fn full_ack_commits_everything_and_drains() {
        let mut q = queue(&[2, 3]);
        fill(&mut q, 4);
        assert!(q.has());
        let batches = q.ready();
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.messages.len() == 4 && b.from == 1));

        q.update_replica_index(2, 4);
        q.update_replica_index(3, 4);
        assert_eq!(q.commit_index(), 4);
        assert_eq!(q.len(), 0);
        assert!(!q.has());
    }

    #[test]
    fn ready_never_returns_an_entry_twice() {
        let mut q = queue(&[2]);
        fill(&mut q, 3);
        assert_eq!(q.ready().len(), 1);
        assert!(q.ready().is_empty());
        fill(&mut q, 1);
        let batches = q.ready();
        assert_eq!(batches[0].messages.len(), 1);
        assert_eq!(batches[0].messages[0].index, 4);
    }

    #[test]
    fn point_to_point_entries_reach_only_their_target() {
        let mut q = queue(&[2, 3]);
        q.append(UserMessage::to_node(1, 3, "u1", "direct"));
        q.append(UserMessage::broadcast(2, "u2", "all"));
        q.append(UserMessage::to_node(3, 9, "u3", "nowhere"));
        let batches = q.ready();
        let to2 = batches.iter().find(|b| b.to == 2).unwrap();
        let to3 = batches.iter().find(|b| b.to == 3).unwrap();
        assert_eq!(to2.messages.iter().map(|m| m.id).collect::<Vec<_>>(), vec![2]);
        assert_eq!(to3.messages.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn ack_regressions_are_ignored() {
        let mut q = queue(&[2]);
        fill(&mut q, 5);
        q.update_replica_index(2, 4);
        q.update_replica_index(2, 1);
        assert_eq!(q.replica(2).unwrap().outbound_forwarded_index, 4);
        assert_eq!(q.commit_index(), 4);
    }

    #[test]
    fn forward_cooldown_gates_has() {
        let mut q = queue(&[2]);
        fill(&mut q, 2);
        assert!(q.has());
        q.ready();
        assert!(!q.has(), "just forwarded, replica is cooling down");
        q.tick();
        assert!(q.has(), "unacked entries become eligible again");
        q.update_replica_index(2, 2);
        q.tick();
        assert!(!q.has());
    }

    #[test]
    fn eviction_never_regresses_commit() {
        let mut q = queue(&[2, 3]);
        fill(&mut q, 3);
        q.update_replica_index(2, 3);
        q.update_replica_index(3, 3);
        assert_eq!(q.commit_index(), 3);
        q.add_replica(4);
        assert_eq!(q.replica(4).unwrap().outbound_forwarded_index, 3);
        for _ in 0..3 {
            q.tick();
        }
        assert!(q.replica_ids().is_empty());
        assert_eq!(q.commit_index(), 3);
    }

    #[test]
    fn reset_forgets_everything() {
        let mut q = queue(&[2]);
        fill(&mut q, 3);
        q.update_replica_index(2, 2);
        q.reset();
        assert_eq!(
            (q.commit_index(), q.last_index(), q.len()),
            (0, 0, 0)
        );
        assert!(q.replica_ids().is_empty());
        assert_eq!(q.append(UserMessage::broadcast(1, "u", "x")), 1);
    }
}
