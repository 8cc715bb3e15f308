use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::outbound::{OutboundConfig, OutboundQueue};
use super::types::{NodeId, UserMessage};

/// Push primitive for forwarded batches. Acks come back separately through
/// `Outbox::ack`.
#[async_trait]
pub trait OutboundForwarder: Send + Sync + 'static {
    async fn forward(&self, to: NodeId, messages: Vec<UserMessage>) -> anyhow::Result<()>;
}

/// Drives an `OutboundQueue`: ticks it and forwards whatever is ready.
pub struct Outbox {
    queue: Mutex<OutboundQueue>,
    forwarder: Arc<dyn OutboundForwarder>,
    notify: Notify,
    tick_interval: Duration,
}

impl Outbox {
    pub fn new(
        cfg: OutboundConfig,
        forwarder: Arc<dyn OutboundForwarder>,
        tick_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(OutboundQueue::new(cfg)),
            forwarder,
            notify: Notify::new(),
            tick_interval,
        })
    }

    fn queue(&self) -> MutexGuard<'_, OutboundQueue> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn append(&self, msg: UserMessage) -> u64 {
        let index = self.queue().append(msg);
        self.notify.notify_one();
        index
    }

    pub fn add_replica(&self, node_id: NodeId) {
        self.queue().add_replica(node_id);
    }

    pub fn remove_replica(&self, node_id: NodeId) {
        self.queue().remove_replica(node_id);
    }

    pub fn ack(&self, node_id: NodeId, index: u64) {
        self.queue().update_replica_index(node_id, index);
    }

    pub fn heartbeat(&self, node_id: NodeId) {
        self.queue().update_replica_heartbeat(node_id);
    }

    /// Ownership moved elsewhere; drop all state.
    pub fn reset(&self) {
        self.queue().reset();
    }

    pub fn commit_index(&self) -> u64 {
        self.queue().commit_index()
    }

    pub fn last_index(&self) -> u64 {
        self.queue().last_index()
    }

    pub fn replica_ids(&self) -> Vec<NodeId> {
        self.queue().replica_ids()
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let outbox = self.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(outbox.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => outbox.queue().tick(),
                    _ = outbox.notify.notified() => {}
                    _ = cancel.cancelled() => break,
                }
                outbox.forward_ready().await;
            }
        })
    }

    /// Forward every ready batch concurrently. Returns the number of
    /// messages handed to the forwarder successfully.
    pub async fn forward_ready(&self) -> usize {
        let batches = {
            let mut queue = self.queue();
            if !queue.has() {
                return 0;
            }
            queue.ready()
        };

        let mut futs = FuturesUnordered::new();
        for batch in batches {
            let forwarder = self.forwarder.clone();
            futs.push(async move {
                let count = batch.messages.len();
                let res = forwarder.forward(batch.to, batch.messages).await;
                (batch.to, count, res)
            });
        }

        let mut forwarded = 0;
        while let Some((to, count, res)) = futs.next().await {
            match res {
                Ok(()) => forwarded += count,
                Err(err) => {
                    tracing::warn!(error = ?err, to, messages = count, "outbound forward failed")
                }
            }
        }
        forwarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(NodeId, Vec<u64>)>>,
    }

    #[async_trait]
    impl OutboundForwarder for Recorder {
        async fn forward(&self, to: NodeId, messages: Vec<UserMessage>) -> anyhow::Result<()> {
            if to == 99 {
                anyhow::bail!("node 99 unreachable");
            }
            let ids = messages.iter().map(|m| m.index).collect();
            self.sent.lock().unwrap().push((to, ids));
            Ok(())
        }
    }

    fn outbox(recorder: Arc<Recorder>) -> Arc<Outbox> {
        Outbox::new(OutboundConfig::new(1), recorder, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn forward_ready_fans_out_and_acks_commit() {
        let recorder = Arc::new(Recorder::default());
        let outbox = outbox(recorder.clone());
        outbox.add_replica(2);
        outbox.add_replica(99);
        outbox.append(UserMessage::broadcast(1, "u1", "a"));
        outbox.append(UserMessage::broadcast(2, "u1", "b"));

        assert_eq!(outbox.forward_ready().await, 2);
        assert_eq!(outbox.forward_ready().await, 0);
        assert_eq!(*recorder.sent.lock().unwrap(), vec![(2, vec![1, 2])]);

        outbox.ack(2, 2);
        assert_eq!(outbox.commit_index(), 0, "node 99 still holds commit back");
        outbox.remove_replica(99);
        assert_eq!(outbox.commit_index(), 2);
    }

    #[tokio::test]
    async fn spawned_driver_forwards_appended_messages() {
        let recorder = Arc::new(Recorder::default());
        let outbox = outbox(recorder.clone());
        outbox.add_replica(2);
        let cancel = CancellationToken::new();
        let task = outbox.spawn(cancel.clone());

        outbox.append(UserMessage::to_node(7, 2, "u9", "direct"));
        for _ in 0..100 {
            if !recorder.sent.lock().unwrap().is_empty() {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*recorder.sent.lock().unwrap(), vec![(2, vec![1])]);

        cancel.cancel();
        task.await.unwrap();
    }
}
