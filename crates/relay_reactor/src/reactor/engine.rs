use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::error::ReactorError;
use super::handler::{Handler, ProposeResult};
use super::sub::SubReactor;
use super::types::{LogEntry, Message, ReactorConfig, Transport};

/// Fixed pool of sub-reactors sharing every handler by key hash.
///
/// All public methods are safe to call from any task; they only enqueue work
/// and wake the owning loop.
pub struct Reactor {
    cfg: ReactorConfig,
    subs: Vec<Arc<SubReactor>>,
    stop: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Reactor {
    pub fn new(cfg: ReactorConfig, transport: Arc<dyn Transport>) -> anyhow::Result<Self> {
        cfg.validate()?;
        let stop = CancellationToken::new();
        let subs = (0..cfg.sub_reactor_count)
            .map(|i| {
                Arc::new(SubReactor::new(
                    i,
                    cfg.clone(),
                    transport.clone(),
                    stop.child_token(),
                ))
            })
            .collect();
        Ok(Self {
            cfg,
            subs,
            stop,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> u64 {
        self.cfg.node_id
    }

    /// Spawn the sub-reactor loops. Calling it again is a no-op.
    pub fn start(&self) {
        let Ok(mut tasks) = self.tasks.lock() else {
            return;
        };
        if !tasks.is_empty() || self.stop.is_cancelled() {
            return;
        }
        for sub in &self.subs {
            tasks.push(tokio::spawn(sub.clone().run()));
        }
        tracing::info!(
            node_id = self.cfg.node_id,
            sub_reactors = self.subs.len(),
            "reactor started"
        );
    }

    /// Stop every loop and force-close all outstanding wait handles.
    pub async fn stop(&self) {
        self.stop.cancel();
        let tasks = self
            .tasks
            .lock()
            .map(|mut g| std::mem::take(&mut *g))
            .unwrap_or_default();
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = ?err, "sub-reactor exited abnormally");
            }
        }
        // Loops that never started still hold waiters.
        let mut snapshot = Vec::new();
        for sub in &self.subs {
            sub.handlers.snapshot(&mut snapshot);
            for handler in &snapshot {
                handler.close(ReactorError::Stopped);
            }
        }
        tracing::info!(node_id = self.cfg.node_id, "reactor stopped");
    }

    /// Sub-reactor index owning `key`. Stable for the life of the process.
    pub fn shard_of(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.subs.len() as u64) as usize
    }

    fn sub_for(&self, key: &str) -> &Arc<SubReactor> {
        &self.subs[self.shard_of(key)]
    }

    /// Register a handler with the sub-reactor owning its key, replacing any
    /// handler already registered under that key.
    pub fn add_handler(&self, handler: Handler) -> Arc<Handler> {
        let handler = Arc::new(handler);
        let sub = self.sub_for(handler.key());
        if let Some(old) = sub.handlers.add(handler.clone()) {
            tracing::warn!(handler = %old.key(), "replaced existing handler");
            old.close(ReactorError::HandlerNotFound(old.key().to_string()));
        }
        sub.advance.signal();
        handler
    }

    pub fn remove_handler(&self, key: &str) -> Option<Arc<Handler>> {
        let handler = self.sub_for(key).handlers.remove(key)?;
        handler.close(ReactorError::HandlerNotFound(key.to_string()));
        Some(handler)
    }

    pub fn handler(&self, key: &str) -> Option<Arc<Handler>> {
        self.sub_for(key).handlers.get(key)
    }

    pub fn handler_count(&self) -> usize {
        self.subs.iter().map(|s| s.handlers.len()).sum()
    }

    /// Tick every handler on its next loop pass, independent of the
    /// sub-reactors' own timers.
    pub fn tick(&self) {
        for sub in &self.subs {
            sub.request_tick();
        }
    }

    /// Queue entries for `key` without waiting. Indices are assigned on the
    /// owning loop; use `propose_and_wait` to learn them. A handler halted
    /// by a storage failure rejects the batch with that failure.
    pub fn propose(&self, key: &str, entries: Vec<LogEntry>) -> Result<(), ReactorError> {
        if self.stop.is_cancelled() {
            return Err(ReactorError::Stopped);
        }
        if entries.is_empty() {
            return Ok(());
        }
        let sub = self.sub_for(key);
        let handler = sub
            .handlers
            .get(key)
            .ok_or_else(|| ReactorError::HandlerNotFound(key.to_string()))?;
        handler.add_propose(entries, None)?;
        sub.advance.signal();
        Ok(())
    }

    /// Propose and wait until every entry is applied, or `timeout` elapses.
    pub async fn propose_and_wait(
        &self,
        key: &str,
        entries: Vec<LogEntry>,
        timeout: Duration,
    ) -> Result<Vec<ProposeResult>, ReactorError> {
        self.wait_proposal(key, entries, time::sleep(timeout)).await
    }

    /// Propose and wait until every entry is applied, or `cancel` fires.
    pub async fn propose_and_wait_with(
        &self,
        key: &str,
        entries: Vec<LogEntry>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ProposeResult>, ReactorError> {
        self.wait_proposal(key, entries, cancel.cancelled()).await
    }

    async fn wait_proposal(
        &self,
        key: &str,
        entries: Vec<LogEntry>,
        cancel: impl Future<Output = ()>,
    ) -> Result<Vec<ProposeResult>, ReactorError> {
        if self.stop.is_cancelled() {
            return Err(ReactorError::Stopped);
        }
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let sub = self.sub_for(key);
        let handler = sub
            .handlers
            .get(key)
            .ok_or_else(|| ReactorError::HandlerNotFound(key.to_string()))?;
        let (tx, rx) = oneshot::channel();
        let proposal = handler.add_propose(entries, Some(tx))?;
        sub.advance.signal();

        tokio::select! {
            res = rx => match res {
                Ok(res) => res,
                Err(_) => Err(ReactorError::Stopped),
            },
            _ = cancel => {
                // The proposal itself keeps going; only this caller stops waiting.
                handler.remove_wait(proposal);
                Err(ReactorError::Cancelled)
            }
        }
    }

    /// Deliver a message received from a peer. Messages for unknown or
    /// failed handlers are dropped.
    pub fn add_message(&self, key: &str, msg: Message) {
        let sub = self.sub_for(key);
        let Some(handler) = sub.handlers.get(key) else {
            tracing::warn!(handler = %key, msg_type = ?msg.msg_type, "message for unknown handler, dropping");
            return;
        };
        let msg_type = msg.msg_type;
        if !handler.add_message(msg) {
            tracing::debug!(handler = %key, ?msg_type, "handler closed, dropping message");
            return;
        }
        sub.advance.signal();
    }
}
