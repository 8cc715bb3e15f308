//! Deferred storage I/O polled by the event loop.
//!
//! A `Task` wraps one blocking storage call. It is created on the loop,
//! started onto the blocking pool, and later polled via `is_finished` /
//! `take_outcome`. Nothing on the loop ever awaits a task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use tokio::sync::Notify;

use super::types::Message;

/// Coalescing wake-up signal for one sub-reactor.
///
/// Any number of `signal` calls between two loop passes collapse into one
/// wake-up.
#[derive(Clone, Default)]
pub struct Advance {
    inner: Arc<AdvanceInner>,
}

#[derive(Default)]
struct AdvanceInner {
    notify: Notify,
    pending: AtomicBool,
}

impl Advance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        if !self.inner.pending.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_one();
        }
    }

    /// True while a signal has been raised and not yet consumed.
    pub fn is_pending(&self) -> bool {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Wait for the next signal and consume it.
    pub async fn notified(&self) {
        self.inner.notify.notified().await;
        self.inner.pending.store(false, Ordering::Release);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum TaskKind {
    Init,
    Append,
    Truncate,
    Apply,
    GetLogs,
    TermStartIndex,
}

/// Result of a task executor: the message to step into the substrate and
/// whether completion should wake the loop.
pub(crate) struct TaskOutput {
    pub(crate) resp: Message,
    pub(crate) wake: bool,
}

impl TaskOutput {
    pub(crate) fn wake(resp: Message) -> Self {
        Self { resp, wake: true }
    }
}

type Exec = Box<dyn FnOnce() -> anyhow::Result<TaskOutput> + Send + 'static>;

pub(crate) struct Task {
    kind: TaskKind,
    index: u64,
    exec: Option<Exec>,
    state: Arc<TaskState>,
}

#[derive(Default)]
struct TaskState {
    finished: AtomicBool,
    outcome: Mutex<Option<anyhow::Result<Message>>>,
}

impl TaskState {
    /// First call wins; later calls are ignored.
    fn finish(&self, outcome: anyhow::Result<Message>) -> bool {
        let Ok(mut slot) = self.outcome.lock() else {
            return false;
        };
        if self.finished.load(Ordering::Acquire) {
            return false;
        }
        *slot = Some(outcome);
        self.finished.store(true, Ordering::Release);
        true
    }
}

impl Task {
    pub(crate) fn new<F>(kind: TaskKind, index: u64, exec: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<TaskOutput> + Send + 'static,
    {
        Self {
            kind,
            index,
            exec: Some(Box::new(exec)),
            state: Arc::new(TaskState::default()),
        }
    }

    pub(crate) fn kind(&self) -> TaskKind {
        self.kind
    }

    pub(crate) fn index(&self) -> u64 {
        self.index
    }

    pub(crate) fn is_started(&self) -> bool {
        self.exec.is_none()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::Acquire)
    }

    /// Take the result of a finished task. Returns `None` while running or
    /// once the outcome has already been taken.
    pub(crate) fn take_outcome(&self) -> Option<anyhow::Result<Message>> {
        if !self.is_finished() {
            return None;
        }
        self.state.outcome.lock().ok()?.take()
    }

    /// Run the executor on the blocking pool. Must be called from within a
    /// tokio runtime. A panicking executor finishes the task with an error.
    pub(crate) fn start(&mut self, advance: &Advance) {
        let Some(exec) = self.exec.take() else {
            return;
        };
        let state = self.state.clone();
        let advance = advance.clone();
        let kind = self.kind;
        tokio::spawn(async move {
            let (outcome, wake) = match tokio::task::spawn_blocking(exec).await {
                Ok(Ok(out)) => (Ok(out.resp), out.wake),
                Ok(Err(err)) => (Err(err), true),
                Err(join_err) => (Err(anyhow!("{kind:?} task aborted: {join_err}")), true),
            };
            state.finish(outcome);
            if wake {
                advance.signal();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::types::MsgType;
    use std::time::Duration;

    fn resp(index: u64) -> Message {
        Message {
            msg_type: MsgType::StoreAppendResp,
            index,
            ..Message::default()
        }
    }

    async fn wait_finished(task: &Task) {
        for _ in 0..200 {
            if task.is_finished() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task did not finish");
    }

    #[test]
    fn finish_is_idempotent() {
        let task = Task::new(TaskKind::Append, 3, || Ok(TaskOutput::wake(resp(3))));
        assert!(!task.is_finished());
        assert!(task.take_outcome().is_none());

        assert!(task.state.finish(Ok(resp(3))));
        assert!(!task.state.finish(Err(anyhow!("late"))));
        let outcome = task.take_outcome().expect("outcome");
        assert_eq!(outcome.expect("ok").index, 3);
        assert!(task.take_outcome().is_none());
    }

    #[tokio::test]
    async fn started_task_finishes_and_signals_advance() {
        let advance = Advance::new();
        let mut task = Task::new(TaskKind::Apply, 7, || Ok(TaskOutput::wake(resp(7))));
        assert!(!task.is_started());
        task.start(&advance);
        assert!(task.is_started());
        wait_finished(&task).await;
        tokio::time::timeout(Duration::from_secs(1), advance.notified())
            .await
            .expect("completion wakes the loop");
        assert_eq!(task.take_outcome().unwrap().unwrap().index, 7);
    }

    #[tokio::test]
    async fn quiet_task_does_not_signal_advance() {
        let advance = Advance::new();
        let mut task = Task::new(TaskKind::GetLogs, 1, || {
            Ok(TaskOutput {
                resp: resp(1),
                wake: false,
            })
        });
        task.start(&advance);
        wait_finished(&task).await;
        assert!(!advance.is_pending());
    }

    #[tokio::test]
    async fn failing_and_panicking_tasks_report_errors() {
        let advance = Advance::new();
        let mut failing = Task::new(TaskKind::Append, 1, || Err(anyhow!("disk full")));
        failing.start(&advance);
        wait_finished(&failing).await;
        let err = failing.take_outcome().unwrap().unwrap_err();
        assert!(err.to_string().contains("disk full"));

        let mut panicking = Task::new(TaskKind::Apply, 1, || -> anyhow::Result<TaskOutput> {
            panic!("boom")
        });
        panicking.start(&advance);
        wait_finished(&panicking).await;
        assert!(panicking.take_outcome().unwrap().is_err());
    }

    #[tokio::test]
    async fn advance_signals_coalesce() {
        let advance = Advance::new();
        advance.signal();
        advance.signal();
        advance.signal();
        tokio::time::timeout(Duration::from_millis(100), advance.notified())
            .await
            .expect("first wake");
        assert!(!advance.is_pending());
        let second = tokio::time::timeout(Duration::from_millis(30), advance.notified()).await;
        assert!(second.is_err(), "coalesced signals must wake once");
    }
}
