//! Caller-visible reactor errors.

use super::types::MsgType;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReactorError {
    /// The substrate refused a message (stale term, wrong role, gap).
    #[error("substrate rejected {msg_type:?}: {reason}")]
    Substrate { msg_type: MsgType, reason: String },
    /// A proposal was refused before reaching the log (backpressure).
    #[error("proposal rejected: {0}")]
    ProposalRejected(String),
    /// An append/apply/truncate task failed; the handler stops progressing.
    #[error("storage failure on handler `{key}`: {reason}")]
    Storage { key: String, reason: String },
    #[error("handler `{0}` not found")]
    HandlerNotFound(String),
    /// The caller stopped waiting (deadline or token). The proposal itself
    /// still completes.
    #[error("proposal wait cancelled")]
    Cancelled,
    #[error("reactor stopped")]
    Stopped,
}

impl ReactorError {
    pub(crate) fn substrate(msg_type: MsgType, reason: impl Into<String>) -> Self {
        Self::Substrate {
            msg_type,
            reason: reason.into(),
        }
    }

    pub(crate) fn storage(key: &str, err: &anyhow::Error) -> Self {
        Self::Storage {
            key: key.to_string(),
            reason: format!("{err:#}"),
        }
    }
}
