use anyhow::anyhow;
use tokio::sync::mpsc;

use super::types::{Envelope, Transport};

/// `Transport` that hands envelopes to an unbounded channel. The receiving
/// side decides how (and whether) they reach the destination node.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.tx
            .send(envelope)
            .map_err(|err| anyhow!("transport channel closed (to node {})", err.0.message.to))
    }
}
