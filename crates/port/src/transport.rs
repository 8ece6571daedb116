use portbridge_core::{Error, PortMessage, Result};
use tokio::sync::mpsc;

/// Worker-side end of one port: the only thing the router needs is a way to
/// post a message back to the connected context.
pub trait PortSink: Send + Sync {
    fn post(&self, message: &PortMessage) -> Result<()>;
}

/// Sink backed by an unbounded channel; the receiving half is drained by
/// whatever owns the real transport (a WebSocket writer, a test).
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<PortMessage>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PortMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PortSink for ChannelSink {
    fn post(&self, message: &PortMessage) -> Result<()> {
        self.tx
            .send(message.clone())
            .map_err(|_| Error::Session("port is closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_post_and_closed_port() {
        let (sink, mut rx) = ChannelSink::new();
        sink.post(&PortMessage::DetachTab).unwrap();
        assert_eq!(rx.recv().await, Some(PortMessage::DetachTab));

        drop(rx);
        assert!(sink.post(&PortMessage::DetachTab).is_err());
    }
}
