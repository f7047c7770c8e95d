use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::message::{Message, StreamId};

/// The external collaborator a producer re-enters once it has decoded
/// a spooled message and wants it delivered again. Production
/// deployments are expected to supply their own implementation wired
/// into the rest of the routing fabric.
pub trait Router: Send + Sync {
    /// Re-injects `msg` at the stream it originally came from.
    fn route_to_origin(&self, msg: Message);

    /// Delivers `msg` to `stream`, regardless of its recorded origin.
    fn enqueue(&self, stream: StreamId, msg: Message);
}

/// An in-process, channel-backed [`Router`] used by the integration
/// tests and by the CLI's `serve` command when no external router is
/// wired in. Each stream gets its own unbounded channel on first use.
pub struct ChannelRouter {
    channels: Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
}

impl Default for ChannelRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribes to a stream, creating its channel if this is the
    /// first subscriber. Only one receiver is kept per stream; a
    /// second call replaces the first (matching the single-consumer
    /// shape this router is meant for).
    pub fn subscribe(&self, stream: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .expect("router mutex poisoned")
            .insert(stream.to_string(), tx);
        rx
    }
}

impl Router for ChannelRouter {
    fn route_to_origin(&self, msg: Message) {
        let origin = msg.origin().clone();
        self.enqueue(origin, msg);
    }

    fn enqueue(&self, stream: StreamId, msg: Message) {
        let channels = self.channels.lock().expect("router mutex poisoned");
        if let Some(tx) = channels.get(stream.name()) {
            // A full/closed receiver means nobody is listening anymore;
            // dropping the message here mirrors a router with no live
            // subscriber for the target stream.
            let _ = tx.send(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn enqueue_delivers_to_subscriber() {
        let router = ChannelRouter::new();
        let mut rx = router.subscribe("orders");

        let msg = Message::new(Bytes::from_static(b"hi"), StreamId::new("orders", 1));
        router.route_to_origin(msg);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.payload(), &Bytes::from_static(b"hi"));
    }
}
