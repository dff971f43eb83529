//! Async message bus — the central nervous system of Oxibot.
//!
//! Replaces nanobot's `bus/queue.py` (asyncio.Queue-based MessageBus).
//! Uses tokio::sync::mpsc bounded channels.

use super::types::{InboundMessage, OutboundMessage};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// How long `poll_inbound` waits for a message before yielding control back
/// to the caller (so a shutdown signal can be checked between polls).
pub const INBOUND_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The message bus connecting channels ↔ agent loop.
///
/// - Channels publish to `inbound` (user messages arriving)
/// - Agent loop consumes from `inbound`, processes, publishes to `outbound`
/// - Channel manager consumes from `outbound` and routes to correct channel
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: tokio::sync::Mutex<mpsc::Receiver<OutboundMessage>>,
}

impl MessageBus {
    /// Create a new message bus with the given buffer capacity.
    pub fn new(buffer_size: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer_size);
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer_size);

        MessageBus {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
        }
    }

    /// Publish a message from a channel to the agent (inbound).
    pub async fn publish_inbound(&self, msg: InboundMessage) -> Result<(), mpsc::error::SendError<InboundMessage>> {
        self.inbound_tx.send(msg).await
    }

    /// Consume the next inbound message (blocks until available).
    /// Returns None if all senders are dropped.
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await
    }

    /// Publish a response from the agent to a channel (outbound).
    ///
    /// Outbound never blocks the caller for long: on a full queue, the
    /// oldest queued message is dropped to make room rather than waiting for
    /// a slow channel consumer (e.g. a stalled `ChannelManager`) to drain it.
    pub async fn publish_outbound(&self, msg: OutboundMessage) -> Result<(), mpsc::error::SendError<OutboundMessage>> {
        let mut pending = msg;
        loop {
            match self.outbound_tx.try_send(pending) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Closed(returned)) => {
                    return Err(mpsc::error::SendError(returned));
                }
                Err(mpsc::error::TrySendError::Full(returned)) => {
                    pending = returned;
                    let mut rx = self.outbound_rx.lock().await;
                    let evicted = rx.try_recv();
                    drop(rx);
                    if evicted.is_err() {
                        // Drained concurrently by the consumer; fall back to
                        // a normal blocking send for this one message.
                        return self.outbound_tx.send(pending).await;
                    }
                    warn!("outbound queue full, dropped oldest message to make room");
                }
            }
        }
    }

    /// Consume the next outbound message (blocks until available).
    /// Returns None if all senders are dropped.
    pub async fn consume_outbound(&self) -> Option<OutboundMessage> {
        let mut rx = self.outbound_rx.lock().await;
        rx.recv().await
    }

    /// Wait up to `INBOUND_POLL_INTERVAL` for the next inbound message.
    ///
    /// Returns `Ok(None)` on a plain timeout (caller should loop and check
    /// shutdown state), `Ok(Some(msg))` on a message, and `Err(())` once all
    /// senders have been dropped (the bus is permanently closed).
    pub async fn poll_inbound(&self) -> Result<Option<InboundMessage>, ()> {
        let mut rx = self.inbound_rx.lock().await;
        match tokio::time::timeout(INBOUND_POLL_INTERVAL, rx.recv()).await {
            Ok(Some(msg)) => Ok(Some(msg)),
            Ok(None) => Err(()),
            Err(_elapsed) => Ok(None),
        }
    }

    /// Get a clone of the inbound sender (for channels to use).
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }

    /// Get a clone of the outbound sender (for the agent loop to use).
    pub fn outbound_sender(&self) -> mpsc::Sender<OutboundMessage> {
        self.outbound_tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inbound_message_flow() {
        let bus = MessageBus::new(10);

        let msg = InboundMessage::new("telegram", "user_1", "chat_1", "Hello!");
        bus.publish_inbound(msg).await.unwrap();

        let received = bus.consume_inbound().await.unwrap();
        assert_eq!(received.channel, "telegram");
        assert_eq!(received.content, "Hello!");
    }

    #[tokio::test]
    async fn test_outbound_message_flow() {
        let bus = MessageBus::new(10);

        let msg = OutboundMessage::new("discord", "channel_42", "Response here");
        bus.publish_outbound(msg).await.unwrap();

        let received = bus.consume_outbound().await.unwrap();
        assert_eq!(received.channel, "discord");
        assert_eq!(received.content, "Response here");
    }

    #[tokio::test]
    async fn test_message_ordering() {
        let bus = MessageBus::new(10);

        // Publish 3 messages
        for i in 1..=3 {
            let msg = InboundMessage::new("cli", "local", "default", format!("msg-{}", i));
            bus.publish_inbound(msg).await.unwrap();
        }

        // Consume in order
        let m1 = bus.consume_inbound().await.unwrap();
        let m2 = bus.consume_inbound().await.unwrap();
        let m3 = bus.consume_inbound().await.unwrap();

        assert_eq!(m1.content, "msg-1");
        assert_eq!(m2.content, "msg-2");
        assert_eq!(m3.content, "msg-3");
    }

    #[tokio::test]
    async fn test_sender_clone_works() {
        let bus = MessageBus::new(10);
        let sender = bus.inbound_sender();

        // Send via cloned sender
        let msg = InboundMessage::new("slack", "user_x", "channel_y", "From clone");
        sender.send(msg).await.unwrap();

        // Receive via bus
        let received = bus.consume_inbound().await.unwrap();
        assert_eq!(received.channel, "slack");
        assert_eq!(received.content, "From clone");
    }

    #[tokio::test]
    async fn test_multiple_producers() {
        let bus = std::sync::Arc::new(MessageBus::new(10));

        // Simulate 2 channels publishing concurrently
        let bus1 = bus.clone();
        let bus2 = bus.clone();

        let h1 = tokio::spawn(async move {
            let msg = InboundMessage::new("telegram", "u1", "c1", "from telegram");
            bus1.publish_inbound(msg).await.unwrap();
        });

        let h2 = tokio::spawn(async move {
            let msg = InboundMessage::new("discord", "u2", "c2", "from discord");
            bus2.publish_inbound(msg).await.unwrap();
        });

        h1.await.unwrap();
        h2.await.unwrap();

        // Both messages should be in the queue
        let r1 = bus.consume_inbound().await.unwrap();
        let r2 = bus.consume_inbound().await.unwrap();

        let channels: Vec<&str> = vec![r1.channel.as_str(), r2.channel.as_str()];
        assert!(channels.contains(&"telegram"));
        assert!(channels.contains(&"discord"));
    }

    #[tokio::test]
    async fn test_full_round_trip() {
        // Simulate: channel → bus → agent → bus → channel
        let bus = std::sync::Arc::new(MessageBus::new(10));

        // 1. Channel publishes inbound
        let inbound = InboundMessage::new("telegram", "user_42", "chat_99", "What is 2+2?");
        bus.publish_inbound(inbound).await.unwrap();

        // 2. Agent consumes inbound
        let received = bus.consume_inbound().await.unwrap();
        assert_eq!(received.content, "What is 2+2?");

        // 3. Agent processes and publishes outbound
        let response = OutboundMessage::new(
            received.channel.clone(),
            received.chat_id.clone(),
            "The answer is 4.",
        );
        bus.publish_outbound(response).await.unwrap();

        // 4. Channel manager consumes outbound
        let outbound = bus.consume_outbound().await.unwrap();
        assert_eq!(outbound.channel, "telegram");
        assert_eq!(outbound.chat_id, "chat_99");
        assert_eq!(outbound.content, "The answer is 4.");
    }

    #[tokio::test]
    async fn test_publish_outbound_drops_oldest_when_full() {
        let bus = MessageBus::new(2);

        for i in 1..=2 {
            let msg = OutboundMessage::new("cli", "default", format!("msg-{i}"));
            bus.publish_outbound(msg).await.unwrap();
        }

        // Queue is now full (capacity 2). This publish must not block
        // forever — it evicts "msg-1" and enqueues "msg-3".
        let msg3 = OutboundMessage::new("cli", "default", "msg-3");
        tokio::time::timeout(Duration::from_secs(1), bus.publish_outbound(msg3))
            .await
            .expect("publish_outbound must not block on a full queue")
            .unwrap();

        let first = bus.consume_outbound().await.unwrap();
        let second = bus.consume_outbound().await.unwrap();
        assert_eq!(first.content, "msg-2");
        assert_eq!(second.content, "msg-3");
    }

    #[tokio::test]
    async fn test_poll_inbound_returns_message() {
        let bus = MessageBus::new(10);
        let msg = InboundMessage::new("cli", "local", "default", "hi");
        bus.publish_inbound(msg).await.unwrap();

        let received = bus.poll_inbound().await.unwrap();
        assert_eq!(received.unwrap().content, "hi");
    }

    #[tokio::test]
    async fn test_poll_inbound_closed_bus_errors() {
        let MessageBus { inbound_tx, inbound_rx, outbound_tx, outbound_rx } = MessageBus::new(10);
        drop(inbound_tx);
        let bus = MessageBus { inbound_tx: mpsc::channel(1).0, inbound_rx, outbound_tx, outbound_rx };
        let result = bus.poll_inbound().await;
        assert!(result.is_err());
    }
}
