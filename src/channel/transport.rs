use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// A message received from the broker
#[derive(Clone, Debug, PartialEq)]
pub struct Inbound {
    pub subject: String,
    pub payload: String,
}

/// Stream of messages for one subscription; ends when the connection drops
pub type InboundStream = BoxStream<'static, Inbound>;

/// Broker connection used by [`CommandChannel`](super::CommandChannel).
///
/// Implementations only move bytes. Timeouts, reconnects, resubscription
/// and callback routing all live in the channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish (or re-establish) the broker connection
    async fn connect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()>;

    /// Wait until everything published so far has reached the broker
    async fn flush(&self) -> Result<()>;

    async fn subscribe(&self, subject: &str) -> Result<InboundStream>;
}
