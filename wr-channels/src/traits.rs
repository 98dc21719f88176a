use crate::types::OutboundMessage;
use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier, e.g. "wechat".
    fn channel_id(&self) -> &str;

    /// Start background work (token refresh and the like). Inbound messages arrive
    /// through webhook routes, not through the adapter.
    async fn start(&self, shutdown: CancellationToken) -> Result<()>;

    /// Push a message to a user outside of the passive-reply window.
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()>;
}
