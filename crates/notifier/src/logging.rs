//! Senders for channels without a real transport yet (push, websocket, sms).
//!
//! They validate the destination and record the delivery in the log.

use async_trait::async_trait;

use herald_common::types::Channel;
use herald_engine::dispatch::ChannelSender;

pub struct LoggingSender {
    channel: Channel,
}

impl LoggingSender {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ChannelSender for LoggingSender {
    async fn send(&self, destination: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        if destination.trim().is_empty() {
            anyhow::bail!("Recipient {} destination is empty", self.channel);
        }

        tracing::info!(
            channel = %self.channel,
            to = destination,
            subject,
            body,
            "Notification delivered"
        );
        Ok(())
    }
}
