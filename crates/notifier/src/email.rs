//! SMTP email sender.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use herald_engine::dispatch::ChannelSender;

/// Sends rendered notifications as HTML email through a plain SMTP relay.
pub struct SmtpEmailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpEmailSender {
    /// Relay without TLS or credentials, as used by local mail catchers and
    /// in-cluster relays.
    pub fn new(host: &str, port: u16, from: &str) -> anyhow::Result<Self> {
        let from: Mailbox = from
            .parse()
            .with_context(|| format!("Invalid SMTP_FROM address '{}'", from))?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            .port(port)
            .timeout(Some(Duration::from_secs(10)))
            .build();

        tracing::info!(host, port, "SMTP email sender initialized");

        Ok(Self { transport, from })
    }

    pub(crate) fn build_message(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<Message> {
        let to: Mailbox = to
            .parse()
            .with_context(|| format!("Invalid recipient address '{}'", to))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(body.to_string())?;

        Ok(message)
    }
}

#[async_trait]
impl ChannelSender for SmtpEmailSender {
    async fn send(&self, destination: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        let message = self.build_message(destination, subject, body)?;

        tracing::debug!(to = destination, subject, "Sending email via SMTP");
        self.transport.send(message).await?;

        Ok(())
    }
}
