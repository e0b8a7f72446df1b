//! Channel dispatch: one send attempt for one job.
//!
//! Resolves contacts and the template, renders both strings, picks the sender
//! registered for the job's channel and hands it the destination. Every
//! failure is returned as a [`DeliveryError`]; the retry engine does not look
//! at which kind it got.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use herald_common::types::{Channel, NotificationJob};

use crate::contacts::ContactResolver;
use crate::error::DeliveryError;
use crate::template::{TemplateRenderer, TemplateStore};

/// Transmission primitive for one delivery channel.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, destination: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// The operation the retry engine drives: try to deliver `job` once.
#[async_trait]
pub trait AttemptSend: Send + Sync {
    async fn attempt(&self, job: &NotificationJob) -> Result<(), DeliveryError>;
}

/// Mapping from channel to its sender.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    senders: HashMap<Channel, Arc<dyn ChannelSender>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, channel: Channel, sender: Arc<dyn ChannelSender>) -> Self {
        self.senders.insert(channel, sender);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<&Arc<dyn ChannelSender>> {
        self.senders.get(&channel)
    }

    pub fn channels(&self) -> impl Iterator<Item = Channel> + '_ {
        self.senders.keys().copied()
    }
}

/// Production [`AttemptSend`]: contacts → template → render → sender.
pub struct Dispatcher {
    contacts: Arc<dyn ContactResolver>,
    templates: Arc<dyn TemplateStore>,
    renderer: TemplateRenderer,
    senders: ChannelRegistry,
}

impl Dispatcher {
    pub fn new(
        contacts: Arc<dyn ContactResolver>,
        templates: Arc<dyn TemplateStore>,
        senders: ChannelRegistry,
    ) -> Self {
        Self {
            contacts,
            templates,
            renderer: TemplateRenderer::new(),
            senders,
        }
    }
}

#[async_trait]
impl AttemptSend for Dispatcher {
    async fn attempt(&self, job: &NotificationJob) -> Result<(), DeliveryError> {
        let contacts = self.contacts.resolve(job.user_id).await;

        let template = self
            .templates
            .find(&job.template_code, &job.locale, job.channel)
            .await
            .map_err(|e| DeliveryError::Send(e.into()))?
            .ok_or_else(|| DeliveryError::TemplateNotFound {
                code: job.template_code.clone(),
                locale: job.locale.clone(),
                channel: job.channel,
            })?;

        let message = self.renderer.render_message(&template, &job.data)?;

        let sender = self
            .senders
            .get(job.channel)
            .ok_or(DeliveryError::UnsupportedChannel(job.channel))?;

        let destination = contacts
            .destination(job.channel)
            .ok_or(DeliveryError::MissingDestination(job.channel))?;

        tracing::debug!(
            job_id = %job.job_id,
            channel = %job.channel,
            "Dispatching notification"
        );

        sender
            .send(destination, &message.subject, &message.body)
            .await?;

        Ok(())
    }
}
