//! Concrete channel senders.

pub mod email;
pub mod logging;

use std::sync::Arc;

use herald_common::types::Channel;
use herald_engine::dispatch::{ChannelRegistry, ChannelSender};

pub use email::SmtpEmailSender;
pub use logging::LoggingSender;

/// Registry with `email` served by `email_sender` and every other channel by a
/// [`LoggingSender`].
pub fn default_registry(email_sender: Arc<dyn ChannelSender>) -> ChannelRegistry {
    ChannelRegistry::new()
        .register(Channel::Email, email_sender)
        .register(Channel::Push, Arc::new(LoggingSender::new(Channel::Push)))
        .register(Channel::Ws, Arc::new(LoggingSender::new(Channel::Ws)))
        .register(Channel::Sms, Arc::new(LoggingSender::new(Channel::Sms)))
}
