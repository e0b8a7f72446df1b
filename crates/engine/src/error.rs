//! Per-attempt delivery failures.
//!
//! The retry engine treats every variant the same way: the attempt failed and
//! counts against the job's budget.

use thiserror::Error;

use herald_common::types::Channel;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Template not found: code={code} locale={locale} channel={channel}")]
    TemplateNotFound {
        code: String,
        locale: String,
        channel: Channel,
    },

    #[error("Template render error: {0}")]
    TemplateRender(String),

    #[error("Unsupported channel: {0}")]
    UnsupportedChannel(Channel),

    #[error("No {0} destination resolved for user")]
    MissingDestination(Channel),

    #[error(transparent)]
    Send(#[from] anyhow::Error),
}
