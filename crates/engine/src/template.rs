//! Template lookup and rendering.
//!
//! Templates are stored per (code, locale, channel) and rendered with
//! MiniJinja against the job's data map. Undefined variables are errors, and
//! output is HTML-escaped.

use async_trait::async_trait;
use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use sqlx::PgPool;

use herald_common::error::AppError;
use herald_common::types::{Channel, Template};

use crate::error::DeliveryError;

/// Lookup of subject/body templates.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn find(
        &self,
        template_code: &str,
        locale: &str,
        channel: Channel,
    ) -> Result<Option<Template>, AppError>;
}

/// Postgres-backed template store on the `templates` table.
#[derive(Clone)]
pub struct PgTemplateStore {
    pool: PgPool,
}

impl PgTemplateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateStore for PgTemplateStore {
    async fn find(
        &self,
        template_code: &str,
        locale: &str,
        channel: Channel,
    ) -> Result<Option<Template>, AppError> {
        let template: Option<Template> = sqlx::query_as(
            r#"
            SELECT template_code, locale, channel, subject, body
            FROM templates
            WHERE template_code = $1
              AND locale = $2
              AND channel = $3
            LIMIT 1
            "#,
        )
        .bind(template_code)
        .bind(locale)
        .bind(channel.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(template)
    }
}

/// A rendered subject/body pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

/// Strict MiniJinja renderer.
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_auto_escape_callback(|_| AutoEscape::Html);
        Self { env }
    }

    /// Render a single template string against `data`.
    pub fn render(&self, source: &str, data: &serde_json::Value) -> Result<String, DeliveryError> {
        if source.is_empty() {
            return Ok(String::new());
        }
        self.env
            .render_str(source, data)
            .map_err(|e| DeliveryError::TemplateRender(e.to_string()))
    }

    /// Render both halves of a template. A missing subject renders as empty.
    pub fn render_message(
        &self,
        template: &Template,
        data: &serde_json::Value,
    ) -> Result<RenderedMessage, DeliveryError> {
        let subject = self.render(template.subject.as_deref().unwrap_or_default(), data)?;
        let body = self.render(&template.body, data)?;
        Ok(RenderedMessage { subject, body })
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}
