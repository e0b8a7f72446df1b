//! Contact resolution: maps a user id to per-channel destinations.
//!
//! Resolution never fails. When the auth service is not configured or does
//! not answer, synthesized contacts are returned so the pipeline keeps moving;
//! a missing field only fails the send for that field's channel.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use herald_common::types::Contacts;

#[async_trait]
pub trait ContactResolver: Send + Sync {
    async fn resolve(&self, user_id: Uuid) -> Contacts;
}

/// Subset of the auth service's user representation we care about.
#[derive(Debug, Deserialize)]
struct UserContactsResponse {
    email: Option<String>,
    push_token: Option<String>,
    ws_session_id: Option<String>,
    phone: Option<String>,
}

/// Resolves contacts through `GET {base_url}/api/v1/users/{id}`.
pub struct AuthContactResolver {
    base_url: Option<String>,
    http: reqwest::Client,
}

impl AuthContactResolver {
    pub fn new(base_url: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.map(|url| url.trim_end_matches('/').to_string()),
            http,
        })
    }

    /// Placeholder contacts for environments without an auth service.
    pub fn fallback_contacts(user_id: Uuid) -> Contacts {
        Contacts {
            user_id,
            email: Some(format!("user-{}@example.com", user_id)),
            push_token: Some(format!("push-{}", user_id)),
            ws_session_id: Some(format!("ws-{}", user_id)),
            phone: None,
        }
    }

    async fn fetch(&self, base_url: &str, user_id: Uuid) -> anyhow::Result<Contacts> {
        let url = format!("{}/api/v1/users/{}", base_url, user_id);
        let response: UserContactsResponse = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(Contacts {
            user_id,
            email: response.email,
            push_token: response.push_token,
            ws_session_id: response.ws_session_id,
            phone: response.phone,
        })
    }
}

#[async_trait]
impl ContactResolver for AuthContactResolver {
    async fn resolve(&self, user_id: Uuid) -> Contacts {
        let Some(base_url) = self.base_url.as_deref() else {
            return Self::fallback_contacts(user_id);
        };

        match self.fetch(base_url, user_id).await {
            Ok(contacts) => contacts,
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "Contact lookup failed, using fallback contacts"
                );
                Self::fallback_contacts(user_id)
            }
        }
    }
}
