use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Delivery channels a notification job can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Channel {
    Email,
    Push,
    Ws,
    Sms,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Email => write!(f, "email"),
            Channel::Push => write!(f, "push"),
            Channel::Ws => write!(f, "ws"),
            Channel::Sms => write!(f, "sms"),
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(Channel::Email),
            "push" => Ok(Channel::Push),
            "ws" => Ok(Channel::Ws),
            "sms" => Ok(Channel::Sms),
            other => Err(AppError::Validation(format!("Unknown channel '{}'", other))),
        }
    }
}

/// Job priority carried in the metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

/// Persisted delivery state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum DeliveryStatus {
    Retrying,
    Sent,
    Failed,
    Expired,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Retrying => write!(f, "RETRYING"),
            DeliveryStatus::Sent => write!(f, "SENT"),
            DeliveryStatus::Failed => write!(f, "FAILED"),
            DeliveryStatus::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Lifecycle state of a recurring campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum CampaignStatus {
    Active,
    Inactive,
    Paused,
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignStatus::Active => write!(f, "ACTIVE"),
            CampaignStatus::Inactive => write!(f, "INACTIVE"),
            CampaignStatus::Paused => write!(f, "PAUSED"),
        }
    }
}

/// Where a job came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMeta {
    /// Originating event type (e.g. `user_registered`, `campaign_triggered`)
    pub event_type: String,
    pub event_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
    #[serde(default)]
    pub priority: Priority,
}

fn default_locale() -> String {
    "ru".to_string()
}

fn default_data() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// One unit of notification work for one user on one channel.
///
/// Jobs are immutable once created; all mutable delivery state lives in the
/// [`DeliveryRecord`] keyed by `job_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationJob {
    pub job_id: Uuid,
    pub user_id: Uuid,
    pub channel: Channel,
    pub template_code: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    /// Template substitution variables (JSON object)
    #[serde(default = "default_data")]
    pub data: serde_json::Value,
    pub meta: JobMeta,
    pub created_at: DateTime<Utc>,
    /// Earliest dispatch time
    pub send_after: Option<DateTime<Utc>>,
    /// Deadline after which the job is void
    pub expires_at: Option<DateTime<Utc>>,
}

impl NotificationJob {
    /// Ingestion-time checks that serde alone cannot express.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.template_code.trim().is_empty() {
            return Err(AppError::Validation("template_code must not be empty".into()));
        }
        if !self.data.is_object() {
            return Err(AppError::Validation("data must be a JSON object".into()));
        }
        if let (Some(send_after), Some(expires_at)) = (self.send_after, self.expires_at) {
            if send_after > expires_at {
                return Err(AppError::Validation(format!(
                    "send_after ({}) is later than expires_at ({})",
                    send_after, expires_at
                )));
            }
        }
        Ok(())
    }
}

/// Persisted delivery state, one row per job.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryRecord {
    pub job_id: Uuid,
    pub user_id: Uuid,
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub error_message: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// Attempts made so far, clamped to zero for corrupt rows.
    pub fn attempt_count(&self) -> u32 {
        self.attempts.max(0) as u32
    }
}

/// Resolved per-user destinations. Every field is independently optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contacts {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub push_token: Option<String>,
    pub ws_session_id: Option<String>,
    pub phone: Option<String>,
}

impl Contacts {
    /// The destination address/token for `channel`, if one was resolved.
    pub fn destination(&self, channel: Channel) -> Option<&str> {
        let field = match channel {
            Channel::Email => &self.email,
            Channel::Push => &self.push_token,
            Channel::Ws => &self.ws_session_id,
            Channel::Sms => &self.phone,
        };
        field.as_deref().filter(|value| !value.trim().is_empty())
    }
}

/// A subject/body template pair for one (code, locale, channel).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Template {
    pub template_code: String,
    pub locale: String,
    pub channel: Channel,
    pub subject: Option<String>,
    pub body: String,
}

/// A recurring campaign driven by a cron schedule.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub template_code: String,
    pub segment_id: String,
    pub schedule_cron: String,
    pub status: CampaignStatus,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub runs_count: i32,
    pub max_runs: Option<i32>,
}
