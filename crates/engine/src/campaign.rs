//! Campaign due evaluation and the poll-tick scheduler that originates
//! recurring jobs.
//!
//! A campaign is due when it has never run, or when the first cron occurrence
//! strictly after its last trigger is not in the future. Campaigns that hit
//! `max_runs` are never due. An invalid cron expression is a configuration
//! error: the campaign is treated as not due and the problem is logged.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{Campaign, CampaignStatus, Channel, JobMeta, NotificationJob, Priority};

use crate::timing::sleep_or_cancel;

/// Event type stamped on jobs originated by the scheduler.
pub const CAMPAIGN_EVENT_TYPE: &str = "campaign_triggered";

/// Parse a cron expression.
///
/// Accepts classic 5-field crontab expressions (minute first, seconds assumed
/// `0`, day-of-week `0`/`7` = Sunday) as well as the 6/7-field form with
/// seconds (and optional year), which keeps the `cron` crate's own numbering.
pub fn parse_schedule(expr: &str) -> Result<Schedule, AppError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = if let [minute, hour, day_of_month, month, day_of_week] = fields[..] {
        format!(
            "0 {} {} {} {} {}",
            minute,
            hour,
            day_of_month,
            month,
            crontab_day_of_week(day_of_week)
                .map_err(|e| AppError::Config(format!("Invalid cron expression '{}': {}", expr, e)))?
        )
    } else {
        fields.join(" ")
    };

    Schedule::from_str(&normalized)
        .map_err(|e| AppError::Config(format!("Invalid cron expression '{}': {}", expr, e)))
}

/// Rewrite a crontab day-of-week field (`0`-`7`, Sunday = 0 or 7) into the
/// `cron` crate's numbering (`1`-`7`, Sunday = 1).
///
/// Numeric items are expanded to an explicit list so ranges ending on `7`
/// and steps stay correct. Items using day names pass through unchanged.
fn crontab_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut items = Vec::new();
    let mut days = Vec::new();

    for item in field.split(',') {
        if item.chars().any(|c| c.is_ascii_alphabetic()) {
            items.push(item.to_string());
            continue;
        }

        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step
                    .parse()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| format!("invalid day-of-week step in '{}'", item))?;
                (base, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = match base.split_once('-') {
            _ if base == "*" => (0, 6),
            Some((start, end)) => (parse_weekday(start)?, parse_weekday(end)?),
            None => {
                let day = parse_weekday(base)?;
                (day, if step.is_some() { 6 } else { day })
            }
        };
        if start > end {
            return Err(format!("day-of-week range '{}' is reversed", base));
        }

        let step = step.unwrap_or(1);
        days.extend(
            (start..=end)
                .filter(|day| (day - start) % step == 0)
                .map(|day| day % 7 + 1),
        );
    }

    days.sort_unstable();
    days.dedup();
    items.extend(days.iter().map(u32::to_string));
    Ok(items.join(","))
}

fn parse_weekday(value: &str) -> Result<u32, String> {
    value
        .parse()
        .ok()
        .filter(|day| *day <= 7)
        .ok_or_else(|| format!("day-of-week '{}' is not in 0-7", value))
}

/// Whether `campaign` should originate a job at `now`, surfacing cron errors.
pub fn evaluate_due(campaign: &Campaign, now: DateTime<Utc>) -> Result<bool, AppError> {
    if let Some(max_runs) = campaign.max_runs {
        if campaign.runs_count >= max_runs {
            return Ok(false);
        }
    }

    let Some(last_triggered_at) = campaign.last_triggered_at else {
        return Ok(true);
    };

    let schedule = parse_schedule(&campaign.schedule_cron)?;
    Ok(schedule
        .after(&last_triggered_at)
        .next()
        .is_some_and(|next_run| next_run <= now))
}

/// Whether `campaign` is due at `now`. Invalid cron expressions log an error
/// and evaluate to not due.
pub fn is_due(campaign: &Campaign, now: DateTime<Utc>) -> bool {
    match evaluate_due(campaign, now) {
        Ok(due) => due,
        Err(e) => {
            tracing::error!(
                campaign_id = %campaign.id,
                schedule_cron = %campaign.schedule_cron,
                error = %e,
                "Campaign has an invalid schedule"
            );
            false
        }
    }
}

/// Persistence for campaigns.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn list_active(&self) -> Result<Vec<Campaign>, AppError>;

    /// Record a trigger: bump `runs_count`, stamp `last_triggered_at` and
    /// deactivate the campaign once the cap is reached.
    ///
    /// Returns `false` when the conditional update matched nothing (campaign no
    /// longer active, or already at its cap).
    async fn mark_triggered(&self, campaign_id: Uuid) -> Result<bool, AppError>;
}

/// Destination for originated jobs.
#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn publish(&self, job: &NotificationJob) -> Result<(), AppError>;
}

/// Postgres-backed campaign store on the `campaigns` table.
#[derive(Clone)]
pub struct PgCampaignStore {
    pool: PgPool,
}

impl PgCampaignStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignStore for PgCampaignStore {
    async fn list_active(&self) -> Result<Vec<Campaign>, AppError> {
        let campaigns: Vec<Campaign> = sqlx::query_as(
            r#"
            SELECT id, name, template_code, segment_id, schedule_cron, status,
                   last_triggered_at, runs_count, max_runs
            FROM campaigns
            WHERE status = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(CampaignStatus::Active.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(campaigns)
    }

    async fn mark_triggered(&self, campaign_id: Uuid) -> Result<bool, AppError> {
        // Single conditional update: a second poller racing on the same campaign
        // cannot push runs_count past max_runs.
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET last_triggered_at = NOW(),
                runs_count = runs_count + 1,
                updated_at = NOW(),
                status = CASE
                    WHEN max_runs IS NOT NULL AND runs_count + 1 >= max_runs THEN 'INACTIVE'
                    ELSE status
                END
            WHERE id = $1
              AND status = 'ACTIVE'
              AND (max_runs IS NULL OR runs_count < max_runs)
            "#,
        )
        .bind(campaign_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

/// Counters for one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub active: usize,
    pub due: usize,
    pub triggered: usize,
}

/// Poll-tick driver: originates jobs for due campaigns.
pub struct CampaignScheduler {
    store: Arc<dyn CampaignStore>,
    publisher: Arc<dyn JobPublisher>,
    channels: Vec<Channel>,
    locale: String,
    /// Campaign id -> cron expression already reported as invalid.
    invalid_schedules: HashMap<Uuid, String>,
}

impl CampaignScheduler {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        publisher: Arc<dyn JobPublisher>,
        channels: Vec<Channel>,
        locale: impl Into<String>,
    ) -> Self {
        Self {
            store,
            publisher,
            channels,
            locale: locale.into(),
            invalid_schedules: HashMap::new(),
        }
    }

    /// Run ticks every `interval` until `shutdown` fires.
    pub async fn run(&mut self, interval: Duration, shutdown: CancellationToken) {
        tracing::info!(
            interval_secs = interval.as_secs(),
            channels = ?self.channels,
            "Campaign scheduler started"
        );

        loop {
            match self.run_tick(Utc::now()).await {
                Ok(summary) if summary.active > 0 => {
                    tracing::info!(
                        active = summary.active,
                        due = summary.due,
                        triggered = summary.triggered,
                        "Campaign tick complete"
                    );
                }
                Ok(_) => tracing::debug!("No active campaigns found on this tick"),
                Err(e) => tracing::error!(error = %e, "Failed to fetch active campaigns"),
            }

            if !sleep_or_cancel(interval, &shutdown).await {
                break;
            }
        }

        tracing::info!("Campaign scheduler stopped");
    }

    /// Evaluate every active campaign once and originate jobs for the due ones.
    pub async fn run_tick(&mut self, now: DateTime<Utc>) -> Result<TickSummary, AppError> {
        let campaigns = self.store.list_active().await?;
        let mut summary = TickSummary {
            active: campaigns.len(),
            ..Default::default()
        };

        for campaign in &campaigns {
            if !self.check_due(campaign, now) {
                tracing::debug!(
                    campaign_id = %campaign.id,
                    schedule_cron = %campaign.schedule_cron,
                    last_triggered_at = ?campaign.last_triggered_at,
                    runs_count = campaign.runs_count,
                    max_runs = ?campaign.max_runs,
                    "Campaign is not due yet"
                );
                continue;
            }

            summary.due += 1;
            if self.trigger(campaign, now).await {
                summary.triggered += 1;
            }
        }

        Ok(summary)
    }

    fn check_due(&mut self, campaign: &Campaign, now: DateTime<Utc>) -> bool {
        match evaluate_due(campaign, now) {
            Ok(due) => {
                self.invalid_schedules.remove(&campaign.id);
                due
            }
            Err(e) => {
                let already_reported = self
                    .invalid_schedules
                    .get(&campaign.id)
                    .is_some_and(|expr| *expr == campaign.schedule_cron);

                if already_reported {
                    tracing::debug!(campaign_id = %campaign.id, "Skipping campaign with invalid schedule");
                } else {
                    tracing::error!(
                        campaign_id = %campaign.id,
                        schedule_cron = %campaign.schedule_cron,
                        error = %e,
                        "Campaign has an invalid schedule and will not run until it is fixed"
                    );
                    self.invalid_schedules
                        .insert(campaign.id, campaign.schedule_cron.clone());
                }
                false
            }
        }
    }

    /// Publish the campaign's jobs, then record the trigger.
    async fn trigger(&self, campaign: &Campaign, now: DateTime<Utc>) -> bool {
        let jobs = self.build_jobs(campaign, now);

        for job in &jobs {
            if let Err(e) = self.publisher.publish(job).await {
                tracing::error!(
                    campaign_id = %campaign.id,
                    job_id = %job.job_id,
                    error = %e,
                    "Failed to publish campaign job, campaign not marked as triggered"
                );
                return false;
            }
        }

        match self.store.mark_triggered(campaign.id).await {
            Ok(true) => {
                tracing::info!(
                    campaign_id = %campaign.id,
                    jobs = jobs.len(),
                    "Campaign triggered"
                );
                true
            }
            Ok(false) => {
                tracing::warn!(
                    campaign_id = %campaign.id,
                    "Campaign jobs published but trigger not recorded (inactive or at max_runs)"
                );
                false
            }
            Err(e) => {
                tracing::error!(
                    campaign_id = %campaign.id,
                    error = %e,
                    "Failed to update campaign after trigger"
                );
                false
            }
        }
    }

    /// One job per configured channel, addressed to the campaign's segment.
    ///
    /// Campaign jobs carry the nil user id; the segment reference in `data`
    /// identifies the audience.
    pub fn build_jobs(&self, campaign: &Campaign, now: DateTime<Utc>) -> Vec<NotificationJob> {
        let event_id = Uuid::new_v4();

        self.channels
            .iter()
            .map(|&channel| NotificationJob {
                job_id: Uuid::new_v4(),
                user_id: Uuid::nil(),
                channel,
                template_code: campaign.template_code.clone(),
                locale: self.locale.clone(),
                data: serde_json::json!({
                    "segment_id": campaign.segment_id,
                    "campaign_id": campaign.id,
                }),
                meta: JobMeta {
                    event_type: CAMPAIGN_EVENT_TYPE.to_string(),
                    event_id: Some(event_id),
                    campaign_id: Some(campaign.id),
                    priority: Priority::Normal,
                },
                created_at: now,
                send_after: None,
                expires_at: None,
            })
            .collect()
    }
}
