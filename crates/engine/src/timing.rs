//! Timing gate: expiration and scheduled-delay decisions for a single job.
//!
//! All waits happen on the task that owns the job, so a long `send_after`
//! never holds up other jobs. Waits are raced against the shutdown token.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use herald_common::types::NotificationJob;

/// Whether the job's deadline has passed. A job is still valid at exactly `expires_at`.
pub fn is_expired(job: &NotificationJob, now: DateTime<Utc>) -> bool {
    job.expires_at.is_some_and(|expires_at| now > expires_at)
}

/// How long the job must wait before its first attempt, capped at `max_wait`.
///
/// Jobs scheduled further out than the cap are dispatched at the cap boundary
/// instead of pinning a worker slot indefinitely.
pub fn send_delay(job: &NotificationJob, now: DateTime<Utc>, max_wait: Duration) -> Duration {
    let Some(send_after) = job.send_after else {
        return Duration::ZERO;
    };
    if send_after <= now {
        return Duration::ZERO;
    }

    (send_after - now)
        .to_std()
        .map(|delay| delay.min(max_wait))
        .unwrap_or(Duration::ZERO)
}

/// Sleep for `duration` on the current task.
///
/// Returns `false` if `shutdown` fired first (or had already fired).
pub async fn sleep_or_cancel(duration: Duration, shutdown: &CancellationToken) -> bool {
    if shutdown.is_cancelled() {
        return false;
    }
    if duration.is_zero() {
        return true;
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.cancelled() => false,
    }
}
