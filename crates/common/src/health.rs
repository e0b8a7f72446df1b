//! File-based readiness and liveness markers for container health checks.
//!
//! The ready file exists only while the process is wired up and serving. The
//! heartbeat file is rewritten with the current Unix timestamp on a fixed
//! interval, so a stale mtime means the runtime is stuck.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;

#[derive(Debug, Clone)]
pub struct HealthFiles {
    ready_file: PathBuf,
    heartbeat_file: PathBuf,
}

impl HealthFiles {
    pub fn new(ready_file: impl Into<PathBuf>, heartbeat_file: impl Into<PathBuf>) -> Self {
        Self {
            ready_file: ready_file.into(),
            heartbeat_file: heartbeat_file.into(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.ready_file.clone(), config.heartbeat_file.clone())
    }

    pub fn ready_file(&self) -> &Path {
        &self.ready_file
    }

    pub fn heartbeat_file(&self) -> &Path {
        &self.heartbeat_file
    }

    pub async fn mark_ready(&self) {
        if let Err(e) = tokio::fs::write(&self.ready_file, "ok\n").await {
            tracing::warn!(path = %self.ready_file.display(), error = %e, "Failed to write ready file");
        }
    }

    pub async fn clear_ready(&self) {
        match tokio::fs::remove_file(&self.ready_file).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.ready_file.display(), error = %e, "Failed to remove ready file");
            }
        }
    }

    /// Rewrite the heartbeat file every `interval` until `shutdown` fires.
    pub async fn heartbeat_loop(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let stamp = Utc::now().timestamp().to_string();
                    if let Err(e) = tokio::fs::write(&self.heartbeat_file, stamp).await {
                        tracing::warn!(
                            path = %self.heartbeat_file.display(),
                            error = %e,
                            "Failed to write heartbeat file"
                        );
                    }
                }
            }
        }

        tracing::debug!("Heartbeat stopped");
    }
}
