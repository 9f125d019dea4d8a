use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use jobtrack_core::SourceRegistry;
use jobtrack_storage::{BackoffPolicy, HttpClientConfig};
use tokio::fs;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub workspace_root: PathBuf,
    pub sources_file: PathBuf,
    pub scheduler_enabled: bool,
    pub daily_cron: String,
    pub weekly_cron: String,
    pub retry_attempts: usize,
    pub retry_delay: Duration,
    /// Treat an empty adapter result as a failed source instead of reconciling it.
    pub skip_empty_results: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub backfill_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True")
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; missing or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://data/jobs.db?mode=rwc".to_string()),
            workspace_root: lookup("JOBTRACK_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            sources_file: lookup("JOBTRACK_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.yaml")),
            scheduler_enabled: lookup("JOBTRACK_SCHEDULER_ENABLED")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
            daily_cron: lookup("JOBTRACK_DAILY_CRON").unwrap_or_else(|| "0 0 9 * * *".to_string()),
            weekly_cron: lookup("JOBTRACK_WEEKLY_CRON")
                .unwrap_or_else(|| "0 0 2 * * Sun".to_string()),
            retry_attempts: lookup("JOBTRACK_RETRY_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            retry_delay: Duration::from_secs(
                lookup("JOBTRACK_RETRY_DELAY_SECS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5),
            ),
            skip_empty_results: lookup("JOBTRACK_SKIP_EMPTY_RESULTS")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
            user_agent: lookup("JOBTRACK_USER_AGENT")
                .unwrap_or_else(|| "jobtrack-bot/0.1".to_string()),
            http_timeout_secs: lookup("JOBTRACK_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            backfill_delay: Duration::from_millis(
                lookup("JOBTRACK_BACKFILL_DELAY_MS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(2000),
            ),
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join(&self.sources_file)
    }

    pub fn retry_policy(&self) -> BackoffPolicy {
        BackoffPolicy::fixed(self.retry_attempts, self.retry_delay)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

pub async fn load_source_registry(path: &Path) -> Result<SourceRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
