use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::SyncConfig;
use crate::orchestrator::ScrapeOrchestrator;
use crate::snapshot::SnapshotEngine;

/// Cron jobs for the daily run and the weekly snapshot; `None` when scheduling is disabled.
///
/// The returned scheduler is not started.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: Arc<ScrapeOrchestrator>,
    snapshots: Arc<SnapshotEngine>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let daily = Job::new_async(config.daily_cron.as_str(), move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            info!("scheduled daily run triggered");
            let summary = orchestrator.run_all(false).await;
            if summary.sources_failed > 0 {
                error!(failed = ?summary.failed_sources, "scheduled run had failing sources");
            }
        })
    })
    .with_context(|| format!("creating daily job for cron {}", config.daily_cron))?;
    sched.add(daily).await.context("adding daily job")?;

    let weekly = Job::new_async(config.weekly_cron.as_str(), move |_uuid, _l| {
        let snapshots = snapshots.clone();
        Box::pin(async move {
            info!("scheduled weekly snapshot triggered");
            if let Err(err) = snapshots.capture_weekly_snapshot().await {
                error!(error = %err, "scheduled snapshot capture failed");
            }
        })
    })
    .with_context(|| format!("creating weekly job for cron {}", config.weekly_cron))?;
    sched.add(weekly).await.context("adding weekly job")?;

    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::Reconciler;
    use jobtrack_storage::PostingStore;

    async fn parts() -> (Arc<ScrapeOrchestrator>, Arc<SnapshotEngine>) {
        let store = PostingStore::in_memory().await.unwrap();
        let reconciler = Arc::new(Reconciler::new(store.clone()));
        (
            Arc::new(ScrapeOrchestrator::new(reconciler, Vec::new())),
            Arc::new(SnapshotEngine::new(store)),
        )
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let (orchestrator, snapshots) = parts().await;
        let sched = maybe_build_scheduler(&SyncConfig::default(), orchestrator, snapshots)
            .await
            .unwrap();
        assert!(sched.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn enabled_scheduler_accepts_default_crons() {
        let (orchestrator, snapshots) = parts().await;
        let config = SyncConfig {
            scheduler_enabled: true,
            ..SyncConfig::default()
        };
        let sched = maybe_build_scheduler(&config, orchestrator, snapshots).await.unwrap();
        assert!(sched.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_cron_is_reported() {
        let (orchestrator, snapshots) = parts().await;
        let config = SyncConfig {
            scheduler_enabled: true,
            daily_cron: "every day please".into(),
            ..SyncConfig::default()
        };
        let err = maybe_build_scheduler(&config, orchestrator, snapshots).await.err().unwrap();
        assert!(err.to_string().contains("daily job"));
    }
}
