//! Reconciliation, scrape orchestration, weekly snapshots, historical backfill
//! and scheduling for the job tracker.

use std::sync::Arc;

use anyhow::{Context, Result};
use jobtrack_core::SourceRegistry;
use jobtrack_storage::{HttpFetcher, PostingStore};
use tokio_cron_scheduler::JobScheduler;
use tracing::info;

pub mod backfill;
pub mod config;
pub mod orchestrator;
pub mod reconcile;
pub mod scheduler;
pub mod snapshot;

pub use backfill::{
    extract_job_count, BackfillReport, Backfiller, CoverageLevel, HistoricalPoint, SourceCoverage,
    WaybackClient,
};
pub use config::{load_source_registry, SyncConfig};
pub use orchestrator::{
    RegisteredSource, RunError, RunProgress, RunSummary, ScrapeOrchestrator, SourceOutcome,
};
pub use reconcile::{ReconcileError, Reconciler};
pub use snapshot::{
    compare_snapshots, CategoryDelta, Comparison, ComparisonScope, SnapshotEngine, SnapshotSummary,
    WeekPoint, YearOverYear,
};

pub const CRATE_NAME: &str = "jobtrack-sync";

/// Every service of the tracker, wired from one configuration.
pub struct JobTracker {
    pub config: SyncConfig,
    pub registry: SourceRegistry,
    pub store: PostingStore,
    pub http: Arc<HttpFetcher>,
    pub reconciler: Arc<Reconciler>,
    pub orchestrator: Arc<ScrapeOrchestrator>,
    pub snapshots: Arc<SnapshotEngine>,
}

impl JobTracker {
    /// Connect and migrate the database, load the source registry and build the adapters.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let store = PostingStore::connect(&config.database_url)
            .await
            .with_context(|| format!("connecting to {}", config.database_url))?;
        store.migrate().await.context("running migrations")?;
        Self::with_store(config, store).await
    }

    pub async fn with_store(config: SyncConfig, store: PostingStore) -> Result<Self> {
        let registry = load_source_registry(&config.sources_path()).await?;
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let reconciler = Arc::new(Reconciler::new(store.clone()));
        let orchestrator = Arc::new(ScrapeOrchestrator::from_registry(
            &registry,
            reconciler.clone(),
            http.clone(),
            &config,
        )?);
        let snapshots = Arc::new(SnapshotEngine::new(store.clone()));

        info!(
            sources = registry.sources.len(),
            enabled = orchestrator.sources().len(),
            "job tracker ready"
        );
        Ok(Self {
            config,
            registry,
            store,
            http,
            reconciler,
            orchestrator,
            snapshots,
        })
    }

    pub fn backfiller(&self) -> Backfiller {
        Backfiller::new(
            self.store.clone(),
            WaybackClient::new(self.http.clone(), self.config.backfill_delay),
        )
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        scheduler::maybe_build_scheduler(&self.config, self.orchestrator.clone(), self.snapshots.clone())
            .await
    }
}
