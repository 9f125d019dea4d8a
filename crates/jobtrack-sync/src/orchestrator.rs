//! Runs every configured source through its adapter and the reconciler,
//! isolating failures per source and publishing live progress.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobtrack_adapters::{adapter_for_source, AdapterError, SourceAdapter};
use jobtrack_core::{RawPosting, ReconciliationStats, SourceConfig, SourceRegistry};
use jobtrack_storage::{BackoffPolicy, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::reconcile::Reconciler;

const EMPTY_RESULT_ERROR: &str = "no postings scraped";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome {
    Succeeded {
        stats: ReconciliationStats,
        attempts: usize,
    },
    Failed {
        error: String,
        attempts: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub totals: ReconciliationStats,
    pub sources_succeeded: usize,
    pub sources_failed: usize,
    pub failed_sources: Vec<String>,
    pub outcomes: BTreeMap<String, SourceOutcome>,
}

impl RunSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            totals: ReconciliationStats::default(),
            sources_succeeded: 0,
            sources_failed: 0,
            failed_sources: Vec::new(),
            outcomes: BTreeMap::new(),
        }
    }

    fn record(&mut self, source_id: &str, outcome: SourceOutcome) {
        match &outcome {
            SourceOutcome::Succeeded { stats, .. } => {
                self.totals.new_count += stats.new_count;
                self.totals.updated_count += stats.updated_count;
                self.totals.inactive_count += stats.inactive_count;
                self.totals.total_scraped += stats.total_scraped;
                self.totals.skipped_count += stats.skipped_count;
                self.sources_succeeded += 1;
            }
            SourceOutcome::Failed { .. } => {
                self.sources_failed += 1;
                self.failed_sources.push(source_id.to_string());
            }
        }
        self.outcomes.insert(source_id.to_string(), outcome);
    }
}

/// Point-in-time copy of the progress of the tracked run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunProgress {
    pub is_running: bool,
    pub run_id: Option<Uuid>,
    pub current_source: Option<String>,
    /// 1-based position of `current_source`.
    pub current_index: usize,
    pub total_sources: usize,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: Option<RunSummary>,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("unknown source `{0}`")]
    UnknownSource(String),
    #[error("source `{source_id}` failed after {attempts} attempt(s): {message}")]
    SourceFailed {
        source_id: String,
        attempts: usize,
        message: String,
    },
}

/// A configured source paired with the adapter that scrapes it.
#[derive(Clone)]
pub struct RegisteredSource {
    pub config: SourceConfig,
    pub adapter: Arc<dyn SourceAdapter>,
}

struct ActiveRun {
    run_id: Uuid,
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

/// Run coordinator shared by scheduled runs, on-demand runs and progress readers.
pub struct ScrapeOrchestrator {
    reconciler: Arc<Reconciler>,
    sources: Vec<RegisteredSource>,
    retry: BackoffPolicy,
    skip_empty_results: bool,
    progress: Mutex<RunProgress>,
    active: Mutex<Option<ActiveRun>>,
}

impl ScrapeOrchestrator {
    pub fn new(reconciler: Arc<Reconciler>, sources: Vec<RegisteredSource>) -> Self {
        Self {
            reconciler,
            sources,
            retry: BackoffPolicy::default(),
            skip_empty_results: false,
            progress: Mutex::new(RunProgress::default()),
            active: Mutex::new(None),
        }
    }

    /// Orchestrator over the enabled sources of `registry`, tuned by `config`.
    pub fn from_registry(
        registry: &SourceRegistry,
        reconciler: Arc<Reconciler>,
        http: Arc<HttpFetcher>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let sources = registry
            .enabled()
            .map(|source| {
                let adapter = adapter_for_source(source, http.clone(), &config.workspace_root)
                    .with_context(|| format!("building adapter for {}", source.source_id))?;
                Ok(RegisteredSource {
                    config: source.clone(),
                    adapter: Arc::from(adapter),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(reconciler, sources)
            .with_retry(config.retry_policy())
            .with_skip_empty_results(config.skip_empty_results))
    }

    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_skip_empty_results(mut self, skip: bool) -> Self {
        self.skip_empty_results = skip;
        self
    }

    pub fn sources(&self) -> &[RegisteredSource] {
        &self.sources
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Run every source in order and wait for the summary.
    ///
    /// With `with_progress`, this run takes over the shared progress state.
    pub async fn run_all(&self, with_progress: bool) -> RunSummary {
        let run_id = Uuid::new_v4();
        if with_progress {
            self.begin_progress(run_id).await;
        }
        self.execute(run_id, with_progress, None).await
    }

    pub async fn run_one(&self, source_id: &str) -> Result<ReconciliationStats, RunError> {
        let source = self
            .sources
            .iter()
            .find(|s| s.config.source_id == source_id)
            .ok_or_else(|| RunError::UnknownSource(source_id.to_string()))?;

        let span = info_span!("source_run", run_id = %Uuid::new_v4(), source_id);
        match self.run_source(source).instrument(span).await {
            SourceOutcome::Succeeded { stats, .. } => Ok(stats),
            SourceOutcome::Failed { error, attempts } => Err(RunError::SourceFailed {
                source_id: source_id.to_string(),
                attempts,
                message: error,
            }),
        }
    }

    /// Start a background run and return immediately.
    ///
    /// A run still marked active is cancelled and its progress replaced.
    pub async fn run_all_async(self: &Arc<Self>) -> bool {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            if !previous.supervisor.is_finished() {
                warn!(previous_run_id = %previous.run_id, "replacing async run that is still running");
                previous.cancel.cancel();
            }
        }

        let run_id = Uuid::new_v4();
        self.begin_progress(run_id).await;

        let cancel = CancellationToken::new();
        let worker = {
            let this = Arc::clone(self);
            let cancel = cancel.clone();
            tokio::spawn(async move { this.execute(run_id, true, Some(&cancel)).await })
        };
        let supervisor = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                match worker.await {
                    Ok(summary) => debug!(%run_id, failed = summary.sources_failed, "async run finished"),
                    Err(err) => {
                        error!(%run_id, error = %err, "async run worker crashed");
                        this.update_progress(run_id, |p| {
                            p.is_running = false;
                            p.current_source = None;
                            p.finished_at = Some(Utc::now());
                        })
                        .await;
                    }
                }
            })
        };

        info!(%run_id, sources = self.sources.len(), "async run started");
        *active = Some(ActiveRun {
            run_id,
            cancel,
            supervisor,
        });
        true
    }

    /// Wait for the current async run, if any, and return its summary.
    pub async fn wait_for_async_run(&self) -> Option<RunSummary> {
        let run = self.active.lock().await.take()?;
        if let Err(err) = run.supervisor.await {
            error!(run_id = %run.run_id, error = %err, "async run supervisor failed");
        }
        let progress = self.progress().await;
        progress.summary.filter(|s| s.run_id == run.run_id)
    }

    pub async fn progress(&self) -> RunProgress {
        self.progress.lock().await.clone()
    }

    async fn begin_progress(&self, run_id: Uuid) {
        let mut progress = self.progress.lock().await;
        *progress = RunProgress {
            is_running: true,
            run_id: Some(run_id),
            total_sources: self.sources.len(),
            started_at: Some(Utc::now()),
            ..Default::default()
        };
    }

    /// Apply `f` only while `run_id` still owns the progress state.
    async fn update_progress(&self, run_id: Uuid, f: impl FnOnce(&mut RunProgress)) {
        let mut progress = self.progress.lock().await;
        if progress.run_id == Some(run_id) {
            f(&mut progress);
        }
    }

    async fn execute(
        &self,
        run_id: Uuid,
        track: bool,
        cancel: Option<&CancellationToken>,
    ) -> RunSummary {
        let mut summary = RunSummary::new(run_id, Utc::now());

        for (index, source) in self.sources.iter().enumerate() {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                warn!(%run_id, "run was replaced; stopping before remaining sources");
                break;
            }
            let source_id = source.config.source_id.as_str();
            if track {
                self.update_progress(run_id, |p| {
                    p.current_source = Some(source_id.to_string());
                    p.current_index = index + 1;
                })
                .await;
            }

            let span = info_span!("source_run", %run_id, source_id);
            let outcome = self.run_source(source).instrument(span).await;

            if track {
                let succeeded = matches!(outcome, SourceOutcome::Succeeded { .. });
                self.update_progress(run_id, |p| {
                    if succeeded {
                        p.completed.push(source_id.to_string());
                    } else {
                        p.failed.push(source_id.to_string());
                    }
                })
                .await;
            }
            summary.record(source_id, outcome);
        }

        summary.finished_at = Utc::now();
        info!(
            %run_id,
            succeeded = summary.sources_succeeded,
            failed = summary.sources_failed,
            new = summary.totals.new_count,
            updated = summary.totals.updated_count,
            inactive = summary.totals.inactive_count,
            "run complete"
        );

        if track {
            let finished = summary.clone();
            self.update_progress(run_id, |p| {
                p.is_running = false;
                p.current_source = None;
                p.finished_at = Some(finished.finished_at);
                p.summary = Some(finished);
            })
            .await;
        }
        summary
    }

    async fn run_source(&self, source: &RegisteredSource) -> SourceOutcome {
        let config = &source.config;
        let (result, attempts) = self.fetch_with_retry(source).await;

        let mut batch = match result {
            Ok(batch) => batch,
            Err(err) => {
                return SourceOutcome::Failed {
                    error: err.to_string(),
                    attempts,
                }
            }
        };
        if batch.is_empty() && self.skip_empty_results {
            warn!("adapter returned no postings; skipping reconciliation");
            return SourceOutcome::Failed {
                error: EMPTY_RESULT_ERROR.to_string(),
                attempts,
            };
        }

        for posting in &mut batch {
            if posting.source_identifier.is_empty() {
                posting.source_identifier = config.source_id.clone();
            }
        }

        match self
            .reconciler
            .reconcile_source(&batch, &config.company, &config.source_id)
            .await
        {
            Ok(stats) => SourceOutcome::Succeeded { stats, attempts },
            Err(err) => {
                error!(error = %err, "reconciliation failed");
                SourceOutcome::Failed {
                    error: err.to_string(),
                    attempts,
                }
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        source: &RegisteredSource,
    ) -> (Result<Vec<RawPosting>, AdapterError>, usize) {
        let max_attempts = self.retry.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match source.adapter.fetch_postings(&source.config).await {
                Ok(batch) => {
                    debug!(attempt, count = batch.len(), "adapter returned postings");
                    return (Ok(batch), attempt);
                }
                Err(err) if attempt < max_attempts => {
                    warn!(attempt, error = %err, "scrape attempt failed; retrying");
                    tokio::time::sleep(self.retry.delay_for_attempt(attempt - 1)).await;
                }
                Err(err) => {
                    error!(attempt, error = %err, "scrape failed on every attempt");
                    return (Err(err), attempt);
                }
            }
        }
    }
}
