//! Merges one freshly scraped batch into the persisted active/inactive state of
//! a (company, source) pair.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobtrack_core::{
    classify, content_fingerprint, identity_fingerprint, normalize_location, Posting, RawPosting,
    ReconciliationStats,
};
use jobtrack_storage::{
    insert_posting, load_active_postings, mark_inactive, touch_posting, update_posting_content,
    NewPosting, PostingStore, StoreError,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("reconciliation rolled back: {0}")]
    Store(#[from] StoreError),
}

type PairKey = (String, String);

/// Reconciliation engine.
///
/// Each batch runs in one transaction. Batches for the same (company, source)
/// pair are serialized; different pairs proceed concurrently.
#[derive(Debug)]
pub struct Reconciler {
    store: PostingStore,
    locks: Mutex<HashMap<PairKey, Arc<Mutex<()>>>>,
}

impl Reconciler {
    pub fn new(store: PostingStore) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &PostingStore {
        &self.store
    }

    /// Reconcile `batch` for `company`, scoped to the source of the first item.
    ///
    /// An empty batch, or one whose first item carries no source, is scoped to
    /// every active posting of the company.
    pub async fn reconcile(
        &self,
        batch: &[RawPosting],
        company: &str,
    ) -> Result<ReconciliationStats, ReconcileError> {
        self.reconcile_at(batch, company, Utc::now()).await
    }

    pub async fn reconcile_at(
        &self,
        batch: &[RawPosting],
        company: &str,
        now: DateTime<Utc>,
    ) -> Result<ReconciliationStats, ReconcileError> {
        let source = batch
            .first()
            .map(|p| p.source_identifier.as_str())
            .filter(|s| !s.is_empty());
        self.reconcile_source_at(batch, company, source, now).await
    }

    /// Reconcile with an explicit source scope, so an empty batch closes only that source.
    pub async fn reconcile_source(
        &self,
        batch: &[RawPosting],
        company: &str,
        source: &str,
    ) -> Result<ReconciliationStats, ReconcileError> {
        self.reconcile_source_at(batch, company, Some(source), Utc::now()).await
    }

    pub async fn reconcile_source_at(
        &self,
        batch: &[RawPosting],
        company: &str,
        source: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ReconciliationStats, ReconcileError> {
        let lock = self.pair_lock(company, source).await;
        let _guard = lock.lock().await;

        let span = info_span!("reconcile", company, source = source.unwrap_or("*"), batch = batch.len());
        let stats = self
            .apply_batch(batch, company, source, now)
            .instrument(span)
            .await?;
        info!(
            company,
            source = source.unwrap_or("*"),
            new = stats.new_count,
            updated = stats.updated_count,
            inactive = stats.inactive_count,
            skipped = stats.skipped_count,
            "batch reconciled"
        );
        Ok(stats)
    }

    async fn pair_lock(&self, company: &str, source: Option<&str>) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry((company.to_string(), source.unwrap_or_default().to_string()))
            .or_default()
            .clone()
    }

    async fn apply_batch(
        &self,
        batch: &[RawPosting],
        company: &str,
        source: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ReconciliationStats, ReconcileError> {
        let mut stats = ReconciliationStats {
            total_scraped: batch.len(),
            ..Default::default()
        };

        // Dropping `tx` on an early return rolls the whole batch back.
        let mut tx = self.store.begin().await?;
        let prior = load_active_postings(&mut tx, company, source).await?;
        let by_identity: HashMap<&str, &Posting> = prior
            .iter()
            .map(|p| (p.identity_fingerprint.as_str(), p))
            .collect();
        let mut seen: HashSet<String> = HashSet::with_capacity(batch.len());

        for (index, raw) in batch.iter().enumerate() {
            if let Err(err) = raw.validate() {
                warn!(index, error = %err, "skipping invalid posting");
                stats.skipped_count += 1;
                continue;
            }
            if raw.company.trim() != company.trim() {
                warn!(index, posting_company = %raw.company, "skipping posting for another company");
                stats.skipped_count += 1;
                continue;
            }
            if let Some(source) = source {
                if !raw.source_identifier.is_empty() && raw.source_identifier != source {
                    warn!(index, posting_source = %raw.source_identifier, "posting source differs from batch source");
                }
            }

            let title = raw.title.trim();
            let location = normalize_location(&raw.location);
            let category = classify(title, raw.description.as_deref().unwrap_or_default());
            let identity = identity_fingerprint(company, title, &location);
            if !seen.insert(identity.clone()) {
                debug!(index, title, location, "duplicate posting in batch");
                continue;
            }
            let content = content_fingerprint(raw.description.as_deref());

            match by_identity.get(identity.as_str()) {
                Some(existing) => match content {
                    Some(fp) if existing.content_fingerprint.as_deref() != Some(fp.as_str()) => {
                        update_posting_content(&mut tx, existing.id, &fp, raw.description.as_deref(), now)
                            .await?;
                        stats.updated_count += 1;
                    }
                    _ => touch_posting(&mut tx, existing.id, now).await?,
                },
                None => {
                    let posting = NewPosting {
                        identity_fingerprint: identity,
                        content_fingerprint: content,
                        company: company.to_string(),
                        title: title.to_string(),
                        normalized_location: location,
                        category,
                        raw_description: raw.description.clone(),
                        post_date: raw.post_date,
                        deadline: raw.deadline,
                        source: source.unwrap_or_default().to_string(),
                        posting_url: raw.posting_url.clone(),
                    };
                    insert_posting(&mut tx, &posting, now).await?;
                    stats.new_count += 1;
                }
            }
        }

        for posting in &prior {
            if !seen.contains(&posting.identity_fingerprint) {
                mark_inactive(&mut tx, posting.id, now).await?;
                stats.inactive_count += 1;
            }
        }

        tx.commit().await.map_err(StoreError::from)?;
        Ok(stats)
    }
}
