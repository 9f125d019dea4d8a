//! Best-effort historical backfill from web-archive captures of career pages.
//!
//! Archived pages rarely contain the rendered listings, so the job count is an
//! estimate taken from phrases like "123 jobs" or from counting job cards.
//! Backfilled snapshots carry a company breakdown only.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use jobtrack_core::{iso_week_of, week_label, LocationBreakdown, SnapshotOrigin, SourceConfig};
use jobtrack_storage::{HttpFetcher, NewSnapshot, PostingStore, RateLimit, StoreResult, Url};
use regex::Regex;
use scraper::{Html, Selector};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const WAYBACK_CDX_API: &str = "https://web.archive.org/cdx/search/cdx";
pub const WAYBACK_PAGE_BASE: &str = "https://web.archive.org/web";
pub const MAX_SAMPLES: usize = 52;
const SAMPLE_STRIDE: usize = 7;
const COVERAGE_WINDOW_DAYS: i64 = 30;
const MAX_PLAUSIBLE_JOBS: i64 = 10_000;

static COUNT_PATTERNS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        Regex::new(r"(?i)(\d+)\s+(?:jobs?|positions?|openings?|results?)").expect("valid regex"),
        Regex::new(r"(?i)(?:showing|found|total)[\s:]+(\d+)").expect("valid regex"),
        Regex::new(r"(?i)(\d+)\s+(?:job|position|opening)").expect("valid regex"),
    ]
});
static JOB_CARD_CLASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)job[-_]?(item|card|listing|result)").expect("valid regex"));
static JOB_ROW_CLASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)job[-_]?row").expect("valid regex"));
static JOB_HREF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)/job/|/careers/|/positions/").expect("valid regex"));

/// One archived capture, identified by its 14-digit archive timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveCapture {
    pub timestamp: String,
    pub captured_on: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoricalPoint {
    pub source_id: String,
    pub company: String,
    pub timestamp: String,
    pub captured_at: DateTime<Utc>,
    pub estimated_jobs: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub source_id: String,
    pub captures_found: usize,
    pub captures_sampled: usize,
    pub points: Vec<HistoricalPoint>,
    /// Week labels written (or that would be written on a dry run).
    pub created_weeks: Vec<String>,
    pub skipped_weeks: Vec<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoverageLevel {
    High,
    Medium,
    Low,
}

impl CoverageLevel {
    pub fn from_capture_count(captures: usize) -> Self {
        match captures {
            n if n > 5 => CoverageLevel::High,
            n if n > 0 => CoverageLevel::Medium,
            _ => CoverageLevel::Low,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceCoverage {
    pub source_id: String,
    pub company: String,
    pub archive_url: String,
    pub recent_captures: usize,
    pub level: CoverageLevel,
}

/// Parse the JSON form of a CDX response. The first row is the field header.
pub fn parse_cdx_rows(body: &str) -> Result<Vec<ArchiveCapture>> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<Vec<String>> = serde_json::from_str(body).context("parsing CDX response")?;
    Ok(rows
        .into_iter()
        .skip(1)
        .filter_map(|row| {
            let timestamp = row.into_iter().next()?;
            let captured_on = NaiveDate::parse_from_str(timestamp.get(..8)?, "%Y%m%d").ok()?;
            Some(ArchiveCapture {
                timestamp,
                captured_on,
            })
        })
        .collect())
}

/// Every `SAMPLE_STRIDE`-th capture when there are more than `MAX_SAMPLES`, capped at `MAX_SAMPLES`.
pub fn sample_captures(captures: &[ArchiveCapture]) -> Vec<ArchiveCapture> {
    let stride = if captures.len() > MAX_SAMPLES { SAMPLE_STRIDE } else { 1 };
    captures
        .iter()
        .step_by(stride)
        .take(MAX_SAMPLES)
        .cloned()
        .collect()
}

fn count_matching(document: &Html, tag: &str, attr: &str, pattern: &Regex) -> usize {
    let Ok(selector) = Selector::parse(tag) else {
        return 0;
    };
    document
        .select(&selector)
        .filter(|el| match attr {
            "class" => el.value().classes().any(|c| pattern.is_match(c)),
            _ => el.value().attr(attr).is_some_and(|v| pattern.is_match(v)),
        })
        .count()
}

/// Estimate the number of listed jobs on an archived page.
pub fn extract_job_count(html: &str) -> Option<i64> {
    let document = Html::parse_document(html);
    let text = document.root_element().text().collect::<Vec<_>>().join(" ");

    for pattern in COUNT_PATTERNS.iter() {
        let Some(count) = pattern
            .captures(&text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<i64>().ok())
        else {
            continue;
        };
        if (1..=MAX_PLAUSIBLE_JOBS).contains(&count) {
            return Some(count);
        }
    }

    [
        count_matching(&document, "div", "class", &JOB_CARD_CLASS),
        count_matching(&document, "tr", "class", &JOB_ROW_CLASS),
        count_matching(&document, "a", "href", &JOB_HREF),
    ]
    .into_iter()
    .find(|&n| n > 0)
    .and_then(|n| i64::try_from(n).ok())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct WeekBucket {
    date: DateTime<Utc>,
    companies: BTreeMap<String, i64>,
}

/// Group points by ISO week. Within a week the latest capture of a company wins.
fn group_by_week(points: &[HistoricalPoint]) -> BTreeMap<(i32, u32), WeekBucket> {
    let mut weeks: BTreeMap<(i32, u32), WeekBucket> = BTreeMap::new();
    for point in points {
        let bucket = weeks
            .entry(iso_week_of(point.captured_at))
            .or_insert_with(|| WeekBucket {
                date: point.captured_at,
                companies: BTreeMap::new(),
            });
        bucket.companies.insert(point.company.clone(), point.estimated_jobs);
    }
    weeks
}

/// Client for the archive's CDX index and archived pages, spaced by a politeness delay.
#[derive(Debug)]
pub struct WaybackClient {
    http: Arc<HttpFetcher>,
    cdx_endpoint: String,
    page_base: String,
    politeness: RateLimit,
}

impl WaybackClient {
    pub fn new(http: Arc<HttpFetcher>, delay: std::time::Duration) -> Self {
        Self {
            http,
            cdx_endpoint: WAYBACK_CDX_API.to_string(),
            page_base: WAYBACK_PAGE_BASE.to_string(),
            politeness: RateLimit::new(delay),
        }
    }

    /// Point the client at another archive deployment.
    pub fn with_endpoints(mut self, cdx_endpoint: impl Into<String>, page_base: impl Into<String>) -> Self {
        self.cdx_endpoint = cdx_endpoint.into();
        self.page_base = page_base.into();
        self
    }

    /// Successful captures of `url` between `from` and `to`, at most one per day.
    pub async fn list_captures(
        &self,
        source_id: &str,
        url: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ArchiveCapture>> {
        let from = from.format("%Y%m%d").to_string();
        let to = to.format("%Y%m%d").to_string();
        let query = Url::parse_with_params(
            &self.cdx_endpoint,
            &[
                ("url", url),
                ("from", from.as_str()),
                ("to", to.as_str()),
                ("output", "json"),
                ("fl", "timestamp,statuscode"),
                ("filter", "statuscode:200"),
                ("collapse", "timestamp:8"),
            ],
        )
        .with_context(|| format!("building CDX query for {url}"))?;

        self.politeness.acquire().await;
        let page = self
            .http
            .fetch_text(Uuid::new_v4(), source_id, query.as_str())
            .await
            .with_context(|| format!("querying archive index for {url}"))?;
        let captures = parse_cdx_rows(&page.body)?;
        info!(source_id, url, captures = captures.len(), "archive captures listed");
        Ok(captures)
    }

    pub async fn fetch_capture(&self, source_id: &str, url: &str, capture: &ArchiveCapture) -> Result<String> {
        let archived = format!("{}/{}/{}", self.page_base, capture.timestamp, url);
        self.politeness.acquire().await;
        let page = self
            .http
            .fetch_text(Uuid::new_v4(), source_id, &archived)
            .await
            .with_context(|| format!("fetching archived page {archived}"))?;
        Ok(page.body)
    }
}

pub struct Backfiller {
    store: PostingStore,
    client: WaybackClient,
}

impl Backfiller {
    pub fn new(store: PostingStore, client: WaybackClient) -> Self {
        Self { store, client }
    }

    pub async fn backfill_source(
        &self,
        source: &SourceConfig,
        weeks_back: i64,
        dry_run: bool,
    ) -> Result<BackfillReport> {
        self.backfill_source_at(source, weeks_back, dry_run, Utc::now()).await
    }

    pub async fn backfill_source_at(
        &self,
        source: &SourceConfig,
        weeks_back: i64,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> Result<BackfillReport> {
        let url = source
            .archive_url
            .as_deref()
            .ok_or_else(|| anyhow!("source `{}` has no archive_url", source.source_id))?;
        let since = Duration::try_weeks(weeks_back)
            .filter(|_| weeks_back > 0)
            .and_then(|window| now.checked_sub_signed(window))
            .ok_or_else(|| anyhow!("backfill window of {weeks_back} weeks is out of range"))?;
        let captures = self.client.list_captures(&source.source_id, url, since, now).await?;
        let sampled = sample_captures(&captures);

        let mut points = Vec::new();
        for capture in &sampled {
            let html = match self.client.fetch_capture(&source.source_id, url, capture).await {
                Ok(html) => html,
                Err(err) => {
                    warn!(source_id = %source.source_id, timestamp = %capture.timestamp, error = %err, "skipping capture");
                    continue;
                }
            };
            let Some(estimated_jobs) = extract_job_count(&html) else {
                debug!(source_id = %source.source_id, timestamp = %capture.timestamp, "no job count on archived page");
                continue;
            };
            let Some(midnight) = capture.captured_on.and_hms_opt(0, 0, 0) else {
                continue;
            };
            points.push(HistoricalPoint {
                source_id: source.source_id.clone(),
                company: source.company.clone(),
                timestamp: capture.timestamp.clone(),
                captured_at: midnight.and_utc(),
                estimated_jobs,
            });
        }

        let (created_weeks, skipped_weeks) = self.store_points(&points, dry_run, now).await?;
        info!(
            source_id = %source.source_id,
            captures = captures.len(),
            points = points.len(),
            created = created_weeks.len(),
            dry_run,
            "backfill finished"
        );
        Ok(BackfillReport {
            source_id: source.source_id.clone(),
            captures_found: captures.len(),
            captures_sampled: sampled.len(),
            points,
            created_weeks,
            skipped_weeks,
            dry_run,
        })
    }

    /// Write one backfilled snapshot per ISO week not already present.
    ///
    /// Returns the created and skipped week labels.
    pub async fn store_points(
        &self,
        points: &[HistoricalPoint],
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<(Vec<String>, Vec<String>)> {
        let mut created = Vec::new();
        let mut skipped = Vec::new();

        for ((year, week_number), bucket) in group_by_week(points) {
            let label = week_label(year, week_number);
            if self.store.find_snapshot(year, week_number).await?.is_some() {
                debug!(week = %label, "week already has a snapshot");
                skipped.push(label);
                continue;
            }
            if dry_run {
                created.push(label);
                continue;
            }

            let snapshot = NewSnapshot {
                snapshot_date: bucket.date,
                year,
                week_number,
                total_active: bucket.companies.values().sum(),
                total_companies: i64::try_from(bucket.companies.len()).unwrap_or(i64::MAX),
                total_locations: 0,
                category_breakdown: BTreeMap::new(),
                company_breakdown: bucket.companies,
                location_breakdown: LocationBreakdown::new(),
                new_this_week: None,
                closed_this_week: None,
                origin: SnapshotOrigin::Backfilled,
            };
            if self.store.insert_snapshot(&snapshot, now).await?.created {
                created.push(label);
            } else {
                skipped.push(label);
            }
        }
        Ok((created, skipped))
    }

    /// Classify each source with an archive URL by its captures in the last 30 days.
    pub async fn coverage(&self, sources: &[SourceConfig]) -> Vec<SourceCoverage> {
        let now = Utc::now();
        let mut report = Vec::new();
        for source in sources {
            let Some(url) = source.archive_url.as_deref() else {
                continue;
            };
            let recent_captures = match self
                .client
                .list_captures(&source.source_id, url, now - Duration::days(COVERAGE_WINDOW_DAYS), now)
                .await
            {
                Ok(captures) => captures.len(),
                Err(err) => {
                    warn!(source_id = %source.source_id, error = %err, "archive index lookup failed");
                    0
                }
            };
            report.push(SourceCoverage {
                source_id: source.source_id.clone(),
                company: source.company.clone(),
                archive_url: url.to_string(),
                recent_captures,
                level: CoverageLevel::from_capture_count(recent_captures),
            });
        }
        report
    }
}
