//! Core domain model for job posting reconciliation and weekly snapshots.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod category;
pub mod fingerprint;
pub mod location;

pub use category::{classify, Category, CategoryParseError};
pub use fingerprint::{content_fingerprint, identity_fingerprint};
pub use location::normalize_location;

/// Location counts in descending order of count.
pub type LocationBreakdown = IndexMap<String, i64>;

pub const CRATE_NAME: &str = "jobtrack-core";

/// A posting first seen within this many days counts as new.
pub const NEW_POSTING_DAYS: i64 = 7;
/// A posting whose content changed within this many days counts as recently updated.
pub const RECENT_UPDATE_DAYS: i64 = 3;

/// Record produced by a scraping adapter, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPosting {
    #[serde(default)]
    pub company: String,
    pub title: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub post_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source_identifier: String,
    #[serde(default)]
    pub posting_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidPosting {
    #[error("posting has no title")]
    MissingTitle,
    #[error("posting has no company")]
    MissingCompany,
}

impl RawPosting {
    pub fn validate(&self) -> Result<(), InvalidPosting> {
        if self.title.trim().is_empty() {
            return Err(InvalidPosting::MissingTitle);
        }
        if self.company.trim().is_empty() {
            return Err(InvalidPosting::MissingCompany);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostingStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown posting status `{0}`")]
pub struct StatusParseError(pub String);

impl PostingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostingStatus::Active => "active",
            PostingStatus::Inactive => "inactive",
        }
    }
}

impl fmt::Display for PostingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostingStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(PostingStatus::Active),
            "inactive" => Ok(PostingStatus::Inactive),
            other => Err(StatusParseError(other.to_string())),
        }
    }
}

/// Persisted posting, one row per distinct identity observed from one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub id: i64,
    pub identity_fingerprint: String,
    pub content_fingerprint: Option<String>,
    pub company: String,
    pub title: String,
    pub normalized_location: String,
    pub category: Option<Category>,
    pub raw_description: Option<String>,
    pub post_date: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub source: String,
    pub posting_url: String,
    pub status: PostingStatus,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_content_updated: DateTime<Utc>,
    pub is_flagged: bool,
    pub user_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Posting {
    pub fn is_active(&self) -> bool {
        self.status == PostingStatus::Active
    }

    pub fn is_new(&self, now: DateTime<Utc>) -> bool {
        now - self.first_seen < Duration::days(NEW_POSTING_DAYS)
    }

    pub fn is_recently_updated(&self, now: DateTime<Utc>) -> bool {
        now - self.last_content_updated < Duration::days(RECENT_UPDATE_DAYS)
    }
}

/// Outcome counters of one reconciliation batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationStats {
    pub new_count: usize,
    pub updated_count: usize,
    pub inactive_count: usize,
    pub total_scraped: usize,
    pub skipped_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotOrigin {
    Captured,
    Backfilled,
}

impl SnapshotOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotOrigin::Captured => "captured",
            SnapshotOrigin::Backfilled => "backfilled",
        }
    }
}

impl FromStr for SnapshotOrigin {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "captured" => Ok(SnapshotOrigin::Captured),
            "backfilled" => Ok(SnapshotOrigin::Backfilled),
            other => Err(StatusParseError(other.to_string())),
        }
    }
}

/// Immutable weekly rollup of posting statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub snapshot_date: DateTime<Utc>,
    pub year: i32,
    pub week_number: u32,
    pub total_active: i64,
    pub total_companies: i64,
    pub total_locations: i64,
    pub category_breakdown: BTreeMap<String, i64>,
    pub company_breakdown: BTreeMap<String, i64>,
    pub location_breakdown: LocationBreakdown,
    pub new_this_week: Option<i64>,
    pub closed_this_week: Option<i64>,
    pub origin: SnapshotOrigin,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn week_label(&self) -> String {
        week_label(self.year, self.week_number)
    }
}

pub fn week_label(year: i32, week_number: u32) -> String {
    format!("{year}-W{week_number:02}")
}

/// ISO 8601 (year, week) of a timestamp.
pub fn iso_week_of(ts: DateTime<Utc>) -> (i32, u32) {
    let week = ts.iso_week();
    (week.year(), week.week())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Fixture,
    HtmlListing,
}

/// CSS selectors used by the generic HTML listing adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingSelectors {
    pub item: String,
    pub title: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub company: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub adapter: AdapterKind,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub selectors: Option<ListingSelectors>,
    #[serde(default)]
    pub fixture_path: Option<String>,
    #[serde(default)]
    pub archive_url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn find(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}
