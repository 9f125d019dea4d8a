//! Weekly snapshot capture, trend series and year-over-year comparison.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use jobtrack_core::{iso_week_of, week_label, Snapshot, SnapshotOrigin};
use jobtrack_storage::{NewSnapshot, PostingStore, StoreResult};
use serde::Serialize;
use tracing::info;

/// Location breakdowns keep this many locations.
pub const TOP_LOCATIONS: usize = 20;
/// Window for the new/closed counters, in days.
pub const SNAPSHOT_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeekPoint {
    pub week: String,
    pub snapshot_date: DateTime<Utc>,
    pub total_active: i64,
    pub new_this_week: Option<i64>,
    pub closed_this_week: Option<i64>,
    pub category_breakdown: BTreeMap<String, i64>,
}

impl From<Snapshot> for WeekPoint {
    fn from(s: Snapshot) -> Self {
        Self {
            week: s.week_label(),
            snapshot_date: s.snapshot_date,
            total_active: s.total_active,
            new_this_week: s.new_this_week,
            closed_this_week: s.closed_this_week,
            category_breakdown: s.category_breakdown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotSummary {
    pub id: i64,
    pub week: String,
    pub snapshot_date: DateTime<Utc>,
    pub total_active: i64,
    pub total_companies: i64,
    pub new_this_week: Option<i64>,
    pub closed_this_week: Option<i64>,
    pub origin: SnapshotOrigin,
}

impl From<Snapshot> for SnapshotSummary {
    fn from(s: Snapshot) -> Self {
        Self {
            id: s.id,
            week: s.week_label(),
            snapshot_date: s.snapshot_date,
            total_active: s.total_active,
            total_companies: s.total_companies,
            new_this_week: s.new_this_week,
            closed_this_week: s.closed_this_week,
            origin: s.origin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum ComparisonScope {
    Overall,
    Category(String),
    Company(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CategoryDelta {
    pub current: i64,
    pub prior: i64,
    pub change: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub scope: ComparisonScope,
    pub week_number: u32,
    pub year: i32,
    pub prior_year: i32,
    pub current: i64,
    pub prior: i64,
    pub change: i64,
    /// `None` when the prior-year count is zero.
    pub change_percent: Option<f64>,
    /// Per-category table, only for the overall scope.
    pub categories: BTreeMap<String, CategoryDelta>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum YearOverYear {
    Unavailable {
        year: i32,
        week_number: u32,
        reason: String,
    },
    Available(Comparison),
}

fn percent_change(current: i64, prior: i64) -> Option<f64> {
    if prior == 0 {
        return None;
    }
    Some((current - prior) as f64 / prior as f64 * 100.0)
}

/// Compare two snapshots of the same ISO week. A category scope wins over a company scope.
pub fn compare_snapshots(
    current: &Snapshot,
    prior: &Snapshot,
    category: Option<&str>,
    company: Option<&str>,
) -> Comparison {
    let count = |map: &BTreeMap<String, i64>, key: &str| map.get(key).copied().unwrap_or(0);

    let (scope, now_count, then_count) = match (category, company) {
        (Some(c), _) => (
            ComparisonScope::Category(c.to_string()),
            count(&current.category_breakdown, c),
            count(&prior.category_breakdown, c),
        ),
        (None, Some(c)) => (
            ComparisonScope::Company(c.to_string()),
            count(&current.company_breakdown, c),
            count(&prior.company_breakdown, c),
        ),
        (None, None) => (ComparisonScope::Overall, current.total_active, prior.total_active),
    };

    let categories = if scope == ComparisonScope::Overall {
        let keys: BTreeSet<&String> = current
            .category_breakdown
            .keys()
            .chain(prior.category_breakdown.keys())
            .collect();
        keys.into_iter()
            .map(|k| {
                let now = count(&current.category_breakdown, k.as_str());
                let then = count(&prior.category_breakdown, k.as_str());
                (
                    k.clone(),
                    CategoryDelta {
                        current: now,
                        prior: then,
                        change: now - then,
                    },
                )
            })
            .collect()
    } else {
        BTreeMap::new()
    };

    Comparison {
        scope,
        week_number: current.week_number,
        year: current.year,
        prior_year: prior.year,
        current: now_count,
        prior: then_count,
        change: now_count - then_count,
        change_percent: percent_change(now_count, then_count),
        categories,
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotEngine {
    store: PostingStore,
}

impl SnapshotEngine {
    pub fn new(store: PostingStore) -> Self {
        Self { store }
    }

    pub async fn capture_weekly_snapshot(&self) -> StoreResult<Snapshot> {
        self.capture_weekly_snapshot_at(Utc::now()).await
    }

    /// Capture the snapshot of the ISO week containing `now`, or return the existing one.
    pub async fn capture_weekly_snapshot_at(&self, now: DateTime<Utc>) -> StoreResult<Snapshot> {
        let (year, week_number) = iso_week_of(now);
        if let Some(existing) = self.store.find_snapshot(year, week_number).await? {
            info!(week = %existing.week_label(), id = existing.id, "snapshot already captured");
            return Ok(existing);
        }

        let rollup = self
            .store
            .rollup_active_postings(now - Duration::days(SNAPSHOT_WINDOW_DAYS), now, TOP_LOCATIONS)
            .await?;
        let inserted = self
            .store
            .insert_snapshot(
                &NewSnapshot {
                    snapshot_date: now,
                    year,
                    week_number,
                    total_active: rollup.total_active,
                    total_companies: rollup.total_companies,
                    total_locations: rollup.total_locations,
                    category_breakdown: rollup.category_breakdown,
                    company_breakdown: rollup.company_breakdown,
                    location_breakdown: rollup.location_breakdown,
                    new_this_week: Some(rollup.first_seen_in_window),
                    closed_this_week: Some(rollup.closed_in_window),
                    origin: SnapshotOrigin::Captured,
                },
                now,
            )
            .await?;

        info!(
            week = %week_label(year, week_number),
            created = inserted.created,
            total_active = inserted.snapshot.total_active,
            "weekly snapshot captured"
        );
        Ok(inserted.snapshot)
    }

    /// The latest `weeks` snapshots, oldest first.
    pub async fn get_trend(&self, weeks: usize) -> StoreResult<Vec<WeekPoint>> {
        let mut snapshots = self.store.recent_snapshots(weeks).await?;
        snapshots.reverse();
        Ok(snapshots.into_iter().map(WeekPoint::from).collect())
    }

    pub async fn get_year_over_year(
        &self,
        category: Option<&str>,
        company: Option<&str>,
    ) -> StoreResult<YearOverYear> {
        self.get_year_over_year_at(category, company, Utc::now()).await
    }

    pub async fn get_year_over_year_at(
        &self,
        category: Option<&str>,
        company: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<YearOverYear> {
        let (year, week_number) = iso_week_of(now);
        let Some(current) = self.store.find_snapshot(year, week_number).await? else {
            return Ok(YearOverYear::Unavailable {
                year,
                week_number,
                reason: format!("no snapshot for {}", week_label(year, week_number)),
            });
        };
        let Some(prior) = self.store.find_snapshot(year - 1, week_number).await? else {
            return Ok(YearOverYear::Unavailable {
                year,
                week_number,
                reason: format!("no snapshot for {}", week_label(year - 1, week_number)),
            });
        };
        Ok(YearOverYear::Available(compare_snapshots(&current, &prior, category, company)))
    }

    /// Every snapshot, newest week first.
    pub async fn list_snapshots(&self) -> StoreResult<Vec<SnapshotSummary>> {
        let snapshots = self.store.all_snapshots().await?;
        Ok(snapshots.into_iter().map(SnapshotSummary::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jobtrack_core::LocationBreakdown;

    fn snapshot(year: i32, total: i64, categories: &[(&str, i64)], companies: &[(&str, i64)]) -> Snapshot {
        Snapshot {
            id: 1,
            snapshot_date: Utc.with_ymd_and_hms(year, 6, 1, 12, 0, 0).single().unwrap(),
            year,
            week_number: 22,
            total_active: total,
            total_companies: companies.len() as i64,
            total_locations: 1,
            category_breakdown: categories.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            company_breakdown: companies.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            location_breakdown: LocationBreakdown::new(),
            new_this_week: None,
            closed_this_week: None,
            origin: SnapshotOrigin::Captured,
            created_at: Utc.with_ymd_and_hms(year, 6, 1, 12, 0, 0).single().unwrap(),
        }
    }

    #[test]
    fn overall_comparison_reports_category_union() {
        let current = snapshot(2026, 30, &[("Quant", 20), ("Research", 10)], &[]);
        let prior = snapshot(2025, 20, &[("Quant", 15), ("Technology", 5)], &[]);

        let cmp = compare_snapshots(&current, &prior, None, None);
        assert_eq!(cmp.scope, ComparisonScope::Overall);
        assert_eq!(cmp.change, 10);
        assert_eq!(cmp.change_percent, Some(50.0));
        assert_eq!(cmp.categories.len(), 3);
        assert_eq!(
            cmp.categories["Technology"],
            CategoryDelta { current: 0, prior: 5, change: -5 }
        );
        assert_eq!(cmp.categories["Research"].change, 10);
    }

    #[test]
    fn scoped_comparison_defaults_missing_keys_to_zero() {
        let current = snapshot(2026, 30, &[("Quant", 4)], &[("Acme", 12)]);
        let prior = snapshot(2025, 20, &[], &[("Acme", 8)]);

        let by_category = compare_snapshots(&current, &prior, Some("Quant"), Some("Acme"));
        assert_eq!(by_category.scope, ComparisonScope::Category("Quant".into()));
        assert_eq!((by_category.current, by_category.prior), (4, 0));
        assert_eq!(by_category.change_percent, None);
        assert!(by_category.categories.is_empty());

        let by_company = compare_snapshots(&current, &prior, None, Some("Acme"));
        assert_eq!(by_company.change, 4);
        assert_eq!(by_company.change_percent, Some(50.0));
    }
}
