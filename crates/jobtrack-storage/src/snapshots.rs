//! Weekly snapshot rows and the aggregate queries they are built from.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use jobtrack_core::{LocationBreakdown, Snapshot, SnapshotOrigin};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::{PostingStore, StoreError, StoreResult};

const SNAPSHOT_COLUMNS: &str = "id, snapshot_date, year, week_number, total_active, total_companies, \
     total_locations, category_breakdown, company_breakdown, location_breakdown, new_this_week, \
     closed_this_week, origin, created_at";

fn breakdown_from_row<T: DeserializeOwned>(row: &SqliteRow, column: &'static str) -> StoreResult<T> {
    let text: String = row.try_get(column)?;
    serde_json::from_str(&text).map_err(|e| StoreError::corrupt(column, e))
}

fn snapshot_from_row(row: &SqliteRow) -> StoreResult<Snapshot> {
    let week_number: i64 = row.try_get("week_number")?;
    let origin: String = row.try_get("origin")?;

    Ok(Snapshot {
        id: row.try_get("id")?,
        snapshot_date: row.try_get("snapshot_date")?,
        year: row.try_get("year")?,
        week_number: u32::try_from(week_number).map_err(|e| StoreError::corrupt("week_number", e))?,
        total_active: row.try_get("total_active")?,
        total_companies: row.try_get("total_companies")?,
        total_locations: row.try_get("total_locations")?,
        category_breakdown: breakdown_from_row(row, "category_breakdown")?,
        company_breakdown: breakdown_from_row(row, "company_breakdown")?,
        location_breakdown: breakdown_from_row(row, "location_breakdown")?,
        new_this_week: row.try_get("new_this_week")?,
        closed_this_week: row.try_get("closed_this_week")?,
        origin: SnapshotOrigin::from_str(&origin).map_err(|e| StoreError::corrupt("origin", e))?,
        created_at: row.try_get("created_at")?,
    })
}

fn breakdown_json<T: Serialize>(map: &T, column: &'static str) -> StoreResult<String> {
    serde_json::to_string(map).map_err(|e| StoreError::corrupt(column, e))
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSnapshot {
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
}

/// Result of an insert that may lose a race against an existing row for the same week.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotInsert {
    pub snapshot: Snapshot,
    pub created: bool,
}

/// Aggregates over the active posting set at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveRollup {
    pub total_active: i64,
    pub total_companies: i64,
    pub total_locations: i64,
    /// Uncategorized postings are not counted.
    pub category_breakdown: BTreeMap<String, i64>,
    pub company_breakdown: BTreeMap<String, i64>,
    /// Top locations by count, descending, ties by name.
    pub location_breakdown: LocationBreakdown,
    pub first_seen_in_window: i64,
    pub closed_in_window: i64,
}

async fn grouped_counts(conn: &mut SqliteConnection, sql: &str) -> StoreResult<BTreeMap<String, i64>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(sql).fetch_all(&mut *conn).await?;
    Ok(rows.into_iter().collect())
}

impl PostingStore {
    pub async fn find_snapshot(&self, year: i32, week_number: u32) -> StoreResult<Option<Snapshot>> {
        let sql = format!("SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE year = ? AND week_number = ?");
        let row = sqlx::query(&sql)
            .bind(year)
            .bind(i64::from(week_number))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(snapshot_from_row).transpose()
    }

    /// Insert unless the week already has a snapshot; either way return the stored row.
    pub async fn insert_snapshot(&self, snapshot: &NewSnapshot, now: DateTime<Utc>) -> StoreResult<SnapshotInsert> {
        let result = sqlx::query(
            r#"
            INSERT INTO snapshots (
                snapshot_date, year, week_number, total_active, total_companies, total_locations,
                category_breakdown, company_breakdown, location_breakdown,
                new_this_week, closed_this_week, origin, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (year, week_number) DO NOTHING
            "#,
        )
        .bind(snapshot.snapshot_date)
        .bind(snapshot.year)
        .bind(i64::from(snapshot.week_number))
        .bind(snapshot.total_active)
        .bind(snapshot.total_companies)
        .bind(snapshot.total_locations)
        .bind(breakdown_json(&snapshot.category_breakdown, "category_breakdown")?)
        .bind(breakdown_json(&snapshot.company_breakdown, "company_breakdown")?)
        .bind(breakdown_json(&snapshot.location_breakdown, "location_breakdown")?)
        .bind(snapshot.new_this_week)
        .bind(snapshot.closed_this_week)
        .bind(snapshot.origin.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        let stored = self
            .find_snapshot(snapshot.year, snapshot.week_number)
            .await?
            .ok_or(StoreError::Database(sqlx::Error::RowNotFound))?;
        Ok(SnapshotInsert {
            snapshot: stored,
            created: result.rows_affected() == 1,
        })
    }

    /// Latest `limit` snapshots, newest week first.
    pub async fn recent_snapshots(&self, limit: usize) -> StoreResult<Vec<Snapshot>> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots ORDER BY year DESC, week_number DESC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(snapshot_from_row).collect()
    }

    pub async fn all_snapshots(&self) -> StoreResult<Vec<Snapshot>> {
        let sql = format!("SELECT {SNAPSHOT_COLUMNS} FROM snapshots ORDER BY year DESC, week_number DESC");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(snapshot_from_row).collect()
    }

    /// Aggregate the active set in one read transaction.
    ///
    /// `first_seen_in_window` counts active postings first seen at or after
    /// `window_start`; `closed_in_window` counts inactive postings whose
    /// `last_seen` falls in `[window_start, now)`.
    pub async fn rollup_active_postings(
        &self,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
        top_locations: usize,
    ) -> StoreResult<ActiveRollup> {
        let mut tx = self.pool.begin().await?;

        let (total_active, total_companies, total_locations): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(DISTINCT company),
                   COUNT(DISTINCT normalized_location)
              FROM postings
             WHERE status = 'active'
            "#,
        )
        .fetch_one(&mut *tx)
        .await?;

        let category_breakdown = grouped_counts(
            &mut tx,
            "SELECT category, COUNT(*) FROM postings \
             WHERE status = 'active' AND category IS NOT NULL GROUP BY category",
        )
        .await?;
        let company_breakdown = grouped_counts(
            &mut tx,
            "SELECT company, COUNT(*) FROM postings WHERE status = 'active' GROUP BY company",
        )
        .await?;

        let locations: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT normalized_location, COUNT(*) AS n
              FROM postings
             WHERE status = 'active'
             GROUP BY normalized_location
             ORDER BY n DESC, normalized_location ASC
             LIMIT ?
            "#,
        )
        .bind(i64::try_from(top_locations).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        let first_seen_in_window: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM postings WHERE status = 'active' AND first_seen >= ?",
        )
        .bind(window_start)
        .fetch_one(&mut *tx)
        .await?;
        let closed_in_window: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM postings WHERE status = 'inactive' AND last_seen >= ? AND last_seen < ?",
        )
        .bind(window_start)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ActiveRollup {
            total_active,
            total_companies,
            total_locations,
            category_breakdown,
            company_breakdown,
            location_breakdown: locations.into_iter().collect(),
            first_seen_in_window,
            closed_in_window,
        })
    }
}
