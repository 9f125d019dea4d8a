//! Posting rows: the transactional primitives used by reconciliation, and the
//! read/user-action queries used by the front ends.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use jobtrack_core::{Category, Posting, PostingStatus, NEW_POSTING_DAYS};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};

use crate::{PostingStore, StoreError, StoreResult};

const POSTING_COLUMNS: &str = "id, identity_fingerprint, content_fingerprint, company, title, \
     normalized_location, category, raw_description, post_date, deadline, source, posting_url, \
     status, first_seen, last_seen, last_content_updated, is_flagged, user_note, created_at, updated_at";

const MONTH_DAYS: i64 = 30;

fn posting_from_row(row: &SqliteRow) -> StoreResult<Posting> {
    let status: String = row.try_get("status")?;
    let category: Option<String> = row.try_get("category")?;

    Ok(Posting {
        id: row.try_get("id")?,
        identity_fingerprint: row.try_get("identity_fingerprint")?,
        content_fingerprint: row.try_get("content_fingerprint")?,
        company: row.try_get("company")?,
        title: row.try_get("title")?,
        normalized_location: row.try_get("normalized_location")?,
        category: category
            .map(|c| Category::from_str(&c))
            .transpose()
            .map_err(|e| StoreError::corrupt("category", e))?,
        raw_description: row.try_get("raw_description")?,
        post_date: row.try_get("post_date")?,
        deadline: row.try_get("deadline")?,
        source: row.try_get("source")?,
        posting_url: row.try_get("posting_url")?,
        status: PostingStatus::from_str(&status).map_err(|e| StoreError::corrupt("status", e))?,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
        last_content_updated: row.try_get("last_content_updated")?,
        is_flagged: row.try_get("is_flagged")?,
        user_note: row.try_get("user_note")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Fields of a posting observed for the first time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPosting {
    pub identity_fingerprint: String,
    pub content_fingerprint: Option<String>,
    pub company: String,
    pub title: String,
    pub normalized_location: String,
    pub category: Category,
    pub raw_description: Option<String>,
    pub post_date: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub source: String,
    pub posting_url: String,
}

/// Active postings of one company, scoped to `source` when given.
pub async fn load_active_postings(
    conn: &mut SqliteConnection,
    company: &str,
    source: Option<&str>,
) -> StoreResult<Vec<Posting>> {
    let rows = match source {
        Some(source) => {
            let sql = format!(
                "SELECT {POSTING_COLUMNS} FROM postings \
                 WHERE company = ? AND source = ? AND status = 'active' ORDER BY id"
            );
            sqlx::query(&sql)
                .bind(company)
                .bind(source)
                .fetch_all(&mut *conn)
                .await?
        }
        None => {
            let sql = format!(
                "SELECT {POSTING_COLUMNS} FROM postings \
                 WHERE company = ? AND status = 'active' ORDER BY id"
            );
            sqlx::query(&sql).bind(company).fetch_all(&mut *conn).await?
        }
    };
    rows.iter().map(posting_from_row).collect()
}

pub async fn insert_posting(
    conn: &mut SqliteConnection,
    posting: &NewPosting,
    now: DateTime<Utc>,
) -> StoreResult<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO postings (
            identity_fingerprint, content_fingerprint, company, title, normalized_location,
            category, raw_description, post_date, deadline, source, posting_url, status,
            first_seen, last_seen, last_content_updated, is_flagged, user_note,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?, ?, 0, NULL, ?, ?)
        "#,
    )
    .bind(&posting.identity_fingerprint)
    .bind(&posting.content_fingerprint)
    .bind(&posting.company)
    .bind(&posting.title)
    .bind(&posting.normalized_location)
    .bind(posting.category.as_str())
    .bind(&posting.raw_description)
    .bind(posting.post_date)
    .bind(posting.deadline)
    .bind(&posting.source)
    .bind(&posting.posting_url)
    .bind(now)
    .bind(now)
    .bind(now)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Record that an active posting was observed again.
pub async fn touch_posting(
    conn: &mut SqliteConnection,
    id: i64,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query("UPDATE postings SET last_seen = ?, updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Overwrite the description of a re-observed posting whose content changed.
pub async fn update_posting_content(
    conn: &mut SqliteConnection,
    id: i64,
    content_fingerprint: &str,
    raw_description: Option<&str>,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE postings
           SET raw_description = ?,
               content_fingerprint = ?,
               last_content_updated = ?,
               last_seen = ?,
               updated_at = ?
         WHERE id = ?
        "#,
    )
    .bind(raw_description)
    .bind(content_fingerprint)
    .bind(now)
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Close an active posting. `last_seen` keeps the time it was last observed.
pub async fn mark_inactive(
    conn: &mut SqliteConnection,
    id: i64,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query("UPDATE postings SET status = 'inactive', updated_at = ? WHERE id = ? AND status = 'active'")
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeRange {
    #[default]
    All,
    ThisWeek,
    ThisMonth,
}

impl FromStr for TimeRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" | "" => Ok(TimeRange::All),
            "this_week" => Ok(TimeRange::ThisWeek),
            "this_month" => Ok(TimeRange::ThisMonth),
            other => Err(format!("unknown time range `{other}`")),
        }
    }
}

impl TimeRange {
    fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            TimeRange::All => None,
            TimeRange::ThisWeek => Some(now - Duration::days(NEW_POSTING_DAYS)),
            TimeRange::ThisMonth => Some(now - Duration::days(MONTH_DAYS)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostingFilter {
    pub company: Option<String>,
    /// Substring of the normalized location.
    pub location: Option<String>,
    pub category: Option<Category>,
    /// Substring of the title or description.
    pub keyword: Option<String>,
    pub flagged_only: bool,
    pub time_range: TimeRange,
    /// `None` lists every status.
    pub status: Option<PostingStatus>,
}

impl Default for PostingFilter {
    fn default() -> Self {
        Self {
            company: None,
            location: None,
            category: None,
            keyword: None,
            flagged_only: false,
            time_range: TimeRange::All,
            status: Some(PostingStatus::Active),
        }
    }
}

impl PostingFilter {
    fn push_where(&self, qb: &mut QueryBuilder<'_, Sqlite>, now: DateTime<Utc>) {
        qb.push(" WHERE 1 = 1");
        if let Some(company) = &self.company {
            qb.push(" AND company = ").push_bind(company.clone());
        }
        if let Some(location) = &self.location {
            qb.push(" AND normalized_location LIKE ")
                .push_bind(format!("%{location}%"));
        }
        if let Some(category) = self.category {
            qb.push(" AND category = ").push_bind(category.as_str());
        }
        if let Some(keyword) = &self.keyword {
            let pattern = format!("%{keyword}%");
            qb.push(" AND (title LIKE ")
                .push_bind(pattern.clone())
                .push(" OR raw_description LIKE ")
                .push_bind(pattern)
                .push(")");
        }
        if self.flagged_only {
            qb.push(" AND is_flagged = 1");
        }
        if let Some(since) = self.time_range.since(now) {
            qb.push(" AND first_seen >= ").push_bind(since);
        }
        if let Some(status) = self.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostingPage {
    pub postings: Vec<Posting>,
    pub page: u32,
    pub per_page: u32,
    pub total: i64,
    pub pages: u32,
    pub has_next: bool,
    pub has_prev: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PostingStatistics {
    pub total_active: i64,
    pub total_inactive: i64,
    pub new_this_week: i64,
    pub new_this_month: i64,
    pub flagged_active: i64,
    pub active_companies: i64,
    /// Whole weeks since the first snapshot; at least 1 once any snapshot exists.
    pub tracking_weeks: i64,
}

impl PostingStore {
    pub async fn get_posting(&self, id: i64) -> StoreResult<Option<Posting>> {
        let sql = format!("SELECT {POSTING_COLUMNS} FROM postings WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(posting_from_row).transpose()
    }

    /// Every row of one (company, source) pair, including inactive history.
    pub async fn postings_for_source(&self, company: &str, source: &str) -> StoreResult<Vec<Posting>> {
        let sql = format!(
            "SELECT {POSTING_COLUMNS} FROM postings WHERE company = ? AND source = ? ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(company)
            .bind(source)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(posting_from_row).collect()
    }

    /// Returns `false` when no posting has this id.
    pub async fn set_flagged(&self, id: i64, flagged: bool) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE postings SET is_flagged = ?, updated_at = ? WHERE id = ?")
            .bind(flagged)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Returns `false` when no posting has this id.
    pub async fn set_user_note(&self, id: i64, note: Option<&str>) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE postings SET user_note = ?, updated_at = ? WHERE id = ?")
            .bind(note)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Newest-first page of postings matching `filter`. `page` is 1-based.
    pub async fn list_postings(
        &self,
        filter: &PostingFilter,
        page: u32,
        per_page: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<PostingPage> {
        let page = page.max(1);
        let per_page = per_page.max(1);

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM postings");
        filter.push_where(&mut count, now);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Sqlite>::new(format!("SELECT {POSTING_COLUMNS} FROM postings"));
        filter.push_where(&mut select, now);
        select
            .push(" ORDER BY first_seen DESC, id DESC LIMIT ")
            .push_bind(i64::from(per_page))
            .push(" OFFSET ")
            .push_bind(i64::from(page - 1) * i64::from(per_page));
        let rows = select.build().fetch_all(&self.pool).await?;
        let postings = rows.iter().map(posting_from_row).collect::<StoreResult<Vec<_>>>()?;

        let pages = u32::try_from((total as u64).div_ceil(u64::from(per_page))).unwrap_or(u32::MAX);
        Ok(PostingPage {
            postings,
            page,
            per_page,
            total,
            pages,
            has_next: page < pages,
            has_prev: page > 1,
        })
    }

    pub async fn distinct_companies(&self) -> StoreResult<Vec<String>> {
        Ok(sqlx::query_scalar(
            "SELECT DISTINCT company FROM postings WHERE status = 'active' ORDER BY company",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn distinct_locations(&self) -> StoreResult<Vec<String>> {
        Ok(sqlx::query_scalar(
            "SELECT DISTINCT normalized_location FROM postings \
             WHERE status = 'active' AND normalized_location <> '' ORDER BY normalized_location",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn distinct_categories(&self) -> StoreResult<Vec<String>> {
        Ok(sqlx::query_scalar(
            "SELECT DISTINCT category FROM postings \
             WHERE status = 'active' AND category IS NOT NULL ORDER BY category",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn statistics(&self, now: DateTime<Utc>) -> StoreResult<PostingStatistics> {
        let week_ago = now - Duration::days(NEW_POSTING_DAYS);
        let month_ago = now - Duration::days(MONTH_DAYS);

        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'active' THEN 1 ELSE 0 END), 0) AS total_active,
                COALESCE(SUM(CASE WHEN status = 'inactive' THEN 1 ELSE 0 END), 0) AS total_inactive,
                COALESCE(SUM(CASE WHEN status = 'active' AND first_seen >= ? THEN 1 ELSE 0 END), 0) AS new_this_week,
                COALESCE(SUM(CASE WHEN status = 'active' AND first_seen >= ? THEN 1 ELSE 0 END), 0) AS new_this_month,
                COALESCE(SUM(CASE WHEN status = 'active' AND is_flagged = 1 THEN 1 ELSE 0 END), 0) AS flagged_active,
                COUNT(DISTINCT CASE WHEN status = 'active' THEN company END) AS active_companies
            FROM postings
            "#,
        )
        .bind(week_ago)
        .bind(month_ago)
        .fetch_one(&self.pool)
        .await?;

        let first_snapshot: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT snapshot_date FROM snapshots ORDER BY snapshot_date ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        let tracking_weeks = first_snapshot
            .map(|first| ((now - first).num_days() / 7).max(1))
            .unwrap_or(0);

        Ok(PostingStatistics {
            total_active: row.try_get("total_active")?,
            total_inactive: row.try_get("total_inactive")?,
            new_this_week: row.try_get("new_this_week")?,
            new_this_month: row.try_get("new_this_month")?,
            flagged_active: row.try_get("flagged_active")?,
            active_companies: row.try_get("active_companies")?,
            tracking_weeks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jobtrack_core::identity_fingerprint;

    fn ts(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, 12, 0, 0).single().unwrap()
    }

    fn mk_posting(company: &str, source: &str, title: &str, location: &str) -> NewPosting {
        NewPosting {
            identity_fingerprint: identity_fingerprint(company, title, location),
            content_fingerprint: None,
            company: company.to_string(),
            title: title.to_string(),
            normalized_location: location.to_string(),
            category: jobtrack_core::classify(title, ""),
            raw_description: Some(format!("{title} role")),
            post_date: None,
            deadline: None,
            source: source.to_string(),
            posting_url: String::new(),
        }
    }

    async fn seed(store: &PostingStore, items: &[(NewPosting, DateTime<Utc>)]) -> Vec<i64> {
        let mut tx = store.begin().await.unwrap();
        let mut ids = Vec::new();
        for (posting, at) in items {
            ids.push(insert_posting(&mut tx, posting, *at).await.unwrap());
        }
        tx.commit().await.unwrap();
        ids
    }

    #[tokio::test]
    async fn active_postings_are_scoped_by_source() {
        let store = PostingStore::in_memory().await.unwrap();
        seed(
            &store,
            &[
                (mk_posting("Acme", "acme-us", "Analyst", "New York"), ts(1)),
                (mk_posting("Acme", "acme-uk", "Analyst", "London"), ts(1)),
                (mk_posting("Globex", "globex", "Analyst", "London"), ts(1)),
            ],
        )
        .await;

        let mut conn = store.pool().acquire().await.unwrap();
        let us = load_active_postings(&mut conn, "Acme", Some("acme-us")).await.unwrap();
        assert_eq!(us.len(), 1);
        assert_eq!(us[0].normalized_location, "New York");
        assert_eq!(us[0].status, PostingStatus::Active);
        assert_eq!(us[0].first_seen, ts(1));

        let all_acme = load_active_postings(&mut conn, "Acme", None).await.unwrap();
        assert_eq!(all_acme.len(), 2);
    }

    #[tokio::test]
    async fn active_uniqueness_allows_inactive_history() {
        let store = PostingStore::in_memory().await.unwrap();
        let posting = mk_posting("Acme", "acme-us", "Analyst", "New York");
        let ids = seed(&store, &[(posting.clone(), ts(1))]).await;

        let mut tx = store.begin().await.unwrap();
        assert!(insert_posting(&mut tx, &posting, ts(2)).await.is_err());
        drop(tx);

        let mut tx = store.begin().await.unwrap();
        mark_inactive(&mut tx, ids[0], ts(3)).await.unwrap();
        insert_posting(&mut tx, &posting, ts(4)).await.unwrap();
        tx.commit().await.unwrap();

        let rows = store.postings_for_source("Acme", "acme-us").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, PostingStatus::Inactive);
        assert_eq!(rows[0].last_seen, ts(1));
        assert_eq!(rows[1].status, PostingStatus::Active);
    }

    #[tokio::test]
    async fn content_update_and_touch_move_timestamps() {
        let store = PostingStore::in_memory().await.unwrap();
        let ids = seed(&store, &[(mk_posting("Acme", "acme-us", "Analyst", "NY"), ts(1))]).await;

        let mut tx = store.begin().await.unwrap();
        touch_posting(&mut tx, ids[0], ts(2)).await.unwrap();
        tx.commit().await.unwrap();
        let touched = store.get_posting(ids[0]).await.unwrap().unwrap();
        assert_eq!(touched.last_seen, ts(2));
        assert_eq!(touched.last_content_updated, ts(1));

        let mut tx = store.begin().await.unwrap();
        update_posting_content(&mut tx, ids[0], "abc", Some("new text"), ts(3)).await.unwrap();
        tx.commit().await.unwrap();
        let updated = store.get_posting(ids[0]).await.unwrap().unwrap();
        assert_eq!(updated.content_fingerprint.as_deref(), Some("abc"));
        assert_eq!(updated.raw_description.as_deref(), Some("new text"));
        assert_eq!(updated.last_content_updated, ts(3));
        assert_eq!(updated.first_seen, ts(1));
    }

    #[tokio::test]
    async fn user_actions_report_missing_ids() {
        let store = PostingStore::in_memory().await.unwrap();
        let ids = seed(&store, &[(mk_posting("Acme", "acme-us", "Analyst", "NY"), ts(1))]).await;

        assert!(store.set_flagged(ids[0], true).await.unwrap());
        assert!(store.set_user_note(ids[0], Some("call recruiter")).await.unwrap());
        assert!(!store.set_flagged(9999, true).await.unwrap());
        assert!(!store.set_user_note(9999, None).await.unwrap());

        let posting = store.get_posting(ids[0]).await.unwrap().unwrap();
        assert!(posting.is_flagged);
        assert_eq!(posting.user_note.as_deref(), Some("call recruiter"));
        assert!(store.get_posting(9999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn listing_filters_and_paginates() {
        let store = PostingStore::in_memory().await.unwrap();
        let ids = seed(
            &store,
            &[
                (mk_posting("Acme", "acme-us", "Quant Researcher", "New York"), ts(1)),
                (mk_posting("Acme", "acme-us", "Software Engineer", "New York"), ts(20)),
                (mk_posting("Acme", "acme-uk", "M&A Analyst", "London"), ts(25)),
                (mk_posting("Globex", "globex", "Equity Sales", "Hong Kong"), ts(26)),
            ],
        )
        .await;
        store.set_flagged(ids[2], true).await.unwrap();
        let now = ts(28);

        let page = store
            .list_postings(&PostingFilter::default(), 1, 3, now)
            .await
            .unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.pages, 2);
        assert!(page.has_next && !page.has_prev);
        assert_eq!(page.postings[0].company, "Globex");

        let filter = PostingFilter {
            company: Some("Acme".into()),
            location: Some("York".into()),
            ..PostingFilter::default()
        };
        let page = store.list_postings(&filter, 1, 10, now).await.unwrap();
        assert_eq!(page.total, 2);

        let filter = PostingFilter {
            keyword: Some("engineer".into()),
            ..PostingFilter::default()
        };
        assert_eq!(store.list_postings(&filter, 1, 10, now).await.unwrap().total, 1);

        let filter = PostingFilter {
            time_range: TimeRange::ThisWeek,
            ..PostingFilter::default()
        };
        assert_eq!(store.list_postings(&filter, 1, 10, now).await.unwrap().total, 2);

        let filter = PostingFilter {
            flagged_only: true,
            category: Some(Category::InvestmentBanking),
            ..PostingFilter::default()
        };
        assert_eq!(store.list_postings(&filter, 1, 10, now).await.unwrap().total, 1);

        let filter = PostingFilter {
            status: Some(PostingStatus::Inactive),
            ..PostingFilter::default()
        };
        let empty = store.list_postings(&filter, 1, 10, now).await.unwrap();
        assert_eq!((empty.total, empty.pages, empty.has_next), (0, 0, false));
    }

    #[tokio::test]
    async fn distinct_lists_and_statistics_cover_active_rows() {
        let store = PostingStore::in_memory().await.unwrap();
        let ids = seed(
            &store,
            &[
                (mk_posting("Acme", "acme-us", "Quant Researcher", "New York"), ts(1)),
                (mk_posting("Acme", "acme-us", "Software Engineer", "Chicago"), ts(25)),
                (mk_posting("Globex", "globex", "Equity Sales", "Hong Kong"), ts(26)),
            ],
        )
        .await;
        store.set_flagged(ids[1], true).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        mark_inactive(&mut tx, ids[2], ts(27)).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.distinct_companies().await.unwrap(), vec!["Acme".to_string()]);
        assert_eq!(
            store.distinct_locations().await.unwrap(),
            vec!["Chicago".to_string(), "New York".to_string()]
        );
        assert_eq!(
            store.distinct_categories().await.unwrap(),
            vec!["Quant".to_string(), "Technology".to_string()]
        );

        let stats = store.statistics(ts(28)).await.unwrap();
        assert_eq!(
            stats,
            PostingStatistics {
                total_active: 2,
                total_inactive: 1,
                new_this_week: 1,
                new_this_month: 2,
                flagged_active: 1,
                active_companies: 1,
                tracking_weeks: 0,
            }
        );
    }

    #[test]
    fn time_range_parses_cli_values() {
        assert_eq!("this_week".parse::<TimeRange>(), Ok(TimeRange::ThisWeek));
        assert_eq!("".parse::<TimeRange>(), Ok(TimeRange::All));
        assert!("yesterday".parse::<TimeRange>().is_err());
    }
}
