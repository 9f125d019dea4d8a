use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use jobtrack_core::{identity_fingerprint, PostingStatus, RawPosting};
use jobtrack_storage::PostingStore;
use jobtrack_sync::{ReconcileError, Reconciler};
use tempfile::tempdir;
use tokio::task::JoinSet;

fn ts(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 14, hour, 0, 0).single().unwrap()
}

fn raw(company: &str, title: &str, location: &str, source: &str, description: Option<&str>) -> RawPosting {
    RawPosting {
        company: company.into(),
        title: title.into(),
        location: location.into(),
        description: description.map(str::to_string),
        post_date: None,
        deadline: None,
        source_identifier: source.into(),
        posting_url: format!("https://jobs.example/{source}/{title}"),
    }
}

async fn engine() -> (PostingStore, Reconciler) {
    let store = PostingStore::in_memory().await.expect("store");
    (store.clone(), Reconciler::new(store))
}

async fn active_identities(store: &PostingStore, company: &str, source: &str) -> BTreeSet<String> {
    store
        .postings_for_source(company, source)
        .await
        .unwrap()
        .into_iter()
        .filter(|p| p.status == PostingStatus::Active)
        .map(|p| p.identity_fingerprint)
        .collect()
}

#[tokio::test]
async fn first_observation_inserts_with_normalized_location() {
    let (store, engine) = engine().await;
    let batch = vec![raw("X", "Analyst", "New York, NY, United States", "s1", None)];

    let stats = engine.reconcile_at(&batch, "X", ts(9)).await.unwrap();
    assert_eq!((stats.new_count, stats.updated_count, stats.inactive_count), (1, 0, 0));
    assert_eq!(stats.total_scraped, 1);

    let stored = store.postings_for_source("X", "s1").await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].normalized_location, "New York");
    assert_eq!(stored[0].status, PostingStatus::Active);
    assert_eq!(stored[0].first_seen, ts(9));
    assert_eq!(stored[0].last_seen, ts(9));
    assert_eq!(stored[0].last_content_updated, ts(9));
}

#[tokio::test]
async fn missing_posting_is_closed_and_seen_posting_touched() {
    let (store, engine) = engine().await;
    let a = raw("X", "Analyst", "London", "s1", Some("desk A"));
    let b = raw("X", "Associate", "London", "s1", Some("desk B"));
    engine.reconcile_at(&[a.clone(), b], "X", ts(9)).await.unwrap();

    let stats = engine.reconcile_at(&[a], "X", ts(12)).await.unwrap();
    assert_eq!((stats.new_count, stats.updated_count, stats.inactive_count), (0, 0, 1));

    let stored = store.postings_for_source("X", "s1").await.unwrap();
    let analyst = stored.iter().find(|p| p.title == "Analyst").unwrap();
    let associate = stored.iter().find(|p| p.title == "Associate").unwrap();
    assert_eq!(analyst.status, PostingStatus::Active);
    assert_eq!(analyst.last_seen, ts(12));
    assert_eq!(associate.status, PostingStatus::Inactive);
    assert_eq!(associate.last_seen, ts(9));
}

#[tokio::test]
async fn changed_description_counts_as_update() {
    let (store, engine) = engine().await;
    engine
        .reconcile_at(&[raw("X", "Analyst", "London", "s1", Some("old text"))], "X", ts(9))
        .await
        .unwrap();

    let stats = engine
        .reconcile_at(&[raw("X", "Analyst", "London", "s1", Some("new text"))], "X", ts(11))
        .await
        .unwrap();
    assert_eq!((stats.new_count, stats.updated_count, stats.inactive_count), (0, 1, 0));

    let stored = &store.postings_for_source("X", "s1").await.unwrap()[0];
    assert_eq!(stored.raw_description.as_deref(), Some("new text"));
    assert_eq!(stored.last_content_updated, ts(11));
    assert_eq!(stored.first_seen, ts(9));
}

#[tokio::test]
async fn empty_batch_closes_the_whole_source() {
    let (store, engine) = engine().await;
    let batch = vec![
        raw("X", "Analyst", "London", "s1", None),
        raw("X", "Associate", "Paris", "s1", None),
    ];
    engine.reconcile_at(&batch, "X", ts(9)).await.unwrap();

    let stats = engine.reconcile_source_at(&[], "X", Some("s1"), ts(10)).await.unwrap();
    assert_eq!((stats.new_count, stats.updated_count, stats.inactive_count), (0, 0, 2));
    assert!(active_identities(&store, "X", "s1").await.is_empty());
}

#[tokio::test]
async fn active_set_equals_batch_after_reconcile() {
    let (store, engine) = engine().await;
    engine
        .reconcile_at(
            &[
                raw("X", "Analyst", "London", "s1", None),
                raw("X", "Associate", "London", "s1", None),
                raw("X", "Trader", "Paris", "s1", None),
            ],
            "X",
            ts(9),
        )
        .await
        .unwrap();

    let batch = vec![
        raw("X", "Trader", "Paris", "s1", None),
        raw("X", "Quant", "Zurich", "s1", None),
        raw("X", "Quant", "Zurich", "s1", None),
    ];
    let stats = engine.reconcile_at(&batch, "X", ts(10)).await.unwrap();
    assert_eq!((stats.new_count, stats.inactive_count), (1, 2));

    let expected: BTreeSet<String> = [("Trader", "Paris"), ("Quant", "Zurich")]
        .into_iter()
        .map(|(t, l)| identity_fingerprint("X", t, l))
        .collect();
    assert_eq!(active_identities(&store, "X", "s1").await, expected);

    let closed: Vec<_> = store
        .postings_for_source("X", "s1")
        .await
        .unwrap()
        .into_iter()
        .filter(|p| p.status == PostingStatus::Inactive)
        .map(|p| p.title)
        .collect();
    assert_eq!(closed, vec!["Analyst".to_string(), "Associate".to_string()]);
}

#[tokio::test]
async fn identical_rerun_changes_nothing() {
    let (_, engine) = engine().await;
    let batch = vec![
        raw("X", "Analyst", "London", "s1", Some("desk")),
        raw("X", "Associate", "London", "s1", None),
    ];
    engine.reconcile_at(&batch, "X", ts(9)).await.unwrap();

    let again = engine.reconcile_at(&batch, "X", ts(9)).await.unwrap();
    assert_eq!((again.new_count, again.updated_count, again.inactive_count), (0, 0, 0));
    assert_eq!(again.total_scraped, 2);
}

#[tokio::test]
async fn duplicates_within_a_batch_produce_one_posting() {
    let (store, engine) = engine().await;
    let batch = vec![
        raw("X", "Analyst", "New York, NY, United States", "s1", Some("first")),
        raw("X", "Analyst", "New York", "s1", Some("second")),
    ];

    let stats = engine.reconcile_at(&batch, "X", ts(9)).await.unwrap();
    assert_eq!(stats.new_count, 1);

    let stored = store.postings_for_source("X", "s1").await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].raw_description.as_deref(), Some("first"));
}

#[tokio::test]
async fn closed_posting_reappearing_is_a_new_row() {
    let (store, engine) = engine().await;
    let batch = vec![raw("X", "Analyst", "London", "s1", None)];
    engine.reconcile_at(&batch, "X", ts(9)).await.unwrap();
    engine.reconcile_source_at(&[], "X", Some("s1"), ts(10)).await.unwrap();

    let stats = engine.reconcile_at(&batch, "X", ts(11)).await.unwrap();
    assert_eq!(stats.new_count, 1);

    let stored = store.postings_for_source("X", "s1").await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].identity_fingerprint, stored[1].identity_fingerprint);
    assert_eq!(stored[0].status, PostingStatus::Inactive);
    assert_eq!(stored[1].status, PostingStatus::Active);
}

#[tokio::test]
async fn user_fields_survive_reconciliation() {
    let (store, engine) = engine().await;
    let batch = vec![raw("X", "Analyst", "London", "s1", Some("v1"))];
    engine.reconcile_at(&batch, "X", ts(9)).await.unwrap();
    let id = store.postings_for_source("X", "s1").await.unwrap()[0].id;
    assert!(store.set_flagged(id, true).await.unwrap());
    assert!(store.set_user_note(id, Some("call recruiter")).await.unwrap());

    let changed = vec![raw("X", "Analyst", "London", "s1", Some("v2"))];
    engine.reconcile_at(&changed, "X", ts(10)).await.unwrap();

    let posting = store.get_posting(id).await.unwrap().unwrap();
    assert!(posting.is_flagged);
    assert_eq!(posting.user_note.as_deref(), Some("call recruiter"));
    assert_eq!(posting.raw_description.as_deref(), Some("v2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_batches_for_different_sources_do_not_interfere() {
    let dir = tempdir().expect("tempdir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("jobs.db").display());
    let store = PostingStore::connect(&url).await.expect("connect");
    store.migrate().await.expect("migrate");
    let engine = Arc::new(Reconciler::new(store.clone()));

    let sources: Vec<String> = (0..8).map(|i| format!("region-{i}")).collect();
    for source in &sources {
        let seed = vec![raw("X", "Analyst", source, source, Some("v0"))];
        engine.reconcile_source_at(&seed, "X", Some(source), ts(8)).await.unwrap();
    }

    for round in 0..5u32 {
        let mut tasks = JoinSet::new();
        for source in sources.clone() {
            let engine = engine.clone();
            tasks.spawn(async move {
                let batch = vec![
                    raw("X", "Analyst", &source, &source, Some(format!("v{round}").as_str())),
                    raw("X", &format!("Trader {round}"), &source, &source, None),
                ];
                engine.reconcile_source_at(&batch, "X", Some(&source), ts(9 + round)).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            let stats = joined.expect("task").expect("reconcile");
            assert_eq!(stats.new_count, 1);
        }
    }

    for source in &sources {
        let active = active_identities(&store, "X", source).await;
        let expected: BTreeSet<String> = ["Analyst", "Trader 4"]
            .into_iter()
            .map(|title| identity_fingerprint("X", title, source))
            .collect();
        assert_eq!(active, expected, "active set for {source}");
    }
}

#[tokio::test]
async fn storage_failure_rolls_back_the_whole_batch() {
    let (store, engine) = engine().await;
    let prior = vec![
        raw("X", "Analyst", "London", "s1", Some("v1")),
        raw("X", "Associate", "London", "s1", None),
        raw("X", "Director", "London", "s1", None),
    ];
    engine.reconcile_at(&prior, "X", ts(9)).await.unwrap();

    // Closing "Director" fails after the update, the insert and the first closure.
    sqlx::query(
        "CREATE TRIGGER keep_director_open BEFORE UPDATE OF status ON postings \
         WHEN OLD.title = 'Director' AND NEW.status = 'inactive' \
         BEGIN SELECT RAISE(ABORT, 'director must stay open'); END",
    )
    .execute(store.pool())
    .await
    .unwrap();

    let batch = vec![
        raw("X", "Analyst", "London", "s1", Some("v2")),
        raw("X", "Quant", "London", "s1", None),
    ];
    let err = engine.reconcile_at(&batch, "X", ts(10)).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Store(_)), "unexpected error: {err}");

    let stored = store.postings_for_source("X", "s1").await.unwrap();
    let titles: Vec<_> = stored.iter().map(|p| p.title.as_str()).collect();
    assert_eq!(titles, vec!["Analyst", "Associate", "Director"]);
    assert!(stored.iter().all(|p| p.status == PostingStatus::Active));
    assert!(stored.iter().all(|p| p.last_seen == ts(9)));
    assert_eq!(stored[0].raw_description.as_deref(), Some("v1"));
}
