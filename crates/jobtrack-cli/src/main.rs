use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use jobtrack_core::{Category, PostingStatus};
use jobtrack_storage::{PostingFilter, PostingStore, TimeRange};
use jobtrack_sync::{
    CategoryDelta, JobTracker, RunSummary, SnapshotEngine, SourceOutcome, SyncConfig, YearOverYear,
};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobtrack")]
#[command(about = "Job posting reconciliation and weekly snapshot tracker")]
struct Cli {
    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Active,
    Inactive,
    All,
}

impl StatusArg {
    fn into_filter(self) -> Option<PostingStatus> {
        match self {
            StatusArg::Active => Some(PostingStatus::Active),
            StatusArg::Inactive => Some(PostingStatus::Inactive),
            StatusArg::All => None,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// List the source registry.
    Sources,
    /// Scrape and reconcile every enabled source.
    Sync {
        /// Run in the background and poll progress until it finishes.
        #[arg(long)]
        background: bool,
    },
    /// Scrape and reconcile one source.
    SyncSource { source_id: String },
    /// Capture this week's snapshot (no-op if it exists).
    Snapshot,
    Trend {
        #[arg(long, default_value_t = 12)]
        weeks: usize,
    },
    /// Compare this ISO week with the same week last year.
    Yoy {
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        company: Option<String>,
    },
    Snapshots,
    Stats,
    Postings {
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        category: Option<Category>,
        #[arg(long)]
        keyword: Option<String>,
        #[arg(long)]
        flagged: bool,
        /// all, this_week or this_month.
        #[arg(long, default_value = "all")]
        range: TimeRange,
        #[arg(long, value_enum, default_value_t = StatusArg::Active)]
        status: StatusArg,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        per_page: u32,
    },
    Flag {
        id: i64,
        /// Remove the flag instead of setting it.
        #[arg(long)]
        off: bool,
    },
    Note {
        id: i64,
        text: Option<String>,
        #[arg(long)]
        clear: bool,
    },
    /// Run the daily sync and weekly snapshot on their cron schedules until Ctrl-C.
    Schedule,
    /// Estimate past weekly counts for a source from archived pages.
    Backfill {
        source_id: String,
        #[arg(long, default_value_t = 52)]
        weeks: i64,
        #[arg(long)]
        dry_run: bool,
    },
    /// Report archive coverage of every source with an archive URL.
    Coverage,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

async fn open_store(config: &SyncConfig) -> Result<PostingStore> {
    let store = PostingStore::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    store.migrate().await.context("running migrations")?;
    Ok(store)
}

fn print_summary(summary: &RunSummary) {
    println!(
        "sync complete: run_id={} succeeded={} failed={} new={} updated={} inactive={} scraped={}",
        summary.run_id,
        summary.sources_succeeded,
        summary.sources_failed,
        summary.totals.new_count,
        summary.totals.updated_count,
        summary.totals.inactive_count,
        summary.totals.total_scraped,
    );
    for (source_id, outcome) in &summary.outcomes {
        match outcome {
            SourceOutcome::Succeeded { stats, attempts } => println!(
                "  ok   {source_id}: new={} updated={} inactive={} skipped={} (attempts={attempts})",
                stats.new_count, stats.updated_count, stats.inactive_count, stats.skipped_count
            ),
            SourceOutcome::Failed { error, attempts } => {
                println!("  FAIL {source_id}: {error} (attempts={attempts})")
            }
        }
    }
}

fn format_change_percent(percent: Option<f64>) -> String {
    percent.map_or_else(|| "n/a".to_string(), |p| format!("{p:+.1}%"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,jobtrack_sync=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    let json = cli.json;

    match cli.command.unwrap_or(Commands::Sync { background: false }) {
        Commands::Migrate => {
            open_store(&config).await?;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Sources => {
            let registry = jobtrack_sync::load_source_registry(&config.sources_path()).await?;
            if json {
                return print_json(&registry);
            }
            for source in &registry.sources {
                println!(
                    "{:<20} {:<8} {:<13} {}",
                    source.source_id,
                    if source.enabled { "enabled" } else { "disabled" },
                    format!("{:?}", source.adapter),
                    source.display_name
                );
            }
        }
        Commands::Sync { background } => {
            let tracker = JobTracker::from_config(config).await?;
            let summary = if background {
                tracker.orchestrator.run_all_async().await;
                let mut last_source = None;
                loop {
                    let progress = tracker.orchestrator.progress().await;
                    if !progress.is_running {
                        break;
                    }
                    if progress.current_source != last_source {
                        if let Some(source) = &progress.current_source {
                            eprintln!("[{}/{}] {source}", progress.current_index, progress.total_sources);
                        }
                        last_source = progress.current_source;
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                tracker
                    .orchestrator
                    .wait_for_async_run()
                    .await
                    .context("background run produced no summary")?
            } else {
                tracker.orchestrator.run_all(true).await
            };
            if json {
                return print_json(&summary);
            }
            print_summary(&summary);
        }
        Commands::SyncSource { source_id } => {
            let tracker = JobTracker::from_config(config).await?;
            let stats = tracker.orchestrator.run_one(&source_id).await?;
            if json {
                return print_json(&stats);
            }
            println!(
                "{source_id}: new={} updated={} inactive={} scraped={} skipped={}",
                stats.new_count, stats.updated_count, stats.inactive_count, stats.total_scraped, stats.skipped_count
            );
        }
        Commands::Snapshot => {
            let engine = SnapshotEngine::new(open_store(&config).await?);
            let snapshot = engine.capture_weekly_snapshot().await?;
            if json {
                return print_json(&snapshot);
            }
            println!(
                "snapshot {} (id={}): active={} companies={} locations={} new={:?} closed={:?}",
                snapshot.week_label(),
                snapshot.id,
                snapshot.total_active,
                snapshot.total_companies,
                snapshot.total_locations,
                snapshot.new_this_week,
                snapshot.closed_this_week
            );
        }
        Commands::Trend { weeks } => {
            let engine = SnapshotEngine::new(open_store(&config).await?);
            let trend = engine.get_trend(weeks).await?;
            if json {
                return print_json(&trend);
            }
            for point in &trend {
                println!(
                    "{}  active={:<6} new={:<6} closed={}",
                    point.week,
                    point.total_active,
                    point.new_this_week.map_or("-".to_string(), |n| n.to_string()),
                    point.closed_this_week.map_or("-".to_string(), |n| n.to_string()),
                );
            }
        }
        Commands::Yoy { category, company } => {
            let engine = SnapshotEngine::new(open_store(&config).await?);
            let result = engine
                .get_year_over_year(category.as_deref(), company.as_deref())
                .await?;
            if json {
                return print_json(&result);
            }
            match result {
                YearOverYear::Unavailable { reason, .. } => println!("year-over-year unavailable: {reason}"),
                YearOverYear::Available(cmp) => {
                    println!(
                        "week {} {} vs {}: {} -> {} ({:+}, {})",
                        cmp.week_number,
                        cmp.prior_year,
                        cmp.year,
                        cmp.prior,
                        cmp.current,
                        cmp.change,
                        format_change_percent(cmp.change_percent)
                    );
                    for (name, CategoryDelta { current, prior, change }) in &cmp.categories {
                        println!("  {name:<20} {prior:>5} -> {current:<5} ({change:+})");
                    }
                }
            }
        }
        Commands::Snapshots => {
            let engine = SnapshotEngine::new(open_store(&config).await?);
            let snapshots = engine.list_snapshots().await?;
            if json {
                return print_json(&snapshots);
            }
            for s in &snapshots {
                println!(
                    "{:>4} {} {}  active={} companies={} origin={:?}",
                    s.id,
                    s.week,
                    s.snapshot_date.format("%Y-%m-%d"),
                    s.total_active,
                    s.total_companies,
                    s.origin
                );
            }
        }
        Commands::Stats => {
            let store = open_store(&config).await?;
            let stats = store.statistics(Utc::now()).await?;
            if json {
                return print_json(&stats);
            }
            println!("active postings:    {}", stats.total_active);
            println!("inactive postings:  {}", stats.total_inactive);
            println!("new this week:      {}", stats.new_this_week);
            println!("new this month:     {}", stats.new_this_month);
            println!("flagged (active):   {}", stats.flagged_active);
            println!("active companies:   {}", stats.active_companies);
            println!("tracking weeks:     {}", stats.tracking_weeks);
        }
        Commands::Postings {
            company,
            location,
            category,
            keyword,
            flagged,
            range,
            status,
            page,
            per_page,
        } => {
            let store = open_store(&config).await?;
            let filter = PostingFilter {
                company,
                location,
                category,
                keyword,
                flagged_only: flagged,
                time_range: range,
                status: status.into_filter(),
            };
            let now = Utc::now();
            let page = store.list_postings(&filter, page, per_page, now).await?;
            if json {
                return print_json(&page);
            }
            for p in &page.postings {
                let marker = match (p.is_new(now), p.is_recently_updated(now)) {
                    (true, _) => "new",
                    (false, true) => "upd",
                    _ => "",
                };
                println!(
                    "{:>6} {} {:<3} {} | {} | {} | {} | first seen {}",
                    p.id,
                    if p.is_flagged { "*" } else { " " },
                    marker,
                    p.company,
                    p.title,
                    p.normalized_location,
                    p.category.map_or("-".to_string(), |c| c.to_string()),
                    p.first_seen.format("%Y-%m-%d"),
                );
            }
            println!("page {}/{} ({} postings)", page.page, page.pages.max(1), page.total);
        }
        Commands::Flag { id, off } => {
            let store = open_store(&config).await?;
            if !store.set_flagged(id, !off).await? {
                bail!("no posting with id {id}");
            }
            println!("posting {id} {}", if off { "unflagged" } else { "flagged" });
        }
        Commands::Note { id, text, clear } => {
            let note = match (text, clear) {
                (_, true) => None,
                (Some(text), false) => Some(text),
                (None, false) => bail!("provide note text or --clear"),
            };
            let store = open_store(&config).await?;
            if !store.set_user_note(id, note.as_deref()).await? {
                bail!("no posting with id {id}");
            }
            println!("posting {id} note {}", if note.is_some() { "saved" } else { "cleared" });
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let tracker = JobTracker::from_config(config).await?;
            let Some(mut sched) = tracker.maybe_build_scheduler().await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            tracing::info!(
                daily = %tracker.config.daily_cron,
                weekly = %tracker.config.weekly_cron,
                "scheduler running; press Ctrl-C to stop"
            );
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Backfill {
            source_id,
            weeks,
            dry_run,
        } => {
            let tracker = JobTracker::from_config(config).await?;
            let source = tracker
                .registry
                .find(&source_id)
                .with_context(|| format!("unknown source `{source_id}`"))?;
            let report = tracker.backfiller().backfill_source(source, weeks, dry_run).await?;
            if json {
                return print_json(&report);
            }
            println!(
                "{}: {} captures, {} sampled, {} estimates",
                report.source_id,
                report.captures_found,
                report.captures_sampled,
                report.points.len()
            );
            for point in &report.points {
                println!("  {}  ~{} jobs", point.captured_at.format("%Y-%m-%d"), point.estimated_jobs);
            }
            let verb = if report.dry_run { "would create" } else { "created" };
            println!("{verb} {} snapshot(s): {}", report.created_weeks.len(), report.created_weeks.join(", "));
            if !report.skipped_weeks.is_empty() {
                println!("skipped existing weeks: {}", report.skipped_weeks.join(", "));
            }
        }
        Commands::Coverage => {
            let tracker = JobTracker::from_config(config).await?;
            let coverage = tracker.backfiller().coverage(&tracker.registry.sources).await;
            if json {
                return print_json(&coverage);
            }
            println!("{:<20} {:<22} {}", "source", "captures (last 30d)", "likelihood");
            for c in &coverage {
                println!("{:<20} {:<22} {:?}", c.source_id, c.recent_captures, c.level);
            }
        }
    }

    Ok(())
}
