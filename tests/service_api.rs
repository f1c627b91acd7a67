use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use sitepulse::{
    AggregationFilter, AnalyticsError, EngineConfig, EventKind, EventRecord, EventSummaryQuery,
    Granularity, ScoreCards, SiteRegistry,
};
use tempfile::TempDir;

type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[tokio::test(flavor = "multi_thread")]
async fn ingest_and_dashboard_flow() -> TestResult<()> {
    let temp = TempDir::new()?;
    let registry = test_registry(&temp)?;
    let site = registry.resolve("acme")?;

    let batch = vec![
        event("page_view", "r1", "/", at(10, 0, 0)),
        event("page_view", "r1", "/pricing", at(10, 0, 30)),
        event("page_view", "r2", "/", at(10, 5, 0)),
        event("page_view", "r3", "/docs", at(10, 10, 0)),
        event("conversion", "r3", "/docs", at(10, 11, 0)),
    ];
    let response = site.record_events(&batch)?;
    assert!(response.success);
    assert_eq!(response.inserted, 5);

    let filter = AggregationFilter::for_range(Some(at(0, 0, 0)), Some(at(12, 0, 0)));
    let dashboard = site.get_dashboard(&filter, None)?;
    assert!(dashboard.success, "{:?}", dashboard.error);
    assert_eq!(
        dashboard.score_cards,
        ScoreCards {
            unique_visitors: 3,
            total_page_views: 4,
            bounce_rate: 66.7,
            conversion_rate: 33.33,
            avg_session_duration_secs: 30.0,
        }
    );
    assert_eq!(dashboard.daily_page_views.len(), 1);
    assert_eq!(dashboard.daily_page_views[0].period, "2024-03-01");
    assert_eq!(dashboard.daily_page_views[0].count, 4);
    assert_eq!(dashboard.breakdowns.top_pages.len(), 3);
    assert_eq!(dashboard.breakdowns.top_pages[0].value, "/");
    assert_eq!(dashboard.breakdowns.top_pages[0].count, 2);

    // Resolving the site primes its rid salt.
    let salt = site.current_salt().ok_or("salt not initialized")?;
    assert_eq!(salt.len(), 32);
    assert!(registry.config().salts_path().exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn batches_span_multiple_insert_statements() -> TestResult<()> {
    let temp = TempDir::new()?;
    let registry = test_registry(&temp)?;
    let site = registry.resolve("acme")?;

    // Nine rows need three INSERTs under the bound-parameter ceiling.
    let batch: Vec<EventRecord> = (0..9)
        .map(|n| event("page_view", &format!("r{n}"), "/", at(9, 0, n)))
        .collect();
    let response = site.record_events(&batch)?;
    assert!(response.success);
    assert_eq!(response.inserted, 9);

    let page = site.get_events(&AggregationFilter::default(), Some(3), 6)?;
    assert_eq!(page.events.len(), 3);
    assert_eq!(page.pagination.total, 9);
    assert_eq!(page.total_all_time, 9);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn ad_hoc_queries_respect_the_row_cap() -> TestResult<()> {
    let temp = TempDir::new()?;
    let registry = test_registry(&temp)?;
    let site = registry.resolve("acme")?;

    let batch: Vec<EventRecord> = (0..501)
        .map(|n| {
            event(
                "page_view",
                &format!("r{n}"),
                "/",
                at(8, 0, 0) + Duration::seconds(n),
            )
        })
        .collect();
    assert_eq!(site.record_events(&batch)?.inserted, 501);

    let capped = site.run_sql_query("SELECT id FROM events", None)?;
    assert_eq!(capped.row_count, 500);
    assert_eq!(capped.limit, 500);

    // A caller-supplied LIMIT is left alone.
    let limited = site.run_sql_query("SELECT id FROM events LIMIT 7", None)?;
    assert_eq!(limited.row_count, 7);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_queries_surface_their_reason() -> TestResult<()> {
    let temp = TempDir::new()?;
    let registry = test_registry(&temp)?;
    let site = registry.resolve("acme")?;

    let cases = [
        (
            "SELECT 1 FROM events; SELECT 2 FROM events",
            "multiple statements not allowed",
        ),
        ("DELETE FROM events", "only read queries allowed"),
        (
            "WITH x AS (SELECT 1) UPDATE events SET event = 'y'",
            "read-only violation",
        ),
        ("SELECT * FROM sessions", "must reference the events table"),
    ];
    for (sql, reason) in cases {
        let err = site.run_sql_query(sql, None).expect_err("must be rejected");
        assert!(matches!(err, AnalyticsError::InvalidQuery(_)), "{sql}");
        assert_eq!(err.to_string(), reason, "{sql}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn deletes_require_criteria() -> TestResult<()> {
    let temp = TempDir::new()?;
    let registry = test_registry(&temp)?;
    let site = registry.resolve("acme")?;
    site.record_events(&[
        event("page_view", "r1", "/", at(9, 0, 0)),
        event("custom", "r1", "/", at(10, 0, 0)),
        event("page_view", "r2", "/", at(11, 0, 0)),
    ])?;

    let err = site.delete_events(None, None).expect_err("criteria required");
    assert!(matches!(err, AnalyticsError::MissingDeleteCriteria));

    let pruned = site.delete_events(Some(at(10, 30, 0)), None)?;
    assert_eq!(pruned.deleted, 2);

    let typed = site.delete_events(None, Some("page_view"))?;
    assert_eq!(typed.deleted, 1);
    assert_eq!(site.health().total_events, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn sites_are_isolated() -> TestResult<()> {
    let temp = TempDir::new()?;
    let registry = test_registry(&temp)?;
    let acme = registry.resolve("acme")?;
    let globex = registry.resolve("globex")?;

    acme.record_events(&[event("page_view", "r1", "/", at(9, 0, 0))])?;
    assert_eq!(acme.health().total_events, 1);
    assert_eq!(globex.health().total_events, 0);
    assert!(registry.config().site_db_path("acme").exists());
    assert!(registry.config().site_db_path("globex").exists());
    assert_eq!(
        registry.resolved_sites(),
        vec!["acme".to_string(), "globex".to_string()]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn invalidate_reopens_with_data_intact() -> TestResult<()> {
    let temp = TempDir::new()?;
    let registry = test_registry(&temp)?;
    let site = registry.resolve("acme")?;
    site.record_events(&[event("page_view", "r1", "/", at(9, 0, 0))])?;

    registry.invalidate("acme");
    let reopened = registry.resolve("acme")?;
    assert!(!Arc::ptr_eq(&site.store(), &reopened.store()));
    assert_eq!(reopened.health().total_events, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn date_filters_include_the_whole_end_day() -> TestResult<()> {
    let temp = TempDir::new()?;
    let registry = test_registry(&temp)?;
    let site = registry.resolve("acme")?;
    site.record_events(&[event("page_view", "r1", "/", at(23, 59, 59))])?;

    let mut filter = AggregationFilter::for_range(Some(at(0, 0, 0)), Some(at(12, 0, 0)));
    let widened = site.get_events(&filter, None, 0)?;
    assert_eq!(widened.pagination.total, 1);

    filter.end_exact = true;
    let exact = site.get_events(&filter, None, 0)?;
    assert_eq!(exact.pagination.total, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn event_summary_classifies_and_pages() -> TestResult<()> {
    let temp = TempDir::new()?;
    let registry = test_registry(&temp)?;
    let site = registry.resolve("acme")?;
    site.record_events(&[
        event("page_view", "r1", "/", at(9, 0, 0)),
        event("page_view", "r2", "/", at(9, 1, 0)),
        event("ac.click.nav-signup", "r1", "/", at(9, 2, 0)),
        event("ac.click.nav-signup", "r2", "/", at(9, 3, 0)),
        event("ac.click.nav-signup", "r3", "/", at(9, 4, 0)),
        event("signup", "r3", "/", at(9, 5, 0)),
    ])?;

    let query = EventSummaryQuery {
        limit: Some(2),
        ..Default::default()
    };
    let summary = site.get_event_summary(&query)?;
    assert_eq!(summary.total, 3);
    assert_eq!(summary.rows.len(), 2);
    assert_eq!(summary.rows[0].event, "ac.click.nav-signup");
    assert_eq!(summary.rows[0].kind, EventKind::AutoCapture);
    assert_eq!(summary.rows[0].action, Some("click"));
    assert_eq!(summary.rows[0].count, 3);
    assert_eq!(summary.rows[1].event, "page_view");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn time_series_follows_the_viewer_timezone() -> TestResult<()> {
    let temp = TempDir::new()?;
    let registry = test_registry(&temp)?;
    let site = registry.resolve("acme")?;
    // 2024-03-01T03:00Z is still Feb 29 in New York.
    site.record_events(&[event("page_view", "r1", "/", at(3, 0, 0))])?;

    let filter = AggregationFilter::default();
    let series = site.get_time_series(&filter, Granularity::Day, Some("America/New_York"), false)?;
    assert_eq!(series.points.len(), 1);
    assert_eq!(series.points[0].period, "2024-02-29");
    assert!(series.by_event.is_none());

    let split = site.get_time_series(&filter, Granularity::Hour, None, true)?;
    let by_event = split.by_event.ok_or("missing by_event split")?;
    assert!(by_event.contains_key("page_view"));
    Ok(())
}

fn test_registry(temp: &TempDir) -> TestResult<SiteRegistry> {
    let mut config = EngineConfig::default();
    config.data_dir = temp.path().join("data");
    Ok(SiteRegistry::with_local_directory(config)?)
}

fn event(name: &str, rid: &str, page: &str, created_at: DateTime<Utc>) -> EventRecord {
    EventRecord {
        event: name.to_string(),
        created_at: Some(created_at),
        rid: Some(rid.to_string()),
        page_url: Some(page.to_string()),
        tag_id: "tag-1".to_string(),
        ..Default::default()
    }
}

fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, second)
        .single()
        .expect("valid timestamp")
}
