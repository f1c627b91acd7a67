//! Aggregation reads over a site's events table.
//!
//! Rows are grouped by hour-of-epoch in SQL and re-bucketed into calendar
//! periods in the requested time zone here, so day boundaries follow the
//! viewer's zone without the store knowing about zones at all.

pub mod buckets;
pub mod types;

use std::collections::BTreeMap;

use chrono::Utc;
use chrono_tz::Tz;
use rusqlite::{Connection, params, params_from_iter, types::Value};

use crate::{error::Result, filter::AggregationFilter};

pub use types::{
    AUTO_CAPTURE_PREFIX, BreakdownRow, CONVERSION_EVENTS, DashboardBreakdowns, EventKind,
    EventSummaryPage, EventSummaryQuery, EventSummaryRow, Granularity, MetricKind, PAGE_VIEW_EVENT,
    ScoreCards, SortDirection, StatsBreakdown, SummarySort, TimeSeriesPoint, capture_action,
};

use buckets::MS_PER_HOUR;

pub const DEFAULT_BREAKDOWN_ROWS: usize = 10;
pub const DEFAULT_SUMMARY_ROWS: usize = 50;
pub const MAX_SUMMARY_ROWS: usize = 500;
pub const DEFAULT_VISITOR_WINDOW_SECS: u64 = 300;

/// Condition selecting rows that belong to an identifiable session.
const RID_PRESENT: &str = "rid IS NOT NULL AND rid != ''";

pub fn score_cards(conn: &Connection, filter: &AggregationFilter) -> Result<ScoreCards> {
    let unique_visitors = unique_visitors(conn, filter)?;
    let total_page_views = total_page_views(conn, filter)?;

    let bounce_rate = if unique_visitors > 0 {
        let single = single_page_sessions(conn, filter)?;
        round1(single as f64 / unique_visitors as f64 * 100.0)
    } else {
        0.0
    };

    let conversion_rate = if unique_visitors > 0 {
        let conversions = conversion_events(conn, filter)?;
        round2(conversions as f64 / unique_visitors as f64 * 100.0)
    } else {
        0.0
    };

    let avg_session_duration_secs = avg_session_duration(conn, filter)?;

    Ok(ScoreCards {
        unique_visitors,
        total_page_views,
        bounce_rate,
        conversion_rate,
        avg_session_duration_secs,
    })
}

pub fn unique_visitors(conn: &Connection, filter: &AggregationFilter) -> Result<i64> {
    let mut clause = filter.clause();
    clause.and(RID_PRESENT);
    let sql = format!("SELECT COUNT(DISTINCT rid) FROM events{}", clause.where_sql());
    query_count(conn, &sql, clause.params())
}

pub fn total_page_views(conn: &Connection, filter: &AggregationFilter) -> Result<i64> {
    let mut clause = filter.clause();
    clause.and("event = 'page_view'");
    let sql = format!("SELECT COUNT(*) FROM events{}", clause.where_sql());
    query_count(conn, &sql, clause.params())
}

/// Sessions whose page-view count is exactly one. Other event types do not
/// save a session from counting as a bounce.
fn single_page_sessions(conn: &Connection, filter: &AggregationFilter) -> Result<i64> {
    let mut clause = filter.clause();
    clause.and("event = 'page_view'");
    clause.and(RID_PRESENT);
    let sql = format!(
        "SELECT COUNT(*) FROM (SELECT rid FROM events{} GROUP BY rid HAVING COUNT(*) = 1)",
        clause.where_sql()
    );
    query_count(conn, &sql, clause.params())
}

fn conversion_events(conn: &Connection, filter: &AggregationFilter) -> Result<i64> {
    let names = CONVERSION_EVENTS
        .map(|name| format!("'{name}'"))
        .join(", ");
    let mut clause = filter.clause();
    clause.and(&format!("event IN ({names})"));
    let sql = format!("SELECT COUNT(*) FROM events{}", clause.where_sql());
    query_count(conn, &sql, clause.params())
}

/// Mean of per-session spans (last event minus first, in seconds) over all
/// identifiable sessions in the slice.
fn avg_session_duration(conn: &Connection, filter: &AggregationFilter) -> Result<f64> {
    let mut clause = filter.clause();
    clause.and(RID_PRESENT);
    let sql = format!(
        "SELECT COALESCE(AVG(span_secs), 0.0) FROM (
            SELECT (MAX(created_at) - MIN(created_at)) / 1000.0 AS span_secs
            FROM events{} GROUP BY rid
        )",
        clause.where_sql()
    );
    let avg: f64 = conn.query_row(&sql, params_from_iter(clause.params().iter()), |row| {
        row.get(0)
    })?;
    Ok(round1(avg))
}

/// Page views per local calendar day, ordered by date.
pub fn daily_page_views(
    conn: &Connection,
    filter: &AggregationFilter,
    tz: &Tz,
) -> Result<Vec<TimeSeriesPoint>> {
    let mut clause = filter.clause();
    clause.and("event = 'page_view'");
    let rows = hour_buckets(conn, &clause.where_sql(), clause.params())?;
    Ok(fold_buckets(rows, |bucket| buckets::local_day(bucket, tz)))
}

/// Event counts per period at the requested granularity.
pub fn time_series(
    conn: &Connection,
    filter: &AggregationFilter,
    granularity: Granularity,
    tz: &Tz,
) -> Result<Vec<TimeSeriesPoint>> {
    let clause = filter.clause();
    let rows = hour_buckets(conn, &clause.where_sql(), clause.params())?;
    Ok(fold_buckets(rows, |bucket| period_key(bucket, granularity, tz)))
}

/// Like [`time_series`], but split per event name.
pub fn time_series_by_event(
    conn: &Connection,
    filter: &AggregationFilter,
    granularity: Granularity,
    tz: &Tz,
) -> Result<BTreeMap<String, Vec<TimeSeriesPoint>>> {
    let clause = filter.clause();
    let sql = format!(
        "SELECT event, created_at / {MS_PER_HOUR} AS hour_bucket, COUNT(*)
         FROM events{} GROUP BY event, hour_bucket",
        clause.where_sql()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(clause.params().iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut per_event: BTreeMap<String, BTreeMap<String, i64>> = BTreeMap::new();
    for (event, bucket, count) in rows {
        *per_event
            .entry(event)
            .or_default()
            .entry(period_key(bucket, granularity, tz))
            .or_default() += count;
    }

    Ok(per_event
        .into_iter()
        .map(|(event, periods)| {
            let series = periods
                .into_iter()
                .map(|(period, count)| TimeSeriesPoint { period, count })
                .collect();
            (event, series)
        })
        .collect())
}

/// Top values of one dimension by event count, descending. `limit` is
/// clamped to the dimension's ceiling.
pub fn breakdown(
    conn: &Connection,
    filter: &AggregationFilter,
    metric: MetricKind,
    limit: Option<usize>,
) -> Result<Vec<BreakdownRow>> {
    let column = metric.column();
    let mut clause = filter.clause();
    clause.and(&format!("{column} IS NOT NULL AND {column} != ''"));

    let effective = limit
        .unwrap_or(DEFAULT_BREAKDOWN_ROWS)
        .clamp(1, metric.ceiling());
    let sql = format!(
        "SELECT {column} AS value, COUNT(*) AS cnt FROM events{}
         GROUP BY {column} ORDER BY cnt DESC, value ASC LIMIT {effective}",
        clause.where_sql()
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(clause.params().iter()), |row| {
            Ok(BreakdownRow {
                value: row.get(0)?,
                count: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Per-event-name counts for the slice plus the total across all names.
pub fn event_stats(conn: &Connection, filter: &AggregationFilter) -> Result<StatsBreakdown> {
    let clause = filter.clause();
    let sql = format!(
        "SELECT event, COUNT(*) AS cnt FROM events{}
         GROUP BY event ORDER BY cnt DESC, event ASC",
        clause.where_sql()
    );
    let mut stmt = conn.prepare(&sql)?;
    let breakdown = stmt
        .query_map(params_from_iter(clause.params().iter()), |row| {
            Ok(BreakdownRow {
                value: row.get(0)?,
                count: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<BreakdownRow>>>()?;

    let total = breakdown.iter().map(|row| row.count).sum();
    Ok(StatsBreakdown { breakdown, total })
}

/// Grouped event-name listing with classification, search, sort, and paging.
pub fn event_summary(conn: &Connection, query: &EventSummaryQuery) -> Result<EventSummaryPage> {
    let mut clause = query.filter.clause();
    if let Some(search) = query
        .search
        .as_deref()
        .map(str::trim)
        .filter(|search| !search.is_empty())
    {
        clause.and_bind("event LIKE '%' || ? || '%'", Value::from(search.to_string()));
    }
    if let Some(kind) = query.kind {
        clause.and(kind.predicate_sql());
    }

    let total_sql = format!("SELECT COUNT(DISTINCT event) FROM events{}", clause.where_sql());
    let total = query_count(conn, &total_sql, clause.params())?;

    let limit = query.effective_limit();
    let offset = query.effective_offset();
    let sql = format!(
        "SELECT event, COUNT(*) AS cnt, MIN(created_at) AS first_seen, MAX(created_at) AS last_seen
         FROM events{}
         GROUP BY event
         ORDER BY {} {}, event ASC
         LIMIT {limit} OFFSET {offset}",
        clause.where_sql(),
        query.sort.order_column(),
        query.direction.as_sql(),
    );

    let mut stmt = conn.prepare(&sql)?;
    let grouped = stmt
        .query_map(params_from_iter(clause.params().iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let rows = grouped
        .into_iter()
        .map(|(event, count, first_ms, last_ms)| {
            let kind = EventKind::classify(&event);
            let action = capture_action(&event);
            EventSummaryRow {
                event,
                kind,
                action,
                count,
                first_seen: buckets::datetime_from_ms(first_ms),
                last_seen: buckets::datetime_from_ms(last_ms),
            }
        })
        .collect();

    Ok(EventSummaryPage {
        rows,
        total,
        limit,
        offset,
    })
}

/// Distinct identifiable sessions seen in the trailing window.
pub fn current_visitors(conn: &Connection, window_secs: u64) -> Result<i64> {
    let cutoff = Utc::now().timestamp_millis() - (window_secs as i64).saturating_mul(1000);
    let sql = format!("SELECT COUNT(DISTINCT rid) FROM events WHERE created_at >= ? AND {RID_PRESENT}");
    let count = conn.query_row(&sql, params![cutoff], |row| row.get(0))?;
    Ok(count)
}

fn hour_buckets(conn: &Connection, where_sql: &str, params: &[Value]) -> Result<Vec<(i64, i64)>> {
    let sql = format!(
        "SELECT created_at / {MS_PER_HOUR} AS hour_bucket, COUNT(*)
         FROM events{where_sql} GROUP BY hour_bucket"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(params.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn fold_buckets(rows: Vec<(i64, i64)>, key: impl Fn(i64) -> String) -> Vec<TimeSeriesPoint> {
    let mut periods: BTreeMap<String, i64> = BTreeMap::new();
    for (bucket, count) in rows {
        *periods.entry(key(bucket)).or_default() += count;
    }
    periods
        .into_iter()
        .map(|(period, count)| TimeSeriesPoint { period, count })
        .collect()
}

fn period_key(bucket: i64, granularity: Granularity, tz: &Tz) -> String {
    match granularity {
        Granularity::Hour => buckets::hour_key(bucket),
        Granularity::Day => buckets::local_day(bucket, tz),
        Granularity::Week => buckets::week_key(buckets::local_date(bucket, tz)),
        Granularity::Month => buckets::month_key(buckets::local_date(bucket, tz)),
    }
}

fn query_count(conn: &Connection, sql: &str, params: &[Value]) -> Result<i64> {
    let count = conn.query_row(sql, params_from_iter(params.iter()), |row| row.get(0))?;
    Ok(count)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
