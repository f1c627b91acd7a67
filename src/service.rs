//! Per-site operation surface. Every request a caller can make against one
//! site flows through a [`SiteContext`]: ingestion, raw event reads, the
//! aggregation endpoints and maintenance. Responses are plain serializable
//! shapes so hosts can forward them over whatever transport they embed in.
//!
//! Aggregation reads never fail outright: a storage error inside one is
//! reported through the response's `error` field next to zero-valued
//! results, so one broken aggregate cannot take a dashboard down with it.

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    analytics::{
        self, BreakdownRow, DEFAULT_BREAKDOWN_ROWS, DEFAULT_VISITOR_WINDOW_SECS,
        DashboardBreakdowns, EventSummaryPage, EventSummaryQuery, EventSummaryRow, Granularity,
        MetricKind, ScoreCards, StatsBreakdown, TimeSeriesPoint, buckets::resolve_timezone,
    },
    config::RunMode,
    error::Result,
    filter::AggregationFilter,
    salt::SaltScheduler,
    store::{
        DEFAULT_EVENTS_PAGE, EventRecord, InsertOutcome, MAX_QUERY_ROWS, SchemaInfo, SiteStore,
        StoredEvent, record_store_op,
    },
};

/// Handle to one resolved site. Cheap to clone; the store and the salt
/// scheduler are shared behind `Arc`s.
#[derive(Clone)]
pub struct SiteContext {
    store: Arc<SiteStore>,
    salt: Option<Arc<SaltScheduler>>,
    run_mode: RunMode,
}

impl SiteContext {
    pub fn new(store: Arc<SiteStore>, salt: Arc<SaltScheduler>, run_mode: RunMode) -> Self {
        Self {
            store,
            salt: Some(salt),
            run_mode,
        }
    }

    /// Context without a salt scheduler, for stores opened outside the
    /// registry (inspection tools, tests).
    pub fn detached(store: Arc<SiteStore>) -> Self {
        Self {
            store,
            salt: None,
            run_mode: RunMode::default(),
        }
    }

    pub fn store(&self) -> Arc<SiteStore> {
        Arc::clone(&self.store)
    }

    pub fn site_id(&self) -> Option<&str> {
        self.store.site_id()
    }

    pub fn run_mode(&self) -> RunMode {
        self.run_mode
    }

    /// Active rid salt for this site, if a scheduler is attached and has
    /// completed its first refresh.
    pub fn current_salt(&self) -> Option<String> {
        self.salt.as_ref()?.current_salt()
    }

    /// Persists a batch of events in arrival order. A mid-batch failure is
    /// reported in the response rather than as an error: everything before
    /// the failing sub-statement stays committed.
    pub fn record_events(&self, events: &[EventRecord]) -> Result<InsertResponse> {
        let InsertOutcome { inserted, error } = self.store.insert_events(events)?;
        if self.run_mode.verbose() {
            debug!(
                site = self.store.site_id(),
                inserted,
                partial = error.is_some(),
                "batch recorded"
            );
        }
        Ok(InsertResponse {
            success: error.is_none(),
            inserted,
            error,
        })
    }

    /// Newest-first page of raw events with pagination bookkeeping.
    pub fn get_events(
        &self,
        filter: &AggregationFilter,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<EventsDataResponse> {
        let limit = limit.unwrap_or(DEFAULT_EVENTS_PAGE).clamp(1, MAX_QUERY_ROWS);
        let events = self.store.list_events(filter, limit, offset)?;
        let total = self.store.count_filtered(filter)?;
        let total_all_time = self.store.total_events()?;
        Ok(EventsDataResponse {
            success: true,
            events,
            pagination: PageInfo {
                limit,
                offset,
                total,
            },
            total_all_time,
        })
    }

    /// Per-event-name counts plus the overall total for the filtered window.
    pub fn get_stats(&self, filter: &AggregationFilter) -> Result<StatsResponse> {
        let outcome = timed("stats", || {
            self.store
                .with_conn(|conn| analytics::event_stats(conn, filter))
        });
        let (stats, error) = degrade(outcome, StatsBreakdown::default());
        Ok(StatsResponse {
            success: error.is_none(),
            breakdown: stats.breakdown,
            total: stats.total,
            error,
        })
    }

    /// Score cards, the daily page-view series and the top-N breakdowns in
    /// one shot. Each part degrades independently: a failing aggregate is
    /// reported through `error` while the rest of the payload stays usable.
    pub fn get_dashboard(
        &self,
        filter: &AggregationFilter,
        timezone: Option<&str>,
    ) -> Result<DashboardResponse> {
        let tz = resolve_timezone(timezone);
        timed("dashboard", || {
            self.store.with_conn(|conn| {
                let mut failures = Vec::new();

                let score_cards = analytics::score_cards(conn, filter).unwrap_or_else(|err| {
                    failures.push(format!("score cards: {err}"));
                    ScoreCards::default()
                });
                let daily_page_views =
                    analytics::daily_page_views(conn, filter, &tz).unwrap_or_else(|err| {
                        failures.push(format!("daily page views: {err}"));
                        Vec::new()
                    });
                let breakdowns = DashboardBreakdowns {
                    top_pages: dashboard_rows(conn, filter, MetricKind::Page, &mut failures),
                    top_referrers: dashboard_rows(
                        conn,
                        filter,
                        MetricKind::Referrer,
                        &mut failures,
                    ),
                    top_countries: dashboard_rows(conn, filter, MetricKind::Country, &mut failures),
                    top_devices: dashboard_rows(conn, filter, MetricKind::Device, &mut failures),
                };

                let error = (!failures.is_empty()).then(|| failures.join("; "));
                Ok(DashboardResponse {
                    success: error.is_none(),
                    score_cards,
                    daily_page_views,
                    breakdowns,
                    error,
                })
            })
        })
    }

    /// Distinct event names with counts, first/last seen and classification,
    /// searchable and paged.
    pub fn get_event_summary(&self, query: &EventSummaryQuery) -> Result<SummaryResponse> {
        let outcome = timed("summary", || {
            self.store
                .with_conn(|conn| analytics::event_summary(conn, query))
        });
        let (page, error) = degrade(
            outcome,
            EventSummaryPage {
                limit: query.effective_limit(),
                offset: query.effective_offset(),
                ..EventSummaryPage::default()
            },
        );
        Ok(SummaryResponse {
            success: error.is_none(),
            rows: page.rows,
            total: page.total,
            limit: page.limit,
            offset: page.offset,
            error,
        })
    }

    /// Bucketed event counts in the viewer's timezone, optionally split per
    /// event name.
    pub fn get_time_series(
        &self,
        filter: &AggregationFilter,
        granularity: Granularity,
        timezone: Option<&str>,
        split_by_event: bool,
    ) -> Result<TimeSeriesResponse> {
        let tz = resolve_timezone(timezone);
        let outcome = timed("time_series", || {
            self.store.with_conn(|conn| {
                let points = analytics::time_series(conn, filter, granularity, &tz)?;
                let by_event = if split_by_event {
                    Some(analytics::time_series_by_event(
                        conn,
                        filter,
                        granularity,
                        &tz,
                    )?)
                } else {
                    None
                };
                Ok((points, by_event))
            })
        });
        let ((points, by_event), error) = degrade(outcome, (Vec::new(), None));
        Ok(TimeSeriesResponse {
            success: error.is_none(),
            granularity,
            points,
            by_event,
            error,
        })
    }

    /// Top values for one dimension, capped at the dimension's ceiling.
    pub fn get_metric_breakdown(
        &self,
        filter: &AggregationFilter,
        metric: MetricKind,
        limit: Option<usize>,
    ) -> Result<MetricsResponse> {
        let outcome = timed("breakdown", || {
            self.store
                .with_conn(|conn| analytics::breakdown(conn, filter, metric, limit))
        });
        let (rows, error) = degrade(outcome, Vec::new());
        Ok(MetricsResponse {
            success: error.is_none(),
            metric,
            rows,
            error,
        })
    }

    /// Screens and runs a caller-supplied read query against the events
    /// table. The response reports the row cap that was in effect.
    pub fn run_sql_query(&self, sql: &str, limit: Option<usize>) -> Result<SqlQueryResponse> {
        let rows = self.store.run_query(sql, limit)?;
        Ok(SqlQueryResponse {
            success: true,
            rows: rows.rows,
            row_count: rows.row_count,
            limit: rows.limit,
        })
    }

    /// Deletes events older than a cutoff, of one event type, or both.
    /// At least one criterion is required.
    pub fn delete_events(
        &self,
        older_than: Option<DateTime<Utc>>,
        event_type: Option<&str>,
    ) -> Result<DeleteResponse> {
        let deleted = self.store.delete_events(older_than, event_type)?;
        if self.run_mode.verbose() {
            debug!(site = self.store.site_id(), deleted, "events deleted");
        }
        Ok(DeleteResponse {
            success: true,
            deleted,
        })
    }

    /// Distinct visitors seen inside the trailing window, 300 seconds by
    /// default.
    pub fn current_visitors(&self, window_secs: Option<u64>) -> Result<VisitorsResponse> {
        let window_secs = window_secs.unwrap_or(DEFAULT_VISITOR_WINDOW_SECS);
        let outcome = timed("visitors", || {
            self.store
                .with_conn(|conn| analytics::current_visitors(conn, window_secs))
        });
        let (current_visitors, error) = degrade(outcome, 0);
        Ok(VisitorsResponse {
            success: error.is_none(),
            current_visitors,
            window_secs,
            error,
        })
    }

    pub fn count_events(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<CountResponse> {
        let count = self.store.count_events_since(start, end)?;
        Ok(CountResponse {
            success: true,
            count,
        })
    }

    /// Live schema of the site store: columns, indexes and applied
    /// migration versions.
    pub fn schema(&self) -> Result<SchemaResponse> {
        let schema = self.store.schema_info()?;
        Ok(SchemaResponse {
            success: true,
            schema,
        })
    }

    /// Liveness probe. Never fails; a broken store is reported in-band.
    pub fn health(&self) -> HealthResponse {
        match self.store.total_events() {
            Ok(total_events) => HealthResponse {
                status: "ok",
                total_events,
                storage_bytes: self.store.storage_bytes(),
                error: None,
            },
            Err(err) => HealthResponse {
                status: "error",
                total_events: 0,
                storage_bytes: None,
                error: Some(err.to_string()),
            },
        }
    }
}

/// Records one aggregation pass in the store-operation metrics.
fn timed<T>(operation: &'static str, run: impl FnOnce() -> Result<T>) -> Result<T> {
    let started = Instant::now();
    match run() {
        Ok(value) => {
            record_store_op(operation, "ok", started.elapsed().as_secs_f64());
            Ok(value)
        }
        Err(err) => {
            record_store_op(operation, "error", started.elapsed().as_secs_f64());
            Err(err)
        }
    }
}

/// Splits an aggregation outcome into its payload and an error annotation,
/// substituting `zero` when the read failed.
fn degrade<T>(outcome: Result<T>, zero: T) -> (T, Option<String>) {
    match outcome {
        Ok(value) => (value, None),
        Err(err) => (zero, Some(err.to_string())),
    }
}

fn dashboard_rows(
    conn: &Connection,
    filter: &AggregationFilter,
    metric: MetricKind,
    failures: &mut Vec<String>,
) -> Vec<BreakdownRow> {
    analytics::breakdown(conn, filter, metric, Some(DEFAULT_BREAKDOWN_ROWS)).unwrap_or_else(|err| {
        failures.push(format!("{}: {err}", metric.as_str()));
        Vec::new()
    })
}

#[derive(Debug, Serialize)]
pub struct InsertResponse {
    pub success: bool,
    pub inserted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PageInfo {
    pub limit: usize,
    pub offset: usize,
    /// Rows matching the filter, before paging.
    pub total: i64,
}

#[derive(Debug, Serialize)]
pub struct EventsDataResponse {
    pub success: bool,
    pub events: Vec<StoredEvent>,
    pub pagination: PageInfo,
    pub total_all_time: i64,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub success: bool,
    pub breakdown: Vec<BreakdownRow>,
    pub total: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    pub success: bool,
    pub score_cards: ScoreCards,
    pub daily_page_views: Vec<TimeSeriesPoint>,
    pub breakdowns: DashboardBreakdowns,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    pub success: bool,
    pub rows: Vec<EventSummaryRow>,
    pub total: i64,
    pub limit: usize,
    pub offset: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TimeSeriesResponse {
    pub success: bool,
    pub granularity: Granularity,
    pub points: Vec<TimeSeriesPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub by_event: Option<BTreeMap<String, Vec<TimeSeriesPoint>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub success: bool,
    pub metric: MetricKind,
    pub rows: Vec<BreakdownRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SqlQueryResponse {
    pub success: bool,
    pub rows: Vec<JsonValue>,
    pub row_count: usize,
    /// Row cap that was in effect for this query.
    pub limit: usize,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub deleted: usize,
}

#[derive(Debug, Serialize)]
pub struct VisitorsResponse {
    pub success: bool,
    pub current_visitors: i64,
    pub window_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub success: bool,
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct SchemaResponse {
    pub success: bool,
    pub schema: SchemaInfo,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub total_events: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
