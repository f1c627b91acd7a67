use std::{
    fs,
    path::{Path, PathBuf},
    time::Instant,
};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use parking_lot::Mutex;
use rusqlite::{
    Connection, params_from_iter,
    types::{Value, ValueRef},
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::{
    analytics::buckets,
    error::{AnalyticsError, Result},
    filter::{AggregationFilter, SqlClause},
    migrations, sandbox,
};

/// Bound parameters per event row.
pub const EVENT_BIND_FIELDS: usize = 21;
/// Parameter ceiling a single prepared statement may carry.
pub const MAX_BOUND_PARAMS: usize = 100;
/// Rows per INSERT statement so the bound-parameter ceiling holds.
pub const MAX_ROWS_PER_INSERT: usize = MAX_BOUND_PARAMS / EVENT_BIND_FIELDS;
/// Row cap applied to ad-hoc reads and event listings.
pub const MAX_QUERY_ROWS: usize = 500;
pub const DEFAULT_EVENTS_PAGE: usize = 50;

const INSERT_COLUMNS: &str = "event, created_at, updated_at, page_url, referrer, country, region, \
     city, postal, device_type, browser, browser_version, os, os_version, screen_width, \
     screen_height, rid, bot_data, custom_data, query_params, tag_id";

const SELECT_COLUMNS: &str = "id, event, created_at, updated_at, page_url, referrer, country, \
     region, city, postal, device_type, browser, browser_version, os, os_version, screen_width, \
     screen_height, rid, bot_data, custom_data, query_params, tag_id";

/// One incoming analytics event. Timestamps are optional; missing ones are
/// filled at insert time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventRecord {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_width: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_height: Option<i64>,
    /// Rotating visitor identifier; sessions are grouped by it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_data: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_params: Option<JsonValue>,
    pub tag_id: String,
}

/// A persisted event as read back from the store.
#[derive(Debug, Clone, Serialize)]
pub struct StoredEvent {
    pub id: i64,
    pub event: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_width: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_height: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_data: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_params: Option<JsonValue>,
    pub tag_id: String,
}

/// Batch result. `error` carries the failure that stopped the batch after
/// `inserted` rows had already been committed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InsertOutcome {
    pub inserted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryRows {
    pub rows: Vec<JsonValue>,
    pub row_count: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexInfo {
    pub name: String,
    pub unique: bool,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaInfo {
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<IndexInfo>,
    pub migrations: Vec<i64>,
}

/// Embedded event store for one site. The inner connection is the
/// serialization point: all reads and writes for the site queue on it.
pub struct SiteStore {
    conn: Mutex<Connection>,
    site_id: Option<String>,
    path: Option<PathBuf>,
}

impl SiteStore {
    /// Opens (creating if needed) the store file and brings its schema up
    /// to date before the handle is usable.
    pub fn open(path: impl Into<PathBuf>, site_id: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| AnalyticsError::StoreUnavailable(err.to_string()))?;
        }
        let conn = Connection::open(&path)
            .map_err(|err| AnalyticsError::StoreUnavailable(err.to_string()))?;
        Self::from_connection(conn, Some(path), Some(site_id.into()))
    }

    /// Opens a store file without a site binding, for maintenance and
    /// inspection. Ingestion against a detached store is rejected.
    pub fn open_detached(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let conn = Connection::open(&path)
            .map_err(|err| AnalyticsError::StoreUnavailable(err.to_string()))?;
        Self::from_connection(conn, Some(path), None)
    }

    pub fn open_in_memory(site_id: impl Into<String>) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|err| AnalyticsError::StoreUnavailable(err.to_string()))?;
        Self::from_connection(conn, None, Some(site_id.into()))
    }

    fn from_connection(
        mut conn: Connection,
        path: Option<PathBuf>,
        site_id: Option<String>,
    ) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        migrations::apply(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            site_id,
            path,
        })
    }

    pub fn site_id(&self) -> Option<&str> {
        self.site_id.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn storage_bytes(&self) -> Option<u64> {
        let path = self.path.as_deref()?;
        fs::metadata(path).ok().map(|meta| meta.len())
    }

    /// Runs a closure against the connection while holding the site lock.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Inserts a batch in arrival order, split into sub-statements that
    /// respect the parameter ceiling. A failing sub-statement stops the
    /// batch; rows committed before it stay committed and the outcome
    /// reports how many, alongside the error.
    pub fn insert_events(&self, events: &[EventRecord]) -> Result<InsertOutcome> {
        if self.site_id.is_none() {
            return Err(AnalyticsError::NoSiteContext);
        }
        if events.is_empty() {
            return Err(AnalyticsError::EmptyBatch);
        }

        let started = Instant::now();
        let now = Utc::now();
        let conn = self.conn.lock();

        let mut inserted = 0usize;
        for chunk in events.chunks(MAX_ROWS_PER_INSERT) {
            let mut bound = Vec::with_capacity(chunk.len() * EVENT_BIND_FIELDS);
            let mut bind_error = None;
            for event in chunk {
                match bind_values(event, now) {
                    Ok(values) => bound.extend(values),
                    Err(err) => {
                        bind_error = Some(err.to_string());
                        break;
                    }
                }
            }

            let failure = match bind_error {
                Some(err) => Some(err),
                None => conn
                    .execute(&insert_sql(chunk.len()), params_from_iter(bound))
                    .err()
                    .map(|err| err.to_string()),
            };

            if let Some(error) = failure {
                warn!(
                    site = self.site_id.as_deref().unwrap_or_default(),
                    inserted, error, "event batch stopped before completion"
                );
                record_store_op("insert", "error", started.elapsed().as_secs_f64());
                return Ok(InsertOutcome {
                    inserted,
                    error: Some(error),
                });
            }
            inserted += chunk.len();
            counter!("sitepulse_events_ingested_total").increment(chunk.len() as u64);
        }
        drop(conn);

        record_store_op("insert", "ok", started.elapsed().as_secs_f64());
        Ok(InsertOutcome {
            inserted,
            error: None,
        })
    }

    /// Deletes events older than a cutoff, of one event type, or both. At
    /// least one criterion is required; an unbounded wipe is refused.
    pub fn delete_events(
        &self,
        older_than: Option<DateTime<Utc>>,
        event_type: Option<&str>,
    ) -> Result<usize> {
        if older_than.is_none() && event_type.is_none() {
            return Err(AnalyticsError::MissingDeleteCriteria);
        }

        let started = Instant::now();
        let mut clause = SqlClause::new();
        if let Some(cutoff) = older_than {
            clause.and_bind("created_at < ?", Value::from(cutoff.timestamp_millis()));
        }
        if let Some(event) = event_type {
            clause.and_bind("event = ?", Value::from(event.to_string()));
        }

        let sql = format!("DELETE FROM events{}", clause.where_sql());
        let conn = self.conn.lock();
        match conn.execute(&sql, params_from_iter(clause.into_params())) {
            Ok(deleted) => {
                record_store_op("delete", "ok", started.elapsed().as_secs_f64());
                Ok(deleted)
            }
            Err(err) => {
                record_store_op("delete", "error", started.elapsed().as_secs_f64());
                Err(err.into())
            }
        }
    }

    pub fn count_events_since(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let mut clause = SqlClause::new();
        clause.and_bind("created_at >= ?", Value::from(start.timestamp_millis()));
        if let Some(end) = end {
            clause.and_bind("created_at <= ?", Value::from(end.timestamp_millis()));
        }
        let sql = format!("SELECT COUNT(*) FROM events{}", clause.where_sql());
        let conn = self.conn.lock();
        let count = conn.query_row(&sql, params_from_iter(clause.params().iter()), |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    pub fn total_events(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Newest-first page of raw events matching the filter.
    pub fn list_events(
        &self,
        filter: &AggregationFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredEvent>> {
        let clause = filter.clause();
        let effective = limit.clamp(1, MAX_QUERY_ROWS);
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM events{} ORDER BY created_at DESC, id DESC \
             LIMIT {effective} OFFSET {offset}",
            clause.where_sql()
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(clause.params().iter()), row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_filtered(&self, filter: &AggregationFilter) -> Result<i64> {
        let clause = filter.clause();
        let sql = format!("SELECT COUNT(*) FROM events{}", clause.where_sql());
        let conn = self.conn.lock();
        let count = conn.query_row(&sql, params_from_iter(clause.params().iter()), |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    /// Screens and runs an ad-hoc read. A row cap is appended unless the
    /// query already carries its own LIMIT; results come back as JSON
    /// objects keyed by column name.
    pub fn run_query(&self, raw: &str, limit: Option<usize>) -> Result<QueryRows> {
        let validated = sandbox::validate_read_query(raw)?;
        let effective = limit.unwrap_or(MAX_QUERY_ROWS).clamp(1, MAX_QUERY_ROWS);
        let sql = if validated.has_limit {
            validated.sql
        } else {
            format!("{} LIMIT {effective}", validated.sql)
        };

        let started = Instant::now();
        let conn = self.conn.lock();
        let result = read_rows(&conn, &sql);
        drop(conn);

        match result {
            Ok(rows) => {
                record_store_op("query", "ok", started.elapsed().as_secs_f64());
                Ok(QueryRows {
                    row_count: rows.len(),
                    rows,
                    limit: effective,
                })
            }
            Err(err) => {
                record_store_op("query", "error", started.elapsed().as_secs_f64());
                Err(err)
            }
        }
    }

    /// Column and index metadata for the events table, plus the applied
    /// migration versions.
    pub fn schema_info(&self) -> Result<SchemaInfo> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare("PRAGMA table_info(events)")?;
        let columns = stmt
            .query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get(1)?,
                    data_type: row.get(2)?,
                    not_null: row.get::<_, i64>(3)? != 0,
                    primary_key: row.get::<_, i64>(5)? != 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare("PRAGMA index_list(events)")?;
        let listed = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(1)?, row.get::<_, i64>(2)? != 0))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut indexes = Vec::with_capacity(listed.len());
        for (name, unique) in listed {
            if name.starts_with("sqlite_") {
                continue;
            }
            let mut stmt = conn.prepare(&format!("PRAGMA index_info(\"{name}\")"))?;
            let index_columns = stmt
                .query_map([], |row| row.get::<_, String>(2))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            indexes.push(IndexInfo {
                name,
                unique,
                columns: index_columns,
            });
        }

        let migrations = migrations::applied_versions(&conn)?;
        Ok(SchemaInfo {
            columns,
            indexes,
            migrations,
        })
    }
}

pub(crate) fn record_store_op(operation: &'static str, status: &'static str, duration: f64) {
    let labels = [("operation", operation), ("status", status)];
    counter!("sitepulse_store_operations_total", &labels).increment(1);
    histogram!("sitepulse_store_operation_duration_seconds", &labels).record(duration);
}

fn insert_sql(rows: usize) -> String {
    let group = format!("({})", vec!["?"; EVENT_BIND_FIELDS].join(", "));
    let placeholders = vec![group; rows].join(", ");
    format!("INSERT INTO events ({INSERT_COLUMNS}) VALUES {placeholders}")
}

fn bind_values(event: &EventRecord, fallback: DateTime<Utc>) -> Result<Vec<Value>> {
    let created_at = event.created_at.unwrap_or(fallback);
    let updated_at = event.updated_at.unwrap_or(created_at);

    let mut values = Vec::with_capacity(EVENT_BIND_FIELDS);
    values.push(Value::from(event.event.clone()));
    values.push(Value::from(created_at.timestamp_millis()));
    values.push(Value::from(updated_at.timestamp_millis()));
    values.push(opt_text(&event.page_url));
    values.push(opt_text(&event.referrer));
    values.push(opt_text(&event.country));
    values.push(opt_text(&event.region));
    values.push(opt_text(&event.city));
    values.push(opt_text(&event.postal));
    values.push(opt_text(&event.device_type));
    values.push(opt_text(&event.browser));
    values.push(opt_text(&event.browser_version));
    values.push(opt_text(&event.os));
    values.push(opt_text(&event.os_version));
    values.push(opt_int(event.screen_width));
    values.push(opt_int(event.screen_height));
    values.push(opt_text(&event.rid));
    values.push(opt_json(&event.bot_data)?);
    values.push(opt_json(&event.custom_data)?);
    values.push(opt_json(&event.query_params)?);
    values.push(Value::from(event.tag_id.clone()));
    debug_assert_eq!(values.len(), EVENT_BIND_FIELDS);
    Ok(values)
}

fn opt_text(value: &Option<String>) -> Value {
    match value {
        Some(text) => Value::from(text.clone()),
        None => Value::Null,
    }
}

fn opt_int(value: Option<i64>) -> Value {
    match value {
        Some(number) => Value::from(number),
        None => Value::Null,
    }
}

fn opt_json(value: &Option<JsonValue>) -> Result<Value> {
    match value {
        Some(json) => Ok(Value::from(serde_json::to_string(json)?)),
        None => Ok(Value::Null),
    }
}

fn read_rows(conn: &Connection, sql: &str) -> Result<Vec<JsonValue>> {
    let mut stmt = conn.prepare(sql)?;
    let column_names: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();

    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut object = serde_json::Map::with_capacity(column_names.len());
        for (idx, name) in column_names.iter().enumerate() {
            object.insert(name.clone(), column_to_json(row.get_ref(idx)?));
        }
        out.push(JsonValue::Object(object));
    }
    Ok(out)
}

fn column_to_json(value: ValueRef<'_>) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(number) => JsonValue::from(number),
        ValueRef::Real(number) => serde_json::Number::from_f64(number)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        ValueRef::Text(text) => JsonValue::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(blob) => {
            JsonValue::String(blob.iter().map(|byte| format!("{byte:02x}")).collect())
        }
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredEvent> {
    Ok(StoredEvent {
        id: row.get(0)?,
        event: row.get(1)?,
        created_at: buckets::datetime_from_ms(row.get(2)?),
        updated_at: buckets::datetime_from_ms(row.get(3)?),
        page_url: row.get(4)?,
        referrer: row.get(5)?,
        country: row.get(6)?,
        region: row.get(7)?,
        city: row.get(8)?,
        postal: row.get(9)?,
        device_type: row.get(10)?,
        browser: row.get(11)?,
        browser_version: row.get(12)?,
        os: row.get(13)?,
        os_version: row.get(14)?,
        screen_width: row.get(15)?,
        screen_height: row.get(16)?,
        rid: row.get(17)?,
        bot_data: parse_json_column(row.get(18)?),
        custom_data: parse_json_column(row.get(19)?),
        query_params: parse_json_column(row.get(20)?),
        tag_id: row.get(21)?,
    })
}

fn parse_json_column(raw: Option<String>) -> Option<JsonValue> {
    let raw = raw?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        // Stored by an older writer or by hand; surface it as-is.
        Err(_) => Some(JsonValue::String(raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };

    use metrics::{
        Counter, CounterFn, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit,
    };
    use serde_json::json;

    fn store() -> SiteStore {
        SiteStore::open_in_memory("acme").expect("open in-memory store")
    }

    fn record(event: &str, rid: &str) -> EventRecord {
        EventRecord {
            event: event.to_string(),
            rid: Some(rid.to_string()),
            tag_id: "t1".to_string(),
            ..Default::default()
        }
    }

    struct IngestTally(Arc<AtomicU64>);

    impl CounterFn for IngestTally {
        fn increment(&self, value: u64) {
            self.0.fetch_add(value, Ordering::SeqCst);
        }

        fn absolute(&self, _value: u64) {}
    }

    /// Captures the ingest counter; every other metric is dropped.
    #[derive(Default)]
    struct StubRecorder {
        ingested: Arc<AtomicU64>,
    }

    impl Recorder for StubRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
            if key.name() == "sitepulse_events_ingested_total" {
                Counter::from_arc(Arc::new(IngestTally(Arc::clone(&self.ingested))))
            } else {
                Counter::noop()
            }
        }

        fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
            Gauge::noop()
        }

        fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    #[test]
    fn sub_batch_size_respects_the_parameter_ceiling() {
        assert_eq!(MAX_ROWS_PER_INSERT, 4);
        assert!(MAX_ROWS_PER_INSERT * EVENT_BIND_FIELDS <= MAX_BOUND_PARAMS);
    }

    #[test]
    fn insert_sql_binds_every_field_of_every_row() {
        let sql = insert_sql(3);
        assert_eq!(
            sql.matches('?').count(),
            3 * EVENT_BIND_FIELDS,
            "wrong placeholder count in {sql}"
        );
    }

    #[test]
    fn insert_fills_missing_timestamps_and_round_trips_fields() {
        let store = store();
        let before = Utc::now();

        let mut event = record("page_view", "r1");
        event.page_url = Some("/pricing".to_string());
        event.custom_data = Some(json!({"plan": "pro", "seats": 3}));
        let outcome = store.insert_events(&[event]).expect("insert");
        assert_eq!(outcome, InsertOutcome { inserted: 1, error: None });

        let rows = store
            .list_events(&AggregationFilter::default(), 10, 0)
            .expect("list");
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.event, "page_view");
        assert_eq!(row.page_url.as_deref(), Some("/pricing"));
        assert_eq!(row.custom_data, Some(json!({"plan": "pro", "seats": 3})));
        assert!(row.created_at >= before);
        assert_eq!(row.updated_at, row.created_at);
    }

    #[test]
    fn large_batches_land_in_full() {
        let store = store();
        let events: Vec<EventRecord> = (0..9).map(|i| record("page_view", &format!("r{i}"))).collect();
        let outcome = store.insert_events(&events).expect("insert");
        assert_eq!(outcome.inserted, 9);
        assert!(outcome.error.is_none());
        assert_eq!(store.total_events().expect("count"), 9);
    }

    #[test]
    fn empty_batch_is_rejected_without_touching_storage() {
        let store = store();
        let err = store.insert_events(&[]).expect_err("must reject");
        assert!(matches!(err, AnalyticsError::EmptyBatch));
    }

    #[test]
    fn detached_stores_refuse_ingestion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SiteStore::open_detached(dir.path().join("events.db")).expect("open detached");
        let err = store
            .insert_events(&[record("page_view", "r1")])
            .expect_err("must reject");
        assert!(matches!(err, AnalyticsError::NoSiteContext));
    }

    #[test]
    fn failed_sub_batch_reports_rows_already_committed() {
        let store = store();
        store
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER poison_guard BEFORE INSERT ON events
                     WHEN NEW.event = 'poison'
                     BEGIN SELECT RAISE(ABORT, 'poison event'); END",
                )?;
                Ok(())
            })
            .expect("install trigger");

        // First sub-batch of four succeeds; the second hits the trigger.
        let mut events: Vec<EventRecord> =
            (0..4).map(|i| record("page_view", &format!("r{i}"))).collect();
        events.push(record("poison", "r4"));
        events.push(record("page_view", "r5"));

        let outcome = store.insert_events(&events).expect("outcome");
        assert_eq!(outcome.inserted, 4);
        let error = outcome.error.expect("error annotation");
        assert!(error.contains("poison"), "unexpected error: {error}");
        assert_eq!(store.total_events().expect("count"), 4);
    }

    #[test]
    fn committed_rows_of_a_stopped_batch_are_still_counted() {
        let store = store();
        store
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER poison_guard BEFORE INSERT ON events
                     WHEN NEW.event = 'poison'
                     BEGIN SELECT RAISE(ABORT, 'poison event'); END",
                )?;
                Ok(())
            })
            .expect("install trigger");

        let mut events: Vec<EventRecord> =
            (0..4).map(|i| record("page_view", &format!("r{i}"))).collect();
        events.push(record("poison", "r4"));

        let recorder = StubRecorder::default();
        let outcome = metrics::with_local_recorder(&recorder, || store.insert_events(&events))
            .expect("outcome");
        assert_eq!(outcome.inserted, 4);
        assert!(outcome.error.is_some());
        assert_eq!(recorder.ingested.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn delete_requires_a_criterion() {
        let store = store();
        let err = store.delete_events(None, None).expect_err("must reject");
        assert!(matches!(err, AnalyticsError::MissingDeleteCriteria));
    }

    #[test]
    fn delete_honors_cutoff_and_event_type() {
        let store = store();
        let old = Utc::now() - chrono::Duration::days(40);
        let mut aged = record("page_view", "r1");
        aged.created_at = Some(old);
        let fresh = record("page_view", "r2");
        let noise = record("heartbeat", "r3");
        store.insert_events(&[aged, fresh, noise]).expect("insert");

        let cutoff = Utc::now() - chrono::Duration::days(30);
        assert_eq!(store.delete_events(Some(cutoff), None).expect("delete"), 1);
        assert_eq!(
            store.delete_events(None, Some("heartbeat")).expect("delete"),
            1
        );
        assert_eq!(store.total_events().expect("count"), 1);
    }

    #[test]
    fn run_query_caps_rows_and_honors_existing_limits() {
        let store = store();
        let events: Vec<EventRecord> = (0..6).map(|i| record("page_view", &format!("r{i}"))).collect();
        store.insert_events(&events).expect("insert");

        let result = store
            .run_query("SELECT id FROM events", Some(5))
            .expect("query");
        assert_eq!(result.row_count, 5);
        assert_eq!(result.limit, 5);

        let result = store
            .run_query("SELECT id FROM events LIMIT 2", Some(500))
            .expect("query");
        assert_eq!(result.row_count, 2);
    }

    #[test]
    fn run_query_rejects_writes_verbatim() {
        let store = store();
        let err = store
            .run_query("DELETE FROM events", None)
            .expect_err("must reject");
        match err {
            AnalyticsError::InvalidQuery(reason) => {
                assert_eq!(reason, "only read queries allowed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn run_query_returns_typed_json_rows() {
        let store = store();
        let mut event = record("page_view", "r1");
        event.screen_width = Some(1440);
        store.insert_events(&[event]).expect("insert");

        let result = store
            .run_query("SELECT event, screen_width, referrer FROM events", None)
            .expect("query");
        assert_eq!(result.row_count, 1);
        assert_eq!(result.rows[0]["event"], json!("page_view"));
        assert_eq!(result.rows[0]["screen_width"], json!(1440));
        assert_eq!(result.rows[0]["referrer"], serde_json::Value::Null);
    }

    #[test]
    fn schema_info_reports_columns_indexes_and_versions() {
        let store = store();
        let info = store.schema_info().expect("schema info");

        assert!(info.columns.iter().any(|c| c.name == "event" && c.not_null));
        assert!(info.columns.iter().any(|c| c.name == "id" && c.primary_key));

        let created_idx = info
            .indexes
            .iter()
            .find(|idx| idx.name == "idx_events_created_at")
            .expect("created_at index present");
        assert_eq!(created_idx.columns, vec!["created_at".to_string()]);
        assert!(!created_idx.unique);

        assert_eq!(info.migrations.len(), crate::migrations::MIGRATIONS.len());
    }

    #[test]
    fn count_events_since_bounds_both_ends() {
        let store = store();
        let mut early = record("page_view", "r1");
        early.created_at = Some("2024-03-01T00:00:00Z".parse().expect("ts"));
        let mut late = record("page_view", "r2");
        late.created_at = Some("2024-03-05T00:00:00Z".parse().expect("ts"));
        store.insert_events(&[early, late]).expect("insert");

        let start = "2024-02-28T00:00:00Z".parse().expect("ts");
        let end = Some("2024-03-02T00:00:00Z".parse().expect("ts"));
        assert_eq!(store.count_events_since(start, end).expect("count"), 1);
        assert_eq!(store.count_events_since(start, None).expect("count"), 2);
    }
}
