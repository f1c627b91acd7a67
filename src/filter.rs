use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

/// Referrer bucket for visits that arrive without one.
pub const DIRECT_SOURCE: &str = "direct";

/// Common slice selector for aggregation reads. Every field is optional; an
/// empty filter selects the whole table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// When set, `end` is used as given instead of being widened to the last
    /// millisecond of its UTC day.
    pub end_exact: bool,
    pub event: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub device_type: Option<String>,
    pub page_url: Option<String>,
    /// Traffic source. The literal `direct` selects rows whose referrer is
    /// null, empty, or the string "null"; any other value is a substring
    /// match against the referrer.
    pub source: Option<String>,
}

impl AggregationFilter {
    pub fn for_range(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self {
            start,
            end,
            ..Self::default()
        }
    }

    /// End bound with day widening applied, so a date-typed end includes the
    /// whole day it names.
    pub fn resolved_end(&self) -> Option<DateTime<Utc>> {
        let end = self.end?;
        if self.end_exact {
            return Some(end);
        }
        end.date_naive()
            .and_hms_milli_opt(23, 59, 59, 999)
            .map(|naive| Utc.from_utc_datetime(&naive))
            .or(Some(end))
    }

    pub(crate) fn clause(&self) -> SqlClause {
        let mut clause = SqlClause::new();
        if let Some(start) = self.start {
            clause.and_bind("created_at >= ?", Value::from(start.timestamp_millis()));
        }
        if let Some(end) = self.resolved_end() {
            clause.and_bind("created_at <= ?", Value::from(end.timestamp_millis()));
        }
        if let Some(event) = &self.event {
            clause.and_bind("event = ?", Value::from(event.clone()));
        }
        if let Some(country) = &self.country {
            clause.and_bind("country = ?", Value::from(country.clone()));
        }
        if let Some(region) = &self.region {
            clause.and_bind("region = ?", Value::from(region.clone()));
        }
        if let Some(city) = &self.city {
            clause.and_bind("city = ?", Value::from(city.clone()));
        }
        if let Some(device_type) = &self.device_type {
            clause.and_bind("device_type = ?", Value::from(device_type.clone()));
        }
        if let Some(page_url) = &self.page_url {
            clause.and_bind("page_url = ?", Value::from(page_url.clone()));
        }
        if let Some(source) = &self.source {
            if source.trim().eq_ignore_ascii_case(DIRECT_SOURCE) {
                clause.and("(referrer IS NULL OR referrer = '' OR referrer = 'null')");
            } else {
                clause.and_bind("referrer LIKE '%' || ? || '%'", Value::from(source.clone()));
            }
        }
        clause
    }
}

/// Accumulates AND-joined conditions plus their positional bindings.
#[derive(Debug, Default)]
pub(crate) struct SqlClause {
    conditions: Vec<String>,
    params: Vec<Value>,
}

impl SqlClause {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn and(&mut self, condition: &str) {
        self.conditions.push(condition.to_string());
    }

    /// Adds a condition containing exactly one `?` placeholder.
    pub fn and_bind(&mut self, condition: &str, value: Value) {
        self.conditions.push(condition.to_string());
        self.params.push(value);
    }

    pub fn where_sql(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.conditions.join(" AND "))
        }
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn into_params(self) -> Vec<Value> {
        self.params
    }
}
