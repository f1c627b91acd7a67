use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::filter::AggregationFilter;

/// Event names that count toward the conversion rate.
pub const CONVERSION_EVENTS: [&str; 2] = ["conversion", "purchase"];

pub const PAGE_VIEW_EVENT: &str = "page_view";

/// Auto-captured interactions are named `ac.<action>.<slug>`.
pub const AUTO_CAPTURE_PREFIX: &str = "ac.";

/// Headline dashboard numbers for a slice of traffic.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScoreCards {
    pub unique_visitors: i64,
    pub total_page_views: i64,
    /// Percentage of sessions with exactly one page view, one decimal.
    pub bounce_rate: f64,
    /// Conversion events per unique visitor as a percentage, two decimals.
    pub conversion_rate: f64,
    pub avg_session_duration_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeriesPoint {
    pub period: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakdownRow {
    pub value: String,
    pub count: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DashboardBreakdowns {
    pub top_pages: Vec<BreakdownRow>,
    pub top_referrers: Vec<BreakdownRow>,
    pub top_countries: Vec<BreakdownRow>,
    pub top_devices: Vec<BreakdownRow>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsBreakdown {
    pub breakdown: Vec<BreakdownRow>,
    pub total: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PageView,
    AutoCapture,
    Custom,
}

impl EventKind {
    pub fn classify(event: &str) -> EventKind {
        if event == PAGE_VIEW_EVENT {
            EventKind::PageView
        } else if event.starts_with(AUTO_CAPTURE_PREFIX) {
            EventKind::AutoCapture
        } else {
            EventKind::Custom
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PageView => "page_view",
            EventKind::AutoCapture => "auto_capture",
            EventKind::Custom => "custom",
        }
    }

    pub(crate) fn predicate_sql(&self) -> &'static str {
        match self {
            EventKind::PageView => "event = 'page_view'",
            EventKind::AutoCapture => "event LIKE 'ac.%'",
            EventKind::Custom => "(event != 'page_view' AND event NOT LIKE 'ac.%')",
        }
    }
}

/// Interaction verb encoded in an auto-capture name, when recognized.
pub fn capture_action(event: &str) -> Option<&'static str> {
    let rest = event.strip_prefix(AUTO_CAPTURE_PREFIX)?;
    match rest.split('.').next()? {
        "click" => Some("click"),
        "submit" => Some("submit"),
        "change" => Some("change"),
        "rule" => Some("rule"),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarySort {
    #[default]
    Count,
    FirstSeen,
    LastSeen,
}

impl SummarySort {
    pub(crate) fn order_column(&self) -> &'static str {
        match self {
            SummarySort::Count => "cnt",
            SummarySort::FirstSeen => "first_seen",
            SummarySort::LastSeen => "last_seen",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub(crate) fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventSummaryQuery {
    pub filter: AggregationFilter,
    /// Substring match against event names.
    pub search: Option<String>,
    pub kind: Option<EventKind>,
    pub sort: SummarySort,
    pub direction: SortDirection,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl EventSummaryQuery {
    /// Page size after defaulting and clamping to the summary ceiling.
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(super::DEFAULT_SUMMARY_ROWS)
            .clamp(1, super::MAX_SUMMARY_ROWS)
    }

    /// Offset clamped to the same ceiling as the page size.
    pub fn effective_offset(&self) -> usize {
        self.offset.min(super::MAX_SUMMARY_ROWS)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventSummaryRow {
    pub event: String,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<&'static str>,
    pub count: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EventSummaryPage {
    pub rows: Vec<EventSummaryRow>,
    /// Distinct event names matching the filters, before paging.
    pub total: i64,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Country,
    Region,
    City,
    Device,
    Browser,
    Os,
    Referrer,
    Page,
    Event,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Country => "country",
            MetricKind::Region => "region",
            MetricKind::City => "city",
            MetricKind::Device => "device",
            MetricKind::Browser => "browser",
            MetricKind::Os => "os",
            MetricKind::Referrer => "referrer",
            MetricKind::Page => "page",
            MetricKind::Event => "event",
        }
    }

    pub(crate) fn column(&self) -> &'static str {
        match self {
            MetricKind::Country => "country",
            MetricKind::Region => "region",
            MetricKind::City => "city",
            MetricKind::Device => "device_type",
            MetricKind::Browser => "browser",
            MetricKind::Os => "os",
            MetricKind::Referrer => "referrer",
            MetricKind::Page => "page_url",
            MetricKind::Event => "event",
        }
    }

    /// Hard cap on breakdown rows for this dimension.
    pub fn ceiling(&self) -> usize {
        match self {
            MetricKind::Country => 250,
            MetricKind::Region => 100,
            MetricKind::City => 100,
            MetricKind::Device => 10,
            MetricKind::Browser => 50,
            MetricKind::Os => 50,
            MetricKind::Referrer => 100,
            MetricKind::Page => 250,
            MetricKind::Event => 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hour,
    #[default]
    Day,
    Week,
    Month,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        }
    }
}
