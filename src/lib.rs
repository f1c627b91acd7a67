//! Embedded multi-tenant analytics engine for website event streams.
//!
//! Each site gets its own SQLite store under the configured data directory,
//! opened and migrated on first use through the [`SiteRegistry`]. A resolved
//! [`SiteContext`] carries everything one site's requests need: batched
//! ingestion, raw event reads, screened ad-hoc SQL, the aggregation
//! endpoints and a per-site rotating rid salt.
//!
//! ```no_run
//! use sitepulse::{EventRecord, SiteRegistry, config};
//!
//! # fn main() -> sitepulse::Result<()> {
//! let (config, _path) = config::load_or_default(None)?;
//! let registry = SiteRegistry::with_local_directory(config)?;
//! let site = registry.resolve("acme")?;
//! site.record_events(&[EventRecord {
//!     event: "page_view".into(),
//!     tag_id: "tag-1".into(),
//!     ..Default::default()
//! }])?;
//! # Ok(())
//! # }
//! ```

pub mod analytics;
pub mod config;
pub mod error;
pub mod filter;
pub mod logging;
pub mod migrations;
pub mod registry;
pub mod salt;
pub mod sandbox;
pub mod service;
pub mod store;

pub use analytics::{
    BreakdownRow, DashboardBreakdowns, EventKind, EventSummaryQuery, Granularity, MetricKind,
    ScoreCards, SortDirection, SummarySort, TimeSeriesPoint,
};
pub use config::{EngineConfig, RunMode};
pub use error::{AnalyticsError, Result};
pub use filter::AggregationFilter;
pub use registry::{SiteRegistry, normalize_site_id};
pub use salt::{LocalSaltDirectory, RidSaltRecord, SaltDirectory, SaltScheduler};
pub use service::SiteContext;
pub use store::{EventRecord, InsertOutcome, SiteStore, StoredEvent};
