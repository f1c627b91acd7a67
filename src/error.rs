use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AnalyticsError>;

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid site id: {0}")]
    InvalidSiteId(String),
    #[error("site context not initialized")]
    NoSiteContext,
    #[error("empty batch: no events to insert")]
    EmptyBatch,
    #[error("{0}")]
    InvalidQuery(String),
    #[error("delete requires an older-than cutoff or an event type")]
    MissingDeleteCriteria,
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<rusqlite::Error> for AnalyticsError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<toml::de::Error> for AnalyticsError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for AnalyticsError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for AnalyticsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
