//! Read-only screening for ad-hoc SQL.
//!
//! The screen is lexical: rules run over the raw text in a fixed order and
//! the first failing rule wins. Keywords inside string literals or comments
//! are matched like any other text. It narrows the surface to single-statement
//! reads against the events table; it is not a SQL parser.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{AnalyticsError, Result};

static READ_PREFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(select|with)\b").expect("valid read prefix regex"));

static WRITE_KEYWORD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(insert|update|delete|drop|alter|create|pragma|attach|detach|replace|truncate)\b")
        .expect("valid write keyword regex")
});

static EVENTS_TABLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bevents\b").expect("valid events table regex"));

static LIMIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\blimit\b").expect("valid limit regex"));

/// A query that passed screening. `sql` is trimmed with at most one trailing
/// semicolon removed; `has_limit` reports whether the text already carries a
/// LIMIT clause, so executors know not to append their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedQuery {
    pub sql: String,
    pub has_limit: bool,
}

pub fn validate_read_query(raw: &str) -> Result<ValidatedQuery> {
    let mut sql = raw.trim();
    if let Some(stripped) = sql.strip_suffix(';') {
        sql = stripped.trim_end();
    }

    if sql.contains(';') {
        return Err(invalid("multiple statements not allowed"));
    }
    if !READ_PREFIX_RE.is_match(sql) {
        return Err(invalid("only read queries allowed"));
    }
    if WRITE_KEYWORD_RE.is_match(sql) {
        return Err(invalid("read-only violation"));
    }
    if !EVENTS_TABLE_RE.is_match(sql) {
        return Err(invalid("must reference the events table"));
    }

    Ok(ValidatedQuery {
        sql: sql.to_string(),
        has_limit: LIMIT_RE.is_match(sql),
    })
}

fn invalid(reason: &str) -> AnalyticsError {
    AnalyticsError::InvalidQuery(reason.to_string())
}
