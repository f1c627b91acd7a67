use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::debug;

pub const MS_PER_HOUR: i64 = 3_600_000;

/// Resolves an IANA zone name, falling back to UTC when the name is missing
/// or unknown.
pub fn resolve_timezone(raw: Option<&str>) -> Tz {
    let Some(name) = raw.map(str::trim).filter(|name| !name.is_empty()) else {
        return Tz::UTC;
    };
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            debug!(zone = name, "unknown time zone, using UTC");
            Tz::UTC
        }
    }
}

pub fn datetime_from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Instant at which the given hour bucket starts.
pub fn hour_bucket_start(bucket: i64) -> DateTime<Utc> {
    datetime_from_ms(bucket * MS_PER_HOUR)
}

/// Calendar date of an hour bucket under the given zone, as `YYYY-MM-DD`.
pub fn local_day(bucket: i64, tz: &Tz) -> String {
    hour_bucket_start(bucket)
        .with_timezone(tz)
        .format("%Y-%m-%d")
        .to_string()
}

pub fn local_date(bucket: i64, tz: &Tz) -> NaiveDate {
    hour_bucket_start(bucket).with_timezone(tz).date_naive()
}

pub fn hour_key(bucket: i64) -> String {
    hour_bucket_start(bucket)
        .format("%Y-%m-%dT%H:00:00Z")
        .to_string()
}

/// ISO week label, e.g. `2024-W09`. The ISO year can differ from the
/// calendar year in the first and last days of a year.
pub fn week_key(date: NaiveDate) -> String {
    let week = date.iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}

pub fn month_key(date: NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}
