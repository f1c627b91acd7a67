use chrono::Utc;
use rusqlite::{Connection, params};
use tracing::info;

use crate::error::{AnalyticsError, Result};

/// One versioned schema step. Versions are applied in ascending order and
/// recorded in `schema_migrations`, so re-running the list is a no-op.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_events",
        sql: "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                page_url TEXT,
                referrer TEXT,
                country TEXT,
                region TEXT,
                city TEXT,
                postal TEXT,
                device_type TEXT,
                browser TEXT,
                browser_version TEXT,
                os TEXT,
                os_version TEXT,
                screen_width INTEGER,
                screen_height INTEGER,
                rid TEXT,
                bot_data TEXT,
                custom_data TEXT,
                query_params TEXT,
                tag_id TEXT NOT NULL
            );",
    },
    Migration {
        version: 2,
        name: "core_indexes",
        sql: "CREATE INDEX IF NOT EXISTS idx_events_created_at ON events (created_at);
            CREATE INDEX IF NOT EXISTS idx_events_tag_id ON events (tag_id);
            CREATE INDEX IF NOT EXISTS idx_events_country ON events (country);
            CREATE INDEX IF NOT EXISTS idx_events_device_type ON events (device_type);
            CREATE INDEX IF NOT EXISTS idx_events_event ON events (event);
            CREATE INDEX IF NOT EXISTS idx_events_referrer ON events (referrer);",
    },
    Migration {
        version: 3,
        name: "composite_indexes",
        sql: "CREATE INDEX IF NOT EXISTS idx_events_event_created ON events (event, created_at);
            CREATE INDEX IF NOT EXISTS idx_events_country_created ON events (country, created_at);
            CREATE INDEX IF NOT EXISTS idx_events_device_created ON events (device_type, created_at);",
    },
];

/// Brings the connection's schema up to date. Any failure aborts the run
/// and surfaces as a `Migration` error; already-applied steps are skipped.
pub fn apply(conn: &mut Connection) -> Result<()> {
    apply_pending(conn).map_err(|err| AnalyticsError::Migration(err.to_string()))?;
    Ok(())
}

pub fn applied_versions(conn: &Connection) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
    let versions = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(versions)
}

fn apply_pending(conn: &mut Connection) -> rusqlite::Result<usize> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        );",
    )?;

    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    let mut applied = 0;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![
                migration.version,
                migration.name,
                Utc::now().timestamp_millis()
            ],
        )?;
        tx.commit()?;
        info!(
            version = migration.version,
            name = migration.name,
            "applied schema migration"
        );
        applied += 1;
    }

    Ok(applied)
}
