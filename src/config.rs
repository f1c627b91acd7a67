use std::{
    env, fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AnalyticsError, Result};

pub const DEFAULT_SALT_TTL_HOURS: u64 = 24;
pub const RUN_MODE_ENV: &str = "SITEPULSE_MODE";

/// Execution mode; `Dev` turns on verbose per-operation diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Dev,
    Prod,
}

impl Default for RunMode {
    fn default() -> Self {
        RunMode::Prod
    }
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Dev => "dev",
            RunMode::Prod => "prod",
        }
    }

    pub fn verbose(&self) -> bool {
        matches!(self, RunMode::Dev)
    }

    pub fn parse(raw: &str) -> Option<RunMode> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Some(RunMode::Dev),
            "prod" | "production" => Some(RunMode::Prod),
            _ => None,
        }
    }

    pub fn from_env() -> Option<RunMode> {
        env::var(RUN_MODE_ENV).ok().and_then(|raw| Self::parse(&raw))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    #[serde(default)]
    pub run_mode: RunMode,
    #[serde(default = "default_salt_ttl_hours")]
    pub salt_ttl_hours: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            data_dir: default_data_dir(),
            run_mode: RunMode::from_env().unwrap_or_default(),
            salt_ttl_hours: DEFAULT_SALT_TTL_HOURS,
            created_at: now,
            updated_at: now,
        }
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let mut path = env::current_dir().map_err(|err| AnalyticsError::Config(err.to_string()))?;
    path.push(".sitepulse");
    path.push("config.toml");
    Ok(path)
}

pub fn load_or_default(path: Option<PathBuf>) -> Result<(EngineConfig, PathBuf)> {
    let config_path = if let Some(path) = path {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        path
    } else {
        default_config_path()?
    };

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let cfg: EngineConfig = toml::from_str(&contents)?;
        cfg.ensure_data_dir()?;
        Ok((cfg, config_path))
    } else {
        let cfg = EngineConfig::default();
        cfg.ensure_data_dir()?;
        cfg.save(&config_path)?;
        Ok((cfg, config_path))
    }
}

impl EngineConfig {
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn ensure_data_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn sites_dir(&self) -> PathBuf {
        self.data_dir.join("sites")
    }

    pub fn site_db_path(&self, site_id: &str) -> PathBuf {
        self.sites_dir().join(site_id).join("events.db")
    }

    pub fn salts_path(&self) -> PathBuf {
        self.data_dir.join("salts.json")
    }

    pub fn salt_ttl(&self) -> Duration {
        Duration::hours(self.salt_ttl_hours.min(i64::MAX as u64) as i64)
    }
}

fn default_data_dir() -> PathBuf {
    let Ok(current_dir) = env::current_dir() else {
        return PathBuf::from(".sitepulse");
    };
    current_dir.join(".sitepulse")
}

fn default_salt_ttl_hours() -> u64 {
    DEFAULT_SALT_TTL_HOURS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_mode_parses_common_spellings() {
        assert_eq!(RunMode::parse("dev"), Some(RunMode::Dev));
        assert_eq!(RunMode::parse(" Development "), Some(RunMode::Dev));
        assert_eq!(RunMode::parse("PROD"), Some(RunMode::Prod));
        assert_eq!(RunMode::parse("production"), Some(RunMode::Prod));
        assert_eq!(RunMode::parse("staging"), None);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = EngineConfig::default();
        cfg.data_dir = dir.path().join("data");
        cfg.run_mode = RunMode::Dev;
        cfg.salt_ttl_hours = 6;

        let path = dir.path().join("config.toml");
        cfg.save(&path).expect("save config");

        let (loaded, loaded_path) = load_or_default(Some(path.clone())).expect("load config");
        assert_eq!(loaded_path, path);
        assert_eq!(loaded.data_dir, cfg.data_dir);
        assert_eq!(loaded.run_mode, RunMode::Dev);
        assert_eq!(loaded.salt_ttl_hours, 6);
    }

    #[test]
    fn missing_optional_keys_fall_back_to_defaults() {
        let raw = r#"
data_dir = "/tmp/sitepulse-test"
created_at = "2024-01-01T00:00:00Z"
updated_at = "2024-01-01T00:00:00Z"
"#;
        let cfg: EngineConfig = toml::from_str(raw).expect("parse config");
        assert_eq!(cfg.run_mode, RunMode::Prod);
        assert_eq!(cfg.salt_ttl_hours, DEFAULT_SALT_TTL_HOURS);
    }

    #[test]
    fn site_paths_nest_under_data_dir() {
        let mut cfg = EngineConfig::default();
        cfg.data_dir = PathBuf::from("/var/lib/sitepulse");
        assert_eq!(
            cfg.site_db_path("acme"),
            PathBuf::from("/var/lib/sitepulse/sites/acme/events.db")
        );
        assert_eq!(cfg.salts_path(), PathBuf::from("/var/lib/sitepulse/salts.json"));
    }
}
