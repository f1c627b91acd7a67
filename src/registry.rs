use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    config::EngineConfig,
    error::{AnalyticsError, Result},
    salt::{LocalSaltDirectory, RotationHandle, SaltDirectory, SaltScheduler, spawn_rotation},
    service::SiteContext,
    store::SiteStore,
};

pub const MAX_SITE_ID_LENGTH: usize = 64;

/// Canonical form of a site identifier: trimmed, lowercased, starting with
/// an ASCII letter or digit, containing only letters, digits, '-' and '_'.
pub fn normalize_site_id(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AnalyticsError::InvalidSiteId(
            "site id must not be empty".to_string(),
        ));
    }
    if trimmed.len() > MAX_SITE_ID_LENGTH {
        return Err(AnalyticsError::InvalidSiteId(format!(
            "site id exceeds {MAX_SITE_ID_LENGTH} characters"
        )));
    }
    let lower = trimmed.to_ascii_lowercase();
    if !matches!(lower.chars().next(), Some(ch) if ch.is_ascii_alphanumeric()) {
        return Err(AnalyticsError::InvalidSiteId(
            "site id must start with a letter or digit".to_string(),
        ));
    }
    if !lower
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Err(AnalyticsError::InvalidSiteId(
            "site id may only contain letters, digits, '-' and '_'".to_string(),
        ));
    }
    Ok(lower)
}

enum SlotState {
    Uninitialized,
    Migrating,
    Ready(ReadySite),
}

struct ReadySite {
    store: Arc<SiteStore>,
    salt: Arc<SaltScheduler>,
    rotation: Option<RotationHandle>,
}

struct SiteSlot {
    state: Mutex<SlotState>,
}

impl Default for SiteSlot {
    fn default() -> Self {
        Self {
            state: Mutex::new(SlotState::Uninitialized),
        }
    }
}

/// Hands out per-site contexts, opening and migrating each site's store at
/// most once. The slot lock doubles as the migration barrier: callers that
/// race on a cold site queue here until the first one finishes. A failed
/// initialization leaves the slot retryable.
pub struct SiteRegistry {
    config: EngineConfig,
    directory: Arc<dyn SaltDirectory>,
    slots: Mutex<HashMap<String, Arc<SiteSlot>>>,
}

impl SiteRegistry {
    pub fn new(config: EngineConfig, directory: Arc<dyn SaltDirectory>) -> Result<Self> {
        config.ensure_data_dir()?;
        Ok(Self {
            config,
            directory,
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// Registry with the salt directory stored next to the site data.
    pub fn with_local_directory(config: EngineConfig) -> Result<Self> {
        let directory = LocalSaltDirectory::load(config.salts_path(), config.salt_ttl())?;
        Self::new(config, Arc::new(directory))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resolve(&self, site: &str) -> Result<SiteContext> {
        let site_id = normalize_site_id(site)?;

        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(site_id.clone()).or_default())
        };

        let mut state = slot.state.lock();
        if let SlotState::Ready(ready) = &*state {
            return Ok(SiteContext::new(
                Arc::clone(&ready.store),
                Arc::clone(&ready.salt),
                self.config.run_mode,
            ));
        }

        *state = SlotState::Migrating;
        match self.initialize_site(&site_id) {
            Ok(ready) => {
                let context = SiteContext::new(
                    Arc::clone(&ready.store),
                    Arc::clone(&ready.salt),
                    self.config.run_mode,
                );
                *state = SlotState::Ready(ready);
                Ok(context)
            }
            Err(err) => {
                *state = SlotState::Uninitialized;
                Err(err)
            }
        }
    }

    fn initialize_site(&self, site_id: &str) -> Result<ReadySite> {
        let store = Arc::new(SiteStore::open(self.config.site_db_path(site_id), site_id)?);
        let salt = Arc::new(SaltScheduler::new(site_id, Arc::clone(&self.directory)));
        let first_wake = salt.activate();
        let rotation = spawn_rotation(Arc::clone(&salt), first_wake);
        if rotation.is_none() {
            debug!(site = site_id, "no async runtime, salt rotation timer not started");
        }
        debug!(site = site_id, "site store ready");
        Ok(ReadySite {
            store,
            salt,
            rotation,
        })
    }

    /// Drops the cached handle; the next resolve reopens and re-migrates.
    pub fn invalidate(&self, site: &str) {
        let Ok(site_id) = normalize_site_id(site) else {
            return;
        };
        let removed = self.slots.lock().remove(&site_id);
        if let Some(slot) = removed {
            let state = slot.state.lock();
            if let SlotState::Ready(ready) = &*state {
                if let Some(rotation) = &ready.rotation {
                    rotation.stop();
                }
            }
        }
    }

    /// Sites with a ready store handle, sorted. Slots parked after a failed
    /// initialization are not listed.
    pub fn resolved_sites(&self) -> Vec<String> {
        let slots = self.slots.lock();
        let mut sites: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| matches!(&*slot.state.lock(), SlotState::Ready(_)))
            .map(|(site, _)| site.clone())
            .collect();
        sites.sort();
        sites
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, SiteRegistry) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = EngineConfig::default();
        config.data_dir = dir.path().join("data");
        let registry = SiteRegistry::with_local_directory(config).expect("registry");
        (dir, registry)
    }

    #[test]
    fn normalize_trims_and_lowercases() {
        assert_eq!(normalize_site_id("  Acme-01 ").expect("valid"), "acme-01");
        assert_eq!(normalize_site_id("shop_eu").expect("valid"), "shop_eu");
    }

    #[test]
    fn normalize_rejects_malformed_ids() {
        for raw in ["", "   ", "-acme", "acme/shop", "a b", &"x".repeat(65)] {
            let err = normalize_site_id(raw).expect_err("must reject");
            assert!(matches!(err, AnalyticsError::InvalidSiteId(_)), "{raw:?}");
        }
    }

    #[test]
    fn resolve_reuses_the_same_store_handle() {
        let (_dir, registry) = registry();
        let first = registry.resolve("acme").expect("resolve");
        let second = registry.resolve("ACME").expect("resolve");
        assert!(Arc::ptr_eq(&first.store(), &second.store()));
        assert_eq!(registry.resolved_sites(), vec!["acme".to_string()]);
    }

    #[test]
    fn resolve_creates_the_site_database_on_disk() {
        let (_dir, registry) = registry();
        registry.resolve("acme").expect("resolve");
        assert!(registry.config().site_db_path("acme").exists());
    }

    #[test]
    fn invalid_site_ids_do_not_reach_storage() {
        let (_dir, registry) = registry();
        let err = registry.resolve("no/slashes").err().expect("must reject");
        assert!(matches!(err, AnalyticsError::InvalidSiteId(_)));
        assert!(registry.resolved_sites().is_empty());
    }

    #[test]
    fn invalidate_forces_a_fresh_handle() {
        let (_dir, registry) = registry();
        let first = registry.resolve("acme").expect("resolve");
        registry.invalidate("acme");
        let second = registry.resolve("acme").expect("resolve");
        assert!(!Arc::ptr_eq(&first.store(), &second.store()));
    }

    #[test]
    fn failed_initialization_is_retryable() {
        let (_dir, registry) = registry();
        // A directory where the database file belongs makes the open fail.
        let db_path = registry.config().site_db_path("acme");
        std::fs::create_dir_all(&db_path).expect("obstruct db path");

        let err = registry.resolve("acme").err().expect("open must fail");
        assert!(matches!(err, AnalyticsError::StoreUnavailable(_)), "{err}");
        assert!(registry.resolved_sites().is_empty());

        std::fs::remove_dir(&db_path).expect("clear obstruction");
        let context = registry.resolve("acme").expect("retry succeeds");
        assert_eq!(context.site_id(), Some("acme"));
        assert_eq!(registry.resolved_sites(), vec!["acme".to_string()]);
    }
}
