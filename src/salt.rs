use std::{collections::BTreeMap, fs, path::PathBuf, sync::Arc, time::Duration as StdDuration};

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinHandle, time::sleep};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;

/// Wake-up delay after a salt directory failure.
pub const ROTATION_RETRY_SECS: i64 = 300;

/// Salt used to derive rotating visitor identifiers for one site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RidSaltRecord {
    pub salt: String,
    /// RFC 3339 expiry. Kept as the raw string so records written by other
    /// tools survive the round trip; an unreadable value reads as expired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

impl RidSaltRecord {
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        let raw = self.expires_at.as_deref()?;
        DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc))
    }
}

/// Source of per-site rid salts. `rotate` mints and stores a fresh record
/// and returns it.
pub trait SaltDirectory: Send + Sync {
    fn fetch(&self, site_id: &str) -> Result<Option<RidSaltRecord>>;
    fn rotate(&self, site_id: &str) -> Result<RidSaltRecord>;
}

/// JSON-file-backed salt directory keyed by site id.
pub struct LocalSaltDirectory {
    path: PathBuf,
    ttl: Duration,
    items: RwLock<BTreeMap<String, RidSaltRecord>>,
}

impl LocalSaltDirectory {
    pub fn load(path: PathBuf, ttl: Duration) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, "{}")?;
        }
        let contents = fs::read_to_string(&path)?;
        // A zero-byte file (crash mid-write) reads as the bootstrap map.
        let items: BTreeMap<String, RidSaltRecord> = if contents.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&contents)?
        };
        Ok(Self {
            path,
            ttl,
            items: RwLock::new(items),
        })
    }

    fn persist(&self, items: &BTreeMap<String, RidSaltRecord>) -> Result<()> {
        let contents = serde_json::to_string_pretty(items)?;
        fs::write(&self.path, contents)?;
        Ok(())
    }
}

impl SaltDirectory for LocalSaltDirectory {
    fn fetch(&self, site_id: &str) -> Result<Option<RidSaltRecord>> {
        Ok(self.items.read().get(site_id).cloned())
    }

    fn rotate(&self, site_id: &str) -> Result<RidSaltRecord> {
        let record = RidSaltRecord {
            salt: Uuid::new_v4().simple().to_string(),
            expires_at: Some((Utc::now() + self.ttl).to_rfc3339()),
        };
        let mut items = self.items.write();
        items.insert(site_id.to_string(), record.clone());
        self.persist(&items)?;
        Ok(record)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaltState {
    Uninitialized,
    Scheduled(DateTime<Utc>),
    Rotating,
}

struct SaltCell {
    state: SaltState,
    current: Option<RidSaltRecord>,
}

/// Per-site rotation driver. `activate` and `on_alarm` run the same
/// read-decide-rotate pass and report when the next wake-up is due.
/// Directory failures never propagate; they are logged and turn into a
/// short retry.
pub struct SaltScheduler {
    site_id: String,
    directory: Arc<dyn SaltDirectory>,
    cell: Mutex<SaltCell>,
}

impl SaltScheduler {
    pub fn new(site_id: impl Into<String>, directory: Arc<dyn SaltDirectory>) -> Self {
        Self {
            site_id: site_id.into(),
            directory,
            cell: Mutex::new(SaltCell {
                state: SaltState::Uninitialized,
                current: None,
            }),
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn state(&self) -> SaltState {
        self.cell.lock().state
    }

    /// Active salt, once a refresh has produced one.
    pub fn current_salt(&self) -> Option<String> {
        self.cell
            .lock()
            .current
            .as_ref()
            .map(|record| record.salt.clone())
    }

    /// First refresh, run when the site comes up.
    pub fn activate(&self) -> DateTime<Utc> {
        self.refresh()
    }

    /// Timer callback. Re-reads the directory rather than trusting the
    /// schedule that fired, so records edited behind our back correct the
    /// schedule here.
    pub fn on_alarm(&self) -> DateTime<Utc> {
        self.refresh()
    }

    fn refresh(&self) -> DateTime<Utc> {
        let mut cell = self.cell.lock();
        match self.directory.fetch(&self.site_id) {
            Ok(record) => {
                let expiry = record.as_ref().and_then(RidSaltRecord::expiry);
                match expiry {
                    Some(expires_at) if expires_at > Utc::now() => {
                        cell.current = record;
                        cell.state = SaltState::Scheduled(expires_at);
                        expires_at
                    }
                    // Missing, expired, or unreadable expiry: rotate now.
                    _ => self.rotate_now(&mut cell),
                }
            }
            Err(err) => {
                warn!(site = %self.site_id, error = %err, "salt fetch failed");
                self.schedule_retry(&mut cell)
            }
        }
    }

    fn rotate_now(&self, cell: &mut SaltCell) -> DateTime<Utc> {
        cell.state = SaltState::Rotating;
        match self.directory.rotate(&self.site_id) {
            Ok(record) => {
                let wake_at = record
                    .expiry()
                    .unwrap_or_else(|| Utc::now() + Duration::seconds(ROTATION_RETRY_SECS));
                debug!(site = %self.site_id, wake_at = %wake_at, "rid salt rotated");
                cell.current = Some(record);
                cell.state = SaltState::Scheduled(wake_at);
                wake_at
            }
            Err(err) => {
                warn!(site = %self.site_id, error = %err, "salt rotation failed");
                self.schedule_retry(cell)
            }
        }
    }

    fn schedule_retry(&self, cell: &mut SaltCell) -> DateTime<Utc> {
        let wake_at = Utc::now() + Duration::seconds(ROTATION_RETRY_SECS);
        cell.state = SaltState::Scheduled(wake_at);
        wake_at
    }
}

/// Handle to the background rotation task. Dropping it (or calling `stop`)
/// ends the task at its next wake-up point.
pub struct RotationHandle {
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl RotationHandle {
    pub fn stop(&self) {
        let _ = self.shutdown.try_send(());
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Drives the scheduler on a tokio timer. Returns `None` when no runtime is
/// present; the scheduler still works, woken only by explicit calls.
pub fn spawn_rotation(
    scheduler: Arc<SaltScheduler>,
    first_wake: DateTime<Utc>,
) -> Option<RotationHandle> {
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    let (shutdown, mut signal) = mpsc::channel::<()>(1);

    let task = runtime.spawn(async move {
        let mut wake_at = first_wake;
        loop {
            let delay = (wake_at - Utc::now()).to_std().unwrap_or(StdDuration::ZERO);
            tokio::select! {
                _ = sleep(delay) => {
                    wake_at = scheduler.on_alarm();
                }
                _ = signal.recv() => {
                    debug!(site = %scheduler.site_id(), "salt rotation task stopped");
                    break;
                }
            }
        }
    });

    Some(RotationHandle { shutdown, task })
}
