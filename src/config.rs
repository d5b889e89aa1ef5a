use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    crypto::{cipher::KdfParams, store::KeyOptions},
    daemon::storage::ledger::DEFAULT_RETENTION_DAYS,
    fs::operations::read_optional,
    sync::{
        coordinator::SyncSettings,
        queue::{DEFAULT_MAX_QUEUE_LEN, DEFAULT_MAX_RETRIES},
    },
};

pub const CONFIG_FILE: &str = "config.json";
pub const PASSPHRASE_ENV: &str = "TABTALLY_PASSPHRASE";
const DEFAULT_USER_ID: &str = "local";

/// Optional `config.json` in the application directory. Every field has a default, so a
/// missing file or a partial one is fine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub tick_interval_secs: u64,
    pub retention_days: u32,
    /// Derive the storage key from a passphrase instead of a generated key. Required for
    /// sync between devices.
    pub passphrase: Option<String>,
    pub kdf: KdfParams,
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            retention_days: DEFAULT_RETENTION_DAYS,
            passphrase: None,
            kdf: KdfParams::default(),
            sync: SyncConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub user_id: Option<String>,
    /// Folder holding one document per device. Sync is off without it.
    pub remote_dir: Option<PathBuf>,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub page_size: usize,
    pub max_retries: u32,
    pub max_queue_len: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            remote_dir: None,
            interval_secs: 15 * 60,
            timeout_secs: 30,
            page_size: 50,
            max_retries: DEFAULT_MAX_RETRIES,
            max_queue_len: DEFAULT_MAX_QUEUE_LEN,
        }
    }
}

impl Config {
    /// Reads `path` when it exists and applies environment overrides.
    pub async fn load(path: &Path) -> Result<Self> {
        let mut config = match read_optional(path).await? {
            Some(bytes) => serde_json::from_slice::<Config>(&bytes)
                .with_context(|| format!("Invalid configuration in {path:?}"))?,
            None => {
                debug!("No configuration at {path:?}, using defaults");
                Config::default()
            }
        };
        if let Ok(passphrase) = std::env::var(PASSPHRASE_ENV) {
            info!("Using passphrase from {PASSPHRASE_ENV}");
            config.passphrase = Some(passphrase);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn default_path(app_dir: &Path) -> PathBuf {
        app_dir.join(CONFIG_FILE)
    }

    fn validate(&self) -> Result<()> {
        if self.tick_interval_secs == 0 {
            bail!("tickIntervalSecs must be positive");
        }
        if self.retention_days == 0 {
            bail!("retentionDays must be positive");
        }
        if self.sync.interval_secs == 0 || self.sync.timeout_secs == 0 {
            bail!("sync intervals must be positive");
        }
        if self.passphrase.as_deref().is_some_and(str::is_empty) {
            bail!("passphrase must not be empty");
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }

    pub fn key_options(&self) -> KeyOptions {
        KeyOptions {
            passphrase: self.passphrase.clone(),
            kdf: self.kdf,
        }
    }

    pub fn sync_settings(&self, device_id: &str) -> SyncSettings {
        let mut settings = SyncSettings::new(
            self.sync.user_id.as_deref().unwrap_or(DEFAULT_USER_ID),
            device_id,
        );
        settings.page_size = self.sync.page_size;
        settings.max_retries = self.sync.max_retries;
        settings.max_queue_len = self.sync.max_queue_len;
        settings.call_timeout = Duration::from_secs(self.sync.timeout_secs);
        settings
    }
}
