use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hub::ReconnectPolicy;
use crate::notifications::NotificationRoutes;

pub const APP_DIR: &str = "hubline";
pub const SERVER_URL_ENV: &str = "HUBLINE_SERVER_URL";
pub const STORAGE_DIR_ENV: &str = "HUBLINE_STORAGE_DIR";

static CONFIG_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Runtime settings for the real-time client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub server_url: String,
    pub chat_hub_path: String,
    pub notification_hub_path: String,
    pub history_path: String,
    pub profile_path: String,
    /// Window inside which two identical deliveries count as one
    pub dedup_tolerance_ms: u64,
    pub retention_days: u32,
    pub reconnect_delays_ms: Vec<u64>,
    /// Zero disables keep-alive pings
    pub keep_alive_interval_secs: u64,
    /// Drop the link after this long without hearing from the server; zero disables
    pub server_timeout_secs: u64,
    /// Tell the other side when a conversation is read
    pub propagate_read_receipts: bool,
    pub routes: NotificationRoutes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<PathBuf>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        RealtimeConfig {
            server_url: "http://localhost:5279".to_string(),
            chat_hub_path: "/chatHub".to_string(),
            notification_hub_path: "/notificationHub".to_string(),
            history_path: "/api/ChatMessages/history".to_string(),
            profile_path: "/api/Users".to_string(),
            dedup_tolerance_ms: 1000,
            retention_days: 7,
            reconnect_delays_ms: vec![0, 2_000, 10_000, 30_000],
            keep_alive_interval_secs: 15,
            server_timeout_secs: 30,
            propagate_read_receipts: true,
            routes: NotificationRoutes::default(),
            storage_dir: None,
        }
    }
}

impl RealtimeConfig {
    pub fn chat_hub_url(&self) -> String {
        join_url(&self.server_url, &self.chat_hub_path)
    }

    pub fn notification_hub_url(&self) -> String {
        join_url(&self.server_url, &self.notification_hub_path)
    }

    pub fn dedup_tolerance(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.dedup_tolerance_ms as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::from_millis(&self.reconnect_delays_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server_timeout_secs)
    }

    /// Directory holding the persisted notification feeds
    pub fn storage_dir(&self) -> Result<PathBuf> {
        match &self.storage_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(dirs::data_dir()
                .ok_or_else(|| anyhow!("Could not determine data directory"))?
                .join(APP_DIR)),
        }
    }

    /// Environment variables win over the file
    pub fn apply_env(&mut self) {
        if let Ok(url) = env::var(SERVER_URL_ENV) {
            if !url.trim().is_empty() {
                debug!("Server URL overridden by {}", SERVER_URL_ENV);
                self.server_url = url.trim().to_string();
            }
        }
        if let Ok(dir) = env::var(STORAGE_DIR_ENV) {
            if !dir.trim().is_empty() {
                debug!("Storage directory overridden by {}", STORAGE_DIR_ENV);
                self.storage_dir = Some(PathBuf::from(dir.trim()));
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.server_url)
            .with_context(|| format!("invalid server_url '{}'", self.server_url))?;
        if self.dedup_tolerance_ms > i64::MAX as u64 {
            return Err(anyhow!("dedup_tolerance_ms out of range"));
        }
        Ok(())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
        let config: RealtimeConfig = serde_json::from_reader(file)
            .with_context(|| format!("cannot parse {}", path.display()))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join(APP_DIR);

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// Use `path` instead of `<config dir>/hubline/config.json`. Only the first call has an effect.
pub fn set_config_path(path: PathBuf) -> bool {
    CONFIG_PATH_OVERRIDE.set(path).is_ok()
}

pub fn get_config_path() -> Result<PathBuf> {
    if let Some(path) = CONFIG_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_config_dir()?.join("config.json"))
}

/// Defaults, overlaid by the config file when it exists, then by the environment
pub fn load_config() -> Result<RealtimeConfig> {
    let path = get_config_path()?;
    let mut config = if path.exists() {
        RealtimeConfig::load_from(&path)?
    } else {
        debug!("No config file at {}, using defaults", path.display());
        RealtimeConfig::default()
    };
    config.apply_env();
    config.validate()?;
    Ok(config)
}
