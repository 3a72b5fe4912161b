use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::discovery::DiscoveryConfig;
use crate::transfer::TRANSFER_PORT;

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "netlink";
const APP_NAME: &str = "netlink";
const CONFIG_FILE: &str = "config.json";
/// Overrides the config directory, mostly for tests
pub const CONFIG_DIR_ENV: &str = "NETLINK_CONFIG_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Name announced to other machines
    pub machine_name: String,
    pub transfer_port: u16,
    pub download_dir: PathBuf,
    /// Skip multicast when announcing
    pub broadcast_only: bool,
    /// Send beacons; when false we only listen
    pub announce: bool,
    /// Age after which `.partial` files count as abandoned
    pub partial_cleanup_days: u64,
    /// Run the partial cleanup when the receiver starts
    pub auto_cleanup_partial: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        let download_dir = UserDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
            .join("NetLinkReceived");

        let machine_name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            machine_name,
            transfer_port: TRANSFER_PORT,
            download_dir,
            broadcast_only: false,
            announce: true,
            partial_cleanup_days: 30,
            auto_cleanup_partial: false,
        }
    }
}

impl NetConfig {
    /// Config file location, honouring `NETLINK_CONFIG_DIR`.
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            return Some(PathBuf::from(dir).join(CONFIG_FILE));
        }

        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load config from disk or return default
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load from `path`. Missing or unreadable files give the defaults.
    pub fn load_from(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                debug!("No config at {}: {}", path.display(), e);
                return Self::default();
            }
        };

        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("Ignoring corrupt config {}: {}", path.display(), e);
            Self::default()
        })
    }

    /// Save config to disk
    pub fn save(&self) -> io::Result<()> {
        let path = Self::config_path().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no config directory available")
        })?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
    }

    pub fn partial_max_age(&self) -> Duration {
        Duration::from_secs(self.partial_cleanup_days.saturating_mul(24 * 60 * 60))
    }

    /// Discovery settings matching this config.
    pub fn discovery_config(&self) -> DiscoveryConfig {
        let config = DiscoveryConfig::new(self.machine_name.clone(), self.transfer_port)
            .with_announce(self.announce);
        if self.broadcast_only {
            config.broadcast_only()
        } else {
            config
        }
    }
}
