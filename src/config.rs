use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Lowest idle timeout accepted from the settings file
pub const MIN_NETWORK_TIMEOUT_MS: u64 = 20_000;

/// Version token sent with `Authenticate`
pub const PLUGIN_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to access settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid server address: {0}")]
    InvalidAddress(String),
}

/// User-tunable behaviour, persisted as `settings.json` in the save directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub allow_radio_station_adjustment: bool,
    pub connect_attempts: u32,
    pub connect_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub enable_logging: bool,
    pub network_timeout_ms: u64,
    pub stream_files: bool,
    pub transfer_files: bool,
    pub tick_interval_ms: u64,
    pub accepted_extensions: Vec<String>,
    pub illegal_characters: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            allow_radio_station_adjustment: true,
            connect_attempts: 10,
            connect_delay_ms: 10_000,
            connect_timeout_ms: 5_000,
            enable_logging: true,
            network_timeout_ms: MIN_NETWORK_TIMEOUT_MS,
            stream_files: true,
            transfer_files: true,
            tick_interval_ms: 100,
            accepted_extensions: [
                ".afc", ".aif", ".aifc", ".aiff", ".it", ".mo3", ".mod", ".mp1", ".mp2", ".mp3",
                ".mtm", ".oga", ".ogg", ".s3m", ".umx", ".wav", ".wave", ".xm",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            illegal_characters: ["\"", "*", "..", "/", ":", "<", ">", "?", "\\", "|"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Settings {
    pub const FILE_NAME: &'static str = "settings.json";

    /// Load `settings.json` from `dir`, writing the defaults back when the
    /// file does not exist yet.
    pub fn load_or_create(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(Self::FILE_NAME);

        if !path.exists() {
            let settings = Self::default();
            let json = serde_json::to_string_pretty(&settings).map_err(|source| {
                ConfigError::Parse {
                    path: path.clone(),
                    source,
                }
            })?;
            std::fs::write(&path, json).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            info!("📝 Wrote default settings to {}", path.display());
            return Ok(settings);
        }

        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let settings: Settings =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;

        info!("⚙️ Loaded settings from {}", path.display());
        Ok(settings.normalized())
    }

    /// Create the save directory if needed and load its settings
    pub fn init_save_path(dir: &Path) -> crate::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self::load_or_create(dir)?)
    }

    /// Clamp values that would make the client misbehave
    pub fn normalized(mut self) -> Self {
        if self.network_timeout_ms < MIN_NETWORK_TIMEOUT_MS {
            warn!(
                "network_timeout_ms {} is below the minimum, using {}",
                self.network_timeout_ms, MIN_NETWORK_TIMEOUT_MS
            );
            self.network_timeout_ms = MIN_NETWORK_TIMEOUT_MS;
        }
        if self.connect_attempts == 0 {
            self.connect_attempts = 1;
        }
        if self.tick_interval_ms == 0 {
            self.tick_interval_ms = 100;
        }
        self
    }

    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Case-insensitive suffix match against `accepted_extensions`
    pub fn accepts_extension(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.accepted_extensions
            .iter()
            .any(|ext| name.ends_with(&ext.to_lowercase()))
    }

    /// Case-insensitive substring match against `illegal_characters`
    pub fn contains_illegal_characters(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.illegal_characters
            .iter()
            .filter(|pattern| !pattern.is_empty())
            .any(|pattern| name.contains(&pattern.to_lowercase()))
    }
}

/// Where the game server listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, ConfigError> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(ConfigError::InvalidAddress("host cannot be empty".to_string()));
        }
        if port == 0 {
            return Err(ConfigError::InvalidAddress(format!("{host}:0")));
        }
        Ok(Self { host, port })
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
