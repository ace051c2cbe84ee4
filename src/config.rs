//! Configuration loading and validation.
//!
//! Configuration lives in a single TOML file, by default
//! `~/.config/putarr/config.toml` (generate one with `putarr generate-config`).
//! Missing optional fields fall back to compiled defaults; required fields are
//! checked by [`Config::validate`], which is run once at startup and is fatal
//! on failure.
//!
//! ```toml
//! username = "myusername"
//! password = "mypassword"
//! download_directory = "/path/to/downloads"
//!
//! bind_address = "0.0.0.0"
//! port = 9091
//! loglevel = "info"
//! uid = 1000
//! polling_interval = 10
//! skip_directories = ["sample", "extras"]
//! orchestration_workers = 10
//! download_workers = 4
//!
//! [putio]
//! api_key = "PUTIO_API_KEY"
//!
//! [sonarr]
//! url = "http://mysonarrhost:8989/sonarr"
//! api_key = "SONARR_API_KEY"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

pub const MIN_POLLING_INTERVAL: u64 = 1;
pub const MAX_POLLING_INTERVAL: u64 = 3600;
pub const MIN_DOWNLOAD_WORKERS: usize = 1;
pub const MAX_DOWNLOAD_WORKERS: usize = 100;
pub const MIN_ORCHESTRATION_WORKERS: usize = 1;
pub const MAX_ORCHESTRATION_WORKERS: usize = 100;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Username the Arr services use to connect to the proxy. Required.
    #[serde(default)]
    pub username: String,
    /// Password the Arr services use to connect to the proxy. Required.
    #[serde(default)]
    pub password: String,
    /// Directory downloads land in. Must exist and be writable, and has to be
    /// readable by the Arr services so they can import from it. Required.
    #[serde(default)]
    pub download_directory: String,
    /// Address to bind the RPC endpoint on (default `0.0.0.0`).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port for the RPC endpoint (default 9091).
    #[serde(default = "default_port")]
    pub port: u16,
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
    /// Owner for downloaded files when running as root (default 1000).
    #[serde(default = "default_uid")]
    pub uid: u32,
    /// Seconds between put.io polls (default 10, range 1–3600).
    #[serde(default = "default_polling_interval")]
    pub polling_interval: u64,
    /// Directory names to skip when downloading, compared case-insensitively
    /// (default `["sample", "extras"]`).
    #[serde(default = "default_skip_directories")]
    pub skip_directories: Vec<String>,
    /// Number of orchestration workers (default 10, range 1–100).
    #[serde(default = "default_orchestration_workers")]
    pub orchestration_workers: usize,
    /// Number of parallel download workers (default 4, range 1–100).
    #[serde(default = "default_download_workers")]
    pub download_workers: usize,
    #[serde(default)]
    pub putio: PutioConfig,
    pub sonarr: Option<ArrConfig>,
    pub radarr: Option<ArrConfig>,
    pub whisparr: Option<ArrConfig>,
}

/// put.io API settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PutioConfig {
    /// API token. Generate one with `putarr get-token`. Required.
    #[serde(default)]
    pub api_key: String,
}

/// Connection settings for one Arr service.
#[derive(Debug, Clone, Deserialize)]
pub struct ArrConfig {
    pub url: String,
    pub api_key: String,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    9091
}
fn default_loglevel() -> String {
    "info".to_string()
}
fn default_uid() -> u32 {
    1000
}
fn default_polling_interval() -> u64 {
    10
}
fn default_skip_directories() -> Vec<String> {
    vec!["sample".to_string(), "extras".to_string()]
}
fn default_orchestration_workers() -> usize {
    10
}
fn default_download_workers() -> usize {
    4
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            download_directory: String::new(),
            bind_address: default_bind_address(),
            port: default_port(),
            loglevel: default_loglevel(),
            uid: default_uid(),
            polling_interval: default_polling_interval(),
            skip_directories: default_skip_directories(),
            orchestration_workers: default_orchestration_workers(),
            download_workers: default_download_workers(),
            putio: PutioConfig::default(),
            sonarr: None,
            radarr: None,
            whisparr: None,
        }
    }
}

/// Errors produced while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    Io(PathBuf, std::io::Error),
    /// The config file is not valid TOML.
    Parse(PathBuf, toml::de::Error),
    /// A field is missing or out of range.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(path, e) => {
                write!(f, "failed to read config file {}: {e}", path.display())
            }
            ConfigError::Parse(path, e) => {
                write!(f, "failed to parse config file {}: {e}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from a TOML file. Unset optional fields fall back
    /// to their defaults; call [`Config::validate`] before using the result.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        toml::from_str(&data).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    /// Check that required fields are present, numeric fields are in range,
    /// and the download directory exists and is writable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.username.is_empty() {
            return Err(ConfigError::Invalid("username is required".into()));
        }
        if self.password.is_empty() {
            return Err(ConfigError::Invalid("password is required".into()));
        }
        if self.download_directory.is_empty() {
            return Err(ConfigError::Invalid("download_directory is required".into()));
        }

        let dir = Path::new(&self.download_directory);
        match std::fs::metadata(dir) {
            Ok(meta) if !meta.is_dir() => {
                return Err(ConfigError::Invalid(format!(
                    "download_directory is not a directory: {}",
                    self.download_directory
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::Invalid(format!(
                    "download_directory does not exist: {}",
                    self.download_directory
                )));
            }
            Err(e) => {
                return Err(ConfigError::Invalid(format!(
                    "unable to stat download_directory: {e}"
                )));
            }
        }
        // Probe writability with a throwaway file.
        let probe = dir.join(format!(".putarr-perm-{}", std::process::id()));
        match std::fs::File::create(&probe) {
            Ok(_) => {
                let _ = std::fs::remove_file(&probe);
            }
            Err(e) => {
                return Err(ConfigError::Invalid(format!(
                    "download_directory is not writable: {e}"
                )));
            }
        }

        if self.port == 0 {
            return Err(ConfigError::Invalid(
                "port must be between 1 and 65535".into(),
            ));
        }
        if EnvFilter::try_new(&self.loglevel).is_err() {
            return Err(ConfigError::Invalid(format!(
                "loglevel is not a valid tracing filter: {}",
                self.loglevel
            )));
        }

        if self.putio.api_key.is_empty() {
            return Err(ConfigError::Invalid("putio.api_key is required".into()));
        }
        if self.sonarr.is_none() && self.radarr.is_none() && self.whisparr.is_none() {
            return Err(ConfigError::Invalid(
                "at least one of sonarr, radarr, or whisparr must be configured".into(),
            ));
        }
        for (name, arr) in self.arr_services() {
            if arr.url.is_empty() {
                return Err(ConfigError::Invalid(format!("{name}.url is required")));
            }
            if url::Url::parse(&arr.url).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "{name}.url is invalid: {}",
                    arr.url
                )));
            }
            if arr.api_key.is_empty() {
                return Err(ConfigError::Invalid(format!("{name}.api_key is required")));
            }
        }

        if !(MIN_POLLING_INTERVAL..=MAX_POLLING_INTERVAL).contains(&self.polling_interval) {
            return Err(ConfigError::Invalid(format!(
                "polling_interval must be between {MIN_POLLING_INTERVAL} and {MAX_POLLING_INTERVAL} seconds"
            )));
        }
        if !(MIN_DOWNLOAD_WORKERS..=MAX_DOWNLOAD_WORKERS).contains(&self.download_workers) {
            return Err(ConfigError::Invalid(format!(
                "download_workers must be between {MIN_DOWNLOAD_WORKERS} and {MAX_DOWNLOAD_WORKERS}"
            )));
        }
        if !(MIN_ORCHESTRATION_WORKERS..=MAX_ORCHESTRATION_WORKERS)
            .contains(&self.orchestration_workers)
        {
            return Err(ConfigError::Invalid(format!(
                "orchestration_workers must be between {MIN_ORCHESTRATION_WORKERS} and {MAX_ORCHESTRATION_WORKERS}"
            )));
        }

        Ok(())
    }

    /// The configured Arr services as `(name, config)` pairs, in a fixed order.
    pub fn arr_services(&self) -> Vec<(&'static str, &ArrConfig)> {
        let mut services = Vec::new();
        if let Some(cfg) = &self.sonarr {
            services.push(("sonarr", cfg));
        }
        if let Some(cfg) = &self.radarr {
            services.push(("radarr", cfg));
        }
        if let Some(cfg) = &self.whisparr {
            services.push(("whisparr", cfg));
        }
        services
    }
}

/// Default configuration file path: `~/.config/putarr/config.toml`, falling
/// back to `./config.toml` when the home directory cannot be determined.
pub fn default_config_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home)
            .join(".config")
            .join("putarr")
            .join("config.toml"),
        None => PathBuf::from("./config.toml"),
    }
}
