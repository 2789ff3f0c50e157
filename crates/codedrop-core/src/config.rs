// Configuration loading (codedrop.toml) and the persisted client settings
// store with live change notification.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

/// Server address used when nothing has been persisted yet.
pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:10044";

pub const CONFIG_FILE: &str = "codedrop.toml";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML in {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("`{field}` {message}")]
    ValidationError { field: String, message: String },

    #[error("could not seed configuration: {message}")]
    DefaultsCopyError { message: String },
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to access settings file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("server address must start with ws:// or wss://, got `{url}`")]
    InvalidUrl { url: String },

    #[error("no settings location available on this platform")]
    NoLocation,
}

// ---------------------------------------------------------------------------
// codedrop.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 10044,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrowserConfig {
    pub debug_url: String,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            debug_url: "http://localhost:9222".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    /// Override for the settings file location. `None` means the platform
    /// config directory.
    #[serde(default)]
    pub settings_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "codedrop=info,warn".into(),
        }
    }
}

impl Config {
    /// The relay listen address as a socket address.
    pub fn relay_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.relay.host, self.relay.port)
            .parse()
            .map_err(|e| ConfigError::ValidationError {
                field: "relay.host".into(),
                message: format!("not a valid socket address: {e}"),
            })
    }

    /// Resolved settings file path: the configured override, else the
    /// platform config directory.
    pub fn settings_path(&self) -> Result<PathBuf, SettingsError> {
        match &self.client.settings_path {
            Some(path) => Ok(path.clone()),
            None => SettingsStore::default_path().ok_or(SettingsError::NoLocation),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate `config/codedrop.toml` relative to `base_dir`.
///
/// Does not seed from `defaults/`; see `load_config` for that.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let path = base_dir.join("config").join(CONFIG_FILE);
    let text = read_file(&path)?;
    let config: Config = toml::from_str(&text).map_err(|e| ConfigError::ParseError {
        path: path.clone(),
        source: e,
    })?;

    validate(&config)?;
    Ok(config)
}

/// Seed `config/codedrop.toml` from `defaults/` if it does not exist yet.
/// An existing file is never overwritten. Returns the files written.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let source = base_dir.join("defaults").join(CONFIG_FILE);
    let target = base_dir.join("config").join(CONFIG_FILE);

    if target.exists() {
        return Ok(vec![]);
    }
    if !source.exists() {
        return Err(ConfigError::DefaultsCopyError {
            message: format!(
                "no {CONFIG_FILE} in {base}/config or {base}/defaults",
                base = base_dir.display()
            ),
        });
    }

    let seed_error = |what: String, e: std::io::Error| ConfigError::DefaultsCopyError {
        message: format!("{what}: {e}"),
    };

    if let Some(dir) = target.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| seed_error(format!("cannot create {}", dir.display()), e))?;
    }

    let mut dest = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&target)
    {
        Ok(dest) => dest,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(vec![]),
        Err(e) => return Err(seed_error(format!("cannot create {}", target.display()), e)),
    };
    let content = std::fs::read(&source)
        .map_err(|e| seed_error(format!("cannot read {}", source.display()), e))?;
    std::io::Write::write_all(&mut dest, &content)
        .map_err(|e| seed_error(format!("cannot write {}", target.display()), e))?;

    info!("Created {} from defaults", target.display());
    Ok(vec![target])
}

/// Convenience wrapper: loads config relative to the current working directory.
/// Ensures default config files are copied before loading.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_files(&cwd)?;
    load_config_from(&cwd)
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.relay.port == 0 {
        return Err(ConfigError::ValidationError {
            field: "relay.port".into(),
            message: "must be greater than 0".into(),
        });
    }

    if config.relay.host.trim().is_empty() {
        return Err(ConfigError::ValidationError {
            field: "relay.host".into(),
            message: "must not be empty".into(),
        });
    }

    config.relay_addr()?;

    if config.browser.debug_url.trim().is_empty() {
        return Err(ConfigError::ValidationError {
            field: "browser.debug_url".into(),
            message: "must not be empty".into(),
        });
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Client settings store
// ---------------------------------------------------------------------------

/// On-disk form of the client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SettingsFile {
    #[serde(default = "default_ws_url")]
    ws_url: String,
}

fn default_ws_url() -> String {
    DEFAULT_WS_URL.to_string()
}

/// Persisted server address with change notification.
///
/// The current value lives in a `watch` channel; every subscriber sees each
/// change exactly once as a new value. Setting the address to its current
/// value publishes nothing.
pub struct SettingsStore {
    path: PathBuf,
    tx: watch::Sender<String>,
}

impl SettingsStore {
    /// Open the store at `path`. A missing file yields the default address;
    /// it is only written on the first `set_ws_url`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let ws_url = read_settings(&path)?;
        let (tx, _rx) = watch::channel(ws_url);
        Ok(Self { path, tx })
    }

    /// `<platform config dir>/codedrop/settings.toml`.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "codedrop")
            .map(|dirs| dirs.config_dir().join("settings.toml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The current server address.
    pub fn ws_url(&self) -> String {
        self.tx.borrow().clone()
    }

    /// Receiver that observes the current address and every later change.
    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.tx.subscribe()
    }

    /// Persist a new server address and notify subscribers if it changed.
    pub fn set_ws_url(&self, url: &str) -> Result<(), SettingsError> {
        validate_ws_url(url)?;
        write_settings(&self.path, url)?;
        self.publish(url.to_string());
        Ok(())
    }

    /// Re-read the file and publish its value if it differs from the current
    /// one. Returns whether a change was published.
    pub fn reload(&self) -> Result<bool, SettingsError> {
        let ws_url = read_settings(&self.path)?;
        validate_ws_url(&ws_url)?;
        Ok(self.publish(ws_url))
    }

    /// Poll the settings file every `every` and publish edits made outside
    /// this process.
    pub fn watch_file(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.reload() {
                    Ok(true) => info!("Server address changed on disk: {}", self.ws_url()),
                    Ok(false) => {}
                    Err(e) => warn!("Failed to reload settings: {e}"),
                }
            }
        })
    }

    fn publish(&self, ws_url: String) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == ws_url {
                false
            } else {
                *current = ws_url;
                true
            }
        })
    }
}

fn validate_ws_url(url: &str) -> Result<(), SettingsError> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(())
    } else {
        Err(SettingsError::InvalidUrl {
            url: url.to_string(),
        })
    }
}

fn read_settings(path: &Path) -> Result<String, SettingsError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(default_ws_url()),
        Err(e) => {
            return Err(SettingsError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    let file: SettingsFile = toml::from_str(&text).map_err(|e| SettingsError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(file.ws_url)
}

fn write_settings(path: &Path, ws_url: &str) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SettingsError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    let text = toml::to_string(&SettingsFile {
        ws_url: ws_url.to_string(),
    })?;
    std::fs::write(path, text).map_err(|e| SettingsError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
