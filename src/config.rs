use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chat::ProviderCapabilities;
use crate::chat::cache::DEFAULT_MAX_MESSAGES;
use crate::gateway::protocol::{ClientInfo, DeviceInfo};
use crate::gateway::{ClientOptions, DEFAULT_ROLE};
use crate::retry::RetryPolicy;

const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Settings directory (defaults to `~/.clawlink`)
    pub settings_dir: PathBuf,
    pub client: ClientSection,
    pub device: DeviceSection,
    /// Gateways this device talks to; the first one is the default.
    pub servers: Vec<ServerConfig>,
    pub reconnect: ReconnectConfig,
    /// Per-request timeout. Absent means requests wait for a response or a close.
    pub request_timeout_ms: Option<u64>,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub id: String,
    pub display_name: Option<String>,
    pub version: String,
    pub platform: String,
    pub mode: String,
    pub role: String,
    pub caps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    /// Generated on first use and persisted by `save`.
    pub id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    /// `ws://` or `wss://` endpoint
    pub url: String,
    /// Auth token issued by pairing
    #[serde(default)]
    pub token: Option<String>,
    /// The gateway remembers history across its restarts
    #[serde(default = "default_true")]
    pub persistent_history: bool,
    /// The gateway can list sessions itself
    #[serde(default = "default_true")]
    pub server_sessions: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub jitter_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Defaults to `<settings_dir>/cache`
    pub dir: Option<PathBuf>,
    pub max_messages: usize,
}

fn default_true() -> bool {
    true
}

fn default_settings_dir() -> PathBuf {
    let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home_dir.join(".clawlink")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings_dir: default_settings_dir(),
            client: ClientSection::default(),
            device: DeviceSection::default(),
            servers: Vec::new(),
            reconnect: ReconnectConfig::default(),
            request_timeout_ms: None,
            cache: CacheConfig::default(),
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            id: env!("CARGO_PKG_NAME").to_string(),
            display_name: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            mode: "cli".to_string(),
            role: DEFAULT_ROLE.to_string(),
            caps: vec!["chat".to_string()],
        }
    }
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            id: None,
            name: std::env::var("HOSTNAME").unwrap_or_else(|_| "clawlink".to_string()),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        let policy = RetryPolicy::reconnect_default();
        Self {
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            max_attempts: policy.max_attempts,
            jitter_ratio: policy.jitter_ratio,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter_ratio: self.jitter_ratio,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_messages: DEFAULT_MAX_MESSAGES,
        }
    }
}

impl ServerConfig {
    pub fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            server_sessions: self.server_sessions,
            persistent_history: self.persistent_history,
        }
    }
}

impl Config {
    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        default_settings_dir().join(CONFIG_FILE)
    }

    /// Load configuration from `path` (or the default location). A missing
    /// file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config from {}", config_path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", config_path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to `path` (or `<settings_dir>/config.toml`).
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.settings_dir.join(CONFIG_FILE));

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config to {}", config_path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for server in &self.servers {
            let url = url::Url::parse(&server.url)
                .with_context(|| format!("Invalid url for server '{}'", server.id))?;
            if !matches!(url.scheme(), "ws" | "wss") {
                bail!(
                    "Server '{}' must use ws:// or wss://, got {}://",
                    server.id,
                    url.scheme()
                );
            }
        }
        if self.reconnect.max_attempts == 0 {
            bail!("reconnect.max_attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter_ratio) {
            bail!("reconnect.jitter_ratio must be between 0 and 1");
        }
        Ok(())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache
            .dir
            .clone()
            .unwrap_or_else(|| self.settings_dir.join("cache"))
    }

    /// Server by id, or the first configured one.
    pub fn server(&self, id: Option<&str>) -> Result<&ServerConfig> {
        match id {
            Some(id) => self
                .servers
                .iter()
                .find(|server| server.id == id)
                .with_context(|| format!("No server named '{id}' in config")),
            None => self
                .servers
                .first()
                .context("No servers configured; add a [[servers]] entry"),
        }
    }

    pub fn server_mut(&mut self, id: &str) -> Option<&mut ServerConfig> {
        self.servers.iter_mut().find(|server| server.id == id)
    }

    /// Device id, generating one if none is stored yet. Returns whether the
    /// config changed and should be saved.
    pub fn ensure_device_id(&mut self) -> bool {
        if self.device.id.is_some() {
            return false;
        }
        self.device.id = Some(uuid::Uuid::new_v4().to_string());
        true
    }

    pub fn client_options(&self, server: &ServerConfig) -> ClientOptions {
        let client = ClientInfo {
            id: self.client.id.clone(),
            display_name: self.client.display_name.clone(),
            version: self.client.version.clone(),
            platform: self.client.platform.clone(),
            mode: self.client.mode.clone(),
        };
        let device = DeviceInfo {
            id: self.device.id.clone().unwrap_or_default(),
            name: self.device.name.clone(),
        };
        let mut options = ClientOptions::new(server.url.clone(), client, device);
        options.role = self.client.role.clone();
        options.caps = self.client.caps.clone();
        options.auth_token = server.token.clone();
        options.reconnect = self.reconnect.policy();
        options.request_timeout = self.request_timeout_ms.map(Duration::from_millis);
        options
    }
}
