use crate::error::ConfigError;
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Workspace directory - computed from home, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub reliability: ReliabilityConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub usage: UsageConfig,
}

// ── Model API ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// API key for the generative-language API. Falls back to the
    /// GOOGLE_API_KEY environment variable when unset.
    pub api_key: Option<String>,
    /// Model identifier (default: gemini-2.5-flash)
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// Base URL override, mainly for tests and proxies.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Per-request transport timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_model_id() -> String {
    "gemini-2.5-flash".into()
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model_id: default_model_id(),
            base_url: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ModelConfig {
    /// Resolve the API key: config file first, then environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(ToOwned::to_owned)
            .or_else(|| std::env::var("GOOGLE_API_KEY").ok().filter(|k| !k.is_empty()))
    }
}

// ── Generation reliability ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Total attempts per accepted request before emitting a failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base unit (ms) for the retry delay; attempt N waits N × base.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Queue submissions FIFO instead of replacing the pending slot.
    /// Default false: a new submission replaces a not-yet-started one.
    #[serde(default)]
    pub queue_submissions: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            queue_submissions: false,
        }
    }
}

// ── HTTP gateway ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway port (default: 8000)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Gateway host (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,
}

fn default_gateway_port() -> u16 {
    8000
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            host: default_gateway_host(),
        }
    }
}

// ── Token usage ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    /// Token count above which the usage endpoints flag a warning.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: u64,
}

fn default_warning_threshold() -> u64 {
    10_000
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            warning_threshold: default_warning_threshold(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────

impl Config {
    /// Load `~/.kotoba/config.toml`, writing a default file on first run.
    pub fn load_or_init() -> Result<Self, ConfigError> {
        let workspace_dir = Self::default_workspace_dir()?;
        Self::load_or_init_at(&workspace_dir)
    }

    /// Same as [`Config::load_or_init`] against an explicit workspace
    /// directory. Used by tests and by the `--workspace` CLI flag.
    pub fn load_or_init_at(workspace_dir: &Path) -> Result<Self, ConfigError> {
        fs::create_dir_all(workspace_dir)?;
        let config_path = workspace_dir.join("config.toml");

        let mut config = if config_path.exists() {
            let raw = fs::read_to_string(&config_path)?;
            match toml::from_str::<Self>(&raw) {
                Ok(parsed) => parsed,
                Err(error) => {
                    // Corrupt config falls back to defaults rather than
                    // refusing to start; the broken file is left in place.
                    tracing::warn!(
                        path = %config_path.display(),
                        %error,
                        "config.toml is malformed, continuing with defaults"
                    );
                    Self::default()
                }
            }
        } else {
            let default = Self::default();
            fs::write(&config_path, toml::to_string_pretty(&default).map_err(
                |e| ConfigError::Load(e.to_string()),
            )?)?;
            tracing::info!(path = %config_path.display(), "wrote default config");
            default
        };

        config.workspace_dir = workspace_dir.to_path_buf();
        config.config_path = config_path;
        config.validate()?;
        Ok(config)
    }

    fn default_workspace_dir() -> Result<PathBuf, ConfigError> {
        let dirs = UserDirs::new()
            .ok_or_else(|| ConfigError::Load("cannot determine home directory".into()))?;
        Ok(dirs.home_dir().join(".kotoba"))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.reliability.max_retries == 0 {
            return Err(ConfigError::Validation(
                "reliability.max_retries must be at least 1".into(),
            ));
        }
        if self.model.request_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "model.request_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Path of the SQLite database holding memories and usage records.
    pub fn db_path(&self) -> PathBuf {
        self.workspace_dir.join("kotoba.db")
    }

    /// Path of the persona catalog JSON file.
    pub fn personas_path(&self) -> PathBuf {
        self.workspace_dir.join("personas.json")
    }
}
