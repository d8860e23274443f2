use anyhow::{Context, Result, anyhow};
use apy_core::Endpoint;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayCfg {
    #[serde(default = "def_host")]
    pub host: String,
    #[serde(default = "def_port")]
    pub port: u16,
    #[serde(default = "def_name")]
    pub name: String,
}
fn def_host() -> String { "0.0.0.0".into() }
fn def_port() -> u16 { 8080 }
fn def_name() -> String { "apy".into() }

impl Default for GatewayCfg {
    fn default() -> Self {
        Self { host: def_host(), port: def_port(), name: def_name() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingCfg {
    #[serde(default = "def_level")]
    pub level: String,
    /// plain | pretty | json
    #[serde(default = "def_format")]
    pub format: String,
}
fn def_level() -> String { "info".into() }
fn def_format() -> String { "plain".into() }

impl Default for LoggingCfg {
    fn default() -> Self {
        Self { level: def_level(), format: def_format() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TracingCfg {
    #[serde(default)]
    pub otlp_endpoint: String,
    #[serde(default)]
    pub service_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreCfg {
    #[serde(default = "def_engine")]
    pub engine: String, // memory | lmdb | redis
    #[serde(default = "def_store_path")]
    pub path: String,
    #[serde(default)]
    pub url: String,
}
fn def_engine() -> String { "memory".into() }
fn def_store_path() -> String { "./data/apy".into() }

impl Default for StoreCfg {
    fn default() -> Self {
        Self { engine: def_engine(), path: def_store_path(), url: String::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCfg {
    /// HS256 signing secret. Empty means generate one per process.
    #[serde(default)]
    pub secret: String,
    #[serde(default = "def_token_ttl")]
    pub token_ttl_secs: i64,
}
fn def_token_ttl() -> i64 { 900 }

impl Default for AuthCfg {
    fn default() -> Self {
        Self { secret: String::new(), token_ttl_secs: def_token_ttl() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsCfg {
    #[serde(default = "def_window")]
    pub window_secs: u64,
    #[serde(default = "def_upstream_timeout")]
    pub upstream_timeout_ms: u64,
    #[serde(default = "def_persist_timeout")]
    pub persist_timeout_ms: u64,
}
fn def_window() -> u64 { 15 * 60 * 60 }
fn def_upstream_timeout() -> u64 { 30_000 }
fn def_persist_timeout() -> u64 { 2_000 }

impl Default for LimitsCfg {
    fn default() -> Self {
        Self {
            window_secs: def_window(),
            upstream_timeout_ms: def_upstream_timeout(),
            persist_timeout_ms: def_persist_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub gateway: GatewayCfg,
    #[serde(default)]
    pub logging: LoggingCfg,
    #[serde(default)]
    pub tracing: TracingCfg,
    #[serde(default)]
    pub store: StoreCfg,
    #[serde(default)]
    pub auth: AuthCfg,
    #[serde(default)]
    pub limits: LimitsCfg,
    /// Registered at startup, after the store has been hydrated.
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl FileConfig {
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overlay `APY_*` variables, then assemble a Redis URL from the legacy
    /// `DB_*` variables when no explicit one was given.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("APY_HOST") {
            self.gateway.host = v;
        }
        if let Some(v) = get("APY_PORT") {
            match v.parse() {
                Ok(port) => self.gateway.port = port,
                Err(_) => warn!(value = %v, "ignoring invalid APY_PORT"),
            }
        }
        if let Some(v) = get("APY_LOG") {
            self.logging.level = v;
        }
        let engine = get("APY_STORE_ENGINE");
        if let Some(v) = &engine {
            self.store.engine = v.to_ascii_lowercase();
        }
        if let Some(v) = get("APY_STORE_PATH") {
            self.store.path = v;
        }
        if let Some(v) = get("APY_JWT_SECRET") {
            self.auth.secret = v;
        }

        if let Some(v) = get("APY_REDIS_URL") {
            self.store.url = v;
        } else if let Some(host) = get("DB_HOST") {
            let port = get("DB_PORT").unwrap_or_else(|| "6379".into());
            let creds = match (get("DB_USER"), get("DB_PASSWORD")) {
                (Some(user), Some(pass)) => format!("{user}:{pass}@"),
                (Some(user), None) => format!("{user}@"),
                (None, Some(pass)) => format!(":{pass}@"),
                (None, None) => String::new(),
            };
            self.store.url = format!("redis://{creds}{host}:{port}");
            if engine.is_none() {
                self.store.engine = "redis".into();
            }
        }
    }
}

/// Parse a config file by extension. A missing file yields defaults.
pub fn load_config(path: &str) -> Result<FileConfig> {
    if !Path::new(path).exists() {
        warn!(path, "config file not found, using defaults");
        return Ok(FileConfig::default());
    }
    let content = fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    parse_config(path, &content)
}

fn parse_config(path: &str, content: &str) -> Result<FileConfig> {
    if path.ends_with(".yaml") || path.ends_with(".yml") {
        serde_yml::from_str(content).with_context(|| format!("parse yaml config {}", path))
    } else if path.ends_with(".json") {
        serde_json::from_str(content).with_context(|| format!("parse json config {}", path))
    } else if path.ends_with(".toml") {
        toml::from_str(content).with_context(|| format!("parse toml config {}", path))
    } else {
        Err(anyhow!("Unknown config extension: {}", path))
    }
}
