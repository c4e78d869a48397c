// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading.
//!
//! The config is a JSON document. `--config` accepts either a path or the
//! document itself encoded as base64 (CI systems often pass secrets that way).
//! A file whose content is base64 is decoded too.
//!
//! ```json
//! {
//!   "base_url": "https://pulp.example.com",
//!   "api_root": "/pulp/api/v3/",
//!   "domain": "konflux",
//!   "username": "builder",
//!   "password": "..."
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::errors::{PulpError, PulpResult};

/// Default API root below `base_url`.
pub const DEFAULT_API_ROOT: &str = "/pulp/api/v3/";

/// Default per-request timeout (seconds).
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Default timeout for server tasks (seconds) - 24 hours.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 86_400;

/// Default number of concurrent downloads.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Shortest string treated as base64 config content.
const MIN_BASE64_LEN: usize = 50;

/// Connection and behaviour settings for the content API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub api_root: String,
    pub domain: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Pre-issued bearer token. Takes precedence over basic auth.
    pub token: Option<String>,
    /// PEM client certificate for mutual TLS.
    pub cert: Option<PathBuf>,
    /// PEM private key matching `cert`.
    pub key: Option<PathBuf>,
    pub verify_tls: bool,
    pub request_timeout_secs: u64,
    pub task_timeout_secs: u64,
    pub max_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_root: DEFAULT_API_ROOT.to_string(),
            domain: None,
            username: None,
            password: None,
            token: None,
            cert: None,
            key: None,
            verify_tls: true,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            task_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

impl Config {
    /// Default config location: `<config dir>/pulp-tool/config.json`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("pulp-tool").join("config.json"))
            .unwrap_or_else(|| PathBuf::from(".pulp-tool/config.json"))
    }

    /// Load from a path or base64 content, apply environment overrides, validate.
    ///
    /// With `source == None` the default path is used if it exists; otherwise
    /// the config is built from the environment alone.
    pub fn load(source: Option<&str>) -> PulpResult<Self> {
        let mut config = match source {
            Some(src) if is_base64_config(src) => {
                tracing::debug!("Loading config from base64 content");
                Self::from_bytes(&decode_base64_config(src)?, "base64 content")?
            }
            Some(src) => Self::from_file(&expand_home(src))?,
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    tracing::debug!("No config at {}, using environment only", path.display());
                    Self::default()
                }
            }
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> PulpResult<Self> {
        if !path.exists() {
            return Err(PulpError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        let mut content = fs::read(path)?;
        if let Ok(text) = std::str::from_utf8(&content) {
            if is_base64_config(text) {
                content = decode_base64_config(text)?;
                tracing::debug!("Decoded base64 config content from {}", path.display());
            }
        }
        Self::from_bytes(&content, &path.display().to_string())
    }

    fn from_bytes(content: &[u8], source: &str) -> PulpResult<Self> {
        let config: Config = serde_json::from_slice(content)
            .map_err(|e| PulpError::Config(format!("invalid JSON in {}: {}", source, e)))?;
        tracing::debug!("Loaded configuration from {}", source);
        Ok(config)
    }

    /// Environment variables win over file values.
    pub fn apply_env(&mut self) {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        if let Some(v) = var("PULP_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = var("PULP_DOMAIN") {
            self.domain = Some(v);
        }
        if let Some(v) = var("PULP_USERNAME") {
            self.username = Some(v);
        }
        if let Some(v) = var("PULP_PASSWORD") {
            self.password = Some(v);
        }
        if let Some(v) = var("PULP_TOKEN") {
            self.token = Some(v);
        }
    }

    pub fn validate(&self) -> PulpResult<()> {
        if self.base_url.trim().is_empty() {
            return Err(PulpError::Config("base_url is required".to_string()));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(PulpError::Config(format!(
                "base_url must start with http:// or https:// (got '{}')",
                self.base_url
            )));
        }
        if self.cert.is_some() != self.key.is_some() {
            return Err(PulpError::Config("cert and key must be configured together".to_string()));
        }
        if self.max_workers == 0 {
            return Err(PulpError::Config("max_workers must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

/// Heuristic: long, no path separators, only base64 alphabet.
pub fn is_base64_config(config: &str) -> bool {
    if config.len() < MIN_BASE64_LEN {
        return false;
    }
    if config.contains('\\') || config.starts_with(['~', '.', '/']) {
        return false;
    }
    let mut significant = 0usize;
    for c in config.chars() {
        if c.is_whitespace() {
            continue;
        }
        if !(c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=') {
            return false;
        }
        significant += 1;
    }
    // '/' is in the base64 alphabet, but a string with several segments
    // and a file extension is far more likely a path.
    if config.contains('/') && Path::new(config.trim()).extension().is_some() {
        return false;
    }
    significant > MIN_BASE64_LEN
}

/// Decode base64 config content, ignoring surrounding and embedded whitespace.
pub fn decode_base64_config(config: &str) -> PulpResult<Vec<u8>> {
    let compact: String = config.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| PulpError::Config(format!("failed to decode base64 config: {}", e)))
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
