//! WeRelay configuration loader.
//!
//! Values come from `~/.werelay/config.toml` (or `--config`), then non-empty
//! environment variables override them. A missing file means defaults plus env.

use crate::coalescer::CoalescerConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use wr_channels::WeChatCredentials;
use wr_llm::{GeminiConfig, RetryPolicy};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WeRelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub wechat: WeChatConfig,
    #[serde(default)]
    pub gemini: GeminiSection,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Applies to every route except the webhook.
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeChatConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default = "default_wechat_api_base_url")]
    pub api_base_url: String,
}

fn default_wechat_api_base_url() -> String {
    wr_channels::DEFAULT_API_BASE_URL.to_string()
}

impl Default for WeChatConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            app_id: String::new(),
            app_secret: String::new(),
            api_base_url: default_wechat_api_base_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeminiSection {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_pro_url")]
    pub pro_url: String,
    #[serde(default = "default_pro_vision_url")]
    pub pro_vision_url: String,
    #[serde(default = "default_safety_threshold")]
    pub safety_threshold: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_pro_url() -> String {
    wr_llm::DEFAULT_PRO_URL.to_string()
}

fn default_pro_vision_url() -> String {
    wr_llm::DEFAULT_PRO_VISION_URL.to_string()
}

fn default_safety_threshold() -> String {
    wr_llm::DEFAULT_SAFETY_THRESHOLD.to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_request_timeout_seconds() -> u64 {
    60
}

impl Default for GeminiSection {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            pro_url: default_pro_url(),
            pro_vision_url: default_pro_vision_url(),
            safety_threshold: default_safety_threshold(),
            max_attempts: default_max_attempts(),
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// How long a non-final waiter waits before abandoning its request.
    #[serde(default = "default_reply_window_ms")]
    pub reply_window_ms: u64,
    /// Occurrence count at which a waiter must not abandon.
    #[serde(default = "default_final_retry")]
    pub final_retry: u32,
    #[serde(default = "default_pending_expiry_seconds")]
    pub pending_expiry_seconds: u64,
    #[serde(default = "default_picture_expiry_seconds")]
    pub picture_expiry_seconds: u64,
}

fn default_reply_window_ms() -> u64 {
    4500
}

fn default_final_retry() -> u32 {
    3
}

fn default_pending_expiry_seconds() -> u64 {
    20
}

fn default_picture_expiry_seconds() -> u64 {
    60
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            reply_window_ms: default_reply_window_ms(),
            final_retry: default_final_retry(),
            pending_expiry_seconds: default_pending_expiry_seconds(),
            picture_expiry_seconds: default_picture_expiry_seconds(),
        }
    }
}

impl WeRelayConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!(error = %e, "failed to load .env");
            }
        }

        let path = path.unwrap_or_else(default_config_path);
        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::from_toml(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(config_path = %path.display(), "config file not found; using defaults and environment");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("WECHAT_TOKEN") {
            self.wechat.token = v;
        }
        if let Some(v) = var("WECHAT_APP_ID") {
            self.wechat.app_id = v;
        }
        if let Some(v) = var("WECHAT_APP_SECRET") {
            self.wechat.app_secret = v;
        }
        if let Some(v) = var("GEMINI_PRO_KEY") {
            self.gemini.api_key = v;
        }
        if let Some(v) = var("GEMINI_PRO_URL") {
            self.gemini.pro_url = v;
        }
        if let Some(v) = var("GEMINI_PRO_VISION_URL") {
            self.gemini.pro_vision_url = v;
        }
        if let Some(v) = var("WERELAY_BIND_ADDR") {
            self.server.bind_addr = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.wechat.token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "wechat.token is required (or set WECHAT_TOKEN)"
            ));
        }
        if self.gemini.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "gemini.api_key is required (or set GEMINI_PRO_KEY)"
            ));
        }
        self.bind_addr()?;
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.http_timeout_seconds must be > 0"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        if self.gemini.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("gemini.request_timeout_seconds must be > 0"));
        }
        if self.relay.reply_window_ms == 0 {
            return Err(anyhow::anyhow!("relay.reply_window_ms must be > 0"));
        }
        if self.relay.final_retry < 1 {
            return Err(anyhow::anyhow!("relay.final_retry must be >= 1"));
        }
        if self.relay.pending_expiry_seconds == 0 {
            return Err(anyhow::anyhow!("relay.pending_expiry_seconds must be > 0"));
        }
        if self.relay.picture_expiry_seconds == 0 {
            return Err(anyhow::anyhow!("relay.picture_expiry_seconds must be > 0"));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .bind_addr
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid server.bind_addr {:?}: {e}", self.server.bind_addr))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.server.http_timeout_seconds)
    }

    pub fn gemini_config(&self) -> GeminiConfig {
        let mut config = GeminiConfig::new(self.gemini.api_key.trim());
        config.pro_url = self.gemini.pro_url.trim().to_string();
        config.pro_vision_url = self.gemini.pro_vision_url.trim().to_string();
        config.safety_threshold = self.gemini.safety_threshold.trim().to_string();
        config.request_timeout = Duration::from_secs(self.gemini.request_timeout_seconds);
        config.retry = RetryPolicy::response_errors(self.gemini.max_attempts);
        config
    }

    /// App credentials, present only when both id and secret are configured.
    pub fn wechat_credentials(&self) -> Option<WeChatCredentials> {
        let app_id = self.wechat.app_id.trim();
        let app_secret = self.wechat.app_secret.trim();
        if app_id.is_empty() || app_secret.is_empty() {
            return None;
        }
        Some(WeChatCredentials {
            app_id: app_id.to_string(),
            app_secret: app_secret.to_string(),
        })
    }

    pub fn coalescer_config(&self) -> CoalescerConfig {
        CoalescerConfig {
            reply_window: Duration::from_millis(self.relay.reply_window_ms),
            final_retry: self.relay.final_retry,
            entry_expiry: Duration::from_secs(self.relay.pending_expiry_seconds),
        }
    }

    pub fn picture_expiry(&self) -> Duration {
        Duration::from_secs(self.relay.picture_expiry_seconds)
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".werelay").join("config.toml")
}
