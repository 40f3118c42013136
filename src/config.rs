use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::error::{RelayError, Result};

pub const DEFAULT_COMPLETION_URL: &str = "https://api.deepseek.com/chat/completions";
pub const DEFAULT_MODEL: &str = "deepseek-chat";
pub const DEFAULT_WECHAT_API_BASE: &str = "https://api.weixin.qq.com";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:5000";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 32;

/// Timeouts and retry policy for outbound HTTP calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles after each further failure.
    pub backoff_base: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(60),
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WechatConfig {
    /// Shared token configured on the WeChat admin console
    pub token: String,
    pub app_id: String,
    pub app_secret: String,
    /// Present only when safe-mode message encryption is enabled
    pub encoding_aes_key: Option<String>,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct CompletionConfig {
    /// Missing keys are reported per request instead of at startup
    pub api_key: Option<String>,
    pub api_url: String,
    pub model: String,
    pub temperature: f32,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub wechat: WechatConfig,
    pub completion: CompletionConfig,
    pub http: HttpConfig,
    pub max_in_flight: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        debug!("Loading configuration from environment");
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let required = |key: &str| {
            var(key).ok_or_else(|| {
                error!("Failed to load {key} from environment");
                RelayError::Config(format!("{key} is not set"))
            })
        };

        let wechat = WechatConfig {
            token: required("WECHAT_TOKEN")?,
            app_id: required("WECHAT_APP_ID")?,
            app_secret: required("WECHAT_APP_SECRET")?,
            encoding_aes_key: var("WECHAT_ENCODING_AES_KEY"),
            api_base: var("WECHAT_API_BASE")
                .unwrap_or_else(|| DEFAULT_WECHAT_API_BASE.to_string()),
        };

        let completion = CompletionConfig {
            api_key: var("DEEPSEEK_API_KEY"),
            api_url: var("DEEPSEEK_API_URL").unwrap_or_else(|| DEFAULT_COMPLETION_URL.to_string()),
            model: var("DEEPSEEK_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            temperature: parse_or(
                "DEEPSEEK_TEMPERATURE",
                var("DEEPSEEK_TEMPERATURE"),
                DEFAULT_TEMPERATURE,
            )?,
            system_prompt: var("DEEPSEEK_SYSTEM_PROMPT"),
        };

        let defaults = HttpConfig::default();
        let http = HttpConfig {
            connect_timeout: parse_secs(
                "RELAY_CONNECT_TIMEOUT_SECS",
                var("RELAY_CONNECT_TIMEOUT_SECS"),
                defaults.connect_timeout,
            )?,
            read_timeout: parse_secs(
                "RELAY_READ_TIMEOUT_SECS",
                var("RELAY_READ_TIMEOUT_SECS"),
                defaults.read_timeout,
            )?,
            max_attempts: defaults.max_attempts,
            backoff_base: parse_secs(
                "RELAY_RETRY_BACKOFF_SECS",
                var("RELAY_RETRY_BACKOFF_SECS"),
                defaults.backoff_base,
            )?,
        };

        let bind_addr = parse_or(
            "RELAY_BIND_ADDR",
            var("RELAY_BIND_ADDR"),
            SocketAddr::from_str(DEFAULT_BIND_ADDR)
                .map_err(|e| RelayError::Config(e.to_string()))?,
        )?;
        let max_in_flight = parse_or(
            "RELAY_MAX_IN_FLIGHT",
            var("RELAY_MAX_IN_FLIGHT"),
            DEFAULT_MAX_IN_FLIGHT,
        )?;
        if max_in_flight == 0 {
            return Err(RelayError::Config(
                "RELAY_MAX_IN_FLIGHT must be at least 1".to_string(),
            ));
        }

        info!("Configuration loaded successfully");
        debug!("WeChat token length: {} characters", wechat.token.len());
        debug!("WeChat app id: {}", wechat.app_id);
        debug!(
            "Message encryption: {}",
            if wechat.encoding_aes_key.is_some() { "enabled" } else { "disabled" }
        );
        match &completion.api_key {
            Some(key) => debug!("Completion API key length: {} characters", key.len()),
            None => warn!("DEEPSEEK_API_KEY is not set; messages will get a configuration error"),
        }
        debug!("Completion model: {}", completion.model);

        Ok(Self {
            bind_addr,
            wechat,
            completion,
            http,
            max_in_flight,
        })
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw.trim().parse().map_err(|e| {
            error!("Invalid value for {key}: {e}");
            RelayError::Config(format!("invalid {key} '{raw}': {e}"))
        }),
        None => Ok(default),
    }
}

fn parse_secs(key: &str, raw: Option<String>, default: Duration) -> Result<Duration> {
    let secs: f64 = parse_or(key, raw, default.as_secs_f64())?;
    Duration::try_from_secs_f64(secs)
        .map_err(|e| RelayError::Config(format!("invalid {key} '{secs}': {e}")))
}
