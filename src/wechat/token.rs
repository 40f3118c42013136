//! Lazily refreshed access token for the WeChat server API.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::sync::Mutex;
use url::Url;

use crate::config::WechatConfig;
use crate::error::{RelayError, Result};
use crate::http::RetryingClient;

/// Tokens are refreshed this long before WeChat says they expire.
pub const REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &format_args!("<{} chars>", self.value.len()))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AccessToken {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at - Duration::seconds(REFRESH_MARGIN_SECS)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    errcode: Option<i64>,
    #[serde(default)]
    errmsg: Option<String>,
}

/// Holds the single current access token.
///
/// A refresh runs while the lock is held, so callers arriving during a
/// refresh wait for it and reuse its result instead of issuing their own.
#[derive(Debug)]
pub struct TokenCache {
    http: Arc<RetryingClient>,
    api_base: String,
    app_id: String,
    app_secret: String,
    current: Mutex<Option<AccessToken>>,
}

impl TokenCache {
    pub fn new(http: Arc<RetryingClient>, config: &WechatConfig) -> Self {
        Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            app_id: config.app_id.clone(),
            app_secret: config.app_secret.clone(),
            current: Mutex::new(None),
        }
    }

    /// Return a token valid for at least the refresh margin, fetching a new
    /// one if needed.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Auth`] if the token endpoint fails. The refresh
    /// is a single request, never retried; the next caller tries again.
    pub async fn get_token(&self) -> Result<String> {
        let mut current = self.current.lock().await;
        if let Some(token) = current.as_ref()
            && !token.is_stale(Utc::now())
        {
            return Ok(token.value.clone());
        }

        debug!("Access token missing or near expiry, refreshing");
        let token = self.fetch().await?;
        info!("Access token refreshed, valid until {}", token.expires_at);
        let value = token.value.clone();
        *current = Some(token);
        Ok(value)
    }

    /// Drop the cached token so the next [`TokenCache::get_token`] refreshes.
    ///
    /// Only clears the cache if it still holds `rejected`, so a token that a
    /// concurrent caller just refreshed survives.
    pub async fn invalidate(&self, rejected: &str) {
        let mut current = self.current.lock().await;
        if current.as_ref().is_some_and(|token| token.value == rejected) {
            warn!("Access token rejected by WeChat, dropping cached token");
            *current = None;
        }
    }

    /// Snapshot of the cached token, if any.
    pub async fn cached(&self) -> Option<AccessToken> {
        self.current.lock().await.clone()
    }

    async fn fetch(&self) -> Result<AccessToken> {
        let mut url = Url::parse(&format!("{}/cgi-bin/token", self.api_base))
            .map_err(|e| RelayError::Config(format!("invalid WECHAT_API_BASE: {e}")))?;
        url.query_pairs_mut()
            .append_pair("grant_type", "client_credential")
            .append_pair("appid", &self.app_id)
            .append_pair("secret", &self.app_secret);

        let response = self
            .http
            .get_once(url.as_str())
            .await
            .map_err(|e| RelayError::Auth(format!("token request failed: {e}")))?;
        if !response.status.is_success() {
            return Err(RelayError::Auth(format!(
                "token endpoint returned {}",
                response.status
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .map_err(|e| RelayError::Auth(format!("unreadable token response: {e}")))?;
        if let Some(errcode) = parsed.errcode.filter(|code| *code != 0) {
            return Err(RelayError::Auth(format!(
                "token endpoint error {errcode}: {}",
                parsed.errmsg.unwrap_or_default()
            )));
        }

        match (parsed.access_token, parsed.expires_in) {
            (Some(value), Some(expires_in)) if !value.is_empty() => Ok(AccessToken {
                value,
                expires_at: Utc::now() + Duration::seconds(expires_in),
            }),
            _ => Err(RelayError::Auth(
                "token response lacks access_token or expires_in".to_string(),
            )),
        }
    }
}
