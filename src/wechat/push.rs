//! Customer-service message API, used to reply after the callback returned.

use std::sync::Arc;

use log::debug;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::WechatConfig;
use crate::error::{RelayError, Result};
use crate::http::RetryingClient;

use super::token::TokenCache;

/// errcodes meaning the access token was rejected (invalid, not latest, expired).
const TOKEN_REJECTED_CODES: [i64; 3] = [40001, 40014, 42001];

#[derive(Debug, Serialize)]
struct TextContent<'a> {
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct CustomTextMessage<'a> {
    touser: &'a str,
    msgtype: &'static str,
    text: TextContent<'a>,
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

#[derive(Debug)]
pub struct PushClient {
    http: Arc<RetryingClient>,
    tokens: Arc<TokenCache>,
    api_base: String,
}

impl PushClient {
    pub fn new(http: Arc<RetryingClient>, tokens: Arc<TokenCache>, config: &WechatConfig) -> Self {
        Self {
            http,
            tokens,
            api_base: config.api_base.trim_end_matches('/').to_string(),
        }
    }

    /// Send a text message to `user_id` in a single request; a failed push is
    /// never repeated here. The caller is responsible for length limits.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Auth`] if no token can be obtained or WeChat rejects
    /// it, [`RelayError::Upstream`] for other non-zero errcodes or non-2xx
    /// statuses, and transport errors from the HTTP client.
    pub async fn send_text(&self, user_id: &str, content: &str) -> Result<()> {
        let token = self.tokens.get_token().await?;

        let mut url = Url::parse(&format!("{}/cgi-bin/message/custom/send", self.api_base))
            .map_err(|e| RelayError::Config(format!("invalid WECHAT_API_BASE: {e}")))?;
        url.query_pairs_mut().append_pair("access_token", &token);

        let message = CustomTextMessage {
            touser: user_id,
            msgtype: "text",
            text: TextContent { content },
        };
        let response = self
            .http
            .post_once(url.as_str(), HeaderMap::new(), &message)
            .await?;
        if !response.status.is_success() {
            return Err(RelayError::Upstream {
                status: response.status,
                message: response.body,
            });
        }

        let status: ApiStatus = response.json()?;
        match status.errcode {
            0 => {
                debug!("Pushed {} characters to {user_id}", content.chars().count());
                Ok(())
            }
            code if TOKEN_REJECTED_CODES.contains(&code) => {
                self.tokens.invalidate(&token).await;
                Err(RelayError::Auth(format!(
                    "push rejected access token ({code}): {}",
                    status.errmsg
                )))
            }
            code => Err(RelayError::Upstream {
                status: response.status,
                message: format!("errcode {code}: {}", status.errmsg),
            }),
        }
    }
}
