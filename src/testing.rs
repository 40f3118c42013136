//! Relay wiring against a mock WeChat/completion server, shared by unit tests.

use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use httpmock::Mock;
use serde_json::json;

use crate::completion::CompletionClient;
use crate::config::{CompletionConfig, HttpConfig, WechatConfig};
use crate::http::RetryingClient;
use crate::relay::{Delivery, Dispatcher};
use crate::wechat::{PushClient, TokenCache};

pub const TEST_TOKEN: &str = "mywechat123token";
pub const TEST_APP_ID: &str = "wx1234567890abcdef";
pub const TEST_AES_KEY: &str = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG";

pub struct TestRelay {
    pub tokens: Arc<TokenCache>,
    pub delivery: Delivery,
    pub dispatcher: Dispatcher,
}

impl TestRelay {
    pub fn new(server: &MockServer, api_key: Option<&str>) -> Self {
        Self::with_read_timeout(server, api_key, Duration::from_secs(5))
    }

    pub fn with_read_timeout(
        server: &MockServer,
        api_key: Option<&str>,
        read_timeout: Duration,
    ) -> Self {
        let wechat = wechat_config(server, None);
        let policy = HttpConfig {
            read_timeout,
            backoff_base: Duration::ZERO,
            ..HttpConfig::default()
        };
        let http = Arc::new(RetryingClient::new(policy).expect("http client"));
        let tokens = Arc::new(TokenCache::new(Arc::clone(&http), &wechat));

        let push = || PushClient::new(Arc::clone(&http), Arc::clone(&tokens), &wechat);
        let completion = CompletionClient::new(
            Arc::clone(&http),
            CompletionConfig {
                api_key: api_key.map(str::to_string),
                api_url: server.url("/chat/completions"),
                model: "deepseek-chat".to_string(),
                temperature: 0.7,
                system_prompt: None,
            },
        );

        Self {
            delivery: Delivery::new(push()),
            dispatcher: Dispatcher::new(completion, Delivery::new(push()), 4),
            tokens,
        }
    }
}

pub fn wechat_config(server: &MockServer, encoding_aes_key: Option<&str>) -> WechatConfig {
    WechatConfig {
        token: TEST_TOKEN.to_string(),
        app_id: TEST_APP_ID.to_string(),
        app_secret: "wx-secret".to_string(),
        encoding_aes_key: encoding_aes_key.map(str::to_string),
        api_base: server.base_url(),
    }
}

/// Token endpoint that always issues `TEST-TOKEN` for two hours.
pub fn mock_token(server: &MockServer) -> Mock<'_> {
    server.mock(|when, then| {
        when.method(GET).path("/cgi-bin/token");
        then.status(200)
            .json_body(json!({"access_token": "TEST-TOKEN", "expires_in": 7200}));
    })
}
