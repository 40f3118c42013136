//! Webhook endpoint for WeChat server callbacks.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use chrono::Utc;
use log::{debug, info, warn};
use serde::Deserialize;

use crate::completion::CompletionClient;
use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::http::RetryingClient;
use crate::relay::{Delivery, Dispatcher};
use crate::types::{ErrorKind, InboundMessage};
use crate::wechat::message::text_reply_xml;
use crate::wechat::signature::verify_signature;
use crate::wechat::{MessageCodec, PushClient, TokenCache};

/// WeChat's documented "no passive reply" answer; it stops callback retries.
pub const ACK_BODY: &str = "success";

/// Query parameters WeChat appends to every callback.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    pub signature: Option<String>,
    pub timestamp: Option<String>,
    pub nonce: Option<String>,
    pub echostr: Option<String>,
    pub msg_signature: Option<String>,
    pub encrypt_type: Option<String>,
}

impl CallbackQuery {
    fn is_signed_by(&self, token: &str) -> bool {
        let Some(signature) = self.signature.as_deref() else {
            return false;
        };
        verify_signature(
            token,
            self.timestamp.as_deref().unwrap_or_default(),
            self.nonce.as_deref().unwrap_or_default(),
            signature,
        )
    }
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    token: String,
    codec: MessageCodec,
    dispatcher: Dispatcher,
}

impl AppState {
    pub fn new(token: String, codec: MessageCodec, dispatcher: Dispatcher) -> Self {
        Self {
            inner: Arc::new(Inner {
                token,
                codec,
                dispatcher,
            }),
        }
    }

    /// Wire the whole relay from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] if the HTTP client cannot be built or
    /// the EncodingAESKey is invalid.
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = Arc::new(RetryingClient::new(config.http)?);
        let tokens = Arc::new(TokenCache::new(Arc::clone(&http), &config.wechat));
        let push = PushClient::new(Arc::clone(&http), tokens, &config.wechat);
        let completion = CompletionClient::new(http, config.completion.clone());
        let dispatcher = Dispatcher::new(completion, Delivery::new(push), config.max_in_flight);
        let codec = MessageCodec::from_config(&config.wechat)?;

        info!(
            "Message decoding: {}",
            if codec.encryption_enabled() { "encrypted (safe mode)" } else { "plaintext" }
        );
        Ok(Self::new(config.wechat.token.clone(), codec, dispatcher))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(verify).head(health).post(receive))
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// Server verification handshake; a bare GET doubles as a health check.
async fn verify(State(state): State<AppState>, Query(query): Query<CallbackQuery>) -> Response {
    if query.signature.is_none() && query.echostr.is_none() {
        return StatusCode::OK.into_response();
    }

    if query.is_signed_by(&state.inner.token) {
        info!("Webhook verification succeeded");
        (StatusCode::OK, query.echostr.unwrap_or_default()).into_response()
    } else {
        warn!("Webhook verification failed: {}", RelayError::Signature);
        (StatusCode::FORBIDDEN, ErrorKind::Signature.user_message()).into_response()
    }
}

/// Message callback. Answers immediately; the reply arrives later via the push API.
async fn receive(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
    body: String,
) -> Response {
    let inner = &state.inner;
    if !query.is_signed_by(&inner.token) {
        warn!("Rejecting callback with invalid signature");
        return (StatusCode::FORBIDDEN, ErrorKind::Signature.user_message()).into_response();
    }

    let timestamp = query.timestamp.as_deref().unwrap_or_default();
    let nonce = query.nonce.as_deref().unwrap_or_default();
    debug!(
        "Callback body of {} bytes (encrypt_type: {})",
        body.len(),
        query.encrypt_type.as_deref().unwrap_or("raw")
    );

    let message = match inner
        .codec
        .decode(&body, timestamp, nonce, query.msg_signature.as_deref())
    {
        Ok(message) => message,
        Err(RelayError::Signature) => {
            warn!("Rejecting callback with invalid msg_signature");
            return (StatusCode::FORBIDDEN, ErrorKind::Signature.user_message()).into_response();
        }
        Err(e) => {
            warn!("Ignoring unreadable callback: {e}");
            return ack();
        }
    };

    if message.text().is_some() && !inner.dispatcher.completion_configured() {
        return configuration_reply(inner, &message, timestamp, nonce);
    }

    // Detached: the relay task is never joined.
    drop(inner.dispatcher.dispatch(message));
    ack()
}

fn ack() -> Response {
    (StatusCode::OK, ACK_BODY).into_response()
}

/// Answer in-band when replies can never succeed, so the user learns why.
fn configuration_reply(
    inner: &Inner,
    message: &InboundMessage,
    timestamp: &str,
    nonce: &str,
) -> Response {
    let error = RelayError::Config("DEEPSEEK_API_KEY is not set".to_string());
    warn!(
        "Replying to {} with configuration error: {error}",
        message.source_user_id
    );

    let reply = text_reply_xml(
        &message.source_user_id,
        &message.target_id,
        &error.user_message(),
        Utc::now(),
    );
    match inner.codec.encode_reply(reply, timestamp, nonce) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/xml")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!("Could not encode configuration reply: {e}");
            ack()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request};
    use httpmock::prelude::*;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::testing::{TEST_AES_KEY, TEST_TOKEN, TestRelay, mock_token, wechat_config};
    use crate::wechat::signature::compute_signature;

    const TIMESTAMP: &str = "1420000000";
    const NONCE: &str = "test";

    fn text_xml(user: &str, content: &str) -> String {
        format!(
            "<xml>\
             <ToUserName><![CDATA[gh_account]]></ToUserName>\
             <FromUserName><![CDATA[{user}]]></FromUserName>\
             <CreateTime>1420000000</CreateTime>\
             <MsgType><![CDATA[text]]></MsgType>\
             <Content><![CDATA[{content}]]></Content>\
             <MsgId>1</MsgId>\
             </xml>"
        )
    }

    fn signed_query() -> String {
        let signature = compute_signature(&[TEST_TOKEN, TIMESTAMP, NONCE]);
        format!("/?signature={signature}&timestamp={TIMESTAMP}&nonce={NONCE}")
    }

    fn plaintext_app(relay: TestRelay) -> Router {
        router(AppState::new(
            TEST_TOKEN.to_string(),
            MessageCodec::Plaintext,
            relay.dispatcher,
        ))
    }

    async fn send(app: Router, method: Method, uri: &str, body: String) -> (StatusCode, String) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::from(body))
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, String::from_utf8(bytes.to_vec()).expect("utf8"))
    }

    async fn wait_for_calls(mock: &httpmock::Mock<'_>, expected: usize) {
        for _ in 0..100 {
            if mock.calls() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn verification_echoes_echostr_for_valid_signature() {
        let server = MockServer::start();
        let app = plaintext_app(TestRelay::new(&server, Some("sk-test")));
        let uri = format!("{}&echostr=hello-wechat", signed_query());

        let (status, body) = send(app, Method::GET, &uri, String::new()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "hello-wechat");
    }

    #[tokio::test]
    async fn verification_rejects_bad_signature() {
        let server = MockServer::start();
        let app = plaintext_app(TestRelay::new(&server, Some("sk-test")));
        let uri = format!(
            "/?signature=0000&timestamp={TIMESTAMP}&nonce={NONCE}&echostr=hello-wechat"
        );

        let (status, body) = send(app, Method::GET, &uri, String::new()).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, "Invalid signature");
    }

    #[tokio::test]
    async fn health_checks_return_empty_ok_and_touch_nothing() {
        let server = MockServer::start();
        let token = mock_token(&server);
        let relay = TestRelay::new(&server, Some("sk-test"));
        let tokens = Arc::clone(&relay.tokens);
        let app = plaintext_app(relay);

        for method in [Method::HEAD, Method::GET, Method::HEAD] {
            let (status, body) = send(app.clone(), method, "/", String::new()).await;
            assert_eq!(status, StatusCode::OK);
            assert!(body.is_empty());
        }

        assert!(tokens.cached().await.is_none());
        token.assert_calls(0);
    }

    #[tokio::test]
    async fn text_message_is_acknowledged_and_relayed() {
        let server = MockServer::start();
        mock_token(&server);
        let completion = server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200)
                .delay(Duration::from_millis(200))
                .json_body(json!({"choices": [{"message": {"content": "hi there"}}]}));
        });
        let push = server.mock(|when, then| {
            when.method(POST)
                .path("/cgi-bin/message/custom/send")
                .body_includes(r#""touser":"o_user""#)
                .body_includes(r#""text":{"content":"hi there"}"#);
            then.status(200).json_body(json!({"errcode": 0, "errmsg": "ok"}));
        });

        let app = plaintext_app(TestRelay::new(&server, Some("sk-test")));
        let (status, body) =
            send(app, Method::POST, &signed_query(), text_xml("o_user", "hello")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, ACK_BODY);
        // The acknowledgement does not wait for the slow upstream.
        assert_eq!(push.calls(), 0);

        wait_for_calls(&push, 1).await;
        completion.assert_calls(1);
        push.assert_calls(1);
    }

    #[tokio::test]
    async fn unsigned_post_is_rejected() {
        let server = MockServer::start();
        let completion = server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200);
        });

        let app = plaintext_app(TestRelay::new(&server, Some("sk-test")));
        let (status, _) = send(app, Method::POST, "/", text_xml("o_user", "hello")).await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        completion.assert_calls(0);
    }

    #[tokio::test]
    async fn malformed_and_non_text_callbacks_are_acknowledged_and_ignored() {
        let server = MockServer::start();
        let completion = server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200);
        });
        let app = plaintext_app(TestRelay::new(&server, Some("sk-test")));

        let image = "<xml>\
            <ToUserName><![CDATA[gh_account]]></ToUserName>\
            <FromUserName><![CDATA[o_user]]></FromUserName>\
            <CreateTime>1420000000</CreateTime>\
            <MsgType><![CDATA[image]]></MsgType>\
            <PicUrl><![CDATA[http://example.com/a.png]]></PicUrl>\
            </xml>";
        for body in [image.to_string(), "<xml><broken".to_string(), String::new()] {
            let (status, ack_body) = send(app.clone(), Method::POST, &signed_query(), body).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(ack_body, ACK_BODY);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        completion.assert_calls(0);
    }

    #[tokio::test]
    async fn missing_api_key_short_circuits_with_passive_reply() {
        let server = MockServer::start();
        let token = mock_token(&server);
        let app = plaintext_app(TestRelay::new(&server, None));

        let (status, body) =
            send(app, Method::POST, &signed_query(), text_xml("o_user", "hello")).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<ToUserName><![CDATA[o_user]]></ToUserName>"));
        assert!(body.contains(ErrorKind::Config.user_message()));
        token.assert_calls(0);
    }

    #[tokio::test]
    async fn encrypted_callbacks_are_decrypted_and_relayed() {
        let server = MockServer::start();
        mock_token(&server);
        server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200)
                .json_body(json!({"choices": [{"message": {"content": "secret hi"}}]}));
        });
        let push = server.mock(|when, then| {
            when.method(POST)
                .path("/cgi-bin/message/custom/send")
                .body_includes("secret hi");
            then.status(200).json_body(json!({"errcode": 0, "errmsg": "ok"}));
        });

        let codec = MessageCodec::from_config(&wechat_config(&server, Some(TEST_AES_KEY)))
            .expect("codec");
        let MessageCodec::Encrypted { crypto, .. } = &codec else {
            panic!("expected encrypted codec");
        };
        let encrypted = crypto.encrypt(&text_xml("o_user", "hello")).expect("encrypt");
        let msg_signature = compute_signature(&[TEST_TOKEN, TIMESTAMP, NONCE, &encrypted]);
        let body = format!(
            "<xml><ToUserName><![CDATA[gh_account]]></ToUserName><Encrypt><![CDATA[{encrypted}]]></Encrypt></xml>"
        );

        let relay = TestRelay::new(&server, Some("sk-test"));
        let app = router(AppState::new(TEST_TOKEN.to_string(), codec, relay.dispatcher));

        let bad_uri = format!("{}&encrypt_type=aes&msg_signature=deadbeef", signed_query());
        let (status, _) = send(app.clone(), Method::POST, &bad_uri, body.clone()).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let uri = format!("{}&encrypt_type=aes&msg_signature={msg_signature}", signed_query());
        let (status, ack_body) = send(app, Method::POST, &uri, body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack_body, ACK_BODY);

        wait_for_calls(&push, 1).await;
        push.assert_calls(1);
    }
}
