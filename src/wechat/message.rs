//! Callback message XML and the plaintext/encrypted codecs.

use chrono::{DateTime, Utc};
use log::debug;
use serde::Deserialize;

use crate::config::WechatConfig;
use crate::error::{RelayError, Result};
use crate::types::{InboundMessage, MessageKind};

use super::crypto::WechatCrypto;
use super::signature::{compute_signature, verify_msg_signature};

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "ToUserName")]
    to_user_name: String,
    #[serde(rename = "FromUserName")]
    from_user_name: String,
    #[serde(rename = "CreateTime", default)]
    create_time: Option<i64>,
    #[serde(rename = "MsgType")]
    msg_type: String,
    #[serde(rename = "Content", default)]
    content: Option<String>,
    #[serde(rename = "MsgId", default)]
    msg_id: Option<String>,
}

/// Outer document of a safe-mode callback.
#[derive(Debug, Deserialize)]
pub struct EncryptedEnvelope {
    #[serde(rename = "ToUserName", default)]
    pub to_user_name: Option<String>,
    #[serde(rename = "Encrypt")]
    pub encrypt: String,
}

/// Parse plaintext callback XML.
///
/// # Errors
///
/// Returns [`RelayError::MessageFormat`] when the XML is malformed or lacks
/// the sender, recipient or message type.
pub fn parse_message(xml: &str) -> Result<InboundMessage> {
    let raw: RawMessage = quick_xml::de::from_str(xml)?;

    let source_user_id = raw.from_user_name.trim().to_string();
    let target_id = raw.to_user_name.trim().to_string();
    if source_user_id.is_empty() || target_id.is_empty() {
        return Err(RelayError::MessageFormat(
            "message has no sender or recipient".to_string(),
        ));
    }
    let kind: MessageKind = raw
        .msg_type
        .trim()
        .parse()
        .map_err(|e| RelayError::MessageFormat(format!("invalid MsgType: {e}")))?;

    let received_at = raw
        .create_time
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);

    Ok(InboundMessage {
        source_user_id,
        target_id,
        content: raw.content.unwrap_or_default(),
        kind,
        received_at,
        msg_id: raw.msg_id,
    })
}

/// Build a passive text reply, answered directly in the webhook response.
#[must_use]
pub fn text_reply_xml(to_user: &str, from_user: &str, content: &str, now: DateTime<Utc>) -> String {
    format!(
        "<xml>\
         <ToUserName>{}</ToUserName>\
         <FromUserName>{}</FromUserName>\
         <CreateTime>{}</CreateTime>\
         <MsgType><![CDATA[text]]></MsgType>\
         <Content>{}</Content>\
         </xml>",
        cdata(to_user),
        cdata(from_user),
        now.timestamp(),
        cdata(content),
    )
}

fn cdata(text: &str) -> String {
    format!("<![CDATA[{}]]>", text.replace("]]>", "]]]]><![CDATA[>"))
}

/// How callback bodies are decoded, fixed once at startup by whether an
/// EncodingAESKey is configured.
#[derive(Debug, Clone)]
pub enum MessageCodec {
    Plaintext,
    Encrypted { crypto: WechatCrypto, token: String },
}

impl MessageCodec {
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] if the configured EncodingAESKey is invalid.
    pub fn from_config(config: &WechatConfig) -> Result<Self> {
        match &config.encoding_aes_key {
            Some(key) => Ok(MessageCodec::Encrypted {
                crypto: WechatCrypto::new(key, &config.app_id)?,
                token: config.token.clone(),
            }),
            None => Ok(MessageCodec::Plaintext),
        }
    }

    pub fn encryption_enabled(&self) -> bool {
        matches!(self, MessageCodec::Encrypted { .. })
    }

    /// Decode a callback body into an [`InboundMessage`].
    ///
    /// # Errors
    ///
    /// In encrypted mode, a missing or wrong `msg_signature` yields
    /// [`RelayError::Signature`]; undecryptable or malformed payloads yield
    /// [`RelayError::Crypto`] or [`RelayError::MessageFormat`].
    pub fn decode(
        &self,
        body: &str,
        timestamp: &str,
        nonce: &str,
        msg_signature: Option<&str>,
    ) -> Result<InboundMessage> {
        match self {
            MessageCodec::Plaintext => parse_message(body),
            MessageCodec::Encrypted { crypto, token } => {
                let envelope: EncryptedEnvelope = quick_xml::de::from_str(body)?;
                let msg_signature = msg_signature.ok_or(RelayError::Signature)?;
                if !verify_msg_signature(token, timestamp, nonce, &envelope.encrypt, msg_signature)
                {
                    return Err(RelayError::Signature);
                }
                let xml = crypto.decrypt(&envelope.encrypt)?;
                debug!(
                    "Decrypted callback for {}",
                    envelope.to_user_name.as_deref().unwrap_or("unknown account")
                );
                parse_message(&xml)
            }
        }
    }

    /// Wrap reply XML for the response body, encrypting it in safe mode.
    pub fn encode_reply(&self, reply_xml: String, timestamp: &str, nonce: &str) -> Result<String> {
        match self {
            MessageCodec::Plaintext => Ok(reply_xml),
            MessageCodec::Encrypted { crypto, token } => {
                let encrypted = crypto.encrypt(&reply_xml)?;
                let signature = compute_signature(&[token, timestamp, nonce, &encrypted]);
                Ok(format!(
                    "<xml>\
                     <Encrypt>{}</Encrypt>\
                     <MsgSignature>{}</MsgSignature>\
                     <TimeStamp>{timestamp}</TimeStamp>\
                     <Nonce>{}</Nonce>\
                     </xml>",
                    cdata(&encrypted),
                    cdata(&signature),
                    cdata(nonce),
                ))
            }
        }
    }
}
