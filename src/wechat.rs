//! WeChat Official Account plumbing: signatures, message codec, access
//! tokens and the customer-service push API.

pub mod crypto;
pub mod message;
pub mod push;
pub mod signature;
pub mod token;

pub use crypto::WechatCrypto;
pub use message::{EncryptedEnvelope, MessageCodec};
pub use push::PushClient;
pub use token::{AccessToken, TokenCache};
