//! Safe-mode message encryption (AES-256-CBC with the account's EncodingAESKey).
//!
//! Plaintext layout: 16 random bytes, the message length as a big-endian
//! `u32`, the message XML, then the app id. It is PKCS#7 padded to 32-byte
//! blocks and the IV is the first 16 bytes of the key.

use aes::Aes256;
use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use log::debug;

use crate::error::{RelayError, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const ENCODING_AES_KEY_LEN: usize = 43;
const PAD_BLOCK: usize = 32;
const RANDOM_PREFIX_LEN: usize = 16;

/// EncodingAESKeys are generated without canonical trailing bits.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

#[derive(Clone)]
pub struct WechatCrypto {
    key: [u8; 32],
    app_id: String,
}

impl std::fmt::Debug for WechatCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WechatCrypto")
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}

impl WechatCrypto {
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] if the key is not a 43-character base64 string.
    pub fn new(encoding_aes_key: &str, app_id: &str) -> Result<Self> {
        if encoding_aes_key.len() != ENCODING_AES_KEY_LEN {
            return Err(RelayError::Config(format!(
                "WECHAT_ENCODING_AES_KEY must be {ENCODING_AES_KEY_LEN} characters, got {}",
                encoding_aes_key.len()
            )));
        }

        let decoded = LENIENT_BASE64
            .decode(format!("{encoding_aes_key}="))
            .map_err(|e| RelayError::Config(format!("invalid WECHAT_ENCODING_AES_KEY: {e}")))?;
        let key: [u8; 32] = decoded.try_into().map_err(|_| {
            RelayError::Config("WECHAT_ENCODING_AES_KEY does not decode to 32 bytes".to_string())
        })?;

        Ok(Self {
            key,
            app_id: app_id.to_string(),
        })
    }

    /// Decrypt the base64 `Encrypt` field of a callback into message XML.
    pub fn decrypt(&self, encrypted: &str) -> Result<String> {
        let mut buf = STANDARD.decode(encrypted.trim())?;
        if buf.is_empty() || buf.len() % 16 != 0 {
            return Err(RelayError::Crypto(format!(
                "ciphertext length {} is not a multiple of the block size",
                buf.len()
            )));
        }

        let decryptor = Aes256CbcDec::new_from_slices(&self.key, &self.key[..16])
            .map_err(|e| RelayError::Crypto(e.to_string()))?;
        let plain = decryptor
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|_| RelayError::Crypto("ciphertext is not block aligned".to_string()))?;
        let plain = strip_pkcs7(plain)?;

        let body = plain
            .get(RANDOM_PREFIX_LEN..)
            .filter(|body| body.len() >= 4)
            .ok_or_else(|| RelayError::Crypto("decrypted payload too short".to_string()))?;
        let (len_bytes, rest) = body.split_at(4);
        let msg_len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
            as usize;
        if msg_len > rest.len() {
            return Err(RelayError::Crypto(format!(
                "declared message length {msg_len} exceeds payload"
            )));
        }

        let (message, app_id) = rest.split_at(msg_len);
        if app_id != self.app_id.as_bytes() {
            return Err(RelayError::Crypto(
                "app id in encrypted payload does not match".to_string(),
            ));
        }

        debug!("Decrypted {msg_len} byte message");
        String::from_utf8(message.to_vec())
            .map_err(|e| RelayError::Crypto(format!("decrypted message is not UTF-8: {e}")))
    }

    /// Encrypt reply XML into the base64 form WeChat expects.
    pub fn encrypt(&self, message: &str) -> Result<String> {
        let msg_len = u32::try_from(message.len())
            .map_err(|_| RelayError::Crypto("message too large to encrypt".to_string()))?;
        let prefix: [u8; RANDOM_PREFIX_LEN] = rand::random();

        let mut buf = Vec::with_capacity(
            RANDOM_PREFIX_LEN + 4 + message.len() + self.app_id.len() + PAD_BLOCK,
        );
        buf.extend_from_slice(&prefix);
        buf.extend_from_slice(&msg_len.to_be_bytes());
        buf.extend_from_slice(message.as_bytes());
        buf.extend_from_slice(self.app_id.as_bytes());

        let pad = PAD_BLOCK - buf.len() % PAD_BLOCK;
        let pad_byte = u8::try_from(pad)
            .map_err(|_| RelayError::Crypto(format!("padding length {pad} out of range")))?;
        buf.resize(buf.len() + pad, pad_byte);

        let encryptor = Aes256CbcEnc::new_from_slices(&self.key, &self.key[..16])
            .map_err(|e| RelayError::Crypto(e.to_string()))?;
        let len = buf.len();
        let cipher = encryptor
            .encrypt_padded_mut::<NoPadding>(&mut buf, len)
            .map_err(|_| RelayError::Crypto("padded reply is not block aligned".to_string()))?;

        Ok(STANDARD.encode(cipher))
    }
}

fn strip_pkcs7(data: &[u8]) -> Result<&[u8]> {
    let Some(&last) = data.last() else {
        return Err(RelayError::Crypto("empty plaintext".to_string()));
    };
    let pad = usize::from(last);
    if pad == 0 || pad > PAD_BLOCK || pad > data.len() {
        return Err(RelayError::Crypto(format!("invalid padding length {pad}")));
    }

    let (body, padding) = data.split_at(data.len() - pad);
    if padding.iter().any(|&byte| byte != last) {
        return Err(RelayError::Crypto("inconsistent padding bytes".to_string()));
    }
    Ok(body)
}
