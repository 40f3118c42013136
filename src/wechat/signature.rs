//! Request signatures used by the WeChat server callbacks.

use sha1::{Digest, Sha1};

/// SHA-1 hex digest of the lexicographically sorted, concatenated parts.
#[must_use]
pub fn compute_signature(parts: &[&str]) -> String {
    let mut sorted = parts.to_vec();
    sorted.sort_unstable();

    let mut hasher = Sha1::new();
    for part in sorted {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Checks the `signature` query parameter sent with every callback.
#[must_use]
pub fn verify_signature(token: &str, timestamp: &str, nonce: &str, signature: &str) -> bool {
    constant_time_eq(&compute_signature(&[token, timestamp, nonce]), signature)
}

/// Checks `msg_signature`, which additionally covers the encrypted payload.
#[must_use]
pub fn verify_msg_signature(
    token: &str,
    timestamp: &str,
    nonce: &str,
    encrypted: &str,
    msg_signature: &str,
) -> bool {
    constant_time_eq(
        &compute_signature(&[token, timestamp, nonce, encrypted]),
        msg_signature,
    )
}

fn constant_time_eq(expected: &str, provided: &str) -> bool {
    let (expected, provided) = (expected.as_bytes(), provided.as_bytes());
    expected.len() == provided.len()
        && expected
            .iter()
            .zip(provided)
            .fold(0_u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}
