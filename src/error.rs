use reqwest::StatusCode;
use thiserror::Error;

use crate::types::ErrorKind;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Access token error: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Upstream API error ({status}): {message}")]
    Upstream { status: StatusCode, message: String },

    #[error("Unexpected response shape: {0}")]
    ResponseShape(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Signature verification failed")]
    Signature,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Message crypto error: {0}")]
    Crypto(String),

    #[error("Malformed message: {0}")]
    MessageFormat(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<quick_xml::DeError> for RelayError {
    fn from(err: quick_xml::DeError) -> Self {
        RelayError::MessageFormat(err.to_string())
    }
}

impl From<base64::DecodeError> for RelayError {
    fn from(err: base64::DecodeError) -> Self {
        RelayError::Crypto(format!("invalid base64: {err}"))
    }
}

impl RelayError {
    /// Classifies a transport failure from reqwest.
    ///
    /// Read timeouts are reported separately from connection problems because
    /// only the latter are safe to retry.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() && !err.is_connect() {
            RelayError::Timeout(err.to_string())
        } else {
            RelayError::Network(err.to_string())
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Auth(_) => ErrorKind::Auth,
            RelayError::Network(_) | RelayError::Io(_) => ErrorKind::Network,
            RelayError::Upstream { .. } => ErrorKind::Upstream,
            RelayError::ResponseShape(_) => ErrorKind::ResponseShape,
            RelayError::Timeout(_) => ErrorKind::Timeout,
            RelayError::Signature => ErrorKind::Signature,
            RelayError::Config(_) => ErrorKind::Config,
            RelayError::Crypto(_) => ErrorKind::Crypto,
            RelayError::MessageFormat(_) => ErrorKind::MessageFormat,
        }
    }

    /// Returns a user-friendly error message suitable for sending back to the chat user
    pub fn user_message(&self) -> String {
        match self {
            RelayError::Upstream { status, .. } => match *status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    "Sorry, the AI service rejected my credentials. Please contact the administrator.".to_string()
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    "Sorry, the AI service is busy right now. Please try again in a few moments.".to_string()
                }
                status if status.is_server_error() => {
                    "Sorry, the AI service is experiencing issues right now. Please try again later.".to_string()
                }
                _ => {
                    "Sorry, there was an issue with my request to the AI service. Please try again later.".to_string()
                }
            },
            other => other.kind().user_message().to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_messages_depend_on_status() {
        let busy = RelayError::Upstream {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: String::new(),
        };
        let broken = RelayError::Upstream {
            status: StatusCode::BAD_GATEWAY,
            message: String::new(),
        };
        assert!(busy.user_message().contains("busy"));
        assert!(broken.user_message().contains("experiencing issues"));
        assert_eq!(busy.kind(), ErrorKind::Upstream);
    }

    #[test]
    fn timeout_message_asks_to_retry() {
        let err = RelayError::Timeout("read".to_string());
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.user_message(), ErrorKind::Timeout.user_message());
    }
}
