//! Terminal step of the relay: push the reply, or an apology if that fails.

use log::{error, info, warn};

use crate::types::{DeliveryOutcome, MAX_MESSAGE_CHARS, truncate_chars};
use crate::wechat::PushClient;

/// Sent once when the real reply could not be delivered.
pub const FALLBACK_APOLOGY: &str =
    "Sorry, something went wrong while sending my reply. Please try again later.";

#[derive(Debug)]
pub struct Delivery {
    push: PushClient,
}

impl Delivery {
    pub fn new(push: PushClient) -> Self {
        Self { push }
    }

    /// Push `text` to `target_user_id`, truncated to the platform limit.
    ///
    /// On failure exactly one [`FALLBACK_APOLOGY`] is attempted. Errors stop
    /// here; they are only logged and recorded in the outcome.
    pub async fn deliver(&self, target_user_id: &str, text: &str) -> DeliveryOutcome {
        let text = truncate_chars(text, MAX_MESSAGE_CHARS);

        let primary_error = if text.trim().is_empty() {
            "reply is empty".to_string()
        } else {
            match self.push.send_text(target_user_id, text).await {
                Ok(()) => {
                    info!(
                        "Delivered {} character reply to {target_user_id}",
                        text.chars().count()
                    );
                    return DeliveryOutcome::delivered();
                }
                Err(e) => e.to_string(),
            }
        };

        warn!("Reply to {target_user_id} failed ({primary_error}), sending apology");
        match self.push.send_text(target_user_id, FALLBACK_APOLOGY).await {
            Ok(()) => DeliveryOutcome {
                success: true,
                error: Some(primary_error),
                used_fallback: true,
            },
            Err(fallback_error) => {
                error!("Apology to {target_user_id} also failed: {fallback_error}");
                DeliveryOutcome {
                    success: false,
                    error: Some(format!(
                        "{primary_error}; fallback failed: {fallback_error}"
                    )),
                    used_fallback: true,
                }
            }
        }
    }
}
