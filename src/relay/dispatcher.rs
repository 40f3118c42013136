//! Hands inbound messages to background tasks so the webhook can answer at once.

use std::sync::Arc;

use log::{debug, info, warn};
use strum::Display;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::completion::CompletionClient;
use crate::types::{DeliveryOutcome, InboundMessage};

use super::delivery::Delivery;

/// Lifecycle of one inbound message, logged as it advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayState {
    Received,
    Acknowledged,
    Processing,
    Delivered,
    DeliveryFailed,
}

#[derive(Debug)]
pub struct Dispatcher {
    completion: Arc<CompletionClient>,
    delivery: Arc<Delivery>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    /// `max_in_flight` bounds how many relays talk to the upstream API at once.
    pub fn new(completion: CompletionClient, delivery: Delivery, max_in_flight: usize) -> Self {
        Self {
            completion: Arc::new(completion),
            delivery: Arc::new(delivery),
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    pub fn completion_configured(&self) -> bool {
        self.completion.is_configured()
    }

    /// Schedule the relay of `message` and return without waiting for it.
    ///
    /// Messages without text are dropped and no task is spawned. The webhook
    /// path never joins the returned handle: delivery is at-most-once and a
    /// task still running at shutdown is abandoned.
    pub fn dispatch(&self, message: InboundMessage) -> Option<JoinHandle<DeliveryOutcome>> {
        log_state(&message, RelayState::Received);
        if message.text().is_none() {
            info!(
                "Ignoring {} message from {}",
                message.kind, message.source_user_id
            );
            return None;
        }

        // The webhook answers as soon as this returns.
        log_state(&message, RelayState::Acknowledged);

        let completion = Arc::clone(&self.completion);
        let delivery = Arc::clone(&self.delivery);
        let permits = Arc::clone(&self.permits);
        let handle = tokio::spawn(async move {
            // Held until delivery finishes; a closed semaphore just means unbounded.
            let _permit = permits.acquire_owned().await.ok();
            relay(&completion, &delivery, &message).await
        });

        debug!("Spawned relay task");
        Some(handle)
    }
}

async fn relay(
    completion: &CompletionClient,
    delivery: &Delivery,
    message: &InboundMessage,
) -> DeliveryOutcome {
    log_state(message, RelayState::Processing);
    let prompt = message.text().unwrap_or_default();
    let result = completion.complete(prompt).await;
    if !result.is_success() {
        warn!(
            "Completion for {} failed, delivering fallback text",
            message.source_user_id
        );
    }

    let outcome = delivery
        .deliver(&message.source_user_id, result.display_text())
        .await;
    if outcome.success {
        log_state(message, RelayState::Delivered);
    } else {
        log_state(message, RelayState::DeliveryFailed);
    }
    outcome
}

fn log_state(message: &InboundMessage, state: RelayState) {
    info!(
        "[{}] message {} from {}: {state}",
        message.target_id,
        message.msg_id.as_deref().unwrap_or("-"),
        message.source_user_id
    );
}
