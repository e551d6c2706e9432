//! Webhook Notifier (spec §4.8). Implements [`crate::tasks::WebhookSink`]
//! so the Task Manager can fire terminal events without knowing anything
//! about subscriptions, signing, or HTTP delivery.
//!
//! Grounded on the teacher's `reqwest::Client::builder().timeout(...)`
//! idiom ([`llm/manager.rs`]'s `LlmManager`) for the HTTP client, and on
//! [`crate::secrets::SecretBox`] for the at-rest secret already carried by
//! the crate.

pub mod store;

use crate::tasks::WebhookSink;
use crate::TaskEvent;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;

pub use store::{NewWebhookInput, WebhookStore, WebhookSubscription};

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    id: uuid::Uuid,
    event: &'a str,
    timestamp: chrono::DateTime<chrono::Utc>,
    data: &'a TaskEvent,
}

pub struct WebhookNotifier {
    store: Arc<WebhookStore>,
    http: reqwest::Client,
}

impl WebhookNotifier {
    /// Returns a plain value rather than pre-wrapping in `Arc`: callers
    /// register it with the Task Manager via
    /// `Arc::new(notifier) as Arc<dyn WebhookSink>`, which is where the
    /// `Arc<WebhookNotifier>` that [`WebhookSink`] is implemented on gets
    /// created.
    pub fn new(store: Arc<WebhookStore>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(DISPATCH_TIMEOUT).build()?;
        Ok(Self { store, http })
    }

    /// Dispatches concurrently to every subscription matching this event;
    /// each delivery is fire-and-forget (single attempt, non-2xx logged).
    async fn dispatch(self: Arc<Self>, event: TaskEvent) {
        let event_name = event.event_name();
        let agent_config_id = None; // task events don't currently carry agent_config_id; every subscription matches by event name alone.

        let subscriptions = match self.store.matching(event_name, agent_config_id).await {
            Ok(subs) => subs,
            Err(err) => {
                tracing::error!(error = %err, "webhook: failed to load subscriptions");
                return;
            }
        };

        if subscriptions.is_empty() {
            return;
        }

        let payload = Arc::new(WebhookPayload {
            id: uuid::Uuid::new_v4(),
            event: event_name,
            timestamp: chrono::Utc::now(),
            data: &event,
        });
        let body = match serde_json::to_vec(&*payload) {
            Ok(body) => Arc::new(body),
            Err(err) => {
                tracing::error!(error = %err, "webhook: failed to serialize payload");
                return;
            }
        };

        let mut deliveries = Vec::with_capacity(subscriptions.len());
        for sub in subscriptions {
            let notifier = self.clone();
            let body = body.clone();
            deliveries.push(tokio::spawn(async move {
                notifier.deliver(sub, body).await;
            }));
        }
        for handle in deliveries {
            let _ = handle.await;
        }
    }

    async fn deliver(&self, sub: WebhookSubscription, body: Arc<Vec<u8>>) {
        let secret = match self.store.signing_secret(sub.id).await {
            Ok(secret) => secret,
            Err(err) => {
                tracing::error!(webhook_id = %sub.id, error = %err, "webhook: failed to load signing secret");
                return;
            }
        };

        let mut request = self
            .http
            .post(&sub.target_url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-ID", sub.id.to_string());

        if let Some(secret) = secret {
            let signature = sign(&secret, &body);
            request = request.header("X-Webhook-Signature", signature);
        }

        let result = request.body((*body).clone()).send().await;
        let outcome = match result {
            Ok(resp) if resp.status().is_success() => None,
            Ok(resp) => Some(format!("webhook target returned {}", resp.status())),
            Err(err) => Some(err.to_string()),
        };

        if let Some(error) = &outcome {
            tracing::warn!(webhook_id = %sub.id, error = %error, "webhook: delivery failed");
        }
        let _ = self.store.record_attempt(sub.id, outcome).await;
    }
}

/// `WebhookSink::notify` is synchronous so the Task Manager never awaits
/// delivery; implementing it on `Arc<WebhookNotifier>` (rather than on
/// `WebhookNotifier` directly) lets `notify` clone the `Arc` and hand the
/// actual async dispatch to a detached task.
impl WebhookSink for Arc<WebhookNotifier> {
    fn notify(&self, event: &TaskEvent) {
        let notifier = self.clone();
        let event = event.clone();
        tokio::spawn(async move { notifier.dispatch(event).await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_deterministic_hex_hmac() {
        let sig1 = sign(b"secret", b"body");
        let sig2 = sign(b"secret", b"body");
        assert_eq!(sig1, sig2);
        assert_ne!(sig1, sign(b"other-secret", b"body"));
    }
}

fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}
