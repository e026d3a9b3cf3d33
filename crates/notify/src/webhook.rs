//! HTTP webhook transport.
//!
//! Delivers events as JSON payloads to per-subscriber webhook URLs.
//! Failures here are expected operational noise: the bus logs them and
//! reconciliation corrects the subscriber's view.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::NotifyError;
use crate::events::Event;
use crate::transport::Transport;

/// Pushes events as JSON over HTTP POST to registered endpoints.
pub struct WebhookTransport {
    /// Subscriber id → endpoint URL.
    endpoints: RwLock<HashMap<String, String>>,
    /// Shared HTTP client (connection pooling).
    client: reqwest::Client,
}

impl WebhookTransport {
    /// Create a transport with the given per-request timeout.
    pub fn new(request_timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            endpoints: RwLock::new(HashMap::new()),
            client,
        })
    }

    /// Register (or replace) the endpoint for a subscriber.
    pub fn register_endpoint(&self, subscriber_id: &str, url: &str) {
        self.endpoints
            .write()
            .unwrap()
            .insert(subscriber_id.to_string(), url.to_string());
    }

    pub fn deregister_endpoint(&self, subscriber_id: &str) -> bool {
        self.endpoints.write().unwrap().remove(subscriber_id).is_some()
    }
}

#[async_trait]
impl Transport for WebhookTransport {
    async fn send(&self, subscriber_id: &str, event: &Event) -> Result<(), NotifyError> {
        let url = {
            let endpoints = self.endpoints.read().unwrap();
            endpoints
                .get(subscriber_id)
                .cloned()
                .ok_or_else(|| NotifyError::UnknownSubscriber(subscriber_id.to_string()))?
        };

        let response = self.client.post(&url).json(event).send().await?;
        response.error_for_status()?;
        debug!(subscriber_id, url = %url, "event delivered");
        Ok(())
    }
}
