//! Notification sinks.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::Notifier;
use crate::{config::ReportingConfig, error::ToolError};

/// Discards every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn send(&self, message: &str) {
        debug!(text = %message, "notification dropped (no sink configured)");
    }
}

#[derive(Debug, Serialize)]
struct Payload<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<&'a str>,
}

/// Posts `{text, username, channel}` to an incoming-webhook URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::blocking::Client,
    url: String,
    username: Option<String>,
    channel: Option<String>,
}

impl WebhookNotifier {
    pub fn new(
        url: impl Into<String>,
        username: Option<String>,
        channel: Option<String>,
    ) -> Result<Self, ToolError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| ToolError::Delivery(err.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            username,
            channel,
        })
    }

    /// Build the configured sink, falling back to [`NullNotifier`] when no
    /// webhook is set or the client cannot be built.
    pub fn from_config(config: &ReportingConfig) -> Arc<dyn Notifier> {
        let Some(url) = config.webhook.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Arc::new(NullNotifier);
        };
        match Self::new(url, config.name.clone(), config.channel.clone()) {
            Ok(notifier) => Arc::new(notifier),
            Err(err) => {
                warn!(error = %err, "webhook notifier unavailable; notifications disabled");
                Arc::new(NullNotifier)
            }
        }
    }

    fn post(&self, message: &str) -> Result<(), ToolError> {
        let payload = Payload {
            text: message,
            username: self.username.as_deref(),
            channel: self.channel.as_deref(),
        };
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .map_err(|err| ToolError::Delivery(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ToolError::Delivery(format!(
                "webhook answered {}",
                response.status()
            )));
        }
        Ok(())
    }
}

impl Notifier for WebhookNotifier {
    fn send(&self, message: &str) {
        info!(text = %message, "notifying");
        if let Err(err) = self.post(message) {
            warn!(error = %err, "notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_omits_unset_fields() {
        let payload = Payload {
            text: "erase failed",
            username: None,
            channel: Some("#carts"),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json, serde_json::json!({"text": "erase failed", "channel": "#carts"}));
    }

    #[test]
    fn missing_webhook_yields_null_sink() {
        // Must not panic or block.
        let sink = WebhookNotifier::from_config(&ReportingConfig::default());
        sink.send("hello");
    }
}
