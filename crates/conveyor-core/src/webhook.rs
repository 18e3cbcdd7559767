//! Webhook request and reply payloads exchanged with the pipeline runtime.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The HTTP request a webhook-triggered pipeline observes.
///
/// Headers and query parameters keep the first value per key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub query: HashMap<String, String>,
}

/// The HTTP reply a pipeline may supply for its triggering webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookReply {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}
