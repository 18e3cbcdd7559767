//! Webhook dispatch.
//!
//! Any HTTP method on `/api/webhooks/{id}` triggers the pipeline and races
//! its optional reply against the webhook timeout.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{OriginalUri, Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use conveyor_core::WebhookRequest;
use conveyor_scheduler::ReplySlot;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/{id}", any(dispatch))
}

async fn dispatch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if !state.config.features.allows("webhooks") {
        return Err(ApiError::Forbidden("webhooks are not enabled".to_string()));
    }

    let pipeline = state.store.get_pipeline(&id).await?;

    let query = first_value_query(&uri);
    if let Some(secret) = pipeline.webhook_secret.as_deref().filter(|s| !s.is_empty()) {
        let signature = headers
            .get("X-Webhook-Signature")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| query.get("signature").cloned());
        if !verify_signature(secret, &body, signature.as_deref()) {
            warn!(pipeline = %pipeline.id, "webhook signature missing or invalid");
            return Err(ApiError::Unauthorized("invalid webhook signature".to_string()));
        }
    }

    if !state.executions.can_execute() {
        return Err(ApiError::TooManyRequests(
            "too many pipelines in flight".to_string(),
        ));
    }

    let webhook = WebhookRequest {
        method: method.to_string(),
        url: uri.to_string(),
        headers: first_value_headers(&headers),
        body: String::from_utf8_lossy(&body).into_owned(),
        query,
    };

    let (slot, reply_rx) = ReplySlot::new();
    let run = state
        .executions
        .trigger_webhook_pipeline(&pipeline, webhook, Arc::new(slot))
        .await
        .map_err(ApiError::from)?;

    info!(run_id = %run.id, pipeline = %pipeline.name, "webhook accepted");

    match tokio::time::timeout(state.config.webhook_timeout, reply_rx).await {
        Ok(Ok(reply)) => {
            // The pipeline answered in time; echo its reply verbatim.
            let status = if reply.body.is_empty() {
                StatusCode::NO_CONTENT
            } else {
                StatusCode::from_u16(reply.status).unwrap_or(StatusCode::OK)
            };
            let mut response = (status, reply.body).into_response();
            for (key, value) in &reply.headers {
                if let (Ok(name), Ok(value)) = (
                    key.parse::<HeaderName>(),
                    HeaderValue::from_str(value),
                ) {
                    response.headers_mut().insert(name, value);
                }
            }
            Ok(response)
        }
        // Timed out, or the runtime finished without ever sending.
        _ => {
            let run = state.store.get_run(&run.id).await?;
            Ok((
                StatusCode::ACCEPTED,
                axum::Json(json!({
                    "run_id": run.id,
                    "pipeline_id": run.pipeline_id,
                    "status": run.status,
                    "message": "pipeline did not reply before the timeout; execution continues",
                })),
            )
                .into_response())
        }
    }
}

/// First value per key, lower-cased names.
fn first_value_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }
    out
}

/// First value per key from the query string.
fn first_value_query(uri: &Uri) -> HashMap<String, String> {
    let mut out = HashMap::new();
    if let Some(query) = uri.query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            out.entry(key.into_owned()).or_insert_with(|| value.into_owned());
        }
    }
    out
}

/// Constant-time check of `hex(hmac-sha256(secret, body))`.
fn verify_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };

    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can take any size key");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn valid_signature_is_accepted() {
        let body = br#"{"x":1}"#;
        let signature = sign("s", body);
        assert!(verify_signature("s", body, Some(&signature)));
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let body = br#"{"x":1}"#;
        let signature = sign("other-secret", body);
        assert!(!verify_signature("s", body, Some(&signature)));
        assert!(!verify_signature("s", body, Some("deadbeef")));
        assert!(!verify_signature("s", body, Some("not hex")));
    }

    #[test]
    fn missing_signature_is_rejected() {
        assert!(!verify_signature("s", b"body", None));
    }

    #[test]
    fn query_and_headers_keep_first_value() {
        let uri: Uri = "/api/webhooks/x?a=1&a=2&b=3".parse().unwrap();
        let query = first_value_query(&uri);
        assert_eq!(query.get("a").map(String::as_str), Some("1"));
        assert_eq!(query.get("b").map(String::as_str), Some("3"));

        let mut headers = HeaderMap::new();
        headers.append("X-Test", HeaderValue::from_static("first"));
        headers.append("X-Test", HeaderValue::from_static("second"));
        let flat = first_value_headers(&headers);
        assert_eq!(flat.get("x-test").map(String::as_str), Some("first"));
    }
}
