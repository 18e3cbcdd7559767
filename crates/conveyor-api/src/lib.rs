//! HTTP surface for Conveyor CI.
//!
//! REST endpoints for pipelines and runs, the webhook dispatch path, and
//! the server binary's state wiring.

pub mod config;
pub mod error;
pub mod routes;
pub mod runtime;
pub mod state;

pub use config::{Config, Features};
pub use state::AppState;

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use conveyor_core::{Result, WebhookReply};
    use conveyor_driver::AllowedDrivers;
    use conveyor_scheduler::{PipelineRuntime, RunContext};
    use conveyor_store::{PipelineRecord, Store};
    use hmac::{Hmac, Mac};
    use serde_json::{Value, json};
    use sha2::Sha256;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    /// Runtime that optionally replies to webhooks after a delay.
    struct TestRuntime {
        reply: Option<WebhookReply>,
        delay: Duration,
    }

    #[async_trait]
    impl PipelineRuntime for TestRuntime {
        async fn run(&self, _pipeline: &PipelineRecord, ctx: RunContext) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            if let (Some(reply), Some(slot)) = (&self.reply, &ctx.reply) {
                slot.send(reply.clone());
            }
            Ok(())
        }
    }

    async fn app(runtime: TestRuntime, drivers: &str, features: &str) -> (axum::Router, Store) {
        let store = Store::in_memory().await.unwrap();
        let config = Config {
            listen_addr: ([127, 0, 0, 1], 0).into(),
            database_path: ":memory:".into(),
            allowed_drivers: AllowedDrivers::parse(drivers),
            features: Features::parse(features),
            max_in_flight: 10,
            webhook_timeout: Duration::from_millis(250),
        };
        let state = AppState::new(store.clone(), Arc::new(runtime), config);
        (routes::router(state), store)
    }

    fn default_runtime() -> TestRuntime {
        TestRuntime {
            reply: None,
            delay: Duration::ZERO,
        }
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(path: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[tokio::test]
    async fn register_trigger_and_poll_a_pipeline() {
        let (app, store) = app(default_runtime(), "*", "*").await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/pipelines",
                json!({
                    "name": "p1",
                    "content": "export const pipeline = async () => {};",
                    "driver_dsn": "native://",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let pipeline = body_json(response).await;
        let id = pipeline["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(post_json(&format!("/api/pipelines/{id}/trigger"), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let run_id = body_json(response).await["run_id"].as_str().unwrap().to_string();

        // Poll until terminal.
        let mut status = String::new();
        for _ in 0..100 {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .uri(format!("/api/runs/{run_id}"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            status = body_json(response).await["status"].as_str().unwrap().to_string();
            if status == "success" || status == "failed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, "success");

        // No job records were written.
        let rows = store
            .tasks(&id)
            .get_all(&format!("/pipeline/{run_id}/jobs"), &[])
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn registration_rejects_disallowed_drivers_by_name() {
        let (app, _store) = app(default_runtime(), "native,docker", "*").await;

        let response = app
            .oneshot(post_json(
                "/api/pipelines",
                json!({ "name": "p", "content": "c", "driver_dsn": "qemu" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error = body_json(response).await["error"].as_str().unwrap().to_string();
        assert!(error.contains("qemu"));
        assert!(error.contains("not allowed"));
    }

    #[tokio::test]
    async fn webhook_secret_requires_the_feature() {
        let (app, _store) = app(default_runtime(), "*", "").await;
        let response = app
            .oneshot(post_json(
                "/api/pipelines",
                json!({ "name": "p", "content": "c", "webhook_secret": "s" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn drivers_endpoint_lists_the_allowlist() {
        let (app, _store) = app(default_runtime(), "native,docker", "*").await;
        let response = app
            .oneshot(Request::builder().uri("/api/drivers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["drivers"], json!(["native", "docker"]));
    }

    #[tokio::test]
    async fn webhooks_are_forbidden_when_the_feature_is_off() {
        let (app, store) = app(default_runtime(), "*", "").await;
        let pipeline = store
            .create_pipeline(conveyor_store::NewPipeline {
                name: "p".into(),
                content: "c".into(),
                driver_dsn: String::new(),
                webhook_secret: None,
            })
            .await
            .unwrap();

        let response = app
            .oneshot(post_json(&format!("/api/webhooks/{}", pipeline.id), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn webhook_for_unknown_pipeline_is_404() {
        let (app, _store) = app(default_runtime(), "*", "*").await;
        let response = app
            .oneshot(post_json("/api/webhooks/missing", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn webhook_signature_gate() {
        let (app, store) = app(default_runtime(), "*", "*").await;
        let pipeline = store
            .create_pipeline(conveyor_store::NewPipeline {
                name: "p".into(),
                content: "c".into(),
                driver_dsn: String::new(),
                webhook_secret: Some("s".into()),
            })
            .await
            .unwrap();

        let body = br#"{"x":1}"#;

        // Missing signature.
        let response = app
            .clone()
            .oneshot(post_json(&format!("/api/webhooks/{}", pipeline.id), json!({"x":1})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Wrong signature.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/webhooks/{}", pipeline.id))
                    .header("X-Webhook-Signature", "deadbeef")
                    .body(Body::from(&body[..]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Correct signature via header: accepted (202, no reply configured).
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/webhooks/{}", pipeline.id))
                    .header("X-Webhook-Signature", sign("s", body))
                    .body(Body::from(&body[..]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let accepted = body_json(response).await;
        assert!(accepted["run_id"].as_str().is_some());
        assert_eq!(accepted["pipeline_id"].as_str().unwrap(), pipeline.id);

        // Correct signature via query parameter.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!(
                        "/api/webhooks/{}?signature={}",
                        pipeline.id,
                        sign("s", body)
                    ))
                    .body(Body::from(&body[..]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn webhook_reply_wins_the_race_when_fast() {
        let runtime = TestRuntime {
            reply: Some(WebhookReply {
                status: 418,
                headers: [("x-flavor".to_string(), "oolong".to_string())].into(),
                body: "short and stout".to_string(),
            }),
            delay: Duration::ZERO,
        };
        let (app, store) = app(runtime, "*", "*").await;
        let pipeline = store
            .create_pipeline(conveyor_store::NewPipeline {
                name: "p".into(),
                content: "c".into(),
                driver_dsn: String::new(),
                webhook_secret: None,
            })
            .await
            .unwrap();

        let response = app
            .oneshot(post_json(&format!("/api/webhooks/{}", pipeline.id), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(
            response.headers().get("x-flavor").unwrap().to_str().unwrap(),
            "oolong"
        );
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        assert_eq!(&bytes[..], b"short and stout");
    }

    #[tokio::test]
    async fn webhook_times_out_to_202_with_the_run_id() {
        let runtime = TestRuntime {
            reply: Some(WebhookReply {
                status: 200,
                headers: Default::default(),
                body: "too late".to_string(),
            }),
            // Longer than the configured 250ms webhook timeout.
            delay: Duration::from_millis(600),
        };
        let (app, store) = app(runtime, "*", "*").await;
        let pipeline = store
            .create_pipeline(conveyor_store::NewPipeline {
                name: "p".into(),
                content: "c".into(),
                driver_dsn: String::new(),
                webhook_secret: None,
            })
            .await
            .unwrap();

        let response = app
            .oneshot(post_json(&format!("/api/webhooks/{}", pipeline.id), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(body_json(response).await["run_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn deleting_a_pipeline_cascades() {
        let (app, store) = app(default_runtime(), "*", "*").await;
        let pipeline = store
            .create_pipeline(conveyor_store::NewPipeline {
                name: "p".into(),
                content: "c".into(),
                driver_dsn: String::new(),
                webhook_secret: None,
            })
            .await
            .unwrap();
        let run = store.create_run(&pipeline.id).await.unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/pipelines/{}", pipeline.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(store.get_run(&run.id).await.is_err());
    }
}
