//! Admission-controlled asynchronous pipeline execution.

use conveyor_core::{Error, Result, WebhookRequest};
use conveyor_store::{PipelineRecord, RunRecord, RunStatus, Store};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info};

use crate::runtime::{PipelineRuntime, ReplySlot, RunContext};

pub const DEFAULT_MAX_IN_FLIGHT: usize = 10;

/// Job statuses that force a run to `failed`.
const FAILING_JOB_STATUSES: &[&str] = &["failure", "error", "abort"];

pub struct ExecutionService {
    store: Store,
    runtime: Arc<dyn PipelineRuntime>,
    default_dsn: String,
    max_in_flight: usize,
    in_flight: AtomicUsize,
    // Serializes admission decisions; the counter alone is only a
    // best-effort pre-check.
    admission: Mutex<()>,
    idle: Notify,
}

impl ExecutionService {
    pub fn new(
        store: Store,
        runtime: Arc<dyn PipelineRuntime>,
        max_in_flight: usize,
        default_dsn: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            runtime,
            default_dsn: default_dsn.to_string(),
            max_in_flight,
            in_flight: AtomicUsize::new(0),
            admission: Mutex::new(()),
            idle: Notify::new(),
        })
    }

    /// Best-effort admission check; the authoritative one happens under
    /// the admission mutex during trigger.
    pub fn can_execute(&self) -> bool {
        self.in_flight.load(Ordering::Relaxed) < self.max_in_flight
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Persist a queued run and execute it in the background.
    pub async fn trigger_pipeline(self: &Arc<Self>, pipeline: &PipelineRecord) -> Result<RunRecord> {
        self.trigger(pipeline, None, None).await
    }

    /// Webhook variant: the request payload and reply slot travel through
    /// to the runtime untouched.
    pub async fn trigger_webhook_pipeline(
        self: &Arc<Self>,
        pipeline: &PipelineRecord,
        webhook: WebhookRequest,
        reply: Arc<ReplySlot>,
    ) -> Result<RunRecord> {
        self.trigger(pipeline, Some(webhook), Some(reply)).await
    }

    async fn trigger(
        self: &Arc<Self>,
        pipeline: &PipelineRecord,
        webhook: Option<WebhookRequest>,
        reply: Option<Arc<ReplySlot>>,
    ) -> Result<RunRecord> {
        let _admission = self.admission.lock().await;
        if self.in_flight.load(Ordering::SeqCst) >= self.max_in_flight {
            return Err(Error::Admission(format!(
                "{} of {} runs in flight",
                self.in_flight.load(Ordering::SeqCst),
                self.max_in_flight
            )));
        }

        let run = self.store.create_run(&pipeline.id).await?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        info!(run_id = %run.id, pipeline = %pipeline.name, "run queued");

        let service = self.clone();
        let pipeline = pipeline.clone();
        let run_id = run.id.clone();
        tokio::spawn(async move {
            service.execute(&pipeline, &run_id, webhook, reply).await;
            service.in_flight.fetch_sub(1, Ordering::SeqCst);
            service.idle.notify_waiters();
        });

        Ok(run)
    }

    /// Block until no run is in flight. Used by tests and shutdown.
    pub async fn wait(&self) {
        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            tokio::select! {
                _ = self.idle.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    }

    async fn execute(
        &self,
        pipeline: &PipelineRecord,
        run_id: &str,
        webhook: Option<WebhookRequest>,
        reply: Option<Arc<ReplySlot>>,
    ) {
        if let Err(e) = self.store.mark_run_running(run_id).await {
            error!(run_id = %run_id, error = %e, "stamping run as running failed");
        }

        let driver_dsn = if pipeline.driver_dsn.is_empty() {
            self.default_dsn.clone()
        } else {
            pipeline.driver_dsn.clone()
        };

        let ctx = RunContext {
            run_id: run_id.to_string(),
            pipeline_id: pipeline.id.clone(),
            driver_dsn,
            webhook,
            reply,
        };

        let outcome = match self.runtime.run(pipeline, ctx).await {
            Err(e) => {
                error!(run_id = %run_id, error = %e, "pipeline runtime failed");
                (RunStatus::Failed, Some(e.to_string()))
            }
            Ok(()) => match self.derive_final_status(&pipeline.id, run_id).await {
                Ok(status) => (status, None),
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "deriving final status failed");
                    (RunStatus::Failed, Some(e.to_string()))
                }
            },
        };

        info!(run_id = %run_id, status = outcome.0.as_str(), "run finished");
        if let Err(e) = self
            .store
            .mark_run_finished(run_id, outcome.0, outcome.1.as_deref())
            .await
        {
            error!(run_id = %run_id, error = %e, "stamping final status failed");
        }
    }

    /// A run fails when any job-level record under `/jobs` carries a
    /// failing status. Task records under `/tasks` are deliberately not
    /// consulted: the runtime translates task errors into job outcomes, so
    /// a pipeline that catches a task failure can still succeed.
    async fn derive_final_status(&self, pipeline_id: &str, run_id: &str) -> Result<RunStatus> {
        let tasks = self.store.tasks(pipeline_id);
        let jobs = tasks
            .get_all(&format!("/pipeline/{run_id}/jobs"), &["status"])
            .await
            .map_err(conveyor_core::Error::from)?;

        for job in &jobs {
            let status = job.payload.get("status").and_then(|s| s.as_str());
            if let Some(status) = status {
                if FAILING_JOB_STATUSES.contains(&status) {
                    return Ok(RunStatus::Failed);
                }
            }
        }
        Ok(RunStatus::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conveyor_core::WebhookReply;
    use conveyor_store::NewPipeline;
    use serde_json::json;
    use std::collections::HashMap;

    /// Runtime stub driven by the test: optionally blocks on a barrier,
    /// writes job/task records, fails, or replies to a webhook.
    #[derive(Default)]
    struct StubBehavior {
        hold: Option<Arc<tokio::sync::Semaphore>>,
        job_statuses: Vec<(&'static str, &'static str)>,
        task_statuses: Vec<(&'static str, &'static str)>,
        fail_with: Option<String>,
        reply_with: Option<WebhookReply>,
    }

    struct StubRuntime {
        store: Store,
        behavior: StubBehavior,
    }

    #[async_trait]
    impl PipelineRuntime for StubRuntime {
        async fn run(&self, pipeline: &PipelineRecord, ctx: RunContext) -> Result<()> {
            if let Some(hold) = &self.behavior.hold {
                hold.acquire().await.unwrap().forget();
            }

            let tasks = self.store.tasks(&pipeline.id);
            for (job, status) in &self.behavior.job_statuses {
                tasks
                    .set(
                        &format!("/pipeline/{}/jobs/{job}", ctx.run_id),
                        json!({"status": status}),
                    )
                    .await
                    .unwrap();
            }
            for (task, status) in &self.behavior.task_statuses {
                tasks
                    .set(
                        &format!("/pipeline/{}/tasks/{task}", ctx.run_id),
                        json!({"status": status}),
                    )
                    .await
                    .unwrap();
            }

            if let (Some(reply), Some(slot)) = (&self.behavior.reply_with, &ctx.reply) {
                slot.send(reply.clone());
            }

            match &self.behavior.fail_with {
                Some(message) => Err(Error::Runtime(message.clone())),
                None => Ok(()),
            }
        }
    }

    async fn setup(
        behavior: StubBehavior,
        max_in_flight: usize,
    ) -> (Store, Arc<ExecutionService>, PipelineRecord) {
        let store = Store::in_memory().await.unwrap();
        let pipeline = store
            .create_pipeline(NewPipeline {
                name: "p".to_string(),
                content: "export const pipeline = async () => {};".to_string(),
                driver_dsn: "native://".to_string(),
                webhook_secret: None,
            })
            .await
            .unwrap();
        let runtime = StubRuntime {
            store: store.clone(),
            behavior,
        };
        let service = ExecutionService::new(store.clone(), Arc::new(runtime), max_in_flight, "native");
        (store, service, pipeline)
    }

    #[tokio::test]
    async fn empty_pipeline_ends_in_success() {
        let (store, service, pipeline) = setup(StubBehavior::default(), 10).await;
        let run = service.trigger_pipeline(&pipeline).await.unwrap();
        service.wait().await;
        let run = store.get_run(&run.id).await.unwrap();
        assert_eq!(run.run_status(), RunStatus::Success);
        assert!(run.started_at.is_some());
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn failing_job_status_forces_failed() {
        let behavior = StubBehavior {
            job_statuses: vec![("j1", "failure")],
            ..Default::default()
        };
        let (store, service, pipeline) = setup(behavior, 10).await;
        let run = service.trigger_pipeline(&pipeline).await.unwrap();
        service.wait().await;
        assert_eq!(
            store.get_run(&run.id).await.unwrap().run_status(),
            RunStatus::Failed
        );
    }

    #[tokio::test]
    async fn task_level_failure_alone_is_ignored() {
        let behavior = StubBehavior {
            job_statuses: vec![("j1", "success")],
            task_statuses: vec![("0-build", "failure")],
            ..Default::default()
        };
        let (store, service, pipeline) = setup(behavior, 10).await;
        let run = service.trigger_pipeline(&pipeline).await.unwrap();
        service.wait().await;
        assert_eq!(
            store.get_run(&run.id).await.unwrap().run_status(),
            RunStatus::Success
        );
    }

    #[tokio::test]
    async fn abort_and_error_job_statuses_also_fail() {
        for status in ["error", "abort"] {
            let behavior = StubBehavior {
                job_statuses: vec![("j1", status)],
                ..Default::default()
            };
            let (store, service, pipeline) = setup(behavior, 10).await;
            let run = service.trigger_pipeline(&pipeline).await.unwrap();
            service.wait().await;
            assert_eq!(
                store.get_run(&run.id).await.unwrap().run_status(),
                RunStatus::Failed,
                "status {status} should fail the run"
            );
        }
    }

    #[tokio::test]
    async fn runtime_error_lands_in_the_error_message() {
        let behavior = StubBehavior {
            fail_with: Some("script exploded".to_string()),
            ..Default::default()
        };
        let (store, service, pipeline) = setup(behavior, 10).await;
        let run = service.trigger_pipeline(&pipeline).await.unwrap();
        service.wait().await;
        let run = store.get_run(&run.id).await.unwrap();
        assert_eq!(run.run_status(), RunStatus::Failed);
        assert!(run.error_message.unwrap().contains("script exploded"));
    }

    #[tokio::test]
    async fn admission_limits_in_flight_runs() {
        let hold = Arc::new(tokio::sync::Semaphore::new(0));
        let behavior = StubBehavior {
            hold: Some(hold.clone()),
            ..Default::default()
        };
        let (store, service, pipeline) = setup(behavior, 1).await;
        let first = service.trigger_pipeline(&pipeline).await.unwrap();

        let rejected = service.trigger_pipeline(&pipeline).await;
        assert!(matches!(rejected, Err(Error::Admission(_))));
        assert!(!service.can_execute());

        hold.add_permits(1);
        service.wait().await;
        assert_eq!(service.in_flight(), 0);
        assert_eq!(
            store.get_run(&first.id).await.unwrap().run_status(),
            RunStatus::Success
        );

        // Capacity is back.
        let second = service.trigger_pipeline(&pipeline).await.unwrap();
        hold.add_permits(1);
        service.wait().await;
        assert_eq!(
            store.get_run(&second.id).await.unwrap().run_status(),
            RunStatus::Success
        );
    }

    #[tokio::test]
    async fn webhook_reply_travels_through_the_slot() {
        let behavior = StubBehavior {
            reply_with: Some(WebhookReply {
                status: 201,
                headers: HashMap::new(),
                body: "created".to_string(),
            }),
            ..Default::default()
        };
        let (_store, service, pipeline) = setup(behavior, 10).await;
        let (slot, rx) = ReplySlot::new();
        let webhook = WebhookRequest {
            method: "POST".to_string(),
            url: "/api/webhooks/x".to_string(),
            headers: HashMap::new(),
            body: "{}".to_string(),
            query: HashMap::new(),
        };
        service
            .trigger_webhook_pipeline(&pipeline, webhook, Arc::new(slot))
            .await
            .unwrap();

        let reply = rx.await.unwrap();
        assert_eq!(reply.status, 201);
        assert_eq!(reply.body, "created");
        service.wait().await;
    }
}
