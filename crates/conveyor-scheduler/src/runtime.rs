//! The pipeline-runtime collaborator.
//!
//! The scripting runtime that interprets user pipeline programs lives
//! outside the core. All the execution service asks of it is to run a
//! program against a context and report failure; the runtime is expected
//! to write per-task records into the task store at the well-known paths
//! (`/pipeline/<run>/tasks/...`, `/pipeline/<run>/jobs/...`).

use async_trait::async_trait;
use conveyor_core::{Result, WebhookReply, WebhookRequest};
use conveyor_store::PipelineRecord;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Consume-once slot for the webhook reply. The runtime may send at most
/// one reply; the webhook handler drains the paired receiver at most once.
pub struct ReplySlot {
    sender: Mutex<Option<oneshot::Sender<WebhookReply>>>,
}

impl ReplySlot {
    pub fn new() -> (Self, oneshot::Receiver<WebhookReply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Returns false when a reply was already sent or nobody is waiting.
    pub fn send(&self, reply: WebhookReply) -> bool {
        match self.sender.lock().unwrap().take() {
            Some(sender) => sender.send(reply).is_ok(),
            None => false,
        }
    }
}

/// Everything a runtime invocation sees.
pub struct RunContext {
    pub run_id: String,
    pub pipeline_id: String,
    pub driver_dsn: String,
    pub webhook: Option<WebhookRequest>,
    pub reply: Option<std::sync::Arc<ReplySlot>>,
}

#[async_trait]
pub trait PipelineRuntime: Send + Sync {
    /// Run the pipeline program to completion. An `Err` means the program
    /// itself failed and becomes the run's error message.
    async fn run(&self, pipeline: &PipelineRecord, ctx: RunContext) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reply_slot_delivers_once() {
        let (slot, rx) = ReplySlot::new();
        assert!(slot.send(WebhookReply {
            status: 200,
            headers: Default::default(),
            body: "ok".to_string(),
        }));
        assert!(!slot.send(WebhookReply {
            status: 500,
            headers: Default::default(),
            body: String::new(),
        }));

        let reply = rx.await.unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, "ok");
    }

    #[tokio::test]
    async fn reply_slot_reports_dropped_receiver() {
        let (slot, rx) = ReplySlot::new();
        drop(rx);
        assert!(!slot.send(WebhookReply {
            status: 200,
            headers: Default::default(),
            body: String::new(),
        }));
    }
}
