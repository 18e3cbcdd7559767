//! Host-side client for the guest agent.

use conveyor_core::{Error, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::sync::Mutex;
use tokio_vsock::{VsockAddr, VsockStream};
use tracing::{debug, warn};

use super::protocol::{AGENT_PORT, AgentRequest, AgentResponse};

pub struct AgentClient {
    cid: u32,
    connection: Mutex<Option<BufStream<VsockStream>>>,
}

impl AgentClient {
    pub fn new(cid: u32) -> Self {
        Self {
            cid,
            connection: Mutex::new(None),
        }
    }

    async fn dial(&self) -> Result<BufStream<VsockStream>> {
        let stream = VsockStream::connect(VsockAddr::new(self.cid, AGENT_PORT))
            .await
            .map_err(|e| Error::Transient(format!("vsock dial cid {}: {e}", self.cid)))?;
        Ok(BufStream::new(stream))
    }

    async fn round_trip_once(
        &self,
        connection: &mut BufStream<VsockStream>,
        line: &str,
    ) -> std::io::Result<String> {
        connection.write_all(line.as_bytes()).await?;
        connection.write_all(b"\n").await?;
        connection.flush().await?;

        let mut response = String::new();
        let read = connection.read_line(&mut response).await?;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "agent closed the connection",
            ));
        }
        Ok(response)
    }

    /// Send one request and read one response. On any I/O failure the
    /// connection is re-dialed and the request retried once.
    pub async fn request(&self, request: &AgentRequest) -> Result<AgentResponse> {
        let line = serde_json::to_string(request)
            .map_err(|e| Error::Internal(format!("encoding agent request: {e}")))?;

        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            *guard = Some(self.dial().await?);
        }

        let attempt = {
            let connection = guard.as_mut().expect("connection present");
            self.round_trip_once(connection, &line).await
        };

        let response_line = match attempt {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "agent connection failed, reconnecting");
                let mut connection = self.dial().await?;
                let response = self
                    .round_trip_once(&mut connection, &line)
                    .await
                    .map_err(|e| Error::Transient(format!("agent request: {e}")))?;
                *guard = Some(connection);
                response
            }
        };

        let response: AgentResponse = serde_json::from_str(response_line.trim())
            .map_err(|e| Error::Transient(format!("decoding agent response: {e}")))?;
        if !response.ok {
            return Err(Error::Transient(format!(
                "agent error: {}",
                response.error.as_deref().unwrap_or("unknown")
            )));
        }
        Ok(response)
    }

    /// Wait until the agent answers a ping and completes a full
    /// exec/exec-status round trip.
    pub async fn wait_ready(&self, deadline: Duration) -> Result<()> {
        let started = tokio::time::Instant::now();
        loop {
            if started.elapsed() > deadline {
                return Err(Error::Timeout(format!(
                    "guest agent not ready after {deadline:?}"
                )));
            }

            match self.request(&AgentRequest::Ping).await {
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "agent ping not answered yet");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            }

            // Full round trip: run a trivial command and poll it to exit.
            let exec = AgentRequest::Exec {
                path: "/bin/true".to_string(),
                args: Vec::new(),
                env: Default::default(),
                stdin_data: None,
            };
            let Ok(response) = self.request(&exec).await else {
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            };
            let Some(pid) = response.pid else {
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            };

            let probe_deadline = tokio::time::Instant::now() + Duration::from_secs(30);
            loop {
                let status = self.request(&AgentRequest::ExecStatus { pid }).await?;
                if status.exited.unwrap_or(false) {
                    return Ok(());
                }
                if tokio::time::Instant::now() > probe_deadline {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}
