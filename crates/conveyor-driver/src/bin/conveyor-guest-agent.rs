//! Guest-side agent for the qemu driver.
//!
//! Listens on vsock, answers line-delimited JSON requests: `ping`, `exec`
//! (spawn a process, reply with its pid), and `exec-status` (report exit
//! state and drain buffered output). Runs as root inside the guest.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use conveyor_driver::qemu::protocol::{AGENT_PORT, AgentRequest, AgentResponse};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::process::Command;
use tokio_vsock::{VMADDR_CID_ANY, VsockAddr, VsockListener};
use tracing::{info, warn};

#[derive(Default)]
struct ProcessEntry {
    exit_code: Option<i64>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

type ProcessTable = Arc<Mutex<HashMap<u32, Arc<Mutex<ProcessEntry>>>>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let processes: ProcessTable = Arc::new(Mutex::new(HashMap::new()));
    let mut listener = VsockListener::bind(VsockAddr::new(VMADDR_CID_ANY, AGENT_PORT))?;
    info!(port = AGENT_PORT, "guest agent listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        info!(?peer, "host connected");
        let processes = processes.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(stream, processes).await {
                warn!(error = %e, "connection ended");
            }
        });
    }
}

async fn serve(stream: tokio_vsock::VsockStream, processes: ProcessTable) -> anyhow::Result<()> {
    let mut stream = BufStream::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        if stream.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let response = match serde_json::from_str::<AgentRequest>(line.trim()) {
            Ok(request) => handle(request, &processes).await,
            Err(e) => AgentResponse::failure(format!("bad request: {e}")),
        };
        let encoded = serde_json::to_string(&response)?;
        stream.write_all(encoded.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;
    }
}

async fn handle(request: AgentRequest, processes: &ProcessTable) -> AgentResponse {
    match request {
        AgentRequest::Ping => AgentResponse {
            ok: true,
            ..Default::default()
        },
        AgentRequest::Exec {
            path,
            args,
            env,
            stdin_data,
        } => exec(path, args, env, stdin_data, processes).await,
        AgentRequest::ExecStatus { pid } => {
            let entry = processes.lock().unwrap().get(&pid).cloned();
            match entry {
                None => AgentResponse::failure(format!("unknown pid {pid}")),
                Some(entry) => {
                    let mut entry = entry.lock().unwrap();
                    let stdout = std::mem::take(&mut entry.stdout);
                    let stderr = std::mem::take(&mut entry.stderr);
                    AgentResponse {
                        ok: true,
                        pid: Some(pid),
                        exited: Some(entry.exit_code.is_some()),
                        exit_code: entry.exit_code,
                        stdout: Some(BASE64.encode(stdout)),
                        stderr: Some(BASE64.encode(stderr)),
                        ..Default::default()
                    }
                }
            }
        }
    }
}

async fn exec(
    path: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    stdin_data: Option<String>,
    processes: &ProcessTable,
) -> AgentResponse {
    let stdin_bytes = match stdin_data.map(|data| BASE64.decode(data)) {
        Some(Ok(bytes)) => Some(bytes),
        Some(Err(e)) => return AgentResponse::failure(format!("bad stdin encoding: {e}")),
        None => None,
    };

    let mut command = Command::new(&path);
    command
        .args(&args)
        .envs(&env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin_bytes.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return AgentResponse::failure(format!("spawning {path}: {e}")),
    };

    let Some(pid) = child.id() else {
        return AgentResponse::failure("process exited before pid was known");
    };

    if let (Some(bytes), Some(mut stdin)) = (stdin_bytes, child.stdin.take()) {
        tokio::spawn(async move {
            let _ = stdin.write_all(&bytes).await;
        });
    }

    let entry = Arc::new(Mutex::new(ProcessEntry::default()));
    processes.lock().unwrap().insert(pid, entry.clone());

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_entry = entry.clone();
    let stdout_task = tokio::spawn(async move {
        if let Some(mut stdout) = stdout {
            let mut buffer = [0u8; 8192];
            while let Ok(read) = stdout.read(&mut buffer).await {
                if read == 0 {
                    break;
                }
                stdout_entry.lock().unwrap().stdout.extend_from_slice(&buffer[..read]);
            }
        }
    });

    let stderr_entry = entry.clone();
    let stderr_task = tokio::spawn(async move {
        if let Some(mut stderr) = stderr {
            let mut buffer = [0u8; 8192];
            while let Ok(read) = stderr.read(&mut buffer).await {
                if read == 0 {
                    break;
                }
                stderr_entry.lock().unwrap().stderr.extend_from_slice(&buffer[..read]);
            }
        }
    });

    tokio::spawn(async move {
        let status = child.wait().await;
        let _ = stdout_task.await;
        let _ = stderr_task.await;
        let exit_code = match status {
            Ok(status) => status.code().unwrap_or(-1) as i64,
            Err(_) => -1,
        };
        entry.lock().unwrap().exit_code = Some(exit_code);
    });

    AgentResponse {
        ok: true,
        pid: Some(pid),
        ..Default::default()
    }
}
