//! SSH transport for remote drivers.
//!
//! Provisioned hosts are reached with a freshly generated ed25519 key; the
//! embedded docker driver talks to the remote daemon through a local TCP
//! listener whose connections are forwarded to the remote unix socket over
//! direct-streamlocal channels.

use conveyor_core::{Error, Result, TarStream};
use russh::client::{self, AuthResult};
use russh::keys::{Algorithm, PrivateKey, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Generate a fresh ed25519 keypair for a host about to be provisioned.
pub fn generate_keypair() -> Result<PrivateKey> {
    PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
        .map_err(|e| Error::Provisioning(format!("generating ssh key: {e}")))
}

/// The key's OpenSSH `authorized_keys` line.
pub fn public_openssh(key: &PrivateKey) -> Result<String> {
    key.public_key()
        .to_openssh()
        .map_err(|e| Error::Provisioning(format!("encoding public key: {e}")))
}

struct AcceptingHandler;

impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    // Hosts are created moments before we dial them; there is no prior
    // known-hosts entry to pin.
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

pub struct SshSession {
    handle: client::Handle<AcceptingHandler>,
}

impl SshSession {
    /// Dial and authenticate. Fails fast; callers retry against their own
    /// deadline while the host boots.
    pub async fn connect(addr: SocketAddr, user: &str, key: &PrivateKey) -> Result<Self> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(120)),
            ..Default::default()
        });

        let mut handle = client::connect(config, addr, AcceptingHandler)
            .await
            .map_err(|e| Error::Transient(format!("ssh dial {addr}: {e}")))?;

        let auth = handle
            .authenticate_publickey(
                user,
                PrivateKeyWithHashAlg::new(Arc::new(key.clone()), None),
            )
            .await
            .map_err(|e| Error::Transient(format!("ssh auth: {e}")))?;
        if !matches!(auth, AuthResult::Success) {
            return Err(Error::Provisioning(format!("ssh auth rejected by {addr}")));
        }

        Ok(Self { handle })
    }

    /// Authenticate over an already established transport, e.g. a TCP
    /// stream carried by a WireGuard tunnel.
    pub async fn connect_over<S>(stream: S, user: &str, key: &PrivateKey) -> Result<Self>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(120)),
            ..Default::default()
        });

        let mut handle = client::connect_stream(config, stream, AcceptingHandler)
            .await
            .map_err(|e| Error::Transient(format!("ssh handshake: {e}")))?;

        let auth = handle
            .authenticate_publickey(
                user,
                PrivateKeyWithHashAlg::new(Arc::new(key.clone()), None),
            )
            .await
            .map_err(|e| Error::Transient(format!("ssh auth: {e}")))?;
        if !matches!(auth, AuthResult::Success) {
            return Err(Error::Provisioning("ssh auth rejected".into()));
        }

        Ok(Self { handle })
    }

    /// Dial with retries until `deadline` from now expires.
    pub async fn connect_with_retry(
        addr: SocketAddr,
        user: &str,
        key: &PrivateKey,
        deadline: Duration,
    ) -> Result<Self> {
        let started = tokio::time::Instant::now();
        let mut last_error = None;
        while started.elapsed() < deadline {
            match Self::connect(addr, user, key).await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    debug!(addr = %addr, error = %e, "ssh not ready yet");
                    last_error = Some(e);
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
            }
        }
        Err(Error::Timeout(format!(
            "ssh to {addr} not ready after {deadline:?}: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Run a command to completion, capturing output.
    pub async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::Transient(format!("ssh channel: {e}")))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::Transient(format!("ssh exec: {e}")))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = -1;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, .. } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => exit_code = exit_status as i64,
                _ => {}
            }
        }

        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    /// Run a command, streaming `stdin` into it. Returns the exit code.
    pub async fn exec_with_stdin(&self, command: &str, mut stdin: TarStream) -> Result<i64> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::Transient(format!("ssh channel: {e}")))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::Transient(format!("ssh exec: {e}")))?;

        let mut writer = channel.make_writer();
        tokio::io::copy(&mut stdin, &mut writer)
            .await
            .map_err(|e| Error::Transient(format!("streaming stdin: {e}")))?;
        writer
            .shutdown()
            .await
            .map_err(|e| Error::Transient(format!("closing stdin: {e}")))?;

        let mut exit_code = -1;
        while let Some(msg) = channel.wait().await {
            if let ChannelMsg::ExitStatus { exit_status } = msg {
                exit_code = exit_status as i64;
            }
        }
        Ok(exit_code)
    }

    /// Run a command and return its stdout as a stream. Stderr is logged.
    pub async fn exec_stream_stdout(&self, command: &str) -> Result<TarStream> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::Transient(format!("ssh channel: {e}")))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::Transient(format!("ssh exec: {e}")))?;

        let (reader, mut writer) = tokio::io::duplex(64 * 1024);
        let command = command.to_string();
        tokio::spawn(async move {
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data } => {
                        if writer.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    ChannelMsg::ExtendedData { data, .. } => {
                        debug!(command = %command, stderr = %String::from_utf8_lossy(&data), "remote stderr");
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        if exit_status != 0 {
                            warn!(command = %command, exit_status, "remote command failed");
                        }
                    }
                    _ => {}
                }
            }
        });

        Ok(Box::new(reader) as TarStream)
    }

    /// Forward a remote unix socket to a local TCP listener. Every accepted
    /// connection becomes one direct-streamlocal channel.
    pub async fn forward_unix_socket(self: &Arc<Self>, remote_path: &str) -> Result<SocketForward> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| Error::Provisioning(format!("binding forward listener: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Provisioning(format!("forward listener addr: {e}")))?;

        let session = self.clone();
        let remote_path = remote_path.to_string();
        let task = tokio::spawn(async move {
            loop {
                let (mut tcp, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "forward accept failed");
                        break;
                    }
                };
                debug!(peer = %peer, socket = %remote_path, "forwarding connection");

                let channel = match session
                    .handle
                    .channel_open_direct_streamlocal(&remote_path)
                    .await
                {
                    Ok(channel) => channel,
                    Err(e) => {
                        warn!(error = %e, "opening streamlocal channel failed");
                        continue;
                    }
                };

                tokio::spawn(async move {
                    let mut stream = channel.into_stream();
                    let _ = tokio::io::copy_bidirectional(&mut tcp, &mut stream).await;
                });
            }
        });

        Ok(SocketForward { local_addr, task })
    }

    pub async fn close(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await;
    }
}

/// A running socket forward; aborted on drop or `close`.
pub struct SocketForward {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl SocketForward {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for SocketForward {
    fn drop(&mut self) {
        self.task.abort();
    }
}
