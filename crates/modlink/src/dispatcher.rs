//! Client side of the bridge: call dispatcher and serialized command
//! worker.
//!
//! Flow:
//! 1. Spawn the helper subprocess (or attach to any transport)
//! 2. Read and retain the startup handshake
//! 3. Spawn the worker task owning both pipe ends
//! 4. Callers `invoke()` concurrently; each request travels through the
//!    queue with its own oneshot reply slot and the caller suspends on
//!    it — the UI scheduler keeps running
//!
//! The worker completes one request on the pipe before starting the
//! next; the transport is a single ordered byte stream and the plain
//! request-id echo could not detect reordering. There is no per-call
//! cancellation or timeout: once enqueued, a call is only abandoned by
//! tearing the bridge down.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{self, JsonLineCodec};
use crate::bridge::protocol::{
    CMD_DIE, CMD_INIT, HANDSHAKE_DEBUG, HANDSHAKE_OK, Reply, Request,
};
use crate::spawn::{HelperSpawnConfig, HelperSpawner, InstalledHelperSpawner, SpawnError};

/// Debug switches, fixed at bridge initialization and read-only after.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugConfig {
    /// Log every request/reply the worker moves across the pipe.
    pub bridge: bool,
    /// Start the helper with `--debug` and keep its stderr on the terminal.
    pub helper: bool,
}

pub struct BridgeConfig {
    pub helper_dir: Option<std::path::PathBuf>,
    pub log_path: Option<std::path::PathBuf>,
    pub debug: DebugConfig,
    pub handshake_timeout: Duration,
    pub spawner: Arc<dyn HelperSpawner>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            helper_dir: None,
            log_path: None,
            debug: DebugConfig::default(),
            handshake_timeout: Duration::from_secs(30),
            spawner: Arc::new(InstalledHelperSpawner),
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_helper_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.helper_dir = Some(dir.into());
        self
    }

    pub fn with_log_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn with_debug(mut self, debug: DebugConfig) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn HelperSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

/// Bridge startup failures. Surfaced once, to the caller of `connect`;
/// never as per-call errors.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("helper {0} pipe was not captured")]
    Pipe(&'static str),

    #[error("helper startup failed: {0}")]
    Helper(String),

    #[error("handshake protocol error: {0}")]
    Handshake(String),

    #[error("timed out waiting for helper handshake")]
    HandshakeTimeout,

    #[error("i/o error during bridge startup: {0}")]
    Io(#[from] io::Error),
}

/// Per-call failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// The helper executed the command and reported an error. The
    /// bridge stays usable.
    #[error("remote command {command:?} failed: {message}")]
    Remote { command: String, message: String },

    /// Desync, malformed frame, or premature pipe closure. Poisons the
    /// bridge: every later call fails with `Closed`.
    #[error("bridge protocol error: {0}")]
    Protocol(String),

    /// The worker is gone (shutdown, poisoned, or dropped).
    #[error("bridge is closed")]
    Closed,
}

struct Dispatch {
    request: Request,
    reply_tx: oneshot::Sender<Result<Reply, BridgeError>>,
}

/// Handle used by any number of concurrent logical callers.
///
/// Cloning is cheap; clones share the request queue and the request-id
/// counter.
#[derive(Clone)]
pub struct Bridge {
    request_tx: mpsc::Sender<Dispatch>,
    ctx: Arc<str>,
    seq: Arc<AtomicU64>,
}

impl Bridge {
    /// Spawn the helper subprocess and bring the bridge up.
    pub async fn connect(config: BridgeConfig) -> Result<Self, InitError> {
        let spawn_config = HelperSpawnConfig {
            parent_pid: std::process::id(),
            debug_helper: config.debug.helper,
            helper_dir: config.helper_dir.clone(),
            log_path: config.log_path.clone(),
        };
        let mut child = config.spawner.spawn(&spawn_config)?;

        let stdin = child.stdin.take().ok_or(InitError::Pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(InitError::Pipe("stdout"))?;

        Self::start(
            FramedRead::new(stdout, JsonLineCodec::new()),
            FramedWrite::new(stdin, JsonLineCodec::new()),
            Some(child),
            &config,
        )
        .await
    }

    /// Bring the bridge up over an arbitrary transport.
    ///
    /// Used by tests and in-process fakes; `connect` is this plus the
    /// subprocess supervisor.
    pub async fn over_transport<R, W>(
        reader: R,
        writer: W,
        config: BridgeConfig,
    ) -> Result<Self, InitError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(
            FramedRead::new(reader, JsonLineCodec::new()),
            FramedWrite::new(writer, JsonLineCodec::new()),
            None,
            &config,
        )
        .await
    }

    async fn start<R, W>(
        mut reader: FramedRead<R, JsonLineCodec>,
        writer: FramedWrite<W, JsonLineCodec>,
        child: Option<Child>,
        config: &BridgeConfig,
    ) -> Result<Self, InitError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        tracing::debug!("Waiting for helper handshake");
        let handshake =
            match tokio::time::timeout(config.handshake_timeout, codec::read_handshake(&mut reader))
                .await
            {
                Ok(Ok(handshake)) => handshake,
                Ok(Err(e)) => return Err(InitError::Io(e)),
                Err(_) => return Err(InitError::HandshakeTimeout),
            };

        match handshake.value.as_str() {
            Some(HANDSHAKE_OK) | Some(HANDSHAKE_DEBUG) => {}
            Some(error) => return Err(InitError::Helper(error.to_string())),
            None => {
                return Err(InitError::Handshake(format!(
                    "handshake status must be a string, got {}",
                    handshake.value
                )));
            }
        }
        tracing::info!(status = %handshake.value, "Helper handshake received");

        let (request_tx, request_rx) = mpsc::channel(32);
        let debug_bridge = config.debug.bridge;
        tokio::spawn(async move {
            run_worker(reader, writer, child, request_rx, handshake, debug_bridge).await;
        });

        Ok(Self {
            request_tx,
            ctx: Arc::from(uuid::Uuid::new_v4().simple().to_string()),
            seq: Arc::new(AtomicU64::new(1)),
        })
    }

    fn next_request_id(&self) -> String {
        format!("{}-{}", self.ctx, self.seq.fetch_add(1, Ordering::Relaxed))
    }

    /// Issue one remote call and suspend until its reply arrives.
    pub async fn invoke(&self, command: &str, args: Vec<Value>) -> Result<Value, BridgeError> {
        let request = Request::new(self.next_request_id(), command, args);
        let (reply_tx, reply_rx) = oneshot::channel();

        self.request_tx
            .send(Dispatch { request, reply_tx })
            .await
            .map_err(|_| BridgeError::Closed)?;

        let reply = reply_rx.await.map_err(|_| BridgeError::Closed)??;
        match reply.status {
            Some(status) => Err(BridgeError::Remote {
                command: command.to_string(),
                message: status.error,
            }),
            None => Ok(reply.value),
        }
    }

    /// Fetch the retained startup handshake (`_init`); idempotent and
    /// free of pipe traffic.
    pub async fn handshake(&self) -> Result<Value, BridgeError> {
        self.invoke(CMD_INIT, Vec::new()).await
    }

    /// Shut the worker down gracefully (`_die`). The acknowledgement is
    /// the last reply the worker ever produces.
    pub async fn shutdown(&self) -> Result<Value, BridgeError> {
        self.invoke(CMD_DIE, Vec::new()).await
    }
}

/// The single owner of both pipe ends for the bridge's lifetime.
///
/// Processes one dispatch at a time: pseudo-commands are answered
/// locally, everything else is written to the pipe followed by exactly
/// one blocking reply read.
async fn run_worker<R, W>(
    mut reader: FramedRead<R, JsonLineCodec>,
    mut writer: FramedWrite<W, JsonLineCodec>,
    child: Option<Child>,
    mut request_rx: mpsc::Receiver<Dispatch>,
    handshake: Reply,
    debug_bridge: bool,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(Dispatch { request, reply_tx }) = request_rx.recv().await {
        match request.command.as_str() {
            CMD_INIT => {
                let reply = handshake.clone().with_request_id(request.request_id);
                let _ = reply_tx.send(Ok(reply));
            }
            CMD_DIE => {
                tracing::info!("Shutdown requested");
                let _ = reply_tx.send(Ok(Reply::ok(
                    request.request_id,
                    Value::String("ok".to_string()),
                )));
                break;
            }
            _ => {
                if debug_bridge {
                    tracing::debug!(
                        request_id = %request.request_id,
                        command = %request.command,
                        "Sending request"
                    );
                }

                if let Err(e) = codec::write_request(&mut writer, &request).await {
                    tracing::error!(error = %e, "Failed to write request");
                    let _ = reply_tx.send(Err(BridgeError::Protocol(format!(
                        "failed to write request: {}",
                        e
                    ))));
                    break;
                }

                let reply = match codec::read_reply(&mut reader).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to read reply");
                        let _ = reply_tx.send(Err(BridgeError::Protocol(format!(
                            "failed to read reply: {}",
                            e
                        ))));
                        break;
                    }
                };

                // Desync voids every ordering guarantee; poison rather
                // than misroute.
                if reply.request_id.as_deref() != Some(request.request_id.as_str()) {
                    tracing::error!(
                        expected = %request.request_id,
                        got = ?reply.request_id,
                        "Reply id does not match in-flight request"
                    );
                    let _ = reply_tx.send(Err(BridgeError::Protocol(format!(
                        "reply id {:?} does not match request {:?}",
                        reply.request_id, request.request_id
                    ))));
                    break;
                }

                if debug_bridge {
                    tracing::debug!(
                        request_id = %request.request_id,
                        failed = reply.is_error(),
                        "Reply received"
                    );
                }
                let _ = reply_tx.send(Ok(reply));
            }
        }
    }

    // Fail anything still queued fast instead of leaving callers
    // suspended forever.
    request_rx.close();
    while let Ok(Dispatch { reply_tx, .. }) = request_rx.try_recv() {
        let _ = reply_tx.send(Err(BridgeError::Closed));
    }

    if let Some(mut child) = child {
        if let Err(e) = child.start_kill() {
            tracing::debug!(error = %e, "Helper already gone at worker exit");
        }
        let _ = child.wait().await;
    }
    tracing::info!("Bridge worker exiting");
}
