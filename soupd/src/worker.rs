//! Worker supervisor.
//!
//! One lifecycle task per worker:
//! 1. Launch the process (channels, fds, stderr bridge, exit waiter)
//! 2. Connect the peer with the notification router as its handler
//! 3. Mark online and register with the worker registry
//! 4. Race process exit against peer stop; whichever fires first tears down once
//!
//! Callers use [`Worker::request`], [`Worker::online`], [`Worker::id`] and
//! [`Worker::close`] concurrently from any task.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use serde::Serialize;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{PortRange, SupervisorConfig};
use crate::launcher::{LaunchedWorker, Launcher, ProcessLauncher};
use crate::peer::{CallContext, MsgPeerConnector, Peer, PeerConnector, PeerError};
use crate::registry::Registries;
use crate::router::NotificationRouter;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// High-frequency message types kept out of request/response logs.
const STATS_MESSAGE_TYPES: &[&str] = &["transport.getStats", "producer.getStats", "consumer.getStats"];

fn is_quiet(msg_type: &str) -> bool {
    STATS_MESSAGE_TYPES.contains(&msg_type)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Starting = 0,
    Online = 1,
    Terminated = 2,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Online,
            _ => Self::Terminated,
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Online => write!(f, "online"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Payload that can be sent to the worker.
pub trait WorkerMessage {
    fn marshal(&self) -> Result<Bytes, BoxError>;
}

impl WorkerMessage for Bytes {
    fn marshal(&self) -> Result<Bytes, BoxError> {
        Ok(self.clone())
    }
}

/// JSON-encoded request body.
#[derive(Debug, Clone)]
pub struct Json<T>(pub T);

impl<T: Serialize> WorkerMessage for Json<T> {
    fn marshal(&self) -> Result<Bytes, BoxError> {
        Ok(Bytes::from(serde_json::to_vec(&self.0)?))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("failed to marshal request: {0}")]
    Marshal(#[source] BoxError),
    #[error("worker unavailable")]
    Unavailable,
    #[error(transparent)]
    Peer(#[from] PeerError),
}

pub struct Worker {
    id: String,
    online: AtomicBool,
    state: AtomicU8,
    peer: OnceLock<Arc<dyn Peer>>,
    pid: OnceLock<u32>,
    closing: CancellationToken,
    terminated: CancellationToken,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("pid", &self.pid.get())
            .finish_non_exhaustive()
    }
}

impl Worker {
    fn new(id: String) -> Self {
        Self {
            id,
            online: AtomicBool::new(false),
            state: AtomicU8::new(WorkerState::Starting as u8),
            peer: OnceLock::new(),
            pid: OnceLock::new(),
            closing: CancellationToken::new(),
            terminated: CancellationToken::new(),
        }
    }

    /// Start supervising a real worker process. Must run inside a tokio runtime.
    pub fn start(
        config: Arc<SupervisorConfig>,
        registries: Registries,
        id: impl Into<String>,
        ports: PortRange,
    ) -> Arc<Self> {
        let connector = Arc::new(MsgPeerConnector::new(config.pump_write_queue));
        let launcher = Arc::new(ProcessLauncher::new(config));
        Self::start_with(launcher, connector, registries, id, ports)
    }

    /// Like [`Worker::start`] with explicit launch and peer strategies.
    pub fn start_with(
        launcher: Arc<dyn Launcher>,
        connector: Arc<dyn PeerConnector>,
        registries: Registries,
        id: impl Into<String>,
        ports: PortRange,
    ) -> Arc<Self> {
        let worker = Arc::new(Self::new(id.into()));
        let span = tracing::info_span!("worker", worker_id = %worker.id);
        tokio::spawn(
            Arc::clone(&worker)
                .run(launcher, connector, registries, ports)
                .instrument(span),
        );
        worker
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// Resolves once teardown has completed (or start failed).
    pub async fn terminated(&self) {
        self.terminated.cancelled().await;
    }

    /// Stop the peer and signal the process. Does not wait for teardown.
    pub fn close(&self) {
        tracing::info!(worker_id = %self.id, state = %self.state(), "Closing worker");
        self.closing.cancel();
        if let Some(peer) = self.peer.get() {
            peer.stop();
        }
        self.signal_terminate();
    }

    pub async fn request<M>(
        &self,
        ctx: &CallContext,
        msg_type: &str,
        msg: &M,
    ) -> Result<Bytes, RequestError>
    where
        M: WorkerMessage + ?Sized,
    {
        let payload = msg.marshal().map_err(RequestError::Marshal)?;

        if !self.online() {
            return Err(RequestError::Unavailable);
        }
        let Some(peer) = self.peer.get() else {
            return Err(RequestError::Unavailable);
        };

        let quiet = is_quiet(msg_type);
        if !quiet {
            tracing::info!(
                worker_id = %self.id,
                %msg_type,
                payload = %String::from_utf8_lossy(&payload),
                "Worker request"
            );
        }

        let result = peer.call(ctx, msg_type, payload).await;

        if !quiet {
            match &result {
                Ok(response) => tracing::info!(
                    worker_id = %self.id,
                    %msg_type,
                    response = %String::from_utf8_lossy(response),
                    "Worker response"
                ),
                Err(e) => tracing::warn!(worker_id = %self.id, %msg_type, error = %e, "Worker request failed"),
            }
        }

        result.map_err(RequestError::Peer)
    }

    async fn run(
        self: Arc<Self>,
        launcher: Arc<dyn Launcher>,
        connector: Arc<dyn PeerConnector>,
        registries: Registries,
        ports: PortRange,
    ) {
        let LaunchedWorker {
            transport,
            exit,
            pid,
        } = match launcher.launch(&self.id, ports) {
            Ok(launched) => launched,
            Err(e) => {
                tracing::error!(error = %e, "Worker failed to start");
                self.finish();
                return;
            }
        };
        if let Some(pid) = pid {
            let _ = self.pid.set(pid);
            tracing::info!(pid, "Worker process started");
        }
        if self.closing.is_cancelled() {
            self.signal_terminate();
        }

        let handler = Arc::new(NotificationRouter::new(
            self.id.as_str(),
            Arc::clone(&registries.sessions),
        ));
        let peer = match connector.connect(transport, handler) {
            Ok(peer) => peer,
            Err(e) => {
                tracing::error!(error = %e, "Failed to start peer");
                self.signal_terminate();
                self.finish();
                return;
            }
        };
        let _ = self.peer.set(Arc::clone(&peer));
        if self.closing.is_cancelled() {
            peer.stop();
        }

        self.online.store(true, Ordering::Release);
        self.state.store(WorkerState::Online as u8, Ordering::Release);
        tracing::info!("Worker online");
        registries.workers.connect(Arc::clone(&self));

        tokio::select! {
            outcome = exit => {
                match outcome {
                    Ok(exit) if exit.success() => tracing::info!(%exit, "Worker process exited"),
                    Ok(exit) => tracing::error!(%exit, "Worker process exited"),
                    Err(_) => tracing::warn!("Worker exit waiter went away"),
                }
                self.state.store(WorkerState::Terminated as u8, Ordering::Release);
                peer.stop();
            }
            _ = peer.stopped() => {
                match peer.error() {
                    Some(e) => tracing::error!(error = %e, "Peer stopped"),
                    None => tracing::info!("Peer stopped"),
                }
                // The control channel is gone; the process has nothing left to serve.
                self.signal_terminate();
            }
        }

        self.online.store(false, Ordering::Release);
        registries.sessions.on_worker_disconnected(&self.id);
        registries.workers.disconnect(&self.id);
        tracing::info!("Worker offline");
        self.finish();
    }

    fn finish(&self) {
        self.online.store(false, Ordering::Release);
        self.state.store(WorkerState::Terminated as u8, Ordering::Release);
        self.terminated.cancel();
    }

    /// Send SIGTERM to the process unless it is already known to be gone.
    fn signal_terminate(&self) {
        let Some(&pid) = self.pid.get() else {
            return;
        };
        if self.state() == WorkerState::Terminated {
            return;
        }
        send_sigterm(&self.id, pid);
    }
}

fn send_sigterm(worker_id: &str, pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        tracing::warn!(%worker_id, pid, "Pid out of range, not signalling");
        return;
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => tracing::debug!(%worker_id, pid, "Sent SIGTERM to worker"),
        Err(Errno::ESRCH) => tracing::debug!(%worker_id, pid, "Worker already gone"),
        Err(e) => tracing::warn!(%worker_id, pid, error = %e, "Failed to signal worker"),
    }
}
