//! Peer contract: correlated calls and notifications over the control channel.
//!
//! The supervisor depends only on the traits here. [`MsgPeer`] is the default
//! implementation, a message pump over the netstring [`Transport`].

mod pump;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::bridge::transport::Transport;

pub use pump::{MsgPeer, MsgPeerConnector};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    #[error("peer stopped")]
    Stopped,
    #[error("peer connection closed")]
    Closed,
    #[error("call cancelled")]
    Cancelled,
    #[error("call deadline exceeded")]
    DeadlineExceeded,
    #[error("remote error: {0}")]
    Remote(String),
    #[error("unsupported request: {0}")]
    Unsupported(String),
    #[error("transport error: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Cancellation and deadline bounding a single call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Run `fut` until it completes, the context is cancelled, or the deadline passes.
    pub async fn bound<T, F>(&self, fut: F) -> Result<T, PeerError>
    where
        F: Future<Output = Result<T, PeerError>>,
    {
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => Err(PeerError::Cancelled),
            _ = deadline => Err(PeerError::DeadlineExceeded),
            result = fut => result,
        }
    }
}

/// Correlated request/response + notification transport.
#[async_trait]
pub trait Peer: Send + Sync {
    /// Send a request and wait for the matching response.
    async fn call(
        &self,
        ctx: &CallContext,
        msg_type: &str,
        payload: Bytes,
    ) -> Result<Bytes, PeerError>;

    /// Request shutdown. Idempotent.
    fn stop(&self);

    /// Resolves once the peer has stopped, for any reason.
    async fn stopped(&self);

    /// First failure that stopped the peer; `None` after a clean `stop()`.
    fn error(&self) -> Option<PeerError>;
}

/// Callbacks for traffic initiated by the worker.
#[async_trait]
pub trait PeerHandler: Send + Sync {
    async fn process(&self, msg_type: &str, request: Bytes) -> Result<Bytes, PeerError>;

    async fn on_notify(&self, msg_type: &str, payload: Bytes);
}

/// Builds and starts a peer over a freshly launched worker's transport.
pub trait PeerConnector: Send + Sync {
    fn connect(
        &self,
        transport: Transport,
        handler: Arc<dyn PeerHandler>,
    ) -> Result<Arc<dyn Peer>, PeerError>;
}
