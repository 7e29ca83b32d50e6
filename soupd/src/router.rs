//! Notification router: the supervisor's [`PeerHandler`].
//!
//! Each notification is either diverted to the log bridge (`logger`), decoded into a
//! [`Notification`] and forwarded to the owning session, or dropped with a log line.
//! Nothing here is ever propagated back to the peer loop; panics included.

use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::bytes::Bytes;

use crate::log_bridge::LogBridge;
use crate::notify::{Notification, tags};
use crate::peer::{PeerError, PeerHandler};
use crate::registry::{Session, SessionRegistry};

/// What happened to a single notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Diverted to the log bridge.
    Logged,
    /// Handed to the owning session's handler, which succeeded.
    Delivered,
    /// Decoded but not addressed to any session.
    Unrouted,
    /// No session owns the target id.
    NoOwner,
    Unsupported,
    Malformed,
    HandlerFailed,
}

/// Registry lookup shape for a routed notification.
enum Owner<'a> {
    Transport(&'a str),
    Consumer(&'a str),
}

pub struct NotificationRouter {
    worker_id: Arc<str>,
    sessions: Arc<dyn SessionRegistry>,
    log: LogBridge,
}

impl NotificationRouter {
    pub fn new(worker_id: impl Into<Arc<str>>, sessions: Arc<dyn SessionRegistry>) -> Self {
        let worker_id = worker_id.into();
        Self {
            log: LogBridge::new(Arc::clone(&worker_id)),
            worker_id,
            sessions,
        }
    }

    pub async fn route(&self, msg_type: &str, payload: &[u8]) -> RouteOutcome {
        let worker_id = &*self.worker_id;

        if msg_type == tags::LOGGER {
            self.log.logger_notification(payload);
            return RouteOutcome::Logged;
        }

        tracing::info!(
            %worker_id,
            %msg_type,
            payload = %String::from_utf8_lossy(payload),
            "Worker notification"
        );

        let notification = match Notification::decode(msg_type, payload) {
            Ok(n) => n,
            Err(crate::notify::DecodeError::Unsupported(_)) => {
                tracing::warn!(%worker_id, %msg_type, "Unsupported notification");
                return RouteOutcome::Unsupported;
            }
            Err(e) => {
                tracing::warn!(%worker_id, error = %e, "Dropping notification");
                return RouteOutcome::Malformed;
            }
        };

        let owner = match &notification {
            Notification::Running(n) => {
                tracing::info!(%worker_id, pid = n.pid, "Worker running");
                return RouteOutcome::Unrouted;
            }
            Notification::Score(_) | Notification::VideoOrientationChange(_) => {
                return RouteOutcome::Unrouted;
            }
            Notification::IceSelectedTupleChange(n) => Owner::Transport(&n.target_id),
            Notification::IceStateChange(n) => Owner::Transport(&n.target_id),
            Notification::DtlsStateChange(n) => Owner::Transport(&n.target_id),
            Notification::ProducerClose(n) => Owner::Consumer(&n.target_id),
            Notification::LayersChange(n) => Owner::Consumer(&n.target_id),
        };

        let (session, target_id) = match owner {
            Owner::Transport(id) => (self.sessions.session_by_transport_id(id), id),
            Owner::Consumer(id) => (self.sessions.session_by_consumer_id(id), id),
        };
        let Some(session) = session else {
            // Expected while a room is tearing down its transports.
            tracing::info!(%worker_id, %msg_type, %target_id, "No session owns target");
            return RouteOutcome::NoOwner;
        };

        match deliver(session.as_ref(), notification).await {
            Ok(()) => RouteOutcome::Delivered,
            Err(e) => {
                tracing::error!(%worker_id, %msg_type, error = %e, "Session handler failed");
                RouteOutcome::HandlerFailed
            }
        }
    }
}

async fn deliver(session: &dyn Session, notification: Notification) -> anyhow::Result<()> {
    match notification {
        Notification::IceSelectedTupleChange(n) => session.on_ice_selected_tuple_change(n).await,
        Notification::IceStateChange(n) => session.on_ice_state_change(n).await,
        Notification::DtlsStateChange(n) => session.on_dtls_state_change(n).await,
        Notification::ProducerClose(n) => session.on_producer_close(n).await,
        Notification::LayersChange(n) => session.on_layers_change(n).await,
        Notification::Running(_) | Notification::Score(_) | Notification::VideoOrientationChange(_) => {
            Ok(())
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[async_trait]
impl PeerHandler for NotificationRouter {
    async fn process(&self, msg_type: &str, _request: Bytes) -> Result<Bytes, PeerError> {
        let worker_id = &*self.worker_id;
        let handled = AssertUnwindSafe(async {
            tracing::warn!(%worker_id, %msg_type, "Unsupported request from worker");
            Err::<Bytes, _>(PeerError::Unsupported(msg_type.to_string()))
        })
        .catch_unwind()
        .await;

        handled.unwrap_or_else(|panic| {
            let msg = panic_message(&*panic);
            let bt = Backtrace::force_capture();
            tracing::error!(%worker_id, %msg_type, "Panic handling request: {msg}\nbacktrace:\n{bt}");
            Err(PeerError::Protocol(format!("panic handling {msg_type}")))
        })
    }

    async fn on_notify(&self, msg_type: &str, payload: Bytes) {
        let routed = AssertUnwindSafe(self.route(msg_type, &payload))
            .catch_unwind()
            .await;

        if let Err(panic) = routed {
            let msg = panic_message(&*panic);
            let bt = Backtrace::force_capture();
            tracing::error!(
                worker_id = %self.worker_id,
                %msg_type,
                "Panic handling notification: {msg}\nbacktrace:\n{bt}"
            );
        }
    }
}
