//! soupd: supervisor for an external real-time media worker process.

#[cfg(not(unix))]
compile_error!("soupd supervises its worker over unix socketpairs and only builds on unix");

pub mod bridge;
pub mod config;
pub mod launcher;
pub mod log_bridge;
pub mod logging;
pub mod notify;
pub mod peer;
pub mod registry;
pub mod router;
pub mod worker;

pub use config::{ConfigError, PortRange, SupervisorConfig};
pub use launcher::{LaunchError, LaunchedWorker, Launcher, ProcessLauncher, WorkerExit};
pub use notify::{DecodeError, Notification};
pub use peer::{CallContext, MsgPeer, MsgPeerConnector, Peer, PeerConnector, PeerError, PeerHandler};
pub use registry::{
    InMemoryWorkerRegistry, NoSessions, Registries, Session, SessionRegistry, WorkerRegistry,
};
pub use router::{NotificationRouter, RouteOutcome};
pub use worker::{Json, RequestError, Worker, WorkerMessage, WorkerState};
