//! IPC bridge between the supervisor and the worker process.
//!
//! # Architecture
//!
//! - **channel**: socketpair provisioning (control + payload channels)
//! - **codec**: netstring framing for AsyncRead/AsyncWrite
//! - **transport**: framed duplex transport handed to the peer
//! - **protocol**: message envelope spoken by the default peer

pub mod channel;
pub mod codec;
pub mod protocol;
pub mod transport;
