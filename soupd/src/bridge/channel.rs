//! Socketpair provisioning for the worker channels.
//!
//! Both channels exist before the worker is spawned so descriptor inheritance is
//! race-free. Every pair has a father end (kept by the supervisor) and a child end
//! (inherited by the worker). Names below follow the worker's perspective: the
//! worker reads `control_read` and writes `control_write`.
//!
//! All ends are owned values; any early return drops whatever was already created.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;

use tokio::net::UnixStream;

use super::transport::Transport;

/// One socketpair: the supervisor keeps `father`, the worker inherits `child`.
struct EndpointPair {
    father: StdUnixStream,
    child: OwnedFd,
}

impl EndpointPair {
    fn new() -> io::Result<Self> {
        let (father, child) = StdUnixStream::pair()?;
        Ok(Self {
            father,
            child: child.into(),
        })
    }
}

/// A duplex channel built from two one-directional socketpairs.
struct Channel {
    read: EndpointPair,
    write: EndpointPair,
}

impl Channel {
    fn new() -> io::Result<Self> {
        Ok(Self {
            read: EndpointPair::new()?,
            write: EndpointPair::new()?,
        })
    }
}

/// Control + payload channels, ready to be split between parent and child.
pub struct ProvisionedChannels {
    control: Channel,
    payload: Channel,
}

/// Allocate all four socketpairs.
pub fn provision() -> io::Result<ProvisionedChannels> {
    let control = Channel::new()?;
    let payload = Channel::new()?;
    tracing::debug!("Provisioned worker channels");
    Ok(ProvisionedChannels { control, payload })
}

impl ProvisionedChannels {
    pub fn split(self) -> (FatherEnds, ChildEnds) {
        let father = FatherEnds {
            control_tx: self.control.read.father,
            control_rx: self.control.write.father,
            payload_tx: self.payload.read.father,
            payload_rx: self.payload.write.father,
        };
        let child = ChildEnds {
            control_read: self.control.read.child,
            control_write: self.control.write.child,
            payload_read: self.payload.read.child,
            payload_write: self.payload.write.child,
        };
        (father, child)
    }
}

/// Ends inherited by the worker. Dropped by the parent right after spawn.
pub struct ChildEnds {
    pub(crate) control_read: OwnedFd,
    pub(crate) control_write: OwnedFd,
    pub(crate) payload_read: OwnedFd,
    pub(crate) payload_write: OwnedFd,
}

impl ChildEnds {
    /// Raw descriptors in the order the worker expects them (fd 3, 4, 5, 6).
    pub fn raw_fds(&self) -> [RawFd; 4] {
        [
            self.control_read.as_raw_fd(),
            self.control_write.as_raw_fd(),
            self.payload_read.as_raw_fd(),
            self.payload_write.as_raw_fd(),
        ]
    }
}

/// Ends retained by the supervisor.
pub struct FatherEnds {
    control_tx: StdUnixStream,
    control_rx: StdUnixStream,
    payload_tx: StdUnixStream,
    payload_rx: StdUnixStream,
}

/// Payload channel ends. Not interpreted here; held open until the worker exits.
pub struct PayloadChannel {
    tx: StdUnixStream,
    rx: StdUnixStream,
}

impl PayloadChannel {
    /// Supervisor ends as `(tx, rx)`: the worker reads `tx` on fd 5 and writes `rx` on fd 6.
    pub fn into_parts(self) -> (StdUnixStream, StdUnixStream) {
        (self.tx, self.rx)
    }
}

impl FatherEnds {
    /// Wrap the control ends in the framed transport. Must run inside a tokio runtime.
    pub fn into_transport(self, max_frame_length: usize) -> io::Result<(Transport, PayloadChannel)> {
        let reader = into_tokio(self.control_rx)?;
        let writer = into_tokio(self.control_tx)?;
        let transport = Transport::new(reader, writer, max_frame_length);
        let payload = PayloadChannel {
            tx: self.payload_tx,
            rx: self.payload_rx,
        };
        Ok((transport, payload))
    }
}

fn into_tokio(stream: StdUnixStream) -> io::Result<UnixStream> {
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}
