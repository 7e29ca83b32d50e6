//! Worker process launcher.
//!
//! Provisions the channels, spawns the worker with the four child ends installed
//! as fds 3-6, bridges its stderr into tracing, and spawns a waiter that reports
//! the exit outcome exactly once.

use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::process::{Child, Command};
use tokio::sync::oneshot;

use crate::bridge::channel::{self, ChildEnds, PayloadChannel};
use crate::bridge::transport::Transport;
use crate::config::{PROTOCOL_VERSION_ENV, PortRange, SupervisorConfig};
use crate::log_bridge::LogBridge;

/// First descriptor number the worker expects its channels at.
const CHILD_FD_BASE: RawFd = 3;

/// Last descriptor number the worker expects its channels at.
const CHILD_FD_LAST: RawFd = CHILD_FD_BASE + 3;

/// Scratch range used while shuffling descriptors into place in the child.
const CHILD_FD_SCRATCH: RawFd = 100;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to provision worker channels: {0}")]
    Provision(#[source] io::Error),
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),
    #[error("worker stderr not captured")]
    MissingStderr,
}

/// How the worker process ended.
#[derive(Debug)]
pub enum WorkerExit {
    Exited(ExitStatus),
    WaitFailed(io::Error),
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(status) if status.success())
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(status) => write!(f, "{status}"),
            Self::WaitFailed(e) => write!(f, "wait failed: {e}"),
        }
    }
}

/// A running worker as seen by the supervisor.
pub struct LaunchedWorker {
    pub transport: Transport,
    /// Resolves once with the exit outcome. A dropped sender also means the process is gone.
    pub exit: oneshot::Receiver<WorkerExit>,
    pub pid: Option<u32>,
}

/// Extension point for how workers are started.
pub trait Launcher: Send + Sync {
    /// Must run inside a tokio runtime.
    fn launch(&self, worker_id: &str, ports: PortRange) -> Result<LaunchedWorker, LaunchError>;
}

/// Command line for the worker, without the executable itself.
pub fn worker_args(config: &SupervisorConfig, worker_id: &str, ports: PortRange) -> Vec<String> {
    let mut args = vec![
        worker_id.to_string(),
        format!("--logLevel={}", config.log_level),
    ];
    args.extend(config.log_tags.iter().map(|tag| format!("--logTag={tag}")));
    args.push(format!("--rtcMinPort={}", ports.min()));
    args.push(format!("--rtcMaxPort={}", ports.max()));
    if let Some(cert) = &config.dtls_certificate_file {
        args.push(format!("--dtlsCertificateFile={}", cert.display()));
    }
    if let Some(key) = &config.dtls_private_key_file {
        args.push(format!("--dtlsPrivateKeyFile={}", key.display()));
    }
    args
}

/// Runs in the forked child before exec: only async-signal-safe calls allowed.
///
/// Sources are first duplicated above the target range (close-on-exec) so that a
/// source already sitting in 3-6 is never clobbered, then moved onto 3, 4, 5, 6.
/// `dup2` clears close-on-exec on the targets.
fn install_child_fds(fds: [RawFd; 4]) -> io::Result<()> {
    let mut scratch = [-1 as RawFd; 4];
    for (slot, fd) in scratch.iter_mut().zip(fds) {
        // SAFETY: plain fcntl on a descriptor owned by this process.
        let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, CHILD_FD_SCRATCH) };
        if dup < 0 {
            return Err(io::Error::last_os_error());
        }
        *slot = dup;
    }
    for (offset, fd) in scratch.into_iter().enumerate() {
        let target = CHILD_FD_BASE + offset as RawFd;
        // SAFETY: `fd` was created above; `target` is reserved for the worker.
        if unsafe { libc::dup2(fd, target) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Occupy every free descriptor up to fd 6 with a close-on-exec placeholder.
///
/// Held across `spawn` so the descriptors the runtime opens for the fork (its
/// exec-error pipe among them) land above the range `install_child_fds` overwrites.
fn reserve_child_fd_range() -> io::Result<Vec<OwnedFd>> {
    let mut held = Vec::new();
    loop {
        let fd = OwnedFd::from(File::open("/dev/null")?);
        if fd.as_raw_fd() > CHILD_FD_LAST {
            return Ok(held);
        }
        held.push(fd);
    }
}

/// Spawns the real worker executable.
pub struct ProcessLauncher {
    config: Arc<SupervisorConfig>,
}

impl ProcessLauncher {
    pub fn new(config: Arc<SupervisorConfig>) -> Self {
        Self { config }
    }

    fn command(&self, worker_id: &str, ports: PortRange, child_ends: &ChildEnds) -> Command {
        let mut command = Command::new(&self.config.worker_path);
        command
            .args(worker_args(&self.config, worker_id, ports))
            .env(PROTOCOL_VERSION_ENV, self.config.protocol_version.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let fds = child_ends.raw_fds();
        // SAFETY: the closure only calls fcntl/dup2 and allocates nothing.
        unsafe {
            command.pre_exec(move || install_child_fds(fds));
        }
        command
    }

    /// Provision the channels and start the process with fds 3-6 installed.
    /// Must run inside a tokio runtime.
    pub(crate) fn spawn_worker(
        &self,
        worker_id: &str,
        ports: PortRange,
    ) -> Result<(Transport, PayloadChannel, Child), LaunchError> {
        let (father, child_ends) = channel::provision()
            .map_err(LaunchError::Provision)?
            .split();
        let (transport, payload) = father
            .into_transport(self.config.max_frame_length)
            .map_err(LaunchError::Provision)?;

        tracing::info!(
            worker_path = %self.config.worker_path.display(),
            rtc_min_port = ports.min(),
            rtc_max_port = ports.max(),
            "Spawning worker process"
        );
        let reserved = reserve_child_fd_range().map_err(LaunchError::Provision)?;
        let child = self
            .command(worker_id, ports, &child_ends)
            .spawn()
            .map_err(LaunchError::Spawn)?;
        drop(reserved);

        // The worker holds its own copies now; keeping ours would hide EOF on exit.
        drop(child_ends);

        Ok((transport, payload, child))
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, worker_id: &str, ports: PortRange) -> Result<LaunchedWorker, LaunchError> {
        let (transport, payload, mut child) = self.spawn_worker(worker_id, ports)?;

        let stderr = child.stderr.take().ok_or(LaunchError::MissingStderr)?;
        LogBridge::new(worker_id).spawn_stderr_pump(stderr);

        let pid = child.id();
        let (exit_tx, exit) = oneshot::channel();
        let worker_id = worker_id.to_string();
        tokio::spawn(async move {
            let outcome = match child.wait().await {
                Ok(status) => WorkerExit::Exited(status),
                Err(e) => WorkerExit::WaitFailed(e),
            };
            tracing::debug!(%worker_id, exit = %outcome, "Worker process reaped");
            if exit_tx.send(outcome).is_err() {
                tracing::trace!(%worker_id, "Exit outcome had no listener");
            }
            drop(payload);
        });

        Ok(LaunchedWorker {
            transport,
            exit,
            pid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use std::io::{Read, Write};
    use std::time::Duration;
    use tokio_util::bytes::Bytes;

    #[test]
    fn args_snapshot() {
        let config = SupervisorConfig::new("/usr/local/bin/mediasoup-worker")
            .with_dtls_files("/etc/soupd/cert.pem", "/etc/soupd/key.pem");
        let args = worker_args(&config, "soupd-1", PortRange::new(40000, 49999).unwrap());
        insta::assert_json_snapshot!("worker_args", args);
    }

    #[test]
    fn dtls_flags_omitted_when_unset() {
        let config = SupervisorConfig::default().with_log_tags(["ice"]);
        let args = worker_args(&config, "w", PortRange::new(10000, 10010).unwrap());
        assert_eq!(
            args,
            vec![
                "w",
                "--logLevel=warn",
                "--logTag=ice",
                "--rtcMinPort=10000",
                "--rtcMaxPort=10010",
            ]
        );
    }

    #[tokio::test]
    async fn missing_executable_is_spawn_error() {
        let config = Arc::new(SupervisorConfig::new("/nonexistent/soupd-worker"));
        let launcher = ProcessLauncher::new(config);
        let err = launcher
            .launch("w1", PortRange::new(40000, 40100).unwrap())
            .err()
            .unwrap();
        assert!(matches!(err, LaunchError::Spawn(_)));
    }

    #[tokio::test]
    async fn worker_inherits_control_channel() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("worker.sh");
        std::fs::write(
            &script,
            concat!(
                "printf '%s\\n' \"$@\" > \"$0.args\"\n",
                "printf '%s' \"$MEDIASOUP_VERSION\" > \"$0.env\"\n",
                "echo 'worker starting' >&2\n",
                "printf '5:hello,' >&4\n",
                "exit 3\n",
            ),
        )
        .unwrap();

        // The worker id is the first argument, so /bin/sh runs it as the script.
        let config = Arc::new(SupervisorConfig::new("/bin/sh"));
        let launcher = ProcessLauncher::new(config);
        let worker_id = script.to_str().unwrap();
        let launched = launcher
            .launch(worker_id, PortRange::new(40000, 40100).unwrap())
            .unwrap();
        assert!(launched.pid.is_some());

        let (mut reader, _writer) = launched.transport.into_parts();
        let frame = tokio::time::timeout(Duration::from_secs(10), reader.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&frame[..], b"hello");

        let exit = tokio::time::timeout(Duration::from_secs(10), launched.exit)
            .await
            .unwrap()
            .unwrap();
        match exit {
            WorkerExit::Exited(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected exit: {other}"),
        }
        assert!(!WorkerExit::WaitFailed(io::Error::other("x")).success());

        let args = std::fs::read_to_string(dir.path().join("worker.sh.args")).unwrap();
        let args: Vec<&str> = args.lines().collect();
        assert_eq!(args.first(), Some(&"--logLevel=warn"));
        assert!(args.contains(&"--rtcMinPort=40000"));
        assert!(args.contains(&"--rtcMaxPort=40100"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("worker.sh.env")).unwrap(),
            "3"
        );
    }

    #[test]
    fn reservation_only_holds_the_channel_range() {
        let held = reserve_child_fd_range().unwrap();
        let mut fds: Vec<RawFd> = held.iter().map(|fd| fd.as_raw_fd()).collect();
        assert!(fds.iter().all(|fd| *fd <= CHILD_FD_LAST));
        fds.sort_unstable();
        fds.dedup();
        assert_eq!(fds.len(), held.len());
    }

    #[tokio::test]
    async fn worker_reads_and_writes_all_four_channels() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("echo.sh");
        std::fs::write(
            &script,
            concat!(
                "dd bs=1 count=7 <&3 >&4 2>/dev/null
",
                "dd bs=1 count=4 <&5 >&6 2>/dev/null
",
            ),
        )
        .unwrap();

        let launcher = ProcessLauncher::new(Arc::new(SupervisorConfig::new("/bin/sh")));
        let (transport, payload, mut child) = launcher
            .spawn_worker(script.to_str().unwrap(), PortRange::new(40000, 40100).unwrap())
            .unwrap();

        // fd 3 in, fd 4 out: the netstring comes back unchanged.
        let (mut reader, mut writer) = transport.into_parts();
        writer.send(Bytes::from_static(b"ping")).await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(10), reader.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&frame[..], b"ping");

        // fd 5 in, fd 6 out.
        let (mut tx, mut rx) = payload.into_parts();
        tx.write_all(b"data").unwrap();
        rx.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let mut buf = [0u8; 4];
        rx.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"data");

        let status = tokio::time::timeout(Duration::from_secs(10), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(status.success());
    }
}
