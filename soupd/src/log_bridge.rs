//! Bridge from the worker's diagnostics into `tracing`.
//!
//! Two sources feed it: raw stderr lines, and `logger` notifications whose first byte
//! selects the severity (`D`, `W`, `E`). Everything lands on the `soupd::worker`
//! target tagged with the worker id.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

pub const WORKER_LOG_TARGET: &str = "soupd::worker";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Split a `logger` payload into severity and message.
///
/// Unknown markers (and empty payloads) log the whole payload as an error.
pub fn classify(payload: &[u8]) -> (WorkerLogLevel, &[u8]) {
    match payload.split_first() {
        Some((b'D', rest)) => (WorkerLogLevel::Debug, rest),
        Some((b'W', rest)) => (WorkerLogLevel::Warn, rest),
        Some((b'E', rest)) => (WorkerLogLevel::Error, rest),
        _ => (WorkerLogLevel::Error, payload),
    }
}

#[derive(Debug, Clone)]
pub struct LogBridge {
    worker_id: Arc<str>,
}

impl LogBridge {
    pub fn new(worker_id: impl Into<Arc<str>>) -> Self {
        Self {
            worker_id: worker_id.into(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn emit(&self, level: WorkerLogLevel, message: &[u8]) {
        let message = String::from_utf8_lossy(message);
        let message = message.trim_end();
        let worker_id = &*self.worker_id;
        match level {
            WorkerLogLevel::Debug => {
                tracing::debug!(target: WORKER_LOG_TARGET, %worker_id, "{}", message)
            }
            WorkerLogLevel::Info => {
                tracing::info!(target: WORKER_LOG_TARGET, %worker_id, "{}", message)
            }
            WorkerLogLevel::Warn => {
                tracing::warn!(target: WORKER_LOG_TARGET, %worker_id, "{}", message)
            }
            WorkerLogLevel::Error => {
                tracing::error!(target: WORKER_LOG_TARGET, %worker_id, "{}", message)
            }
        }
    }

    pub fn logger_notification(&self, payload: &[u8]) {
        let (level, message) = classify(payload);
        self.emit(level, message);
    }

    pub fn stderr_line(&self, line: &[u8]) {
        self.emit(WorkerLogLevel::Info, line);
    }

    /// Forward every stderr line until EOF. Resolves to the number of lines forwarded.
    pub fn spawn_stderr_pump<R>(&self, stderr: R) -> JoinHandle<usize>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let bridge = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).split(b'\n');
            let mut forwarded = 0;
            loop {
                match lines.next_segment().await {
                    Ok(Some(line)) => {
                        bridge.stderr_line(&line);
                        forwarded += 1;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(worker_id = %bridge.worker_id, error = %e, "Worker stderr read failed");
                        break;
                    }
                }
            }
            tracing::trace!(worker_id = %bridge.worker_id, "Worker stderr closed");
            forwarded
        })
    }
}
