//! Supervisor configuration.
//!
//! Loaded from the host's config file (serde) and/or environment variables.

use std::path::PathBuf;

use serde::Deserialize;

use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;

/// Environment marker telling the worker which protocol major version to speak.
pub const PROTOCOL_VERSION_ENV: &str = "MEDIASOUP_VERSION";

const DEFAULT_LOG_TAGS: &[&str] = &[
    "info",
    "ice",
    "dtls",
    "rtp",
    "srtp",
    "rtcp",
    "rtx",
    "bwe",
    "score",
    "simulcast",
    "svc",
    "sctp",
    "message",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid port range {min}-{max}")]
    InvalidPortRange { min: u16, max: u16 },
}

/// RTC port range handed to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "(u16, u16)")]
pub struct PortRange {
    min: u16,
    max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Result<Self, ConfigError> {
        if min == 0 || min > max {
            return Err(ConfigError::InvalidPortRange { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> u16 {
        self.min
    }

    pub fn max(&self) -> u16 {
        self.max
    }
}

impl TryFrom<(u16, u16)> for PortRange {
    type Error = ConfigError;

    fn try_from((min, max): (u16, u16)) -> Result<Self, Self::Error> {
        Self::new(min, max)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub worker_path: PathBuf,
    pub log_level: String,
    pub log_tags: Vec<String>,
    /// Flag is omitted when unset and the worker generates its own certificate.
    pub dtls_certificate_file: Option<PathBuf>,
    pub dtls_private_key_file: Option<PathBuf>,
    pub protocol_version: u32,
    /// Outbound frames queued by the peer before callers wait.
    pub pump_write_queue: usize,
    pub max_frame_length: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_path: PathBuf::from("mediasoup-worker"),
            log_level: "warn".to_string(),
            log_tags: DEFAULT_LOG_TAGS.iter().map(|t| t.to_string()).collect(),
            dtls_certificate_file: None,
            dtls_private_key_file: None,
            protocol_version: 3,
            pump_write_queue: 128,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl SupervisorConfig {
    pub fn new(worker_path: impl Into<PathBuf>) -> Self {
        Self {
            worker_path: worker_path.into(),
            ..Self::default()
        }
    }

    /// Defaults overlaid with `SOUPD_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    pub fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(path) = lookup("SOUPD_WORKER_PATH") {
            self.worker_path = PathBuf::from(path);
        }
        if let Some(level) = lookup("SOUPD_WORKER_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(cert) = lookup("SOUPD_DTLS_CERTIFICATE_FILE") {
            self.dtls_certificate_file = Some(PathBuf::from(cert));
        }
        if let Some(key) = lookup("SOUPD_DTLS_PRIVATE_KEY_FILE") {
            self.dtls_private_key_file = Some(PathBuf::from(key));
        }
        match lookup("SOUPD_PUMP_WRITE_QUEUE").map(|s| s.parse::<usize>()) {
            Some(Ok(n)) if n > 0 => self.pump_write_queue = n,
            Some(_) => tracing::warn!("Ignoring invalid SOUPD_PUMP_WRITE_QUEUE"),
            None => {}
        }
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_log_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.log_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dtls_files(mut self, certificate: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.dtls_certificate_file = Some(certificate.into());
        self.dtls_private_key_file = Some(key.into());
        self
    }

    pub fn with_pump_write_queue(mut self, n: usize) -> Self {
        self.pump_write_queue = n.max(1);
        self
    }

    pub fn with_max_frame_length(mut self, n: usize) -> Self {
        self.max_frame_length = n;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.worker_path, PathBuf::from("mediasoup-worker"));
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.log_tags.len(), 13);
        assert_eq!(config.protocol_version, 3);
        assert!(config.dtls_certificate_file.is_none());
    }

    #[test]
    fn env_overlay() {
        let env: HashMap<&str, &str> = [
            ("SOUPD_WORKER_PATH", "/opt/soupd/worker"),
            ("SOUPD_DTLS_CERTIFICATE_FILE", "/etc/soupd/cert.pem"),
            ("SOUPD_PUMP_WRITE_QUEUE", "16"),
        ]
        .into_iter()
        .collect();

        let config =
            SupervisorConfig::default().apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.worker_path, PathBuf::from("/opt/soupd/worker"));
        assert_eq!(
            config.dtls_certificate_file,
            Some(PathBuf::from("/etc/soupd/cert.pem"))
        );
        assert!(config.dtls_private_key_file.is_none());
        assert_eq!(config.pump_write_queue, 16);
    }

    #[test]
    fn env_overlay_ignores_bad_queue_size() {
        let config = SupervisorConfig::default().apply_env(|k| {
            (k == "SOUPD_PUMP_WRITE_QUEUE").then(|| "zero".to_string())
        });
        assert_eq!(config.pump_write_queue, 128);
    }

    #[test]
    fn deserializes_partial_config() {
        let config: SupervisorConfig = serde_json::from_value(serde_json::json!({
            "worker_path": "/usr/bin/soupd-worker",
            "log_tags": ["ice", "dtls"],
        }))
        .unwrap();

        assert_eq!(config.worker_path, PathBuf::from("/usr/bin/soupd-worker"));
        assert_eq!(config.log_tags, vec!["ice", "dtls"]);
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.pump_write_queue, 128);
    }

    #[test]
    fn port_range_validation() {
        assert!(PortRange::new(40000, 49999).is_ok());
        assert!(PortRange::new(5000, 5000).is_ok());
        assert_eq!(
            PortRange::new(50000, 40000),
            Err(ConfigError::InvalidPortRange {
                min: 50000,
                max: 40000
            })
        );
        assert!(PortRange::new(0, 10).is_err());

        let range: PortRange = serde_json::from_str("[10000, 10100]").unwrap();
        assert_eq!((range.min(), range.max()), (10000, 10100));
        assert!(serde_json::from_str::<PortRange>("[10100, 10000]").is_err());
    }
}
