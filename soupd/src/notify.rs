//! Typed notifications emitted by the worker.
//!
//! Payloads are JSON records with camelCase keys. Each tag maps to exactly one
//! variant of [`Notification`]; the reserved `logger` tag is handled by the log
//! bridge and never decoded here.

use serde::{Deserialize, Serialize};

/// Notification type tags.
pub mod tags {
    pub const LOGGER: &str = "logger";
    pub const RUNNING: &str = "running";
    pub const SCORE: &str = "score";
    pub const VIDEO_ORIENTATION_CHANGE: &str = "videoorientationchange";
    pub const ICE_SELECTED_TUPLE_CHANGE: &str = "iceselectedtuplechange";
    pub const ICE_STATE_CHANGE: &str = "icestatechange";
    pub const DTLS_STATE_CHANGE: &str = "dtlsstatechange";
    pub const PRODUCER_CLOSE: &str = "producerclose";
    pub const LAYERS_CHANGE: &str = "layerschange";
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unsupported notification type: {0}")]
    Unsupported(String),
    #[error("malformed {tag} notification: {source}")]
    Malformed {
        tag: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningNotify {
    pub pid: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreNotify {
    pub target_id: String,
    #[serde(default)]
    pub score: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoOrientationChangeNotify {
    pub target_id: String,
    pub camera: bool,
    pub flip: bool,
    pub rotation: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportTuple {
    pub local_ip: String,
    pub local_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceSelectedTupleChangeNotify {
    pub target_id: String,
    pub ice_selected_tuple: TransportTuple,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceState {
    New,
    Connected,
    Completed,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceStateChangeNotify {
    pub target_id: String,
    pub ice_state: IceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsStateChangeNotify {
    pub target_id: String,
    pub dtls_state: DtlsState,
    /// Remote certificate in PEM, present once the handshake completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtls_remote_cert: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerCloseNotify {
    /// Consumer whose producer went away.
    pub target_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayers {
    pub spatial_layer: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal_layer: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayersChangeNotify {
    pub target_id: String,
    /// `None` when the consumer is paused and no layer is being forwarded.
    #[serde(default)]
    pub layers: Option<ConsumerLayers>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Running(RunningNotify),
    Score(ScoreNotify),
    VideoOrientationChange(VideoOrientationChangeNotify),
    IceSelectedTupleChange(IceSelectedTupleChangeNotify),
    IceStateChange(IceStateChangeNotify),
    DtlsStateChange(DtlsStateChangeNotify),
    ProducerClose(ProducerCloseNotify),
    LayersChange(LayersChangeNotify),
}

fn parse<T: serde::de::DeserializeOwned>(
    tag: &'static str,
    payload: &[u8],
) -> Result<T, DecodeError> {
    serde_json::from_slice(payload).map_err(|source| DecodeError::Malformed { tag, source })
}

impl Notification {
    pub fn decode(tag: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        let notification = match tag {
            tags::RUNNING => Self::Running(parse(tags::RUNNING, payload)?),
            tags::SCORE => Self::Score(parse(tags::SCORE, payload)?),
            tags::VIDEO_ORIENTATION_CHANGE => Self::VideoOrientationChange(parse(
                tags::VIDEO_ORIENTATION_CHANGE,
                payload,
            )?),
            tags::ICE_SELECTED_TUPLE_CHANGE => Self::IceSelectedTupleChange(parse(
                tags::ICE_SELECTED_TUPLE_CHANGE,
                payload,
            )?),
            tags::ICE_STATE_CHANGE => Self::IceStateChange(parse(tags::ICE_STATE_CHANGE, payload)?),
            tags::DTLS_STATE_CHANGE => {
                Self::DtlsStateChange(parse(tags::DTLS_STATE_CHANGE, payload)?)
            }
            tags::PRODUCER_CLOSE => Self::ProducerClose(parse(tags::PRODUCER_CLOSE, payload)?),
            tags::LAYERS_CHANGE => Self::LayersChange(parse(tags::LAYERS_CHANGE, payload)?),
            other => return Err(DecodeError::Unsupported(other.to_string())),
        };
        Ok(notification)
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Running(_) => tags::RUNNING,
            Self::Score(_) => tags::SCORE,
            Self::VideoOrientationChange(_) => tags::VIDEO_ORIENTATION_CHANGE,
            Self::IceSelectedTupleChange(_) => tags::ICE_SELECTED_TUPLE_CHANGE,
            Self::IceStateChange(_) => tags::ICE_STATE_CHANGE,
            Self::DtlsStateChange(_) => tags::DTLS_STATE_CHANGE,
            Self::ProducerClose(_) => tags::PRODUCER_CLOSE,
            Self::LayersChange(_) => tags::LAYERS_CHANGE,
        }
    }

    /// Correlation identifier, if the notification carries one.
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Self::Running(_) => None,
            Self::Score(n) => Some(&n.target_id),
            Self::VideoOrientationChange(n) => Some(&n.target_id),
            Self::IceSelectedTupleChange(n) => Some(&n.target_id),
            Self::IceStateChange(n) => Some(&n.target_id),
            Self::DtlsStateChange(n) => Some(&n.target_id),
            Self::ProducerClose(n) => Some(&n.target_id),
            Self::LayersChange(n) => Some(&n.target_id),
        }
    }
}
