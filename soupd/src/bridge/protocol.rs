//! Message envelope used by the message pump on the control channel.
//!
//! Each netstring frame carries one JSON envelope. Payloads are opaque to the pump
//! and travel base64-encoded so binary host codecs survive unchanged.

use serde::{Deserialize, Serialize};
use tokio_util::bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerFrame {
    /// Correlated call; answered by a `Response` with the same id.
    Request {
        id: u64,
        #[serde(rename = "type")]
        msg_type: String,
        #[serde(with = "base64_payload")]
        payload: Bytes,
    },

    Response {
        id: u64,
        #[serde(with = "base64_payload")]
        payload: Bytes,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// One-way event, never answered.
    Notify {
        #[serde(rename = "type")]
        msg_type: String,
        #[serde(with = "base64_payload")]
        payload: Bytes,
    },
}

impl PeerFrame {
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(frame)
    }
}

mod base64_payload {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use tokio_util::bytes::Bytes;

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}
