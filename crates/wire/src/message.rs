use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current envelope schema version.
pub const MESSAGE_VERSION: u16 = 1;

/// Envelope every remote node message travels in.
///
/// The `topic` doubles as the type header: it names the message kind so the
/// receiver knows which payload type to decode. The payload itself is
/// MessagePack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Message kind, e.g. `calcnode.execute`.
    pub topic: String,

    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,

    pub sent_at: DateTime<Utc>,

    /// Envelopes newer than [`MESSAGE_VERSION`] are rejected by the decoder.
    #[serde(default = "default_version")]
    pub version: u16,
}

fn default_version() -> u16 {
    MESSAGE_VERSION
}

impl Message {
    pub fn new<T: Serialize>(
        topic: impl Into<String>,
        payload: &T,
    ) -> Result<Self, rmp_serde::encode::Error> {
        Ok(Self {
            topic: topic.into(),
            payload: rmp_serde::to_vec(payload)?,
            sent_at: Utc::now(),
            version: MESSAGE_VERSION,
        })
    }

    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, rmp_serde::decode::Error> {
        rmp_serde::from_slice(&self.payload)
    }

    /// The whole envelope as one ZeroMQ frame.
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Encode `Vec<u8>` as a MessagePack bin rather than an array of integers.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}
