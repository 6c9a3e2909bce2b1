//! Request payloads and the canonical structured encoding.
//!
//! A payload is either absent, raw bytes that travel unmodified, or a
//! structured value that is serialized to compact JSON text. Which one is
//! decided by the type of the value handed to [`Payload::from`], never by a
//! caller flag.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Body of an outgoing request.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    /// No body is sent.
    #[default]
    Absent,
    /// Bytes sent exactly as given.
    Raw(Vec<u8>),
    /// A value sent in canonical JSON encoding.
    Structured(Value),
}

impl Payload {
    /// Build a structured payload from any serializable value.
    pub fn structured<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(Payload::Structured)
            .map_err(|e| Error::Encoding(e.to_string()))
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Payload::Absent)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Raw(text.as_bytes().to_vec())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Raw(text.into_bytes())
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Raw(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Raw(bytes)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Structured(value)
    }
}

impl<T: Into<Payload>> From<Option<T>> for Payload {
    fn from(value: Option<T>) -> Self {
        value.map_or(Payload::Absent, Into::into)
    }
}

/// Encode a payload into the bytes put on the wire.
pub fn encode(payload: &Payload) -> Result<Option<Vec<u8>>> {
    match payload {
        Payload::Absent => Ok(None),
        Payload::Raw(bytes) => Ok(Some(bytes.clone())),
        Payload::Structured(value) => serde_json::to_vec(value)
            .map(Some)
            .map_err(|e| Error::Encoding(e.to_string())),
    }
}

/// Interpret a response body as UTF-8 text.
///
/// An absent body reads as the empty string.
pub fn decode_str(bytes: Option<&[u8]>) -> Result<&str> {
    std::str::from_utf8(bytes.unwrap_or_default())
        .map_err(|e| Error::Decoding(format!("payload is not valid UTF-8: {e}")))
}

/// Decode a response body from canonical JSON.
///
/// An absent body decodes as JSON `null`.
pub fn decode<T: DeserializeOwned>(bytes: Option<&[u8]>) -> Result<T> {
    let text = decode_str(bytes)?;
    let text = if bytes.is_none() { "null" } else { text };
    serde_json::from_str(text).map_err(|e| Error::Decoding(e.to_string()))
}
