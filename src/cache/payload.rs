//! Tagged cache payloads.

use crate::Result;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// How the payload bytes are encoded.
///
/// `Json` payloads can be exported as text archives; `Binary` payloads can only
/// travel in binary archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    Json,
    Binary,
}

impl PayloadFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadFormat::Json => "json",
            PayloadFormat::Binary => "binary",
        }
    }
}

/// Serialized cached value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub format: PayloadFormat,
    pub bytes: Bytes,
}

impl Payload {
    pub fn new(format: PayloadFormat, bytes: impl Into<Bytes>) -> Self {
        Self {
            format,
            bytes: bytes.into(),
        }
    }

    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self::new(PayloadFormat::Json, serde_json::to_vec(value)?))
    }

    pub fn binary(bytes: impl Into<Bytes>) -> Self {
        Self::new(PayloadFormat::Binary, bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decode a JSON payload into `T`.
    ///
    /// Binary payloads are decoded as a JSON byte array so callers caching
    /// `Vec<u8>` through the typed API still round-trip.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match self.format {
            PayloadFormat::Json => Ok(serde_json::from_slice(&self.bytes)?),
            PayloadFormat::Binary => Ok(serde_json::from_value(serde_json::Value::from(
                self.bytes.to_vec(),
            ))?),
        }
    }

    /// Parse a JSON payload as a `serde_json::Value`; `None` for binary payloads.
    pub fn to_json_value(&self) -> Option<Result<serde_json::Value>> {
        match self.format {
            PayloadFormat::Json => Some(serde_json::from_slice(&self.bytes).map_err(Into::into)),
            PayloadFormat::Binary => None,
        }
    }
}
