//! Raw upstream payloads.

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::Result;

/// Response body of a successful upstream call.
///
/// Cheap to clone: every cache hit and every single-flight waiter shares
/// the same underlying buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(Bytes);

impl Payload {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self(body.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Deserialize the body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.0)?)
    }

    /// Parse the body as untyped JSON.
    pub fn value(&self) -> Result<serde_json::Value> {
        self.json()
    }
}

impl From<Bytes> for Payload {
    fn from(body: Bytes) -> Self {
        Self(body)
    }
}

impl From<&'static str> for Payload {
    fn from(body: &'static str) -> Self {
        Self(Bytes::from_static(body.as_bytes()))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(body: Vec<u8>) -> Self {
        Self(Bytes::from(body))
    }
}
