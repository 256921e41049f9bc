//! Payload codecs.
//!
//! The RPC core never looks inside a payload beyond the `{args, kwargs}`
//! envelope, so all it needs is an encode/decode pair between bytes and a
//! dynamic [`serde_json::Value`]. Two codecs ship with the crate:
//!
//! - [`MsgPackCodec`] - compact binary object encoding (the default)
//! - [`JsonCodec`]    - UTF-8 JSON, for handlers that declare JSON arguments
//!
//! Applications can inject their own by implementing [`PayloadCodec`].

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use crate::{Result, RpcError};

/// Content type advertised for [`MsgPackCodec`] payloads.
pub const CONTENT_TYPE_MSGPACK: &str = "application/msgpack";

/// Content type advertised for [`JsonCodec`] payloads.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// An injectable encode/decode pair for message bodies.
pub trait PayloadCodec: Send + Sync {
    /// MIME type written to the `content_type` message property.
    fn content_type(&self) -> &str;

    /// Encode a value into a message body.
    fn encode(&self, value: &Value) -> Result<Bytes>;

    /// Decode a message body into a value.
    fn decode(&self, body: &[u8]) -> Result<Value>;
}

/// Shared codec pointer.
pub type CodecPtr = Arc<dyn PayloadCodec>;

/// Binary object codec backed by MessagePack.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl PayloadCodec for MsgPackCodec {
    fn content_type(&self) -> &str {
        CONTENT_TYPE_MSGPACK
    }

    fn encode(&self, value: &Value) -> Result<Bytes> {
        // Named (map) encoding keeps objects as maps on the wire.
        rmp_serde::to_vec_named(value)
            .map(Bytes::from)
            .map_err(|e| RpcError::Codec(format!("msgpack encode failed: {e}")))
    }

    fn decode(&self, body: &[u8]) -> Result<Value> {
        rmp_serde::from_slice(body)
            .map_err(|e| RpcError::Codec(format!("msgpack decode failed: {e}")))
    }
}

/// JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn content_type(&self) -> &str {
        CONTENT_TYPE_JSON
    }

    fn encode(&self, value: &Value) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode(&self, body: &[u8]) -> Result<Value> {
        serde_json::from_slice(body).map_err(|e| RpcError::Codec(format!("json decode failed: {e}")))
    }
}

/// The binary and JSON codecs a server or client can choose between.
///
/// Lookup by content type lets a peer answer in the encoding the caller
/// used, regardless of which codec a handler declares for its arguments.
#[derive(Clone)]
pub struct CodecSet {
    binary: CodecPtr,
    json: CodecPtr,
}

impl CodecSet {
    /// Build a set from explicit codecs.
    pub fn new(binary: CodecPtr, json: CodecPtr) -> Self {
        Self { binary, json }
    }

    /// The binary object codec.
    pub fn binary(&self) -> &CodecPtr {
        &self.binary
    }

    /// The JSON codec.
    pub fn json(&self) -> &CodecPtr {
        &self.json
    }

    /// Pick the JSON codec when `json` is set, the binary one otherwise.
    pub fn select(&self, json: bool) -> &CodecPtr {
        if json {
            &self.json
        } else {
            &self.binary
        }
    }

    /// Find the codec advertising `content_type`, if any.
    pub fn by_content_type(&self, content_type: &str) -> Option<&CodecPtr> {
        // ---
        if content_type == self.binary.content_type() {
            Some(&self.binary)
        } else if content_type == self.json.content_type() {
            Some(&self.json)
        } else {
            None
        }
    }
}

impl Default for CodecSet {
    fn default() -> Self {
        Self::new(Arc::new(MsgPackCodec), Arc::new(JsonCodec))
    }
}

impl std::fmt::Debug for CodecSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecSet")
            .field("binary", &self.binary.content_type())
            .field("json", &self.json.content_type())
            .finish()
    }
}
