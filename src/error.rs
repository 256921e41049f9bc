use thiserror::Error;

/// Errors that can occur during RPC operations.
///
/// Only client-visible and setup-time failures appear here. Failures that
/// happen while a server dispatches a message (unknown function, handler
/// error, handler panic) are converted into error replies and never
/// surface as `RpcError` on the server side.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Invalid setup or call parameters (exclusive queue conflict,
    /// malformed timeout, bad URI, invalid certificate, ...).
    ///
    /// Raised synchronously; never sent over the wire.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No reply arrived before the call deadline.
    #[error("calling remote function '{function}' timed out")]
    Timeout { function: String },

    /// The remote handler failed; carries the remote-provided message verbatim.
    #[error("remote function error: {0}")]
    RemoteFunction(String),

    /// A broker primitive (declare, bind, publish, consume, ack) failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The broker connection closed and could not be recovered.
    #[error("broker connection lost")]
    ConnectionLost,

    /// Payload encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// JSON conversion of a value failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RpcError {
    // ---
    /// Shorthand for a [`RpcError::Configuration`] error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Shorthand for a [`RpcError::Transport`] error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;
