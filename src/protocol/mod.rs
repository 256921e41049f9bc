//! Wire format shared by client and server.
//!
//! A request body is the codec-encoded mapping `{"args": [...], "kwargs":
//! {...}}`. Requests name their target in the `consumer_name` header;
//! replies carry the `error_flag` header.
mod arguments;
mod message;

pub use arguments::{extract_arguments, KwargsFallback};
pub use message::{
    // ---
    request_message,
    reply_message,
    ErrorFlag,
    HEADER_CONSUMER_NAME,
    HEADER_ERROR_FLAG,
};
