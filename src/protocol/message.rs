use std::sync::Arc;

use serde_json::Value;

use crate::codec::PayloadCodec;
use crate::{CallArgs, CorrelationId, Headers, MessageProperties, OutboundMessage, Result};

/// Request header naming the remote function.
pub const HEADER_CONSUMER_NAME: &str = "consumer_name";

/// Reply header telling a result from a remote error.
pub const HEADER_ERROR_FLAG: &str = "error_flag";

/// Value of the [`HEADER_ERROR_FLAG`] header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFlag {
    NoError,
    HasError,
}

impl ErrorFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoError => "no-error",
            Self::HasError => "has-error",
        }
    }

    /// Read the flag from a header value. Anything but `has-error` is a
    /// normal result.
    pub fn from_header(value: Option<&str>) -> Self {
        match value {
            Some("has-error") => Self::HasError,
            _ => Self::NoError,
        }
    }

    pub fn is_error(self) -> bool {
        self == Self::HasError
    }
}

/// Build the message for a call to `function`.
pub fn request_message(
    exchange: &str,
    routing_key: &str,
    function: &str,
    args: &CallArgs,
    codec: &dyn PayloadCodec,
    correlation_id: &CorrelationId,
    reply_to: Option<&str>,
) -> Result<OutboundMessage> {
    // ---
    let body = codec.encode(&serde_json::to_value(args)?)?;

    let mut headers = Headers::new();
    headers.insert(HEADER_CONSUMER_NAME.to_string(), function.to_string());

    Ok(OutboundMessage {
        exchange: exchange.to_string(),
        routing_key: routing_key.to_string(),
        properties: MessageProperties {
            correlation_id: Some(Arc::from(correlation_id.as_str())),
            reply_to: reply_to.map(Arc::from),
            headers,
            content_type: Some(Arc::from(codec.content_type())),
        },
        body,
    })
}

/// Build the reply to a request, routed to `reply_to` on `exchange`.
pub fn reply_message(
    exchange: &str,
    reply_to: &str,
    correlation_id: Option<Arc<str>>,
    result: &Value,
    flag: ErrorFlag,
    codec: &dyn PayloadCodec,
) -> Result<OutboundMessage> {
    // ---
    let mut headers = Headers::new();
    headers.insert(HEADER_ERROR_FLAG.to_string(), flag.as_str().to_string());

    Ok(OutboundMessage {
        exchange: exchange.to_string(),
        routing_key: reply_to.to_string(),
        properties: MessageProperties {
            correlation_id,
            reply_to: None,
            headers,
            content_type: Some(Arc::from(codec.content_type())),
        },
        body: codec.encode(result)?,
    })
}
