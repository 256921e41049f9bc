//! Per-queue message dispatch.
//!
//! Each inbound delivery moves through
//! `received → resolved → decoded → executed → replied → acknowledged`.
//! Resolution and decoding happen on the server's consume loop; execution
//! and the two channel side effects (reply, ack) happen wherever the
//! handler runs, and reach the channel only through the [`Scheduler`].
//!
//! Every delivery is acknowledged exactly once, whatever happens to it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;

use crate::codec::{CodecPtr, CodecSet};
use crate::protocol::{extract_arguments, reply_message, ErrorFlag, KwargsFallback, HEADER_CONSUMER_NAME};
use crate::{
    // ---
    log_error,
    log_info,
    log_stage,
    log_warn,
    CallArgs,
    Delivery,
    Handler,
    Scheduler,
};

use super::pool::WorkerPool;
use super::registry::{Registry, DEFAULT_HANDLER};

/// Server-side record of one delivery being dispatched.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub delivery_tag: u64,
    /// Connection generation the delivery arrived on.
    pub generation: u64,
    pub reply_to: Option<Arc<str>>,
    pub correlation_id: Option<Arc<str>>,
    pub content_type: Option<Arc<str>>,
    /// Function name the caller asked for, as sent.
    pub requested: Option<String>,
}

impl InFlight {
    fn from_delivery(delivery: &Delivery, generation: u64) -> Self {
        // ---
        let props = &delivery.properties;
        Self {
            delivery_tag: delivery.delivery_tag,
            generation,
            reply_to: props.reply_to.clone(),
            correlation_id: props.correlation_id.clone(),
            content_type: props.content_type.clone(),
            requested: props.header(HEADER_CONSUMER_NAME).map(str::to_string),
        }
    }
}

/// A resolved delivery, ready to execute or to reject.
pub enum Prepared {
    /// No handler for the name, and no default handler.
    Unknown { inflight: InFlight },
    /// Handler found and arguments decoded.
    Ready {
        inflight: InFlight,
        handler: Arc<Handler>,
        args: CallArgs,
    },
}

/// Dispatches deliveries from one queue to that queue's handlers.
pub struct Dispatcher {
    queue: String,
    exchange: String,
    registry: Registry,
    codecs: CodecSet,
    fallback: KwargsFallback,
    scheduler: Scheduler,
}

impl Dispatcher {
    // ---
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        registry: Registry,
        codecs: CodecSet,
        fallback: KwargsFallback,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            registry,
            codecs,
            fallback,
            scheduler,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Handle one delivery: resolve and decode here, then execute on
    /// `pool` when given, inline otherwise.
    pub fn dispatch(self: &Arc<Self>, delivery: Delivery, generation: u64, pool: Option<&mut WorkerPool>) {
        // ---
        match self.prepare(&delivery, generation) {
            Prepared::Unknown { inflight } => self.reject_unknown(inflight),
            Prepared::Ready {
                inflight,
                handler,
                args,
            } => match pool {
                Some(pool) => {
                    let this = Arc::clone(self);
                    pool.submit(move || this.complete(inflight, &handler, args));
                }
                None => self.complete(inflight, &handler, args),
            },
        }
    }

    /// received → resolved → decoded.
    pub fn prepare(&self, delivery: &Delivery, generation: u64) -> Prepared {
        // ---
        let inflight = InFlight::from_delivery(delivery, generation);
        log_stage!(self.queue, inflight.delivery_tag, "received");

        let requested = inflight.requested.as_deref().unwrap_or(DEFAULT_HANDLER);
        log_info!("[{}] remote call on function '{requested}'", self.queue);

        let Some(handler) = self.registry.resolve(inflight.requested.as_deref()) else {
            return Prepared::Unknown { inflight };
        };
        log_stage!(self.queue, inflight.delivery_tag, "resolved");

        let codec = self.codecs.select(handler.json_args);
        let decoded = match codec.decode(&delivery.body) {
            Ok(value) => Some(value),
            Err(e) => {
                log_error!("[{}] load arguments failed: {e}", self.queue);
                None
            }
        };
        let args = extract_arguments(decoded, &delivery.body, self.fallback);
        log_stage!(self.queue, inflight.delivery_tag, "decoded");

        Prepared::Ready {
            inflight,
            handler,
            args,
        }
    }

    /// Reply `Function '<name>' not found.` (when a reply is wanted) and ack.
    pub fn reject_unknown(&self, inflight: InFlight) {
        // ---
        let requested = inflight.requested.as_deref().unwrap_or(DEFAULT_HANDLER);
        let msg = format!("Function '{requested}' not found.");
        log_info!("[{}] {msg}", self.queue);

        let codec = self.reply_codec(&inflight, self.codecs.binary());
        self.finish(&inflight, Value::String(msg), ErrorFlag::HasError, &codec);
    }

    /// executed → replied → acknowledged. Runs the handler on the calling
    /// thread.
    pub fn complete(&self, inflight: InFlight, handler: &Handler, args: CallArgs) {
        // ---
        let (result, flag) = self.execute(handler, args);
        log_stage!(self.queue, inflight.delivery_tag, "executed");

        let codec = self.reply_codec(&inflight, self.codecs.select(handler.json_args));
        self.finish(&inflight, result, flag, &codec);
    }

    /// Run a handler, turning errors and panics into an error result.
    fn execute(&self, handler: &Handler, args: CallArgs) -> (Value, ErrorFlag) {
        // ---
        let logged = args.clone();

        match catch_unwind(AssertUnwindSafe(|| handler.call(args))) {
            Ok(Ok(value)) => (value, ErrorFlag::NoError),
            Ok(Err(e)) => {
                log_error!(
                    "[{}] error calling handler '{}': {e}; args: {:?}, kwargs: {:?}",
                    self.queue,
                    handler.name,
                    logged.args,
                    logged.kwargs
                );
                (Value::String(e.to_string()), ErrorFlag::HasError)
            }
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                log_error!(
                    "[{}] handler '{}' panicked: {msg}; args: {:?}, kwargs: {:?}",
                    self.queue,
                    handler.name,
                    logged.args,
                    logged.kwargs
                );
                (Value::String(msg), ErrorFlag::HasError)
            }
        }
    }

    /// Answer in the caller's encoding when it named a known one.
    fn reply_codec(&self, inflight: &InFlight, fallback: &CodecPtr) -> CodecPtr {
        // ---
        inflight
            .content_type
            .as_deref()
            .and_then(|ct| self.codecs.by_content_type(ct))
            .unwrap_or(fallback)
            .clone()
    }

    /// Schedule the reply (if a reply address was given), then the ack.
    fn finish(&self, inflight: &InFlight, result: Value, flag: ErrorFlag, codec: &CodecPtr) {
        // ---
        if let Some(reply_to) = inflight.reply_to.as_deref() {
            let msg = reply_message(
                &self.exchange,
                reply_to,
                inflight.correlation_id.clone(),
                &result,
                flag,
                codec.as_ref(),
            )
            .or_else(|e| {
                log_error!("[{}] encoding reply failed: {e}", self.queue);
                reply_message(
                    &self.exchange,
                    reply_to,
                    inflight.correlation_id.clone(),
                    &Value::String(e.to_string()),
                    ErrorFlag::HasError,
                    codec.as_ref(),
                )
            });

            match msg.and_then(|m| self.scheduler.publish(m)) {
                Ok(()) => log_stage!(self.queue, inflight.delivery_tag, "replied"),
                Err(e) => log_error!("[{}] reply not scheduled: {e}", self.queue),
            }
        }

        match self.scheduler.ack(inflight.delivery_tag, inflight.generation) {
            Ok(()) => log_stage!(self.queue, inflight.delivery_tag, "acknowledged"),
            Err(e) => log_warn!("[{}] ack not scheduled: {e}", self.queue),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    // ---
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
