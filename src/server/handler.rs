use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Error type handlers return. Only its `Display` form reaches the caller.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// What a handler produces.
pub type HandlerResult = std::result::Result<Value, BoxError>;

/// Type-erased handler function.
///
/// Handlers are synchronous. Event-driven servers run them on blocking
/// worker threads; blocking-mode servers run them inline on the server's
/// run-loop task, which stalls that task until the handler returns.
pub type HandlerFn = Arc<dyn Fn(CallArgs) -> HandlerResult + Send + Sync>;

/// Positional and named arguments of one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a named argument.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Positional argument `i`, if present.
    pub fn get(&self, i: usize) -> Option<&Value> {
        self.args.get(i)
    }

    /// Named argument `name`, if present.
    pub fn named(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }
}

/// A named remote function.
///
/// Immutable once registered.
#[derive(Clone)]
pub struct Handler {
    pub(crate) name: String,
    pub(crate) queue: Option<String>,
    pub(crate) exclusive: bool,
    pub(crate) json_args: bool,
    pub(crate) func: HandlerFn,
}

impl Handler {
    // ---
    /// Create a handler on the default queue, with binary-encoded arguments.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(CallArgs) -> HandlerResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            queue: None,
            exclusive: false,
            json_args: false,
            func: Arc::new(func),
        }
    }

    /// Pin the handler to a named queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Require the handler's queue to carry no other handler.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Arguments arrive JSON-encoded.
    pub fn json_args(mut self) -> Self {
        self.json_args = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_name(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn uses_json(&self) -> bool {
        self.json_args
    }

    /// Run the handler.
    pub fn call(&self, args: CallArgs) -> HandlerResult {
        (self.func)(args)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("exclusive", &self.exclusive)
            .field("json_args", &self.json_args)
            .finish_non_exhaustive()
    }
}

/// Supplies the handlers a server registers at startup.
pub trait HandlerSource {
    fn handlers(&self) -> Vec<Handler>;
}

impl HandlerSource for Vec<Handler> {
    fn handlers(&self) -> Vec<Handler> {
        self.clone()
    }
}

impl HandlerSource for [Handler] {
    fn handlers(&self) -> Vec<Handler> {
        self.to_vec()
    }
}
