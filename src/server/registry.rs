use std::collections::HashMap;
use std::sync::Arc;

use crate::log_warn;

use super::handler::Handler;

/// Name under which a catch-all handler is registered.
pub const DEFAULT_HANDLER: &str = "default";

/// Name → handler map for one queue. Built at startup, read-only after.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    handlers: HashMap<String, Arc<Handler>>,
    order: Vec<String>,
}

impl Registry {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler`. A name already present keeps its first handler;
    /// returns `false` in that case.
    pub fn insert(&mut self, handler: Handler) -> bool {
        // ---
        if self.handlers.contains_key(&handler.name) {
            log_warn!("duplicate handler '{}' ignored", handler.name);
            return false;
        }

        self.order.push(handler.name.clone());
        self.handlers.insert(handler.name.clone(), Arc::new(handler));
        true
    }

    /// Look up the handler for a requested name.
    ///
    /// An absent or unknown name falls back to [`DEFAULT_HANDLER`].
    pub fn resolve(&self, name: Option<&str>) -> Option<Arc<Handler>> {
        // ---
        name.and_then(|n| self.handlers.get(n))
            .or_else(|| self.handlers.get(DEFAULT_HANDLER))
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Handler names in registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Handlers in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Handler>> {
        self.order.iter().filter_map(|name| self.handlers.get(name))
    }
}
