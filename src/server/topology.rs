//! Queue planning.
//!
//! Turns the registered handlers into the queues a server declares. Pure:
//! nothing here touches the broker, so a bad layout fails before any
//! declaration happens.

use crate::{Result, RpcError};

use super::handler::Handler;
use super::registry::Registry;

/// One queue to declare, bind, and consume.
#[derive(Debug, Clone)]
pub struct QueuePlan {
    pub name: String,
    /// At most one handler may live on this queue.
    pub exclusive: bool,
    pub registry: Registry,
}

/// Assign handlers to queues.
///
/// The default queue always comes first, even with no handler. Every
/// distinct explicit queue follows in first-reference order. A queue is
/// exclusive when any of its handlers is; an exclusive queue holding more
/// than one handler is a configuration error, whatever the registration
/// order.
pub fn plan_queues(default_queue: &str, handlers: &[Handler]) -> Result<Vec<QueuePlan>> {
    // ---
    let mut plans = vec![QueuePlan {
        name: default_queue.to_string(),
        exclusive: false,
        registry: Registry::new(),
    }];

    for handler in handlers {
        let queue = handler.queue.as_deref().unwrap_or(default_queue);

        let idx = match plans.iter().position(|p| p.name == queue) {
            Some(idx) => idx,
            None => {
                plans.push(QueuePlan {
                    name: queue.to_string(),
                    exclusive: false,
                    registry: Registry::new(),
                });
                plans.len() - 1
            }
        };

        let plan = &mut plans[idx];
        plan.exclusive |= handler.exclusive;
        plan.registry.insert(handler.clone());
    }

    for plan in &plans {
        if plan.exclusive && plan.registry.len() > 1 {
            let names = plan.registry.names().join(", ");
            return Err(RpcError::config(format!(
                "queue '{}' is exclusive but has {} handlers: {names}",
                plan.name,
                plan.registry.len()
            )));
        }
    }

    Ok(plans)
}
