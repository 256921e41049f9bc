use std::collections::HashMap;
use std::time::Instant;

use crate::{CorrelationId, Delivery};

/// Outcome of checking one pending call.
#[derive(Debug)]
pub(super) enum PollState {
    /// The reply arrived; the entry is gone.
    Ready(Delivery),
    /// Still waiting.
    Waiting,
    /// The deadline passed first; the entry is gone.
    Expired,
    /// No such call (never registered, or already finished).
    Unknown,
}

struct PendingCall {
    deadline: Option<Instant>,
    reply: Option<Delivery>,
}

/// Tracks calls waiting for replies.
///
/// Entries exist only for calls that want a result. A reply is filed under
/// its correlation id and stays there until the caller polls it.
pub(super) struct PendingCalls {
    // ---
    calls: HashMap<CorrelationId, PendingCall>,
}

impl PendingCalls {
    // ---
    pub fn new() -> Self {
        Self {
            calls: HashMap::new(),
        }
    }

    /// Start tracking a call. `None` waits forever.
    pub fn register(&mut self, correlation_id: CorrelationId, deadline: Option<Instant>) {
        // ---
        self.calls.insert(
            correlation_id,
            PendingCall {
                deadline,
                reply: None,
            },
        );
    }

    /// File a reply.
    ///
    /// Returns `false` for an id nobody waits on; the reply should be dropped.
    pub fn file(&mut self, correlation_id: &str, reply: Delivery) -> bool {
        // ---
        match self.calls.get_mut(correlation_id) {
            Some(call) if call.reply.is_none() => {
                call.reply = Some(reply);
                true
            }
            _ => false,
        }
    }

    /// Check on a call as of `now`.
    ///
    /// A reply that arrived wins over an elapsed deadline.
    pub fn poll(&mut self, correlation_id: &CorrelationId, now: Instant) -> PollState {
        // ---
        let Some(call) = self.calls.get_mut(correlation_id) else {
            return PollState::Unknown;
        };

        if let Some(reply) = call.reply.take() {
            self.calls.remove(correlation_id);
            return PollState::Ready(reply);
        }

        match call.deadline {
            Some(deadline) if now >= deadline => {
                self.calls.remove(correlation_id);
                PollState::Expired
            }
            _ => PollState::Waiting,
        }
    }

    /// Stop tracking a call. Returns whether it was tracked.
    pub fn remove(&mut self, correlation_id: &CorrelationId) -> bool {
        self.calls.remove(correlation_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::MessageProperties;
    use bytes::Bytes;
    use std::time::Duration;

    fn reply(body: &'static [u8]) -> Delivery {
        Delivery {
            delivery_tag: 1,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            properties: MessageProperties::default(),
            body: Bytes::from_static(body),
        }
    }

    #[test]
    fn test_register_file_and_poll() {
        // ---
        let mut pending = PendingCalls::new();
        let id = CorrelationId::generate();

        pending.register(id.clone(), None);
        assert_eq!(pending.len(), 1);
        assert!(matches!(pending.poll(&id, Instant::now()), PollState::Waiting));

        assert!(pending.file(id.as_str(), reply(b"ok")));
        match pending.poll(&id, Instant::now()) {
            PollState::Ready(d) => assert_eq!(&d.body[..], b"ok"),
            other => panic!("unexpected {other:?}"),
        }

        // Should be removed after completion
        assert_eq!(pending.len(), 0);
        assert!(matches!(pending.poll(&id, Instant::now()), PollState::Unknown));
    }

    #[test]
    fn test_deadline_expires_and_late_reply_dropped() {
        // ---
        let mut pending = PendingCalls::new();
        let id = CorrelationId::generate();
        let start = Instant::now();

        pending.register(id.clone(), Some(start + Duration::from_millis(100)));
        assert!(matches!(pending.poll(&id, start), PollState::Waiting));
        assert!(matches!(
            pending.poll(&id, start + Duration::from_millis(100)),
            PollState::Expired
        ));

        assert_eq!(pending.len(), 0);
        assert!(!pending.file(id.as_str(), reply(b"late")));
    }

    #[test]
    fn test_reply_beats_deadline() {
        // ---
        let mut pending = PendingCalls::new();
        let id = CorrelationId::generate();
        let start = Instant::now();

        pending.register(id.clone(), Some(start));
        pending.file(id.as_str(), reply(b"x"));
        assert!(matches!(pending.poll(&id, start + Duration::from_secs(1)), PollState::Ready(_)));
    }

    #[test]
    fn test_unknown_ids() {
        // ---
        let mut pending = PendingCalls::new();
        let id = CorrelationId::generate();

        assert!(!pending.file(id.as_str(), reply(b"x")));
        assert!(!pending.remove(&id));

        pending.register(id.clone(), None);
        assert!(pending.remove(&id));
        assert!(!pending.remove(&id));
    }
}
