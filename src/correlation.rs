use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Opaque token linking a request to its eventual reply.
///
/// Carried in the AMQP `correlation_id` property. The server echoes it
/// back unchanged; only the calling client interprets it. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    /// Generate a new unique correlation ID (UUID v4, hyphenated).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string().into())
    }

    /// Borrow the correlation ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<Arc<str>> for CorrelationId {
    fn from(value: Arc<str>) -> Self {
        Self(value)
    }
}

impl Borrow<str> for CorrelationId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_unique() {
        // ---
        let ids: HashSet<CorrelationId> = (0..1000).map(|_| CorrelationId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_format() {
        // ---
        let id = CorrelationId::generate();
        assert_eq!(id.to_string().len(), 36); // Standard UUID format
        assert_eq!(id.as_str(), id.to_string());
    }

    #[test]
    fn test_lookup_by_str() {
        // ---
        let mut ids = HashSet::new();
        ids.insert(CorrelationId::from("abc"));
        assert!(ids.contains("abc"));
        assert!(!ids.contains("abd"));
    }
}
