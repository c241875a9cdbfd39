//! Message identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for one staged message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a new random message ID.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let a = MessageId::new();
        let b = MessageId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn display_matches_inner() {
        let id = MessageId::from("msg-123");
        assert_eq!(id.to_string(), "msg-123");
        assert_eq!(id.as_str(), "msg-123");
    }

    #[test]
    fn serializes_transparently() {
        let id = MessageId::from("msg-456");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"msg-456\"");

        let back: MessageId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
