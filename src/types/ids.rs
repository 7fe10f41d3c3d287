//! Strongly-typed identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Dense, 0-based service identifier.
///
/// Assigned at registration time and used as the index of the service in
/// every container built from the same catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(usize);

impl ServiceId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one container instance (UUID v4), used in tracing fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn from_string(s: String) -> Result<Self, &'static str> {
        if s.is_empty() {
            return Err("ContainerId cannot be empty");
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ContainerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_id_serializes_as_number() {
        let json = serde_json::to_string(&ServiceId::new(3)).unwrap();
        assert_eq!(json, "3");
    }

    #[test]
    fn test_container_id_rejects_empty() {
        assert!(ContainerId::from_string(String::new()).is_err());
        assert_ne!(ContainerId::new(), ContainerId::new());
    }
}
