//! Typed identifiers for engine entities.
//!
//! Every cross-entity reference is an id; traversal is a registry lookup,
//! never pointer chasing.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a registered project.
    ProjectId
);
uuid_id!(
    /// Identifier of a backlog story.
    StoryId
);
uuid_id!(
    /// Identifier of a sprint.
    SprintId
);
uuid_id!(
    /// Identifier of a TDD cycle.
    CycleId
);
uuid_id!(
    /// Correlation id joining a command ack with the events it caused.
    CorrelationId
);

/// Identifier of a shared resource, e.g. `service:ci-runner` or `port:8443`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId(pub String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(ProjectId::new(), ProjectId::new());
        assert_ne!(CycleId::new(), CycleId::new());
    }

    #[test]
    fn test_id_serde_roundtrip() {
        let id = StoryId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: StoryId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn test_resource_id_display() {
        let id = ResourceId::new("service:ci-runner");
        assert_eq!(id.to_string(), "service:ci-runner");
    }
}
