//! Stable identity attached to every chainable.

use std::fmt;
use std::hash::{Hash, Hasher};

use uuid::Uuid;

/// Immutable identity for a processor or connector.
///
/// The UUID is generated at construction and never changes; it is how
/// external observers correlate schema nodes with runtime events. Equality
/// and hashing go by UUID, display goes by name.
#[derive(Debug, Clone)]
pub struct Identity {
    id: Uuid,
    name: String,
    description: Option<String>,
}

impl Identity {
    /// Create a new identity with a fresh UUID.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
        }
    }

    /// Attach a human-readable description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The stable UUID.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The short human name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The optional description.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
