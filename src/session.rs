use std::fmt;

use uuid::Uuid;

/// Correlates every chat turn of one page load with the dialogue service's conversation
/// state. Created once, handed to the widgets, never rotated or persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionContext {
    id: String,
}

impl SessionContext {
    pub fn new() -> Self {
        let simple = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("user_{}", &simple[..12]),
        }
    }

    /// Rebuilds a context around an id that was handed out earlier.
    pub fn from_id(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}
