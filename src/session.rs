//! The session contract.
//!
//! The consumer treats the user's session as a plain string key/value store
//! with three operations. Serialization of anything richer (such as the
//! discovery manager) is handled by the facade, not the session.

use std::collections::HashMap;

/// A per-user session shared between the `begin` and `complete` phases.
pub trait Session {
    /// Look up the value stored under `key`.
    fn get(&self, key: &str) -> Option<String>;

    /// Store `value` under `key`, replacing any prior value.
    fn set(&mut self, key: &str, value: String);

    /// Remove the value stored under `key`, if any.
    fn del(&mut self, key: &str);
}

/// A baseline in-memory [`Session`] backed by a [`HashMap`].
#[derive(Clone, Debug, Default)]
pub struct MemorySession {
    values: HashMap<String, String>,
}

impl MemorySession {
    /// Create an empty session.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Session for MemorySession {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) {
        self.values.insert(key.to_string(), value);
    }

    fn del(&mut self, key: &str) {
        self.values.remove(key);
    }
}
