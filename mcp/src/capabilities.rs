//! Per-session downstream capability tracking.
//!
//! The gateway advertises to upstream servers only what its own downstream
//! client can honor. Capabilities are captured when the downstream session
//! initializes and dropped when the session ends.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Capabilities a downstream client declared at initialize time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamCapabilities {
    pub sampling: bool,
    pub elicitation: bool,
}

/// Capability records keyed by downstream session id.
#[derive(Default)]
pub struct CapabilityStore {
    inner: DashMap<String, DownstreamCapabilities>,
}

impl CapabilityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, session_id: impl Into<String>, capabilities: DownstreamCapabilities) {
        self.inner.insert(session_id.into(), capabilities);
    }

    pub fn get(&self, session_id: &str) -> Option<DownstreamCapabilities> {
        self.inner.get(session_id).map(|entry| *entry.value())
    }

    /// Query a single capability by name. Unknown names and unknown sessions
    /// are both "not supported".
    pub fn supports(&self, session_id: &str, capability: &str) -> bool {
        let Some(caps) = self.get(session_id) else {
            return false;
        };
        match capability {
            "sampling" => caps.sampling,
            "elicitation" => caps.elicitation,
            _ => false,
        }
    }

    pub fn remove(&self, session_id: &str) {
        self.inner.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_query() {
        let store = CapabilityStore::new();
        store.store(
            "session-1",
            DownstreamCapabilities {
                sampling: true,
                elicitation: false,
            },
        );

        assert!(store.supports("session-1", "sampling"));
        assert!(!store.supports("session-1", "elicitation"));
        assert!(!store.supports("session-1", "roots"));
        assert!(!store.supports("session-2", "sampling"));
    }

    #[test]
    fn test_remove_on_session_end() {
        let store = CapabilityStore::new();
        store.store("session-1", DownstreamCapabilities::default());
        assert!(store.get("session-1").is_some());

        store.remove("session-1");
        assert!(store.get("session-1").is_none());
    }
}
