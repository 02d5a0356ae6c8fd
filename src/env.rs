//! Per-request environment overlay.
//!
//! A request may carry an `env` map that overrides process environment
//! variables for that request only. The snapshot is a plain value threaded
//! through the adapter call stack; handlers never mutate the process
//! environment.

use std::collections::HashMap;

/// Immutable view over the process environment plus per-request overrides.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    overrides: HashMap<String, String>,
}

impl EnvSnapshot {
    /// Snapshot with no overrides; reads fall through to the process env.
    pub fn process() -> Self {
        Self::default()
    }

    /// Snapshot with request-scoped overrides layered on top.
    pub fn with_overrides(overrides: HashMap<String, String>) -> Self {
        Self { overrides }
    }

    /// Look up a variable, override first, process env second.
    pub fn get(&self, key: &str) -> Option<String> {
        self.overrides
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
    }

    /// Look up a variable that must be present.
    pub fn require(&self, key: &str) -> Result<String, crate::error::AgentError> {
        self.get(key)
            .ok_or_else(|| crate::error::AgentError::Config(format!("missing env var {key}")))
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_over_process_env() {
        let mut map = HashMap::new();
        map.insert("DESKPILOT_TEST_KEY".to_string(), "override".to_string());
        let snap = EnvSnapshot::with_overrides(map);
        assert_eq!(snap.get("DESKPILOT_TEST_KEY").as_deref(), Some("override"));
        // A key absent from both layers is None
        assert!(snap.get("DESKPILOT_TEST_KEY_ABSENT").is_none());
    }

    #[test]
    fn require_reports_missing_key() {
        let snap = EnvSnapshot::process();
        let err = snap.require("DESKPILOT_TEST_KEY_ABSENT").unwrap_err();
        assert!(err.to_string().contains("DESKPILOT_TEST_KEY_ABSENT"));
    }
}
