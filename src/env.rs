//! Explicit environment value threaded through the API.
//!
//! Time and environment-variable access go through an [`Environment`] so
//! tests can inject deterministic values instead of patching globals. The
//! recognized variables are `GIT_DIR`, `GIT_SSH`, `GIT_SSH_COMMAND`,
//! `GIT_PROTOCOL`, and `GIT_TERMINAL_PROMPT`; all are optional.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock time and environment variables.
#[derive(Clone, Debug)]
pub struct Environment {
    overrides: HashMap<String, String>,
    fixed_time: Option<i64>,
    read_process_env: bool,
}

impl Default for Environment {
    fn default() -> Self {
        Self::system()
    }
}

impl Environment {
    /// Environment backed by the real process environment and clock.
    #[must_use]
    pub fn system() -> Self {
        Self {
            overrides: HashMap::new(),
            fixed_time: None,
            read_process_env: true,
        }
    }

    /// Deterministic environment for tests: no process variables, a fixed
    /// epoch-seconds clock.
    #[must_use]
    pub fn fixed(now_epoch_seconds: i64) -> Self {
        Self {
            overrides: HashMap::new(),
            fixed_time: Some(now_epoch_seconds),
            read_process_env: false,
        }
    }

    /// Overrides a variable regardless of the process environment.
    #[must_use]
    pub fn with_var(mut self, name: &str, value: &str) -> Self {
        self.overrides.insert(name.to_owned(), value.to_owned());
        self
    }

    /// Looks up a variable: overrides first, then (when enabled) the
    /// process environment.
    #[must_use]
    pub fn var(&self, name: &str) -> Option<String> {
        if let Some(value) = self.overrides.get(name) {
            return Some(value.clone());
        }
        if self.read_process_env {
            return std::env::var(name).ok();
        }
        None
    }

    /// Seconds since the Unix epoch.
    #[must_use]
    pub fn now_epoch_seconds(&self) -> i64 {
        if let Some(fixed) = self.fixed_time {
            return fixed;
        }
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_environment_is_deterministic() {
        let env = Environment::fixed(1_700_000_000).with_var("GIT_DIR", "/tmp/x");
        assert_eq!(env.now_epoch_seconds(), 1_700_000_000);
        assert_eq!(env.var("GIT_DIR").as_deref(), Some("/tmp/x"));
        assert_eq!(env.var("PATH"), None);
    }

    #[test]
    fn override_beats_process_env() {
        let env = Environment::system().with_var("GIT_PROTOCOL", "version=2");
        assert_eq!(env.var("GIT_PROTOCOL").as_deref(), Some("version=2"));
    }
}
