//! Typed access to process configuration.
//!
//! Service factories receive an [`Env`] instead of reading `std::env`
//! directly, so tests can inject configuration without mutating the process
//! environment and factories fail with a uniform, actionable message when a
//! variable is missing.

use anyhow::Context;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

/// Read-only view of the process configuration.
///
/// Cloning is cheap; all clones share the same underlying source.
#[derive(Clone)]
pub struct Env {
    source: Arc<EnvSource>,
}

enum EnvSource {
    Process,
    Map(HashMap<String, String>),
}

impl Env {
    /// An [`Env`] backed by the real process environment.
    pub fn process() -> Self {
        Env {
            source: Arc::new(EnvSource::Process),
        }
    }

    /// An [`Env`] backed by a fixed set of key/value pairs.
    ///
    /// Intended for tests and embedded setups.
    pub fn from_iter<K: ToString, V: ToString>(vars: impl IntoIterator<Item = (K, V)>) -> Self {
        Env {
            source: Arc::new(EnvSource::Map(
                vars.into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            )),
        }
    }

    fn lookup(&self, key: &str) -> Option<String> {
        match self.source.as_ref() {
            EnvSource::Process => std::env::var(key).ok(),
            EnvSource::Map(map) => map.get(key).cloned(),
        }
    }

    /// Reads a required variable.
    pub fn var(&self, key: &str) -> anyhow::Result<String> {
        self.lookup(key)
            .with_context(|| format!("Failed to read {key}. Please provide {key} in the environment"))
    }

    /// Reads an optional variable, falling back to the given default.
    pub fn var_or(&self, key: &str, default: impl ToString) -> String {
        self.lookup(key).unwrap_or_else(|| default.to_string())
    }

    /// Reads and parses a required variable.
    pub fn parsed<T>(&self, key: &str) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        self.var(key)?
            .parse::<T>()
            .with_context(|| format!("Failed to parse {key}"))
    }
}
