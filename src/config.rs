//! Loading default options from TOML.
//!
//! Only the closure-free options can be configured this way. The loaded
//! values become the ambient default layer of a cache:
//!
//! ```toml
//! [cache]
//! ttl_ms = 60000
//! background_fetch = true
//! retry_limit = 2
//! stop_refetch_delay_ms = 180000
//! evict_delay_ms = 1800000
//! invalidate_on_event = true
//!
//! [mutations]
//! background_fetch = false
//! ```

use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::types::{CacheOptions, MutationOptions};
use crate::{CacheError, Result};

/// Cache configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub cache: OptionsConfig,
    #[serde(default)]
    pub mutations: MutationsConfig,
}

/// Default entry options. Unset fields fall through to the built-in
/// defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptionsConfig {
    pub ttl_ms: Option<u64>,
    pub background_fetch: Option<bool>,
    pub retry_limit: Option<u32>,
    pub stop_refetch_delay_ms: Option<u64>,
    pub evict_delay_ms: Option<u64>,
    /// `true` invalidates on every external event, `false` never does.
    pub invalidate_on_event: Option<bool>,
}

/// Default mutation options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MutationsConfig {
    #[serde(default)]
    pub background_fetch: bool,
}

impl Config {
    /// Parse configuration from a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| CacheError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            CacheError::Config(format!("Failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            CacheError::Config(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    /// The ambient default layer described by `[cache]`.
    pub fn cache_options(&self) -> CacheOptions {
        self.cache.to_options()
    }

    pub fn mutation_options(&self) -> MutationOptions {
        MutationOptions::new().background_fetch(self.mutations.background_fetch)
    }
}

impl OptionsConfig {
    pub fn to_options(&self) -> CacheOptions {
        CacheOptions {
            ttl: self.ttl_ms.map(Duration::from_millis),
            background_fetch: self.background_fetch,
            retry_limit: self.retry_limit,
            stop_refetch_delay: self.stop_refetch_delay_ms.map(Duration::from_millis),
            evict_delay: self.evict_delay_ms.map(Duration::from_millis),
            should_notify: None,
            invalidation: self.invalidate_on_event.map(Into::into),
        }
    }
}
