// src/config.rs
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{WarpError, WarpResult};
use crate::retry::Attempts;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct PoolConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_attempts")]
    pub default_attempts: u32,
    #[serde(default = "default_livelock_threshold")]
    pub livelock_threshold: u32,
    #[serde(default = "default_scratch_capacity")]
    pub scratch_capacity: usize,
    /// Entries kept per dataset so calls on one dataset can run in parallel.
    #[serde(default = "default_copies")]
    pub copies: usize,
    /// Library options applied when a context is created.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

fn default_capacity() -> usize {
    64
}

fn default_attempts() -> u32 {
    8
}

fn default_livelock_threshold() -> u32 {
    32
}

fn default_scratch_capacity() -> usize {
    4096
}

fn default_copies() -> usize {
    1
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            default_attempts: default_attempts(),
            livelock_threshold: default_livelock_threshold(),
            scratch_capacity: default_scratch_capacity(),
            copies: default_copies(),
            options: BTreeMap::new(),
        }
    }
}

impl PoolConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> WarpResult<Self> {
        serde_json::from_str(json).map_err(|e| WarpError::Config(e.to_string()))
    }

    pub fn from_json_file(path: &Path) -> WarpResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| WarpError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&content)
    }

    /// Apply `WARP_POOL_CAPACITY`, `WARP_POOL_ATTEMPTS`, `WARP_POOL_COPIES`
    /// and `WARP_POOL_LIVELOCK_THRESHOLD` if set.
    pub fn with_env_overrides(self) -> WarpResult<Self> {
        self.with_overrides(|name| env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> WarpResult<Self> {
        if let Some(v) = parse_var(&lookup, "WARP_POOL_CAPACITY")? {
            self.capacity = v;
        }
        if let Some(v) = parse_var(&lookup, "WARP_POOL_ATTEMPTS")? {
            self.default_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "WARP_POOL_COPIES")? {
            self.copies = v;
        }
        if let Some(v) = parse_var(&lookup, "WARP_POOL_LIVELOCK_THRESHOLD")? {
            self.livelock_threshold = v;
        }
        Ok(self)
    }

    pub fn validate(&self) -> WarpResult<()> {
        if self.capacity == 0 {
            return Err(WarpError::Config("capacity must be at least 1".into()));
        }
        if self.default_attempts == 0 {
            return Err(WarpError::Config("default_attempts must be at least 1".into()));
        }
        if self.copies == 0 {
            return Err(WarpError::Config("copies must be at least 1".into()));
        }
        if self.livelock_threshold == 0 {
            return Err(WarpError::Config("livelock_threshold must be at least 1".into()));
        }
        Ok(())
    }

    pub fn attempts(&self) -> Attempts {
        Attempts::bounded(self.default_attempts)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> WarpResult<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| WarpError::Config(format!("{name}: cannot parse `{raw}'"))),
    }
}
