// src/tokens.rs
//! Opaque tokens handed to callers in place of dataset keys.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{WarpError, WarpResult};
use crate::key::DatasetKey;

/// Caller-held reference to a dataset key. Carries no pool state; the entry
/// behind it may be evicted and reopened any number of times.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(u64);

impl Token {
    pub const fn from_raw(raw: u64) -> Self {
        Token(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Issued tokens and the keys they stand for.
///
/// Values are never reused, so a surrendered token stays invalid for the
/// life of the table.
pub struct TokenTable {
    next: AtomicU64,
    map: RwLock<HashMap<Token, Arc<DatasetKey>>>,
}

impl Default for TokenTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenTable {
    pub fn new() -> Self {
        Self {
            // 0 stays unissued so callers can use it as "no token"
            next: AtomicU64::new(1),
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Register `key` and return a fresh token for it. Never touches the pool.
    pub fn issue(&self, key: DatasetKey) -> Token {
        let token = Token(self.next.fetch_add(1, Ordering::Relaxed));
        trace!(%token, %key, "token issued");
        self.map.write().insert(token, Arc::new(key));
        token
    }

    pub fn resolve(&self, token: Token) -> WarpResult<Arc<DatasetKey>> {
        self.map
            .read()
            .get(&token)
            .cloned()
            .ok_or(WarpError::InvalidToken(token.0))
    }

    pub fn surrender(&self, token: Token) -> WarpResult<Arc<DatasetKey>> {
        let key = self
            .map
            .write()
            .remove(&token)
            .ok_or(WarpError::InvalidToken(token.0))?;
        trace!(%token, key = %key, "token surrendered");
        Ok(key)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Drop every token. Returns how many were live.
    pub fn clear(&self) -> usize {
        let mut map = self.map.write();
        let n = map.len();
        map.clear();
        n
    }
}
