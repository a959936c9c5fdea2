// src/context.rs
//! A self-contained pool instance: configuration, backend, token table, pool
//! and retry state. Typed operations live in [`crate::ops`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::{NativeResult, RasterBackend, RasterDataset};
use crate::buffer;
use crate::config::PoolConfig;
use crate::dispatch::Dispatcher;
use crate::error::{WarpError, WarpResult};
use crate::key::DatasetKey;
use crate::retry::{Attempted, Attempts};
use crate::tokens::Token;

pub struct WarpContext {
    config: PoolConfig,
    backend: Arc<dyn RasterBackend>,
    dispatcher: Dispatcher,
    shut_down: AtomicBool,
}

impl WarpContext {
    pub fn new(config: PoolConfig, backend: Arc<dyn RasterBackend>) -> WarpResult<Self> {
        config.validate()?;
        for (key, value) in &config.options {
            backend
                .set_option(key, Some(value.as_str()))
                .map_err(|e| WarpError::InitializationFailure(format!("{key}: {e}")))?;
        }
        info!(
            capacity = config.capacity,
            attempts = config.default_attempts,
            copies = config.copies,
            backend = %backend.version(),
            "warp pool ready"
        );
        let dispatcher = Dispatcher::new(
            config.capacity,
            config.livelock_threshold,
            Arc::clone(&backend),
        )
        .with_copies(config.copies);
        Ok(Self {
            config,
            backend,
            dispatcher,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn default_attempts(&self) -> Attempts {
        self.config.attempts()
    }

    fn ensure_live(&self) -> WarpResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(WarpError::NotInitialized)
        } else {
            Ok(())
        }
    }

    /// Issue a token for `uri` opened with `options`. Nothing is opened yet.
    pub fn get_token<U, I, S>(&self, uri: U, options: I) -> WarpResult<Token>
    where
        U: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.token_for(DatasetKey::new(uri, options))
    }

    pub fn token_for(&self, key: DatasetKey) -> WarpResult<Token> {
        self.ensure_live()?;
        Ok(self.dispatcher.tokens().issue(key))
    }

    /// Retire `token`. The pool entry stays until it is evicted.
    pub fn surrender_token(&self, token: Token) -> WarpResult<()> {
        self.ensure_live()?;
        let key = self.dispatcher.tokens().surrender(token)?;
        debug!(%token, key = %key, "token surrendered");
        Ok(())
    }

    pub fn set_option(&self, key: &str, value: Option<&str>) -> WarpResult<()> {
        self.ensure_live()?;
        self.backend.set_option(key, value)?;
        Ok(())
    }

    pub fn version(&self) -> String {
        self.backend.version()
    }

    pub fn version_into(&self, out: &mut [u8]) -> WarpResult<usize> {
        buffer::write_str(out, &self.backend.version())
    }

    /// Run an arbitrary operation against the dataset behind `token`.
    pub fn execute<T>(
        &self,
        token: Token,
        attempts: Attempts,
        op: impl FnMut(&dyn RasterDataset) -> NativeResult<T>,
    ) -> WarpResult<Attempted<T>> {
        self.ensure_live()?;
        self.dispatcher.execute(token, attempts, op)
    }

    /// Close every dataset and forget every token. Later calls fail with
    /// `NotInitialized`.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let closed = self.dispatcher.pool().clear(true);
        let tokens = self.dispatcher.tokens().clear();
        info!(closed, tokens, "warp pool shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.dispatcher.pool().capacity()
    }

    /// Datasets currently open. Never exceeds [`capacity`](Self::capacity).
    pub fn open_entries(&self) -> usize {
        self.dispatcher.pool().open_count()
    }

    /// Entries held by the pool, opened or not.
    pub fn pooled_entries(&self) -> usize {
        self.dispatcher.pool().len()
    }

    /// Entries held for `key`.
    pub fn copies_of(&self, key: &DatasetKey) -> usize {
        self.dispatcher.pool().copies(key)
    }

    pub fn live_tokens(&self) -> usize {
        self.dispatcher.tokens().len()
    }

    pub fn generation(&self, key: &DatasetKey) -> Option<u64> {
        self.dispatcher.pool().generation(key)
    }

    pub fn is_open(&self, key: &DatasetKey) -> bool {
        self.dispatcher.pool().is_open(key)
    }

    /// Close the least recently used idle entry, if any.
    pub fn evict_idle(&self) -> Option<DatasetKey> {
        self.dispatcher.pool().evict_idle()
    }
}
