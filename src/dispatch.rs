// src/dispatch.rs
//! Resolves a token, claims and locks one of its pool entries and runs one
//! native operation on it, retrying through reopen when the handle goes bad.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::backend::{NativeResult, RasterBackend, RasterDataset};
use crate::error::{NativeError, WarpError, WarpResult};
use crate::key::DatasetKey;
use crate::pool::HandlePool;
use crate::retry::{Attempted, Attempts, Retrier, Step};
use crate::tokens::{Token, TokenTable};

pub struct Dispatcher {
    pub(crate) tokens: TokenTable,
    pub(crate) pool: HandlePool,
    retrier: Retrier,
    copies: usize,
}

impl Dispatcher {
    pub fn new(capacity: usize, livelock_threshold: u32, backend: Arc<dyn RasterBackend>) -> Self {
        Self {
            tokens: TokenTable::new(),
            pool: HandlePool::new(capacity, backend),
            retrier: Retrier::new(livelock_threshold),
            copies: 1,
        }
    }

    /// Keep up to `copies` entries per key so calls on one dataset can run
    /// in parallel.
    pub fn with_copies(mut self, copies: usize) -> Self {
        self.copies = copies.max(1);
        self
    }

    pub fn copies(&self) -> usize {
        self.copies
    }

    pub fn tokens(&self) -> &TokenTable {
        &self.tokens
    }

    pub fn pool(&self) -> &HandlePool {
        &self.pool
    }

    /// Run `op` against the dataset behind `token`.
    ///
    /// `op` may run more than once; every run sees a freshly validated handle
    /// and holds the entry lock for its whole duration.
    #[instrument(level = "trace", skip(self, op))]
    pub fn execute<T>(
        &self,
        token: Token,
        attempts: Attempts,
        mut op: impl FnMut(&dyn RasterDataset) -> NativeResult<T>,
    ) -> WarpResult<Attempted<T>> {
        let key = self.tokens.resolve(token)?;
        self.retrier.run(attempts, |attempt| self.try_once(&key, attempt, &mut op))
    }

    fn try_once<T>(
        &self,
        key: &DatasetKey,
        attempt: u32,
        op: &mut impl FnMut(&dyn RasterDataset) -> NativeResult<T>,
    ) -> Step<T> {
        let claims = match self.pool.acquire(key, self.copies) {
            Ok(claims) => claims,
            Err(err @ WarpError::ResourceExhausted { .. }) => return Step::Busy(err),
            Err(err) => return Step::Fail(err),
        };

        // an open copy nobody is using, then any free copy, else wait for the first
        let free = |open_only: bool| {
            claims
                .iter()
                .filter(|c| !open_only || c.is_open())
                .find_map(|c| c.try_lock().map(|l| (c, l)))
        };
        let (entry, result) = {
            let (entry, mut lock) = match free(true).or_else(|| free(false)) {
                Some(found) => found,
                None => match claims.first() {
                    Some(first) => (first, first.lock()),
                    None => {
                        return Step::Busy(WarpError::ResourceExhausted {
                            capacity: self.pool.capacity(),
                        })
                    }
                },
            };
            let result = self.pool.dataset(&mut lock).and_then(|dataset| op(dataset));
            (entry, result)
        };

        match result {
            Ok(value) => Step::Done(value),
            Err(err @ NativeError::Transient { .. }) => {
                debug!(%key, attempt, error = %err, "invalidating after transient failure");
                self.pool.invalidate(entry);
                Step::Reopen(err)
            }
            Err(NativeError::Permanent { code, message }) => {
                Step::Fail(WarpError::Permanent { code, message })
            }
        }
    }
}
