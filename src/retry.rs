// src/retry.rs
//! Bounded retry loop around dispatch attempts.

use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{NativeError, WarpError, WarpResult};

/// How many tries an operation gets. Zero means no bound.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attempts(u32);

impl Attempts {
    pub const UNBOUNDED: Attempts = Attempts(0);

    pub fn bounded(n: u32) -> Self {
        Attempts(n.max(1))
    }

    /// Non-positive values mean unbounded.
    pub fn from_raw(raw: i32) -> Self {
        if raw <= 0 {
            Attempts::UNBOUNDED
        } else {
            Attempts(raw as u32)
        }
    }

    pub fn is_unbounded(self) -> bool {
        self.0 == 0
    }

    pub fn limit(self) -> Option<u32> {
        (self.0 != 0).then_some(self.0)
    }

    fn allows(self, tried: u32) -> bool {
        self.0 == 0 || tried < self.0
    }
}

impl Default for Attempts {
    fn default() -> Self {
        Attempts(8)
    }
}

/// A result together with the number of tries it took.
#[derive(Clone, Debug, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

impl<T> Attempted<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Attempted<U> {
        Attempted {
            value: f(self.value),
            attempts: self.attempts,
        }
    }

    pub fn try_map<U>(self, f: impl FnOnce(T) -> WarpResult<U>) -> WarpResult<Attempted<U>> {
        Ok(Attempted {
            value: f(self.value)?,
            attempts: self.attempts,
        })
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Flat integer form of a result: the attempt count on success, the error's
/// negative code otherwise.
pub fn return_code<T>(result: &WarpResult<Attempted<T>>) -> i32 {
    match result {
        Ok(done) => i32::try_from(done.attempts).unwrap_or(i32::MAX),
        Err(err) => err.code(),
    }
}

/// Outcome of a single try.
pub enum Step<T> {
    Done(T),
    /// A native call failed transiently and the entry has been invalidated.
    Reopen(NativeError),
    /// No pool entry could be made available.
    Busy(WarpError),
    Fail(WarpError),
}

enum LastFailure {
    Nothing,
    Native(NativeError),
    Busy(WarpError),
}

const BACKOFF_START: Duration = Duration::from_micros(50);
const BACKOFF_MAX: Duration = Duration::from_millis(10);

/// Runs tries until one settles or the attempt bound is reached.
///
/// Past `livelock_threshold` tries a thread serializes behind every other
/// long-retrying thread, so that a pair of callers evicting each other's
/// entries eventually lets one of them through. From then on it sleeps
/// between tries, doubling the pause up to `BACKOFF_MAX`.
pub struct Retrier {
    livelock_threshold: u32,
    livelock: Mutex<()>,
}

impl Retrier {
    pub fn new(livelock_threshold: u32) -> Self {
        Self {
            livelock_threshold,
            livelock: Mutex::new(()),
        }
    }

    pub fn run<T>(
        &self,
        attempts: Attempts,
        mut step: impl FnMut(u32) -> Step<T>,
    ) -> WarpResult<Attempted<T>> {
        let mut tried = 0u32;
        let mut last = LastFailure::Nothing;
        let mut serialized: Option<MutexGuard<'_, ()>> = None;
        let mut backoff = BACKOFF_START;

        while attempts.allows(tried) {
            if serialized.is_none() && tried >= self.livelock_threshold {
                debug!(tried, "retrying under the livelock lock");
                serialized = Some(self.livelock.lock());
            }
            tried = tried.saturating_add(1);

            match step(tried) {
                Step::Done(value) => {
                    return Ok(Attempted {
                        value,
                        attempts: tried,
                    })
                }
                Step::Fail(err) => return Err(err),
                Step::Reopen(err) => {
                    trace!(attempt = tried, error = %err, "transient failure");
                    last = LastFailure::Native(err);
                }
                Step::Busy(err) => {
                    trace!(attempt = tried, "pool busy");
                    last = LastFailure::Busy(err);
                }
            }

            if serialized.is_none() {
                thread::yield_now();
            } else if attempts.allows(tried) {
                thread::sleep(backoff);
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        }

        Err(match last {
            LastFailure::Busy(err) => err,
            LastFailure::Native(err) => WarpError::RetriesExhausted {
                attempts: tried,
                last: err.to_string(),
            },
            LastFailure::Nothing => WarpError::RetriesExhausted {
                attempts: 0,
                last: "no attempt was made".to_string(),
            },
        })
    }
}
