// src/global.rs
//! Process-wide context for callers that cannot carry a [`WarpContext`]
//! around. Everything here fails with `NotInitialized` until
//! [`initialize`] or [`initialize_with`] has run.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::backend::{GdalBackend, RasterBackend};
use crate::config::PoolConfig;
use crate::context::WarpContext;
use crate::error::{WarpError, WarpResult};
use crate::tokens::Token;

static CONTEXT: RwLock<Option<Arc<WarpContext>>> = parking_lot::const_rwlock(None);

/// Set up the GDAL-backed context with `capacity` entries. Other settings
/// come from the `WARP_POOL_*` environment variables.
pub fn initialize(capacity: usize) -> WarpResult<Arc<WarpContext>> {
    if let Some(ctx) = CONTEXT.read().as_ref() {
        warn!("already initialized, keeping the existing context");
        return Ok(Arc::clone(ctx));
    }
    let mut config = PoolConfig::default().with_env_overrides()?;
    config.capacity = capacity;
    let backend = GdalBackend::new()?;
    initialize_with(config, Arc::new(backend))
}

/// Install a context built from `config` and `backend`. A second call while a
/// context is live leaves the existing one in place.
pub fn initialize_with(
    config: PoolConfig,
    backend: Arc<dyn RasterBackend>,
) -> WarpResult<Arc<WarpContext>> {
    let mut slot = CONTEXT.write();
    if let Some(ctx) = slot.as_ref() {
        warn!("already initialized, keeping the existing context");
        return Ok(Arc::clone(ctx));
    }
    let ctx = Arc::new(WarpContext::new(config, backend)?);
    *slot = Some(Arc::clone(&ctx));
    Ok(ctx)
}

/// Close every dataset and drop the context. Returns whether one was live.
pub fn shutdown() -> bool {
    let taken = CONTEXT.write().take();
    match taken {
        Some(ctx) => {
            ctx.shutdown();
            true
        }
        None => false,
    }
}

pub fn context() -> WarpResult<Arc<WarpContext>> {
    CONTEXT
        .read()
        .as_ref()
        .map(Arc::clone)
        .ok_or(WarpError::NotInitialized)
}

pub fn is_initialized() -> bool {
    CONTEXT.read().is_some()
}

pub fn get_token<U, I, S>(uri: U, options: I) -> WarpResult<Token>
where
    U: Into<String>,
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    context()?.get_token(uri, options)
}

pub fn surrender_token(token: Token) -> WarpResult<()> {
    context()?.surrender_token(token)
}

pub fn set_option(key: &str, value: Option<&str>) -> WarpResult<()> {
    context()?.set_option(key, value)
}
