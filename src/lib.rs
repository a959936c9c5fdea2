// src/lib.rs
pub mod backend;
pub mod buffer;
pub mod cli;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod global;
pub mod key;
pub mod logging;
pub mod ops;
pub mod pool;
pub mod retry;
pub mod tokens;

pub use crate::backend::{GdalBackend, MemoryBackend, PixelType, RasterBackend, RasterDataset, Window};
pub use crate::config::PoolConfig;
pub use crate::context::WarpContext;
pub use crate::error::{ErrorKind, NativeError, WarpError, WarpResult};
pub use crate::key::{DatasetKey, DatasetSelector};
pub use crate::ops::ReadRequest;
pub use crate::retry::{return_code, Attempted, Attempts};
pub use crate::tokens::Token;

// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
