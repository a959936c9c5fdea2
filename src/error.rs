// src/error.rs
//! Error taxonomy shared by the pool, the token table and the dispatch layer.

use thiserror::Error;

/// Failure reported by the collaborator library for a single native call.
///
/// The backend decides which side of the line an error falls on; the retry
/// loop only ever looks at the variant.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum NativeError {
    /// The handle may be stale or the failure may clear up after a reopen.
    #[error("transient native failure ({code}): {message}")]
    Transient { code: i32, message: String },
    /// Bad arguments, unsupported requests or corrupt data.
    #[error("permanent native failure ({code}): {message}")]
    Permanent { code: i32, message: String },
}

impl NativeError {
    pub fn transient(code: i32, message: impl Into<String>) -> Self {
        NativeError::Transient {
            code,
            message: message.into(),
        }
    }

    pub fn permanent(code: i32, message: impl Into<String>) -> Self {
        NativeError::Permanent {
            code,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, NativeError::Transient { .. })
    }
}

/// Errors that cross the boundary to callers.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WarpError {
    #[error("token {0} was never issued or has been surrendered")]
    InvalidToken(u64),

    #[error("all {capacity} pool entries are busy")]
    ResourceExhausted { capacity: usize },

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("output buffer too small, {required} bytes required")]
    BufferTooSmall { required: usize },

    /// A transient native failure outside the retry loop, such as from
    /// `set_option`.
    #[error("transient failure ({code}): {message}")]
    Transient { code: i32, message: String },

    #[error("permanent failure ({code}): {message}")]
    Permanent { code: i32, message: String },

    #[error("initialization failed: {0}")]
    InitializationFailure(String),

    #[error("not initialized")]
    NotInitialized,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type WarpResult<T> = Result<T, WarpError>;

impl From<NativeError> for WarpError {
    /// Direct conversion for calls made once. Dispatched operations never take
    /// this path: their transient failures are retried and surface as
    /// `RetriesExhausted`.
    fn from(err: NativeError) -> Self {
        match err {
            NativeError::Permanent { code, message } => WarpError::Permanent { code, message },
            NativeError::Transient { code, message } => WarpError::Transient { code, message },
        }
    }
}

/// Failure categories with stable integer codes for flat calling conventions.
#[repr(i32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    InvalidToken = -1,
    ResourceExhausted = -2,
    TransientFailure = -3,
    RetriesExhausted = -4,
    BufferTooSmall = -5,
    PermanentFailure = -6,
    InitializationFailure = -7,
    NotInitialized = -8,
}

impl ErrorKind {
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Whether the same request may succeed if issued again later.
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::ResourceExhausted
                | ErrorKind::TransientFailure
                | ErrorKind::RetriesExhausted
                | ErrorKind::BufferTooSmall
        )
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -1 => ErrorKind::InvalidToken,
            -2 => ErrorKind::ResourceExhausted,
            -3 => ErrorKind::TransientFailure,
            -4 => ErrorKind::RetriesExhausted,
            -5 => ErrorKind::BufferTooSmall,
            -6 => ErrorKind::PermanentFailure,
            -7 => ErrorKind::InitializationFailure,
            -8 => ErrorKind::NotInitialized,
            _ => return None,
        })
    }
}

impl WarpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WarpError::InvalidToken(_) => ErrorKind::InvalidToken,
            WarpError::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            WarpError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            WarpError::Transient { .. } => ErrorKind::TransientFailure,
            WarpError::BufferTooSmall { .. } => ErrorKind::BufferTooSmall,
            WarpError::Permanent { .. } => ErrorKind::PermanentFailure,
            WarpError::InitializationFailure(_) | WarpError::Config(_) => {
                ErrorKind::InitializationFailure
            }
            WarpError::NotInitialized => ErrorKind::NotInitialized,
        }
    }

    pub fn code(&self) -> i32 {
        self.kind().code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorKind::InvalidToken.code(), -1);
        assert_eq!(ErrorKind::ResourceExhausted.code(), -2);
        assert_eq!(ErrorKind::TransientFailure.code(), -3);
        assert_eq!(ErrorKind::RetriesExhausted.code(), -4);
        assert_eq!(ErrorKind::BufferTooSmall.code(), -5);
        assert_eq!(ErrorKind::PermanentFailure.code(), -6);
        assert_eq!(ErrorKind::InitializationFailure.code(), -7);
        assert_eq!(ErrorKind::NotInitialized.code(), -8);
    }

    #[test]
    fn codes_round_trip_through_from_code() {
        for code in -8..=-1 {
            let kind = ErrorKind::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
        }
        assert_eq!(ErrorKind::from_code(0), None);
        assert_eq!(ErrorKind::from_code(-9), None);
    }

    #[test]
    fn invalid_token_is_not_retryable() {
        let err = WarpError::InvalidToken(7);
        assert!(!err.kind().is_retryable());
        assert!(WarpError::ResourceExhausted { capacity: 1 }.kind().is_retryable());
        assert_eq!(WarpError::Config("x".into()).code(), -7);
    }

    #[test]
    fn permanent_native_error_keeps_its_code() {
        let err: WarpError = NativeError::permanent(5, "bad band").into();
        assert_eq!(
            err,
            WarpError::Permanent {
                code: 5,
                message: "bad band".into()
            }
        );
    }

    #[test]
    fn transient_native_error_is_not_reported_as_retried() {
        let err: WarpError = NativeError::transient(4, "server busy").into();
        assert_eq!(
            err,
            WarpError::Transient {
                code: 4,
                message: "server busy".into()
            }
        );
        assert_eq!(err.code(), -3);
        assert!(err.kind().is_retryable());
    }
}
