use thiserror::Error;

use crate::stats::StatsHandle;

pub type LockResult<T> = Result<T, LockError>;

/// Error taxonomy for the quorum lock protocol.
#[derive(Debug, Error, Clone)]
pub enum LockError {
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A server reported that one or more requested keys already held a value.
    /// Always carried as an against-vote; never returned on its own from a public API.
    #[error("resource already locked")]
    ResourceLocked,

    /// An adapter-level transport failure: closed connection, timeout, malformed reply.
    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("{message}")]
    ExecutionFailed {
        message: String,
        attempts: Vec<StatsHandle>,
    },

    /// The scoped holder's guaranteed release failed on exit. `routine_error` is set
    /// when the routine itself also failed, so neither error is silently dropped.
    #[error("using() release failed on exit{}", routine_error.as_ref().map(|_| " (routine also failed)").unwrap_or(""))]
    UsingFailed {
        routine_error: Option<Box<LockError>>,
        #[source]
        release_error: Box<LockError>,
    },

    /// A Server Adapter task panicked or returned something outside its documented
    /// contract. Adapters must turn ordinary failures into votes; this indicates a bug.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::Transport {
            message: err.to_string(),
        }
    }
}

impl LockError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        LockError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn execution_failed(message: impl Into<String>, attempts: Vec<StatsHandle>) -> Self {
        LockError::ExecutionFailed {
            message: message.into(),
            attempts,
        }
    }
}
