use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Recoverable failures. Everything here travels through
/// [`Runtime::raise_failure`](crate::Runtime::raise_failure) and is caught
/// by the innermost recoverable scope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("out of memory: could not obtain {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("** {id} error: {message}")]
    Raised { id: String, message: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(&'static str),

    #[error("pool {pool} is corrupt: {reason}")]
    PoolCorrupt { pool: usize, reason: String },
}

impl Error {
    pub fn raised(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Raised {
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}
