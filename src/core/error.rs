use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Denied: {0}")]
    Denied(String),

    #[error("Ambiguous prefix '{prefix}' matches {matches} tasks")]
    AmbiguousPrefix { prefix: String, matches: usize },

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl KernelError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied(_))
    }

    pub fn is_execution_error(&self) -> bool {
        matches!(self, Self::ExecutionError(_))
    }

    /// Short machine-readable tag, used in execution logs and journals.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Denied(_) => "denied",
            Self::AmbiguousPrefix { .. } => "ambiguous_prefix",
            Self::ExecutionError(_) => "execution_error",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::ParseError(_) => "parse_error",
            Self::SerializationError(_) => "serialization_error",
            Self::IoError(_) => "io_error",
            Self::LockError(_) => "lock_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;

impl<T> From<std::sync::PoisonError<T>> for KernelError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for KernelError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}
