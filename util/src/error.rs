use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Closed result taxonomy shared by every crate in the stack.
///
/// Variants split into four families: retryable (`NoFreeChunk`,
/// `QueueFull`, `Busy`, `Timeout`), fatal for one stream
/// (`HwCompletionIssue`, `Io`), fatal for the application
/// (`InvalidArgument`, `NotInitialized`, `Unsupported`,
/// `InsufficientBar1`) and per-packet soft (`ChecksumIssue`). `Signal`
/// reports cooperative shutdown and is never an error in the exit-code
/// sense.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not initialized")]
    NotInitialized,
    #[error("flow already attached")]
    AlreadyAttached,
    #[error("flow not attached")]
    NotAttached,
    #[error("no free chunk")]
    NoFreeChunk,
    #[error("send queue full")]
    QueueFull,
    #[error("resource busy")]
    Busy,
    #[error("packet checksum issue")]
    ChecksumIssue,
    #[error("hardware completion issue")]
    HwCompletionIssue,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("insufficient BAR1 memory on device")]
    InsufficientBar1,
    #[error("signal received")]
    Signal,
    #[error("timed out")]
    Timeout,
    #[error("io error: {0}")]
    Io(String),
}

impl Error {
    /// Retryable results are handled inside the engine's inner loops and
    /// never surface to application callbacks.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NoFreeChunk | Error::QueueFull | Error::Busy | Error::Timeout
        )
    }

    /// Soft results update counters without aborting the packet path.
    pub fn is_soft(&self) -> bool {
        matches!(self, Error::ChecksumIssue)
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

#[cfg(test)]
mod error_test {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::NoFreeChunk.is_retryable());
        assert!(Error::QueueFull.is_retryable());
        assert!(Error::Busy.is_retryable());
        assert!(Error::Timeout.is_retryable());
        assert!(!Error::HwCompletionIssue.is_retryable());
        assert!(!Error::Signal.is_retryable());
        assert!(!Error::InvalidArgument("x".into()).is_retryable());
    }

    #[test]
    fn test_soft_classification() {
        assert!(Error::ChecksumIssue.is_soft());
        assert!(!Error::HwCompletionIssue.is_soft());
    }
}
