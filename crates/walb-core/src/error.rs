//! Error types for the WalB storage host.

use thiserror::Error;

/// A specialized `Result` type for WalB operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification driving the handling policy of §7:
/// fatal format errors stop the volume, transient errors re-schedule,
/// state violations are reported to the client with no internal effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Corrupt superblock / logpack / wdiff data.
    Format,
    /// Transient I/O failure (socket, disk); the operation is retried.
    Io,
    /// Operation attempted in the wrong volume state.
    State,
    /// The log device ring buffer overflowed; operator reset required.
    Overflow,
    /// Cooperative abort due to force stop or shutdown.
    ForceStopped,
    /// No proxy accepted the transfer.
    Proxy,
    /// Bad configuration or parameter.
    Config,
    /// Wire protocol violation.
    Protocol,
}

/// Errors that can occur during WalB operations.
#[derive(Debug, Error)]
pub enum Error {
    /// On-disk data failed validation.
    #[error("format error: {0}")]
    Format(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation not accepted in the current state.
    #[error("state violation: {op} not allowed in state {state}")]
    State {
        /// The rejected operation.
        op: String,
        /// The volume state at the time.
        state: String,
    },

    /// Ring buffer overflow.
    #[error("log device overflow: {0}")]
    Overflow(String),

    /// Force stop or process shutdown interrupted the operation.
    #[error("force stopped: {0}")]
    ForceStopped(String),

    /// Every configured proxy refused or failed.
    #[error("no available proxy: {0}")]
    Proxy(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Wire protocol violation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Creates a format error.
    #[must_use]
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    /// Creates a state-violation error.
    #[must_use]
    pub fn state(op: impl Into<String>, state: impl Into<String>) -> Self {
        Self::State { op: op.into(), state: state.into() }
    }

    /// Creates a protocol error.
    #[must_use]
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Format(_) => ErrorKind::Format,
            Self::Io(_) => ErrorKind::Io,
            Self::State { .. } => ErrorKind::State,
            Self::Overflow(_) => ErrorKind::Overflow,
            Self::ForceStopped(_) => ErrorKind::ForceStopped,
            Self::Proxy(_) => ErrorKind::Proxy,
            Self::Config(_) => ErrorKind::Config,
            Self::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// True when the §7 policy is to retry after a delay.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Io | ErrorKind::Proxy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(Error::format("bad header").kind(), ErrorKind::Format);
        assert_eq!(Error::state("snapshot", "SyncReady").kind(), ErrorKind::State);
        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "t"));
        assert!(io.is_transient());
        assert!(!Error::Overflow("vol0".into()).is_transient());
    }

    #[test]
    fn test_display() {
        let e = Error::state("full-bkp", "Target");
        assert_eq!(e.to_string(), "state violation: full-bkp not allowed in state Target");
    }
}
