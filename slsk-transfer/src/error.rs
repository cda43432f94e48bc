use std::fmt;

/// Crate-wide result alias, matching the teacher's `type Result<T> =
/// std::result::Result<T, Error>` convention.
pub type Result<T> = std::result::Result<T, SoulseekError>;

/// Argument/state errors raised synchronously at API entry (spec §7 layer
/// 1). Never wrapped, never attached to a `Transfer` — no transfer exists
/// yet when these fire.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ArgumentError {
    #[error("Value cannot be null or whitespace (Parameter '{0}')")]
    NullOrWhitespace(&'static str),
    #[error("Value must be non-negative (Parameter '{0}')")]
    OutOfRange(&'static str),
    #[error("Value cannot be null (Parameter '{0}')")]
    Null(&'static str),
}

/// `start_offset > 0` was supplied without a `size`. Distinct from the
/// generic `Null` case so callers can match on it directly.
pub fn missing_size_for_offset() -> ArgumentError {
    ArgumentError::Null("size")
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum InvalidOperationError {
    #[error("The client must be connected and logged in to {0} (missing: {1})")]
    NotReady(&'static str, &'static str),
}

#[derive(thiserror::Error, Debug, Clone)]
#[error("A transfer with token {0} is already active")]
pub struct DuplicateTokenError(pub u32);

#[derive(thiserror::Error, Debug, Clone)]
#[error("An active or queued {direction} of {filename} from {username} is already in progress")]
pub struct DuplicateTransferError {
    pub direction: crate::transfer::Direction,
    pub username: String,
    pub filename: String,
}

/// Pre-stream negotiation and stream-phase errors (spec §7 layers 2-3).
#[derive(thiserror::Error, Debug, Clone)]
pub enum SoulseekError {
    #[error(transparent)]
    Argument(#[from] ArgumentError),
    #[error(transparent)]
    InvalidOperation(#[from] InvalidOperationError),
    #[error(transparent)]
    DuplicateToken(#[from] DuplicateTokenError),
    #[error(transparent)]
    DuplicateTransfer(#[from] DuplicateTransferError),

    #[error("User {0} is offline")]
    UserOffline(String),
    #[error("The operation has timed out: {0}")]
    Timeout(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Transfer was rejected by the remote peer: {0}")]
    TransferRejected(String),
    #[error("Negotiated size does not match the size supplied by the caller (local={local}, remote={remote})")]
    TransferSizeMismatch { local: u64, remote: u64 },
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("Download reported as failed by remote client")]
    RemoteDownloadFailed,
    #[error("Upload reported as failed by remote client")]
    RemoteUploadFailed,

    /// Top-level wrapper: anything that does not fit one of the
    /// semantically meaningful kinds above gets wrapped here so callers
    /// have a single `catch` surface, while `inner` preserves the cause.
    #[error("{context}")]
    Wrapped {
        context: &'static str,
        #[source]
        inner: Box<SoulseekError>,
    },
}

impl SoulseekError {
    pub fn wrap(context: &'static str, inner: SoulseekError) -> Self {
        Self::Wrapped {
            context,
            inner: Box::new(inner),
        }
    }

    /// The unwrapped, root cause — what gets attached to `Transfer::exception`
    /// per spec §7 (always the root, never the top-level wrapper).
    pub fn root_cause(&self) -> &SoulseekError {
        match self {
            SoulseekError::Wrapped { inner, .. } => inner.root_cause(),
            other => other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), SoulseekError::Timeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), SoulseekError::Cancelled)
    }
}

/// Connection-layer failures, the inner cause of stream-phase wrapped
/// errors (spec §7 layer 3 / §4.2 failure table).
#[derive(thiserror::Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("Failed to connect to peer: {0}")]
    ConnectFailed(String),
    #[error("Transfer failed: {0}")]
    TransferFailed(String),
    #[error(transparent)]
    Io(#[from] IoErrorShim),
}

/// `std::io::Error` is not `Clone`, but orchestrator state and test
/// fixtures want to pass errors by value freely. This captures the
/// `(kind, message)` the way the teacher's `Error::Io(#[from] IoError)`
/// captures the original, without giving up `Clone`.
#[derive(Debug, Clone)]
pub struct IoErrorShim {
    pub kind: std::io::ErrorKind,
    pub message: String,
}

impl fmt::Display for IoErrorShim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for IoErrorShim {}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        ConnectionError::Io(IoErrorShim::from(err))
    }
}

impl From<std::io::Error> for IoErrorShim {
    fn from(err: std::io::Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cause_unwraps_through_multiple_layers() {
        let root = SoulseekError::TransferRejected("File not shared.".into());
        let wrapped = SoulseekError::wrap("Failed to download file", root.clone());
        let twice_wrapped = SoulseekError::wrap("outer", wrapped);

        match twice_wrapped.root_cause() {
            SoulseekError::TransferRejected(msg) => assert_eq!(msg, "File not shared."),
            other => panic!("expected TransferRejected, got {other:?}"),
        }
    }

    #[test]
    fn is_timeout_looks_through_wrapper() {
        let err = SoulseekError::wrap("ctx", SoulseekError::Timeout("response".into()));
        assert!(err.is_timeout());
    }
}
