use thiserror::Error;

pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Closed error taxonomy for the backup engine. Every failure a worker can
/// encounter is one of these; the retry layer and the report aggregation
/// both key off the classification helpers below.
#[derive(Error, Debug, Clone)]
pub enum ArchiveError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("folder not found: {0}")]
    FolderNotFound(String),
    #[error("folder not selectable: {0}")]
    FolderNotSelectable(String),
    #[error("fetch failed: {0}")]
    FetchFailed(String),
    #[error("uidvalidity changed: {old} -> {new}")]
    UidValidityChanged { old: u32, new: u32 },
    #[error("message {uid} is {size} bytes, over the {limit}-byte ceiling")]
    SizeExceeded { uid: u32, size: u32, limit: u32 },
    #[error("folder path escapes the account root: {0}")]
    PathEscape(String),
    #[error("unusable name: {0}")]
    SanitizationFailed(String),
    #[error("local i/o: {0}")]
    LocalIo(String),
    #[error("server rate limit: {0}")]
    RateLimited(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("cancelled")]
    Cancelled,
}

impl ArchiveError {
    pub fn local_io(context: &str, err: std::io::Error) -> Self {
        ArchiveError::LocalIo(format!("{context}: {err}"))
    }

    /// Errors worth another attempt after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ArchiveError::ConnectionFailed(_)
                | ArchiveError::FetchFailed(_)
                | ArchiveError::RateLimited(_)
                | ArchiveError::Timeout(_)
        )
    }

    /// Errors that short-circuit every remaining folder of the account.
    pub fn is_account_fatal(&self) -> bool {
        matches!(
            self,
            ArchiveError::AuthFailed(_) | ArchiveError::LocalIo(_) | ArchiveError::Cancelled
        )
    }

    /// Errors that skip the current folder but leave the account running.
    pub fn is_folder_fatal(&self) -> bool {
        matches!(
            self,
            ArchiveError::FolderNotFound(_)
                | ArchiveError::FolderNotSelectable(_)
                | ArchiveError::PathEscape(_)
                | ArchiveError::SanitizationFailed(_)
        )
    }

    /// Whether the underlying socket must be assumed dead. A timed-out
    /// command leaves the session mid-response, so it counts too.
    pub fn needs_reconnect(&self) -> bool {
        matches!(
            self,
            ArchiveError::ConnectionFailed(_)
                | ArchiveError::RateLimited(_)
                | ArchiveError::Timeout(_)
        )
    }

    /// Stable category tag carried into reports and progress events.
    pub fn category(&self) -> &'static str {
        match self {
            ArchiveError::ConnectionFailed(_) => "connection-failed",
            ArchiveError::AuthFailed(_) => "auth-failed",
            ArchiveError::FolderNotFound(_) => "folder-not-found",
            ArchiveError::FolderNotSelectable(_) => "folder-not-selectable",
            ArchiveError::FetchFailed(_) => "fetch-failed",
            ArchiveError::UidValidityChanged { .. } => "uidvalidity-changed",
            ArchiveError::SizeExceeded { .. } => "size-exceeded",
            ArchiveError::PathEscape(_) => "path-escape",
            ArchiveError::SanitizationFailed(_) => "sanitization-failed",
            ArchiveError::LocalIo(_) => "local-io",
            ArchiveError::RateLimited(_) => "rate-limited",
            ArchiveError::Timeout(_) => "timeout",
            ArchiveError::Cancelled => "cancelled",
        }
    }
}
