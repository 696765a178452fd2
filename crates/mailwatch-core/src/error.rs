//! Error types for the sync engine.

use thiserror::Error;

/// Errors from sync, cache, and monitoring operations.
#[derive(Debug, Error)]
pub enum Error {
    /// IMAP protocol or connection failure.
    #[error("IMAP error: {0}")]
    Imap(#[from] mailwatch_imap::Error),

    /// Cache database failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Attachment metadata (de)serialization failure.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A requested message, attachment, or account does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The account has not been registered with the orchestrator.
    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    /// A dual-write mutation left the server and cache inconsistent.
    #[error("Mutation failed: {0}")]
    MutationFailed(String),

    /// The idle monitor gave up after exhausting its attempts.
    #[error("Monitor exhausted: {0}")]
    MonitorExhausted(String),
}

/// Broad failure category, for callers that branch on the class of error
/// rather than its details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection or transport failure.
    Network,
    /// Credentials rejected.
    Auth,
    /// Server spoke something we could not handle.
    Protocol,
    /// A deadline elapsed.
    Timeout,
    /// Missing message, attachment, or account.
    NotFound,
    /// Local cache failure.
    Cache,
}

impl Error {
    /// Classifies the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        use mailwatch_imap::Error as Imap;
        match self {
            Self::Imap(e) => match e {
                Imap::Auth(_) => ErrorKind::Auth,
                Imap::Timeout(_) => ErrorKind::Timeout,
                Imap::Io(_) | Imap::Tls(_) | Imap::InvalidDnsName(_) | Imap::Bye(_) => {
                    ErrorKind::Network
                }
                Imap::No(_) | Imap::Bad(_) | Imap::InvalidState(_) | Imap::Protocol(_) => {
                    ErrorKind::Protocol
                }
            },
            Self::Database(_) | Self::Json(_) => ErrorKind::Cache,
            Self::NotFound(_) | Self::UnknownAccount(_) => ErrorKind::NotFound,
            Self::MutationFailed(_) | Self::MonitorExhausted(_) => ErrorKind::Network,
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_classification() {
        let auth = Error::Imap(mailwatch_imap::Error::Auth("denied".to_string()));
        assert_eq!(auth.kind(), ErrorKind::Auth);

        let missing = Error::NotFound("uid 9".to_string());
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        let timeout =
            Error::Imap(mailwatch_imap::Error::Timeout(std::time::Duration::from_secs(20)));
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
    }
}
