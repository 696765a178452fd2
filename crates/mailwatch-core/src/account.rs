//! Account identity and connection credentials.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque account identifier chosen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl AccountId {
    /// Creates an account id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Connection credentials for one account.
///
/// Supplied by the caller per account and held only for the lifetime of
/// the registration; never persisted by this crate.
#[derive(Debug, Clone)]
pub struct ImapCredentials {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Use implicit TLS. Disable only against local test servers.
    pub use_tls: bool,
    /// Login username.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Mailbox to synchronize.
    pub mailbox: String,
}

impl ImapCredentials {
    /// Credentials for an implicit-TLS server, synchronizing INBOX.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            use_tls: true,
            username: username.into(),
            password: password.into(),
            mailbox: "INBOX".to_string(),
        }
    }

    /// Builds the protocol client configuration for these credentials.
    #[must_use]
    pub fn client_config(&self) -> mailwatch_imap::ClientConfig {
        let mut config = mailwatch_imap::ClientConfig::new(self.host.clone(), self.port)
            .credentials(self.username.clone(), self.password.clone());
        config.use_tls = self.use_tls;
        config
    }
}

impl fmt::Display for ImapCredentials {
    // Deliberately omits the password.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}
