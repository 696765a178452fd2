//! Transport seam for the idle monitor.
//!
//! The monitor is generic over this trait so its state machine can be
//! tested without a network; the real implementation drives a dedicated
//! IMAP connection.

use std::time::Duration;

use mailwatch_imap::{IdleEvent, ProtocolClient};

use crate::account::ImapCredentials;
use crate::{Error, Result};

/// Something observed while watching the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The mailbox now holds `count` messages.
    NewActivity {
        /// Current EXISTS count.
        count: u32,
    },
    /// The message at `seq` was expunged.
    Deleted {
        /// Expunged sequence number.
        seq: u32,
    },
    /// Nothing happened within the wait ceiling.
    Quiet,
}

/// Connection factory for the monitor.
pub trait IdleTransport: Send + Sync + 'static {
    /// The session type produced by [`IdleTransport::connect`].
    type Session: IdleSession;

    /// Opens and authenticates a fresh watching session.
    fn connect(
        &self,
        credentials: &ImapCredentials,
    ) -> impl Future<Output = Result<Self::Session>> + Send;
}

/// One live watching session.
pub trait IdleSession: Send {
    /// Whether the server supports IDLE (advertised or queried).
    fn supports_idle(&mut self) -> impl Future<Output = Result<bool>> + Send;

    /// Waits up to `ceiling` for mailbox activity.
    fn wait(&mut self, ceiling: Duration) -> impl Future<Output = Result<WatchOutcome>> + Send;

    /// Tears the session down; best-effort, never fails.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;
}

/// Real transport over [`ProtocolClient`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ImapIdleTransport;

/// A watching session on a dedicated IMAP connection.
///
/// The connection holds a read-only selection and is never used for
/// mutations.
pub struct ImapIdleSession {
    client: ProtocolClient,
    mailbox: String,
}

impl IdleTransport for ImapIdleTransport {
    type Session = ImapIdleSession;

    async fn connect(&self, credentials: &ImapCredentials) -> Result<Self::Session> {
        let mut client = ProtocolClient::new(credentials.client_config());
        client.connect().await?;
        client.mailbox_info(&credentials.mailbox).await?;
        Ok(ImapIdleSession {
            client,
            mailbox: credentials.mailbox.clone(),
        })
    }
}

impl IdleSession for ImapIdleSession {
    async fn supports_idle(&mut self) -> Result<bool> {
        self.client.supports_idle().await.map_err(Error::from)
    }

    async fn wait(&mut self, ceiling: Duration) -> Result<WatchOutcome> {
        // Keep the read-only selection current before idling.
        self.client.mailbox_info(&self.mailbox).await?;
        let connection = self.client.connection()?;
        let mut handle = connection.idle().await?;
        let event = handle.wait(ceiling).await;
        // Always leave IDLE, even when the wait failed.
        let done = handle.done().await;
        let outcome = match event? {
            IdleEvent::Exists(count) => WatchOutcome::NewActivity { count },
            IdleEvent::Expunged(seq) => WatchOutcome::Deleted { seq },
            IdleEvent::Changed(_) | IdleEvent::Timeout => WatchOutcome::Quiet,
        };
        done?;
        Ok(outcome)
    }

    async fn disconnect(&mut self) {
        self.client.disconnect().await;
    }
}
