//! Outbound event stream.
//!
//! Consumers receive mailbox changes over a `tokio::sync::mpsc` channel
//! rather than registering callbacks, so delivery never runs caller code
//! inside monitor or orchestrator tasks.

use tokio::sync::mpsc;

use crate::account::AccountId;

/// What happened on an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailEventKind {
    /// New messages were merged into the cache.
    NewMail {
        /// How many messages were new.
        count: u32,
    },
    /// A message was removed on the server.
    MailDeleted {
        /// Server-side sequence number of the expunged message.
        seq: u32,
    },
    /// A refresh should be performed (poll tick or manual request).
    RefreshRequested,
    /// The monitor established its connection.
    Connected,
    /// The monitor lost its connection.
    Disconnected,
    /// A non-fatal or fatal failure, described for display.
    Error {
        /// Human-readable description.
        message: String,
    },
}

/// One event on one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailEvent {
    /// The account the event belongs to.
    pub account_id: AccountId,
    /// What happened.
    pub kind: MailEventKind,
}

/// Sender half of an event channel.
pub type EventSender = mpsc::UnboundedSender<MailEvent>;

/// Receiver half of an event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<MailEvent>;

/// Creates an event channel pair.
#[must_use]
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Sends an event, ignoring a closed receiver (shutdown races are fine).
pub fn emit(sender: &EventSender, account_id: &AccountId, kind: MailEventKind) {
    let _ = sender.send(MailEvent {
        account_id: account_id.clone(),
        kind,
    });
}
