//! Cache-aware mailbox synchronization.
//!
//! This crate ties the wire protocol ([`mailwatch_imap`]) and MIME
//! decoding ([`mailwatch_mime`]) together into an engine that keeps a
//! SQLite cache of message summaries and content in step with the
//! server:
//!
//! - [`cache::CacheStore`] persists summaries and decoded content,
//!   merging new messages idempotently by `(account, uid)`.
//! - [`monitor::IdleMonitor`] watches a mailbox over IMAP IDLE, falling
//!   back to polling, and reports changes on an event channel.
//! - [`sync::SyncOrchestrator`] answers listing, content, search, and
//!   mutation requests, deciding per call whether the cache is fresh
//!   enough or the server must be consulted.

pub mod account;
pub mod cache;
mod error;
pub mod events;
pub mod model;
pub mod monitor;
pub mod sync;

pub use account::{AccountId, ImapCredentials};
pub use cache::CacheStore;
pub use error::{Error, ErrorKind, Result};
pub use events::{EventReceiver, EventSender, MailEvent, MailEventKind};
pub use model::{AttachmentMeta, MessageContent, MessageSummary, SyncCursor};
pub use monitor::{IdleMonitor, MonitorConfig, MonitorStatus};
pub use sync::{BatchSource, ImapMailer, LiveMail, MessageBatch, SyncOptions, SyncOrchestrator};
