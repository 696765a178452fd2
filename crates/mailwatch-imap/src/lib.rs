//! Async IMAP client for the mailwatch sync engine.
//!
//! Implements the slice of IMAP4rev1 (RFC 3501) plus IDLE (RFC 2177) that
//! mailbox synchronization needs: implicit-TLS connections, LOGIN,
//! EXAMINE/SELECT, UID SEARCH/FETCH/STORE, EXPUNGE, and IDLE.
//!
//! The layering is deliberate:
//!
//! - [`connection`] frames the byte stream into complete responses,
//!   literals included.
//! - [`parser`] turns response buffers into typed data, sans I/O.
//! - [`command`] builds and serializes outgoing commands.
//! - [`client`] drives exchanges over a connection and manages its
//!   lifecycle.

pub mod client;
pub mod command;
pub mod connection;
pub mod error;
pub mod parser;
pub mod types;

pub use client::{
    ClientConfig, Connection, FetchedMessage, IdleEvent, IdleHandle, ProtocolClient,
};
pub use command::{Command, FetchProfile, SearchCriteria};
pub use error::{Error, Result};
pub use types::{Capability, Flag, Flags, MailboxSnapshot, SequenceSet, Uid};
