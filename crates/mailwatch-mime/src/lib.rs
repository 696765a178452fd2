//! MIME decoding for the mailwatch sync engine.
//!
//! Pure functions, no I/O: RFC 2047 header decoding, header-block
//! extraction, multipart body traversal, and attachment detection over a
//! part tree. The parsing surface is infallible by design; malformed
//! input degrades to passthrough rather than failing a sync.

pub mod body;
pub mod encoding;
pub mod error;
pub mod header;
pub mod structure;

pub use body::{AttachmentInfo, ParsedBody, parse_body};
pub use error::{Error, Result};
pub use header::{HeaderBlock, Headers, Mailbox, decode_header_word, parse_header_block};
pub use structure::{PartNode, has_attachments};
