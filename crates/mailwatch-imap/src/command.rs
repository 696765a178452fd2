//! IMAP command builders and serialization.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::NaiveDate;

use crate::types::SequenceSet;

/// Tag generator for IMAP commands.
///
/// Generates unique sequential tags in the format "A0000", "A0001", etc.
#[derive(Debug)]
pub struct TagGenerator {
    counter: AtomicU32,
    prefix: char,
}

impl TagGenerator {
    /// Creates a new tag generator with the given prefix.
    #[must_use]
    pub const fn new(prefix: char) -> Self {
        Self {
            counter: AtomicU32::new(0),
            prefix,
        }
    }

    /// Generates the next tag.
    #[must_use]
    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}{:04}", self.prefix, n)
    }
}

impl Default for TagGenerator {
    fn default() -> Self {
        Self::new('A')
    }
}

/// Search criteria for the SEARCH command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchCriteria {
    /// All messages.
    All,
    /// Messages with an internal date on or after the given day.
    Since(NaiveDate),
    /// Messages whose Subject contains the given text.
    Subject(String),
}

/// Profile of items to request in a FETCH command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchProfile {
    /// UID, flags, size, internal date, body structure, and the header
    /// fields the summary view needs (From, To, Subject, Date, Message-ID).
    Summary,
    /// UID, flags, and the entire raw message (peek, so \Seen is untouched).
    Full,
}

impl FetchProfile {
    /// Returns the FETCH item list for this profile.
    #[must_use]
    pub const fn items(self) -> &'static str {
        match self {
            Self::Summary => {
                "(UID FLAGS RFC822.SIZE INTERNALDATE BODYSTRUCTURE \
                 BODY.PEEK[HEADER.FIELDS (FROM TO SUBJECT DATE MESSAGE-ID)])"
            }
            Self::Full => "(UID FLAGS BODY.PEEK[])",
        }
    }
}

/// IMAP command issued by the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// CAPABILITY command.
    Capability,
    /// LOGOUT command.
    Logout,
    /// LOGIN command.
    Login {
        /// Username.
        username: String,
        /// Password.
        password: String,
    },
    /// SELECT command (read-write open).
    Select {
        /// Mailbox to select.
        mailbox: String,
    },
    /// EXAMINE command (read-only open).
    Examine {
        /// Mailbox to examine.
        mailbox: String,
    },
    /// EXPUNGE command.
    Expunge,
    /// UID SEARCH command.
    UidSearch {
        /// Search criteria.
        criteria: SearchCriteria,
    },
    /// UID FETCH command.
    UidFetch {
        /// UID set.
        set: SequenceSet,
        /// Items to fetch.
        profile: FetchProfile,
    },
    /// FETCH command over sequence numbers.
    Fetch {
        /// Sequence set.
        set: SequenceSet,
        /// Items to fetch.
        profile: FetchProfile,
    },
    /// UID STORE command (always `.SILENT`; the engine tracks state itself).
    UidStore {
        /// UID set.
        set: SequenceSet,
        /// Flag to add or remove.
        flag: crate::types::Flag,
        /// Add (`true`) or remove (`false`) the flag.
        add: bool,
    },
    /// IDLE command.
    Idle,
    /// DONE (to end IDLE; sent without a tag).
    Done,
}

impl Command {
    /// Serializes the command to wire bytes with the given tag.
    #[must_use]
    pub fn serialize(&self, tag: &str) -> Vec<u8> {
        let mut buf = Vec::new();

        // DONE is the lone untagged line in the protocol.
        if !matches!(self, Self::Done) {
            buf.extend_from_slice(tag.as_bytes());
            buf.push(b' ');
        }

        match self {
            Self::Capability => buf.extend_from_slice(b"CAPABILITY"),
            Self::Logout => buf.extend_from_slice(b"LOGOUT"),

            Self::Login { username, password } => {
                buf.extend_from_slice(b"LOGIN ");
                write_astring(&mut buf, username);
                buf.push(b' ');
                write_astring(&mut buf, password);
            }

            Self::Select { mailbox } => {
                buf.extend_from_slice(b"SELECT ");
                write_astring(&mut buf, mailbox);
            }

            Self::Examine { mailbox } => {
                buf.extend_from_slice(b"EXAMINE ");
                write_astring(&mut buf, mailbox);
            }

            Self::Expunge => buf.extend_from_slice(b"EXPUNGE"),

            Self::UidSearch { criteria } => {
                buf.extend_from_slice(b"UID SEARCH ");
                write_search_criteria(&mut buf, criteria);
            }

            Self::UidFetch { set, profile } => {
                buf.extend_from_slice(b"UID FETCH ");
                buf.extend_from_slice(set.to_string().as_bytes());
                buf.push(b' ');
                buf.extend_from_slice(profile.items().as_bytes());
            }

            Self::Fetch { set, profile } => {
                buf.extend_from_slice(b"FETCH ");
                buf.extend_from_slice(set.to_string().as_bytes());
                buf.push(b' ');
                buf.extend_from_slice(profile.items().as_bytes());
            }

            Self::UidStore { set, flag, add } => {
                buf.extend_from_slice(b"UID STORE ");
                buf.extend_from_slice(set.to_string().as_bytes());
                if *add {
                    buf.extend_from_slice(b" +FLAGS.SILENT (");
                } else {
                    buf.extend_from_slice(b" -FLAGS.SILENT (");
                }
                buf.extend_from_slice(flag.as_str().as_bytes());
                buf.push(b')');
            }

            Self::Idle => buf.extend_from_slice(b"IDLE"),
            Self::Done => buf.extend_from_slice(b"DONE"),
        }

        buf.extend_from_slice(b"\r\n");
        buf
    }
}

/// Writes an astring, quoting when the value contains specials.
fn write_astring(buf: &mut Vec<u8>, s: &str) {
    let needs_quoting = s.is_empty()
        || s.bytes().any(|b| {
            matches!(
                b,
                b' ' | b'"' | b'\\' | b'(' | b')' | b'{' | b'}' | b'%' | b'*'
            ) || b < 0x20
        });

    if needs_quoting {
        buf.push(b'"');
        for b in s.bytes() {
            if b == b'"' || b == b'\\' {
                buf.push(b'\\');
            }
            buf.push(b);
        }
        buf.push(b'"');
    } else {
        buf.extend_from_slice(s.as_bytes());
    }
}

fn write_search_criteria(buf: &mut Vec<u8>, criteria: &SearchCriteria) {
    match criteria {
        SearchCriteria::All => buf.extend_from_slice(b"ALL"),
        SearchCriteria::Since(date) => {
            buf.extend_from_slice(b"SINCE ");
            buf.extend_from_slice(format_imap_date(*date).as_bytes());
        }
        SearchCriteria::Subject(text) => {
            buf.extend_from_slice(b"SUBJECT ");
            write_astring(buf, text);
        }
    }
}

/// Formats a date for IMAP SEARCH, e.g. `26-Aug-2026`.
#[must_use]
pub fn format_imap_date(date: NaiveDate) -> String {
    date.format("%d-%b-%Y").to_string()
}
