//! Core IMAP types: identifiers, flags, capabilities, mailbox snapshots.

use std::fmt;
use std::num::NonZeroU32;

/// Unique identifier for a message.
///
/// UIDs are assigned by the mailbox, increase monotonically, and are stable
/// across sessions (unlike sequence numbers, which shift on expunge).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(pub NonZeroU32);

impl Uid {
    /// Creates a new UID. Returns `None` if the value is 0.
    #[must_use]
    pub fn new(n: u32) -> Option<Self> {
        NonZeroU32::new(n).map(Self)
    }

    /// Returns the underlying value.
    #[must_use]
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message sequence number, ephemeral within one mailbox session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeqNum(pub NonZeroU32);

impl SeqNum {
    /// Creates a new sequence number. Returns `None` if the value is 0.
    #[must_use]
    pub fn new(n: u32) -> Option<Self> {
        NonZeroU32::new(n).map(Self)
    }

    /// Returns the underlying value.
    #[must_use]
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A set of sequence numbers or UIDs for FETCH/STORE/SEARCH commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceSet {
    /// A single number.
    Single(u32),
    /// An inclusive range `start:end`.
    Range(u32, u32),
    /// An open range `start:*`.
    From(u32),
    /// An explicit list of numbers.
    List(Vec<u32>),
}

impl SequenceSet {
    /// Creates a single-element set. Returns `None` for 0.
    #[must_use]
    pub fn single(n: u32) -> Option<Self> {
        (n > 0).then_some(Self::Single(n))
    }

    /// Creates an inclusive range. Returns `None` if empty or starting at 0.
    #[must_use]
    pub fn range(start: u32, end: u32) -> Option<Self> {
        (start > 0 && start <= end).then_some(Self::Range(start, end))
    }

    /// Creates an open-ended range `start:*`.
    #[must_use]
    pub fn from(start: u32) -> Option<Self> {
        (start > 0).then_some(Self::From(start))
    }

    /// Creates a set from an explicit UID list. Returns `None` when empty.
    #[must_use]
    pub fn list(mut uids: Vec<u32>) -> Option<Self> {
        uids.retain(|&u| u > 0);
        if uids.is_empty() {
            return None;
        }
        uids.sort_unstable();
        uids.dedup();
        Some(Self::List(uids))
    }
}

impl fmt::Display for SequenceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(n) => write!(f, "{n}"),
            Self::Range(a, b) => write!(f, "{a}:{b}"),
            Self::From(a) => write!(f, "{a}:*"),
            Self::List(ns) => {
                let joined = ns
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                write!(f, "{joined}")
            }
        }
    }
}

/// A message flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Flag {
    /// Message has been read (`\Seen`).
    Seen,
    /// Message has been answered.
    Answered,
    /// Message is flagged for attention.
    Flagged,
    /// Message is marked for deletion.
    Deleted,
    /// Message is a draft.
    Draft,
    /// Message recently arrived in this session.
    Recent,
    /// A server-defined keyword.
    Keyword(String),
}

impl Flag {
    /// Returns the wire representation of the flag.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Seen => "\\Seen",
            Self::Answered => "\\Answered",
            Self::Flagged => "\\Flagged",
            Self::Deleted => "\\Deleted",
            Self::Draft => "\\Draft",
            Self::Recent => "\\Recent",
            Self::Keyword(k) => k,
        }
    }

    /// Parses a flag from its wire representation.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            _ if s.eq_ignore_ascii_case("\\Seen") => Self::Seen,
            _ if s.eq_ignore_ascii_case("\\Answered") => Self::Answered,
            _ if s.eq_ignore_ascii_case("\\Flagged") => Self::Flagged,
            _ if s.eq_ignore_ascii_case("\\Deleted") => Self::Deleted,
            _ if s.eq_ignore_ascii_case("\\Draft") => Self::Draft,
            _ if s.eq_ignore_ascii_case("\\Recent") => Self::Recent,
            _ => Self::Keyword(s.to_string()),
        }
    }
}

/// A set of message flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flags(Vec<Flag>);

impl Flags {
    /// Creates a flag set from a vector.
    #[must_use]
    pub fn from_vec(flags: Vec<Flag>) -> Self {
        Self(flags)
    }

    /// Returns true if the set contains the given flag.
    #[must_use]
    pub fn contains(&self, flag: &Flag) -> bool {
        self.0.contains(flag)
    }

    /// Returns the flags as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[Flag] {
        &self.0
    }

    /// Returns true if no flags are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A server capability advertised in CAPABILITY responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    /// IMAP4rev1 (RFC 3501).
    Imap4Rev1,
    /// IMAP4rev2 (RFC 9051).
    Imap4Rev2,
    /// IDLE (RFC 2177).
    Idle,
    /// UIDPLUS (RFC 4315).
    UidPlus,
    /// LOGINDISABLED.
    LoginDisabled,
    /// An AUTH= mechanism.
    Auth(String),
    /// Anything else.
    Other(String),
}

impl Capability {
    /// Parses a capability token.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        let upper = s.to_ascii_uppercase();
        match upper.as_str() {
            "IMAP4REV1" => Self::Imap4Rev1,
            "IMAP4REV2" => Self::Imap4Rev2,
            "IDLE" => Self::Idle,
            "UIDPLUS" => Self::UidPlus,
            "LOGINDISABLED" => Self::LoginDisabled,
            _ => upper.strip_prefix("AUTH=").map_or_else(
                || Self::Other(s.to_string()),
                |mech| Self::Auth(mech.to_string()),
            ),
        }
    }
}

/// Ephemeral snapshot of a mailbox, recomputed on every open.
///
/// Never persisted; sequence-dependent counters here are only meaningful
/// for the lifetime of the connection that produced them.
#[derive(Debug, Clone, Default)]
pub struct MailboxSnapshot {
    /// Total number of messages (EXISTS).
    pub total_messages: u32,
    /// Number of unseen messages, when the server reports it.
    pub unseen_count: Option<u32>,
    /// Number of recent messages (RECENT).
    pub recent_count: u32,
    /// Flags defined for the mailbox.
    pub flags: Flags,
    /// Whether the mailbox was opened read-only.
    pub read_only: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn uid_zero_is_invalid() {
        assert!(Uid::new(0).is_none());
        assert_eq!(Uid::new(42).unwrap().get(), 42);
    }

    #[test]
    fn sequence_set_display() {
        assert_eq!(SequenceSet::single(5).unwrap().to_string(), "5");
        assert_eq!(SequenceSet::range(1, 10).unwrap().to_string(), "1:10");
        assert_eq!(SequenceSet::from(100).unwrap().to_string(), "100:*");
        assert_eq!(
            SequenceSet::list(vec![3, 1, 2, 3]).unwrap().to_string(),
            "1,2,3"
        );
    }

    #[test]
    fn sequence_set_rejects_empty() {
        assert!(SequenceSet::range(10, 5).is_none());
        assert!(SequenceSet::single(0).is_none());
        assert!(SequenceSet::list(vec![0]).is_none());
    }

    #[test]
    fn flag_round_trip() {
        assert_eq!(Flag::parse("\\Seen"), Flag::Seen);
        assert_eq!(Flag::parse("\\deleted"), Flag::Deleted);
        assert_eq!(
            Flag::parse("$Forwarded"),
            Flag::Keyword("$Forwarded".to_string())
        );
        assert_eq!(Flag::Deleted.as_str(), "\\Deleted");
    }

    #[test]
    fn capability_parse() {
        assert_eq!(Capability::parse("IDLE"), Capability::Idle);
        assert_eq!(Capability::parse("idle"), Capability::Idle);
        assert_eq!(
            Capability::parse("AUTH=PLAIN"),
            Capability::Auth("PLAIN".to_string())
        );
        assert_eq!(
            Capability::parse("X-GM-EXT-1"),
            Capability::Other("X-GM-EXT-1".to_string())
        );
    }
}
