//! Message models shared between cache, live fetch, and callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::AccountId;

/// Listing-level view of one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
    /// Owning account.
    pub account_id: AccountId,
    /// Mailbox UID; with the account, the natural key.
    pub uid: u32,
    /// Sender display name, when known.
    pub from_name: Option<String>,
    /// Sender address.
    pub from_address: String,
    /// To header, decoded, as a display string.
    pub to: String,
    /// Decoded subject.
    pub subject: String,
    /// Message date.
    pub date: DateTime<Utc>,
    /// Whether the message carries `\Seen`.
    pub is_read: bool,
    /// Whether the structure metadata indicates attachments.
    pub has_attachments: bool,
    /// First lines of the text body, filled once content is cached.
    pub preview_text: String,
    /// RFC822 size in bytes.
    pub size_bytes: u32,
    /// Message-ID header, when present.
    pub message_id: Option<String>,
}

impl MessageSummary {
    /// Deterministic client-facing identifier.
    #[must_use]
    pub fn client_id(&self) -> String {
        format!("imap-{}", self.uid)
    }
}

/// Attachment metadata persisted alongside message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    /// Declared filename.
    pub filename: String,
    /// Size of the decoded part in bytes.
    pub size_bytes: u32,
    /// Lowercased `type/subtype`.
    pub content_type: String,
}

impl From<mailwatch_mime::AttachmentInfo> for AttachmentMeta {
    fn from(info: mailwatch_mime::AttachmentInfo) -> Self {
        Self {
            filename: info.filename,
            size_bytes: info.size_bytes,
            content_type: info.content_type,
        }
    }
}

/// Full view of one message: summary plus decoded bodies and attachments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    /// Listing fields.
    pub summary: MessageSummary,
    /// Decoded text body.
    pub text_body: String,
    /// Decoded HTML body, when the message has one.
    pub html_body: Option<String>,
    /// Attachments in part order.
    pub attachments: Vec<AttachmentMeta>,
}

/// Per-account synchronization position.
///
/// Advanced only by the orchestrator, after a successful fetch-and-merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCursor {
    /// When the last successful sync completed.
    pub last_sync: Option<DateTime<Utc>>,
    /// Highest UID known to be merged into the cache.
    pub highest_known_uid: Option<u32>,
}

impl SyncCursor {
    /// Records a successful sync that reached `uid`.
    pub fn advance(&mut self, uid: Option<u32>) {
        self.last_sync = Some(Utc::now());
        if let Some(uid) = uid {
            self.highest_known_uid = Some(self.highest_known_uid.map_or(uid, |cur| cur.max(uid)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_is_uid_derived() {
        let summary = MessageSummary {
            account_id: AccountId::from("acct"),
            uid: 4711,
            from_name: None,
            from_address: "a@b.com".to_string(),
            to: String::new(),
            subject: String::new(),
            date: Utc::now(),
            is_read: false,
            has_attachments: false,
            preview_text: String::new(),
            size_bytes: 0,
            message_id: None,
        };
        assert_eq!(summary.client_id(), "imap-4711");
    }

    #[test]
    fn cursor_advance_keeps_maximum() {
        let mut cursor = SyncCursor::default();
        cursor.advance(Some(100));
        assert_eq!(cursor.highest_known_uid, Some(100));
        cursor.advance(Some(90));
        assert_eq!(cursor.highest_known_uid, Some(100));
        cursor.advance(None);
        assert_eq!(cursor.highest_known_uid, Some(100));
        assert!(cursor.last_sync.is_some());
    }
}
