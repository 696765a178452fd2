//! Live-mail seam: what the orchestrator needs from the server side.
//!
//! The real implementation opens a fresh protocol client per logical
//! operation; mutations and reads never share the monitor's connection.
//! Tests substitute a mock.

use chrono::{DateTime, NaiveDate, Utc};
use mailwatch_imap::parser::BodyStructure;
use mailwatch_imap::{FetchedMessage, Flag, ProtocolClient, SearchCriteria};
use mailwatch_mime::{PartNode, has_attachments, parse_body, parse_header_block};

use crate::account::{AccountId, ImapCredentials};
use crate::model::{MessageContent, MessageSummary};
use crate::Result;

/// Server-side operations the orchestrator depends on.
pub trait LiveMail: Send + Sync + 'static {
    /// The newest `limit` messages, newest UID first.
    fn fetch_recent(
        &self,
        account_id: &AccountId,
        credentials: &ImapCredentials,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<MessageSummary>>> + Send;

    /// All messages received on or after `since`, newest UID first.
    fn fetch_since(
        &self,
        account_id: &AccountId,
        credentials: &ImapCredentials,
        since: NaiveDate,
    ) -> impl Future<Output = Result<Vec<MessageSummary>>> + Send;

    /// The full content of one message.
    fn fetch_content(
        &self,
        account_id: &AccountId,
        credentials: &ImapCredentials,
        uid: u32,
    ) -> impl Future<Output = Result<MessageContent>> + Send;

    /// Server-side subject search.
    fn search(
        &self,
        account_id: &AccountId,
        credentials: &ImapCredentials,
        query: &str,
    ) -> impl Future<Output = Result<Vec<MessageSummary>>> + Send;

    /// Sets or clears `\Seen` on one message.
    fn set_read(
        &self,
        credentials: &ImapCredentials,
        uid: u32,
        read: bool,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Deletes one message.
    fn delete(
        &self,
        credentials: &ImapCredentials,
        uid: u32,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Real implementation over [`ProtocolClient`], one connection per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImapMailer;

impl ImapMailer {
    async fn with_client<T, F>(credentials: &ImapCredentials, op: F) -> Result<T>
    where
        F: AsyncFnOnce(&mut ProtocolClient, &str) -> mailwatch_imap::Result<T>,
    {
        let mut client = ProtocolClient::new(credentials.client_config());
        client.connect().await?;
        let result = op(&mut client, &credentials.mailbox).await;
        client.disconnect().await;
        Ok(result?)
    }
}

impl LiveMail for ImapMailer {
    async fn fetch_recent(
        &self,
        account_id: &AccountId,
        credentials: &ImapCredentials,
        limit: u32,
    ) -> Result<Vec<MessageSummary>> {
        let fetched = Self::with_client(credentials, async |client, mailbox| {
            client.list_recent(mailbox, limit).await
        })
        .await?;
        Ok(summaries_from(account_id, fetched))
    }

    async fn fetch_since(
        &self,
        account_id: &AccountId,
        credentials: &ImapCredentials,
        since: NaiveDate,
    ) -> Result<Vec<MessageSummary>> {
        let fetched = Self::with_client(credentials, async |client, mailbox| {
            client.list_since(mailbox, since).await
        })
        .await?;
        Ok(summaries_from(account_id, fetched))
    }

    async fn fetch_content(
        &self,
        account_id: &AccountId,
        credentials: &ImapCredentials,
        uid: u32,
    ) -> Result<MessageContent> {
        let raw = Self::with_client(credentials, async |client, mailbox| {
            client.fetch_content(mailbox, uid).await
        })
        .await?;
        Ok(content_from_raw(account_id, uid, &raw))
    }

    async fn search(
        &self,
        account_id: &AccountId,
        credentials: &ImapCredentials,
        query: &str,
    ) -> Result<Vec<MessageSummary>> {
        let criteria = SearchCriteria::Subject(query.to_string());
        let fetched = Self::with_client(credentials, async |client, mailbox| {
            client.search(mailbox, criteria).await
        })
        .await?;
        Ok(summaries_from(account_id, fetched))
    }

    async fn set_read(&self, credentials: &ImapCredentials, uid: u32, read: bool) -> Result<()> {
        Self::with_client(credentials, async |client, mailbox| {
            client.set_flag(mailbox, uid, Flag::Seen, read).await
        })
        .await
    }

    async fn delete(&self, credentials: &ImapCredentials, uid: u32) -> Result<()> {
        Self::with_client(credentials, async |client, mailbox| {
            client.delete(mailbox, uid).await
        })
        .await
    }
}

fn summaries_from(account_id: &AccountId, fetched: Vec<FetchedMessage>) -> Vec<MessageSummary> {
    fetched
        .into_iter()
        .filter_map(|msg| summary_from_fetched(account_id, msg))
        .collect()
}

/// Builds a listing summary from one FETCH result. Messages the server
/// returned without a UID cannot be keyed and are dropped.
fn summary_from_fetched(account_id: &AccountId, msg: FetchedMessage) -> Option<MessageSummary> {
    let uid = msg.uid?;
    let header = parse_header_block(msg.header.as_deref().unwrap_or_default());

    let date = if msg.header.is_some() {
        header.date
    } else {
        msg.internal_date
            .as_deref()
            .and_then(parse_internal_date)
            .unwrap_or_else(Utc::now)
    };

    let (from_name, from_address) = header
        .from
        .map(|mb| (mb.name, mb.address))
        .unwrap_or_default();
    let to = header
        .to
        .iter()
        .map(|mb| mb.address.clone())
        .collect::<Vec<_>>()
        .join(", ");

    let attachments = msg
        .structure
        .as_ref()
        .is_some_and(|bs| has_attachments(&part_node(bs)));

    Some(MessageSummary {
        account_id: account_id.clone(),
        uid,
        from_name,
        from_address,
        to,
        subject: header.subject,
        date,
        is_read: msg.flags.contains(&Flag::Seen),
        has_attachments: attachments,
        preview_text: String::new(),
        size_bytes: msg.size_bytes.unwrap_or(0),
        message_id: header.message_id,
    })
}

/// Builds full content from the raw message bytes of a content fetch.
fn content_from_raw(account_id: &AccountId, uid: u32, raw: &[u8]) -> MessageContent {
    let header = parse_header_block(raw);
    let body = parse_body(raw);
    let attachments: Vec<_> = body.attachments.into_iter().map(Into::into).collect();
    let (from_name, from_address) = header
        .from
        .map(|mb| (mb.name, mb.address))
        .unwrap_or_default();

    MessageContent {
        summary: MessageSummary {
            account_id: account_id.clone(),
            uid,
            from_name,
            from_address,
            to: header
                .to
                .iter()
                .map(|mb| mb.address.clone())
                .collect::<Vec<_>>()
                .join(", "),
            subject: header.subject,
            date: header.date,
            is_read: false,
            has_attachments: !attachments.is_empty(),
            preview_text: String::new(),
            size_bytes: u32::try_from(raw.len()).unwrap_or(u32::MAX),
            message_id: header.message_id,
        },
        text_body: body.text,
        html_body: body.html,
        attachments,
    }
}

/// Maps the wire body-structure tree onto the MIME part tree used for
/// attachment detection.
fn part_node(bs: &BodyStructure) -> PartNode {
    PartNode {
        content_type: bs.content_type.clone(),
        disposition: bs.disposition.clone(),
        filename: bs.filename.clone(),
        size_bytes: bs.size_bytes,
        children: bs.parts.iter().map(part_node).collect(),
    }
}

/// Parses an INTERNALDATE value, e.g. `25-Aug-2026 10:30:00 +0200`.
fn parse_internal_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value.trim(), "%d-%b-%Y %H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
