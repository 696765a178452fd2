//! Protocol client: authenticated IMAP operations over one connection.
//!
//! `ProtocolClient` owns the connection lifecycle (connect, login, logout)
//! and exposes the mailbox operations the sync engine needs. The inner
//! `Connection` is generic over the stream so tests can drive it with mock
//! I/O.

use std::time::Duration;

use chrono::NaiveDate;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::command::{Command, FetchProfile, SearchCriteria, TagGenerator};
use crate::connection::{FramedStream, MailStream, connect_plain, connect_tls};
use crate::parser::{
    self, BodyStructure, FetchItem, Response, ResponseCode, Status, UntaggedResponse,
};
use crate::types::{Capability, Flag, Flags, MailboxSnapshot, SequenceSet};
use crate::{Error, Result};

/// Default deadline for connection establishment steps.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for a single command round-trip.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(20);

/// Deadline for the LOGOUT exchange before the socket is torn down anyway.
const LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Extra headroom fetched beyond a requested message count, so that a sort
/// by UID still yields the newest messages when sequence order and UID
/// order disagree slightly.
const OVERFETCH_DIVISOR: u32 = 4;

/// Connection settings for a [`ProtocolClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server hostname.
    pub host: String,
    /// Server port (993 for implicit TLS).
    pub port: u16,
    /// Login username.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Use TLS. Disable only against local test servers.
    pub use_tls: bool,
    /// Deadline for each connection establishment step.
    pub connect_timeout: Duration,
    /// Deadline for each command round-trip.
    pub command_timeout: Duration,
}

impl ClientConfig {
    /// Creates a config for an implicit-TLS server on the given host.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: String::new(),
            password: String::new(),
            use_tls: true,
            connect_timeout: CONNECT_TIMEOUT,
            command_timeout: COMMAND_TIMEOUT,
        }
    }

    /// Sets the login credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }
}

/// One message as returned by a FETCH, before any MIME interpretation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedMessage {
    /// Sequence number within the current mailbox session.
    pub seq: u32,
    /// UID, when the server included one.
    pub uid: Option<u32>,
    /// Message flags.
    pub flags: Flags,
    /// RFC822.SIZE in bytes.
    pub size_bytes: Option<u32>,
    /// INTERNALDATE as the server sent it.
    pub internal_date: Option<String>,
    /// Raw header block from a summary fetch.
    pub header: Option<Vec<u8>>,
    /// Raw full message from a content fetch.
    pub body: Option<Vec<u8>>,
    /// Body structure from a summary fetch.
    pub structure: Option<BodyStructure>,
}

/// Result of one command exchange: the untagged data plus the tagged
/// completion's response code and text.
struct Exchange {
    untagged: Vec<UntaggedResponse>,
    code: Option<ResponseCode>,
}

/// An established, authenticated connection.
///
/// Generic over the stream so tests can substitute mock I/O.
#[derive(Debug)]
pub struct Connection<S> {
    stream: FramedStream<S>,
    tags: TagGenerator,
    capabilities: Vec<Capability>,
    selected: Option<SelectedState>,
}

#[derive(Debug)]
struct SelectedState {
    mailbox: String,
    read_only: bool,
    snapshot: MailboxSnapshot,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an already-open stream, reading and parsing the greeting.
    ///
    /// # Errors
    ///
    /// Returns an error if the greeting is missing or is a BYE.
    pub async fn from_stream(stream: S) -> Result<Self> {
        let mut stream = FramedStream::new(stream);
        let greeting = stream.read_response().await?;
        let capabilities = match parser::parse(&greeting)? {
            Response::Untagged(UntaggedResponse::Ok { code, .. }) => match code {
                Some(ResponseCode::Capability(caps)) => caps,
                _ => Vec::new(),
            },
            Response::Untagged(UntaggedResponse::Bye { text }) => {
                return Err(Error::Bye(text));
            }
            other => {
                return Err(Error::Protocol(format!("unexpected greeting: {other:?}")));
            }
        };
        Ok(Self {
            stream,
            tags: TagGenerator::default(),
            capabilities,
            selected: None,
        })
    }

    /// Logs in with LOGIN. Refreshes capabilities from the reply when the
    /// server includes them.
    ///
    /// # Errors
    ///
    /// Returns `Error::Auth` when the server rejects the credentials.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let command = Command::Login {
            username: username.to_string(),
            password: password.to_string(),
        };
        let exchange = self.exchange(&command).await.map_err(|e| match e {
            Error::No(text) => Error::Auth(text),
            other => other,
        })?;
        if let Some(ResponseCode::Capability(caps)) = exchange.code {
            self.capabilities = caps;
        }
        Ok(())
    }

    /// Returns the advertised capabilities, querying the server when the
    /// greeting and login reply carried none.
    ///
    /// # Errors
    ///
    /// Returns an error if the CAPABILITY command fails.
    pub async fn capabilities(&mut self) -> Result<&[Capability]> {
        if self.capabilities.is_empty() {
            let exchange = self.exchange(&Command::Capability).await?;
            for untagged in exchange.untagged {
                if let UntaggedResponse::Capability(caps) = untagged {
                    self.capabilities = caps;
                }
            }
        }
        Ok(&self.capabilities)
    }

    /// Opens a mailbox, read-only via EXAMINE or read-write via SELECT,
    /// rebuilding the mailbox snapshot from the untagged replies.
    ///
    /// Re-opening the same mailbox in the same mode is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Error::No` when the mailbox does not exist or cannot be
    /// opened in the requested mode.
    pub async fn open(&mut self, mailbox: &str, read_only: bool) -> Result<&MailboxSnapshot> {
        let already_open = self
            .selected
            .as_ref()
            .is_some_and(|s| s.mailbox == mailbox && s.read_only == read_only);

        if !already_open {
            let command = if read_only {
                Command::Examine {
                    mailbox: mailbox.to_string(),
                }
            } else {
                Command::Select {
                    mailbox: mailbox.to_string(),
                }
            };
            self.selected = None;
            let exchange = self.exchange(&command).await?;

            let mut snapshot = MailboxSnapshot::default();
            for untagged in exchange.untagged {
                match untagged {
                    UntaggedResponse::Exists(n) => snapshot.total_messages = n,
                    UntaggedResponse::Recent(n) => snapshot.recent_count = n,
                    UntaggedResponse::Flags(flags) => snapshot.flags = flags,
                    UntaggedResponse::Ok {
                        code: Some(ResponseCode::Unseen(n)),
                        ..
                    } => snapshot.unseen_count = Some(n),
                    _ => {}
                }
            }
            snapshot.read_only = match exchange.code {
                Some(ResponseCode::ReadOnly) => true,
                Some(ResponseCode::ReadWrite) => false,
                _ => read_only,
            };

            self.selected = Some(SelectedState {
                mailbox: mailbox.to_string(),
                read_only: snapshot.read_only,
                snapshot,
            });
        }
        self.selected
            .as_ref()
            .map(|s| &s.snapshot)
            .ok_or_else(|| Error::InvalidState("open did not select".to_string()))
    }

    /// Returns the newest `limit` messages of `mailbox` as summaries,
    /// ordered by UID descending.
    ///
    /// Fetches a little beyond `limit` by sequence position, then sorts by
    /// UID, so recent arrivals with out-of-order sequence placement are not
    /// missed.
    ///
    /// # Errors
    ///
    /// Returns an error when the mailbox cannot be opened or the fetch
    /// fails.
    pub async fn list_recent(&mut self, mailbox: &str, limit: u32) -> Result<Vec<FetchedMessage>> {
        let total = self.open(mailbox, true).await?.total_messages;
        if total == 0 || limit == 0 {
            return Ok(Vec::new());
        }

        let want = limit.saturating_add(limit / OVERFETCH_DIVISOR).max(1);
        let start = total.saturating_sub(want).saturating_add(1);
        let Some(set) = SequenceSet::range(start, total) else {
            return Ok(Vec::new());
        };

        let exchange = self
            .exchange(&Command::Fetch {
                set,
                profile: FetchProfile::Summary,
            })
            .await?;

        let mut messages = collect_fetches(exchange.untagged);
        messages.sort_by(|a, b| b.uid.cmp(&a.uid));
        messages.truncate(limit as usize);
        Ok(messages)
    }

    /// Returns summaries for all messages received on or after `since`.
    ///
    /// # Errors
    ///
    /// Returns an error when the search or fetch fails.
    pub async fn list_since(
        &mut self,
        mailbox: &str,
        since: NaiveDate,
    ) -> Result<Vec<FetchedMessage>> {
        self.open(mailbox, true).await?;
        let exchange = self
            .exchange(&Command::UidSearch {
                criteria: SearchCriteria::Since(since),
            })
            .await?;
        let uids = collect_search(&exchange.untagged);
        self.fetch_by_uids(mailbox, &uids).await
    }

    /// Fetches summaries for the given UIDs, ordered by UID descending.
    ///
    /// # Errors
    ///
    /// Returns an error when the fetch fails.
    pub async fn fetch_by_uids(
        &mut self,
        mailbox: &str,
        uids: &[u32],
    ) -> Result<Vec<FetchedMessage>> {
        self.open(mailbox, true).await?;
        let Some(set) = SequenceSet::list(uids.to_vec()) else {
            return Ok(Vec::new());
        };
        let exchange = self
            .exchange(&Command::UidFetch {
                set,
                profile: FetchProfile::Summary,
            })
            .await?;
        let mut messages = collect_fetches(exchange.untagged);
        messages.sort_by(|a, b| b.uid.cmp(&a.uid));
        Ok(messages)
    }

    /// Fetches the complete raw message for one UID.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` when the server returns no body for the
    /// UID.
    pub async fn fetch_content(&mut self, mailbox: &str, uid: u32) -> Result<Vec<u8>> {
        self.open(mailbox, true).await?;
        let set = SequenceSet::single(uid)
            .ok_or_else(|| Error::Protocol("uid must be nonzero".to_string()))?;
        let exchange = self
            .exchange(&Command::UidFetch {
                set,
                profile: FetchProfile::Full,
            })
            .await?;
        collect_fetches(exchange.untagged)
            .into_iter()
            .find(|m| m.uid == Some(uid))
            .and_then(|m| m.body)
            .ok_or_else(|| Error::Protocol(format!("no body returned for uid {uid}")))
    }

    /// Runs a UID SEARCH and fetches summaries for the hits.
    ///
    /// # Errors
    ///
    /// Returns an error when the search or fetch fails.
    pub async fn search(
        &mut self,
        mailbox: &str,
        criteria: SearchCriteria,
    ) -> Result<Vec<FetchedMessage>> {
        self.open(mailbox, true).await?;
        let exchange = self.exchange(&Command::UidSearch { criteria }).await?;
        let uids = collect_search(&exchange.untagged);
        self.fetch_by_uids(mailbox, &uids).await
    }

    /// Adds or removes a flag on one message.
    ///
    /// # Errors
    ///
    /// Returns an error when the mailbox cannot be opened read-write or
    /// the store fails.
    pub async fn set_flag(&mut self, mailbox: &str, uid: u32, flag: Flag, add: bool) -> Result<()> {
        self.open(mailbox, false).await?;
        let set = SequenceSet::single(uid)
            .ok_or_else(|| Error::Protocol("uid must be nonzero".to_string()))?;
        self.exchange(&Command::UidStore { set, flag, add }).await?;
        Ok(())
    }

    /// Deletes one message: marks it `\Deleted` and expunges.
    ///
    /// # Errors
    ///
    /// Returns an error when the store or expunge fails.
    pub async fn delete(&mut self, mailbox: &str, uid: u32) -> Result<()> {
        self.set_flag(mailbox, uid, Flag::Deleted, true).await?;
        self.exchange(&Command::Expunge).await?;
        // Expunge shifts sequence numbers; drop the stale snapshot.
        self.selected = None;
        Ok(())
    }

    /// Enters IDLE, returning a handle for waiting on server events.
    ///
    /// # Errors
    ///
    /// Returns `Error::Bad`/`Error::No` when the server rejects IDLE.
    pub async fn idle(&mut self) -> Result<IdleHandle<'_, S>> {
        let tag = self.tags.next();
        self.stream
            .write_command(&Command::Idle.serialize(&tag))
            .await?;
        let response = self.stream.read_response().await?;
        match parser::parse(&response)? {
            Response::Continuation { .. } => Ok(IdleHandle {
                stream: &mut self.stream,
                tag,
            }),
            Response::Tagged { status, text, .. } => match status {
                Status::No => Err(Error::No(text)),
                Status::Bad => Err(Error::Bad(text)),
                _ => Err(Error::Protocol("unexpected reply to IDLE".to_string())),
            },
            Response::Untagged(_) => {
                Err(Error::Protocol("expected IDLE continuation".to_string()))
            }
        }
    }

    /// Sends LOGOUT and waits for the tagged reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails; callers tear the socket
    /// down regardless.
    pub async fn logout(&mut self) -> Result<()> {
        let tag = self.tags.next();
        self.stream
            .write_command(&Command::Logout.serialize(&tag))
            .await?;
        // BYE arrives untagged before the tagged OK.
        self.stream.read_until_tagged(&tag).await?;
        Ok(())
    }

    async fn exchange(&mut self, command: &Command) -> Result<Exchange> {
        let tag = self.tags.next();
        self.stream.write_command(&command.serialize(&tag)).await?;
        let raw = self.stream.read_until_tagged(&tag).await?;

        let mut untagged = Vec::new();
        for buf in &raw {
            match parser::parse(buf) {
                Ok(Response::Untagged(u)) => untagged.push(u),
                Ok(Response::Tagged {
                    tag: got,
                    status,
                    code,
                    text,
                }) if got == tag => {
                    return match status {
                        Status::Ok => Ok(Exchange { untagged, code }),
                        Status::No => Err(Error::No(text)),
                        Status::Bad => Err(Error::Bad(text)),
                        Status::Bye => Err(Error::Bye(text)),
                    };
                }
                Ok(other) => debug!(?other, "ignoring out-of-band response"),
                // One malformed untagged line should not sink the command.
                Err(e) => warn!(error = %e, "skipping unparseable response line"),
            }
        }
        Err(Error::Protocol(format!("no tagged reply for {tag}")))
    }

    fn into_stream(self) -> FramedStream<S> {
        self.stream
    }
}

/// Handle for an active IDLE session (RFC 2177).
///
/// Dropping the handle without calling [`IdleHandle::done`] leaves the
/// connection in IDLE; callers should always finish with `done`.
pub struct IdleHandle<'a, S> {
    stream: &'a mut FramedStream<S>,
    tag: String,
}

/// Mailbox change observed while idling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    /// Message count changed (EXISTS).
    Exists(u32),
    /// A message was expunged.
    Expunged(u32),
    /// Flags changed on a message.
    Changed(u32),
    /// The wait deadline elapsed without server activity.
    Timeout,
}

impl<S> IdleHandle<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Waits up to `duration` for one server event.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection drops or the server
    /// terminates the session.
    pub async fn wait(&mut self, duration: Duration) -> Result<IdleEvent> {
        let Ok(read) = tokio::time::timeout(duration, self.stream.read_response()).await else {
            return Ok(IdleEvent::Timeout);
        };
        match parser::parse(&read?)? {
            Response::Untagged(UntaggedResponse::Exists(n)) => Ok(IdleEvent::Exists(n)),
            Response::Untagged(UntaggedResponse::Expunge(n)) => Ok(IdleEvent::Expunged(n)),
            Response::Untagged(UntaggedResponse::Fetch { seq, .. }) => Ok(IdleEvent::Changed(seq)),
            Response::Untagged(UntaggedResponse::Bye { text }) => Err(Error::Bye(text)),
            Response::Tagged { status, text, .. } => match status {
                // The server ended IDLE on its own; treat like a timeout so
                // the caller re-issues.
                Status::Ok => Ok(IdleEvent::Timeout),
                Status::No => Err(Error::No(text)),
                Status::Bad => Err(Error::Bad(text)),
                Status::Bye => Err(Error::Bye(text)),
            },
            _ => Ok(IdleEvent::Timeout),
        }
    }

    /// Ends IDLE by sending DONE and draining to the tagged reply.
    ///
    /// # Errors
    ///
    /// Returns an error when the server rejects the termination.
    pub async fn done(self) -> Result<()> {
        self.stream
            .write_command(&Command::Done.serialize(""))
            .await?;
        for buf in self.stream.read_until_tagged(&self.tag).await? {
            if let Response::Tagged { status, text, .. } = parser::parse(&buf)? {
                return match status {
                    Status::Ok => Ok(()),
                    Status::No => Err(Error::No(text)),
                    Status::Bad => Err(Error::Bad(text)),
                    Status::Bye => Err(Error::Bye(text)),
                };
            }
        }
        Err(Error::Protocol("no reply to DONE".to_string()))
    }
}

fn collect_fetches(untagged: Vec<UntaggedResponse>) -> Vec<FetchedMessage> {
    let mut out = Vec::new();
    for response in untagged {
        let UntaggedResponse::Fetch { seq, items } = response else {
            continue;
        };
        let mut msg = FetchedMessage {
            seq,
            ..FetchedMessage::default()
        };
        for item in items {
            match item {
                FetchItem::Uid(uid) => msg.uid = Some(uid),
                FetchItem::Flags(flags) => msg.flags = flags,
                FetchItem::Rfc822Size(n) => msg.size_bytes = Some(n),
                FetchItem::InternalDate(d) => msg.internal_date = Some(d),
                FetchItem::BodyStructure(bs) => msg.structure = Some(bs),
                FetchItem::Body { section, data } => {
                    if section.is_empty() {
                        msg.body = data;
                    } else {
                        msg.header = data;
                    }
                }
            }
        }
        out.push(msg);
    }
    out
}

fn collect_search(untagged: &[UntaggedResponse]) -> Vec<u32> {
    let mut uids = Vec::new();
    for response in untagged {
        if let UntaggedResponse::Search(hits) = response {
            uids.extend_from_slice(hits);
        }
    }
    uids
}

/// Client with managed connection state over real network streams.
///
/// Every public operation enforces the configured timeouts; a timeout
/// surfaces as [`Error::Timeout`] and leaves the connection unusable.
pub struct ProtocolClient {
    config: ClientConfig,
    conn: Option<Connection<MailStream>>,
}

impl ProtocolClient {
    /// Creates a disconnected client.
    #[must_use]
    pub const fn new(config: ClientConfig) -> Self {
        Self { config, conn: None }
    }

    /// Returns true when a live, authenticated connection is held.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Connects, reads the greeting, and logs in.
    ///
    /// Each step runs under its own `connect_timeout` so a stall in any
    /// one of them cannot hold the connection attempt open indefinitely.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` when a step stalls and `Error::Auth` when
    /// login is rejected.
    pub async fn connect(&mut self) -> Result<()> {
        let deadline = self.config.connect_timeout;

        let stream = step(deadline, async {
            if self.config.use_tls {
                connect_tls(&self.config.host, self.config.port).await
            } else {
                connect_plain(&self.config.host, self.config.port).await
            }
        })
        .await?;

        let mut conn = step(deadline, Connection::from_stream(stream)).await?;
        step(
            deadline,
            conn.login(&self.config.username, &self.config.password),
        )
        .await?;

        debug!(host = %self.config.host, "connected and authenticated");
        self.conn = Some(conn);
        Ok(())
    }

    /// Logs out and closes the socket.
    ///
    /// The LOGOUT exchange is bounded; if the server stalls, the socket
    /// is shut down anyway and the client still ends up disconnected.
    pub async fn disconnect(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if let Err(e) = step(LOGOUT_TIMEOUT, conn.logout()).await {
            debug!(error = %e, "logout failed, forcing socket close");
        }
        let mut stream = conn.into_stream();
        let _ = stream.get_mut().shutdown().await;
    }

    /// Whether the server advertises IDLE.
    ///
    /// # Errors
    ///
    /// Returns an error when a capability query is needed and fails.
    pub async fn supports_idle(&mut self) -> Result<bool> {
        let timeout = self.config.command_timeout;
        let conn = self.require_conn()?;
        let caps = step(timeout, conn.capabilities()).await?;
        Ok(caps.contains(&Capability::Idle))
    }

    /// Newest `limit` messages of `mailbox`, newest UID first.
    ///
    /// # Errors
    ///
    /// Returns an error when disconnected or the fetch fails.
    pub async fn list_recent(&mut self, mailbox: &str, limit: u32) -> Result<Vec<FetchedMessage>> {
        let timeout = self.config.command_timeout;
        let conn = self.require_conn()?;
        step(timeout, conn.list_recent(mailbox, limit)).await
    }

    /// All messages received on or after `since`, newest UID first.
    ///
    /// # Errors
    ///
    /// Returns an error when disconnected or the search fails.
    pub async fn list_since(
        &mut self,
        mailbox: &str,
        since: NaiveDate,
    ) -> Result<Vec<FetchedMessage>> {
        let timeout = self.config.command_timeout;
        let conn = self.require_conn()?;
        step(timeout, conn.list_since(mailbox, since)).await
    }

    /// Summaries for specific UIDs.
    ///
    /// # Errors
    ///
    /// Returns an error when disconnected or the fetch fails.
    pub async fn fetch_by_uids(
        &mut self,
        mailbox: &str,
        uids: &[u32],
    ) -> Result<Vec<FetchedMessage>> {
        let timeout = self.config.command_timeout;
        let conn = self.require_conn()?;
        step(timeout, conn.fetch_by_uids(mailbox, uids)).await
    }

    /// Full raw message bytes for one UID.
    ///
    /// # Errors
    ///
    /// Returns an error when disconnected or the fetch fails.
    pub async fn fetch_content(&mut self, mailbox: &str, uid: u32) -> Result<Vec<u8>> {
        let timeout = self.config.command_timeout;
        let conn = self.require_conn()?;
        step(timeout, conn.fetch_content(mailbox, uid)).await
    }

    /// UID search plus summary fetch for the hits.
    ///
    /// # Errors
    ///
    /// Returns an error when disconnected or the search fails.
    pub async fn search(
        &mut self,
        mailbox: &str,
        criteria: SearchCriteria,
    ) -> Result<Vec<FetchedMessage>> {
        let timeout = self.config.command_timeout;
        let conn = self.require_conn()?;
        step(timeout, conn.search(mailbox, criteria)).await
    }

    /// Adds or removes a flag on one message.
    ///
    /// # Errors
    ///
    /// Returns an error when disconnected or the store fails.
    pub async fn set_flag(&mut self, mailbox: &str, uid: u32, flag: Flag, add: bool) -> Result<()> {
        let timeout = self.config.command_timeout;
        let conn = self.require_conn()?;
        step(timeout, conn.set_flag(mailbox, uid, flag, add)).await
    }

    /// Deletes one message (flag `\Deleted` plus EXPUNGE).
    ///
    /// # Errors
    ///
    /// Returns an error when disconnected or the delete fails.
    pub async fn delete(&mut self, mailbox: &str, uid: u32) -> Result<()> {
        let timeout = self.config.command_timeout;
        let conn = self.require_conn()?;
        step(timeout, conn.delete(mailbox, uid)).await
    }

    /// Opens a mailbox read-only and returns its snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error when disconnected or the open fails.
    pub async fn mailbox_info(&mut self, mailbox: &str) -> Result<MailboxSnapshot> {
        let timeout = self.config.command_timeout;
        let conn = self.require_conn()?;
        let snapshot = step(timeout, conn.open(mailbox, true)).await?;
        Ok(snapshot.clone())
    }

    /// Direct access to the connection, for IDLE.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` when disconnected.
    pub fn connection(&mut self) -> Result<&mut Connection<MailStream>> {
        self.require_conn()
    }

    fn require_conn(&mut self) -> Result<&mut Connection<MailStream>> {
        self.conn
            .as_mut()
            .ok_or_else(|| Error::InvalidState("not connected".to_string()))
    }
}

impl std::fmt::Debug for ProtocolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolClient")
            .field("host", &self.config.host)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

async fn step<T>(
    deadline: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| Error::Timeout(deadline))?
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    const GREETING: &[u8] = b"* OK [CAPABILITY IMAP4rev1 IDLE] ready\r\n";

    #[tokio::test]
    async fn greeting_captures_capabilities() {
        let mock = Builder::new().read(GREETING).build();
        let conn = Connection::from_stream(mock).await.unwrap();
        assert!(conn.capabilities.contains(&Capability::Idle));
    }

    #[tokio::test]
    async fn bye_greeting_is_an_error() {
        let mock = Builder::new().read(b"* BYE overloaded\r\n").build();
        let err = Connection::from_stream(mock).await.unwrap_err();
        assert!(matches!(err, Error::Bye(_)));
    }

    #[tokio::test]
    async fn login_failure_maps_to_auth_error() {
        let mock = Builder::new()
            .read(GREETING)
            .write(b"A0000 LOGIN user secret\r\n")
            .read(b"A0000 NO [AUTHENTICATIONFAILED] nope\r\n")
            .build();
        let mut conn = Connection::from_stream(mock).await.unwrap();
        let err = conn.login("user", "secret").await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn list_recent_sorts_by_uid_descending() {
        // Three messages, UIDs arriving out of order; limit 2 must keep
        // the two highest UIDs, newest first.
        let mock = Builder::new()
            .read(GREETING)
            .write(b"A0000 EXAMINE INBOX\r\n")
            .read(b"* 3 EXISTS\r\n* 0 RECENT\r\nA0000 OK [READ-ONLY] done\r\n")
            .write(
                b"A0001 FETCH 1:3 (UID FLAGS RFC822.SIZE INTERNALDATE BODYSTRUCTURE \
BODY.PEEK[HEADER.FIELDS (FROM TO SUBJECT DATE MESSAGE-ID)])\r\n",
            )
            .read(
                b"* 1 FETCH (UID 104 FLAGS ())\r\n\
* 2 FETCH (UID 110 FLAGS ())\r\n\
* 3 FETCH (UID 107 FLAGS (\\Seen))\r\n\
A0001 OK done\r\n",
            )
            .build();
        let mut conn = Connection::from_stream(mock).await.unwrap();
        let messages = conn.list_recent("INBOX", 2).await.unwrap();
        let uids: Vec<_> = messages.iter().filter_map(|m| m.uid).collect();
        assert_eq!(uids, vec![110, 107]);
    }

    #[tokio::test]
    async fn list_recent_empty_mailbox() {
        let mock = Builder::new()
            .read(GREETING)
            .write(b"A0000 EXAMINE INBOX\r\n")
            .read(b"* 0 EXISTS\r\nA0000 OK [READ-ONLY] done\r\n")
            .build();
        let mut conn = Connection::from_stream(mock).await.unwrap();
        assert!(conn.list_recent("INBOX", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_stores_flag_then_expunges() {
        let mock = Builder::new()
            .read(GREETING)
            .write(b"A0000 SELECT INBOX\r\n")
            .read(b"* 1 EXISTS\r\nA0000 OK [READ-WRITE] done\r\n")
            .write(b"A0001 UID STORE 7 +FLAGS.SILENT (\\Deleted)\r\n")
            .read(b"A0001 OK done\r\n")
            .write(b"A0002 EXPUNGE\r\n")
            .read(b"* 1 EXPUNGE\r\nA0002 OK done\r\n")
            .build();
        let mut conn = Connection::from_stream(mock).await.unwrap();
        conn.delete("INBOX", 7).await.unwrap();
        // Snapshot is invalidated after expunge.
        assert!(conn.selected.is_none());
    }

    #[tokio::test]
    async fn idle_waits_for_exists() {
        let mock = Builder::new()
            .read(GREETING)
            .write(b"A0000 IDLE\r\n")
            .read(b"+ idling\r\n")
            .read(b"* 8 EXISTS\r\n")
            .write(b"DONE\r\n")
            .read(b"A0000 OK IDLE terminated\r\n")
            .build();
        let mut conn = Connection::from_stream(mock).await.unwrap();
        let mut handle = conn.idle().await.unwrap();
        let event = handle.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(event, IdleEvent::Exists(8));
        handle.done().await.unwrap();
    }

    #[tokio::test]
    async fn idle_wait_times_out() {
        let mock = Builder::new()
            .read(GREETING)
            .write(b"A0000 IDLE\r\n")
            .read(b"+ idling\r\n")
            .wait(Duration::from_millis(200))
            .write(b"DONE\r\n")
            .read(b"A0000 OK done\r\n")
            .build();
        let mut conn = Connection::from_stream(mock).await.unwrap();
        let mut handle = conn.idle().await.unwrap();
        let event = handle.wait(Duration::from_millis(20)).await.unwrap();
        assert_eq!(event, IdleEvent::Timeout);
        handle.done().await.unwrap();
    }

    #[tokio::test]
    async fn operations_require_connection() {
        let mut client = ProtocolClient::new(ClientConfig::new("imap.example.com", 993));
        let err = client.list_recent("INBOX", 5).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }
}
