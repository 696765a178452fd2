//! Cache-aware synchronization between the live server and the cache.
//!
//! The orchestrator answers reads from the cache whenever the account's
//! last sync is recent enough, refreshes in the background when it is
//! not, and keeps mutations dual-written so cache and server never
//! drift apart.

mod live;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{Days, Utc};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

pub use live::{ImapMailer, LiveMail};

use crate::account::{AccountId, ImapCredentials};
use crate::cache::CacheStore;
use crate::events::{self, EventReceiver, EventSender, MailEventKind};
use crate::model::{AttachmentMeta, MessageContent, MessageSummary, SyncCursor};
use crate::{Error, Result};

/// Cached listings younger than this are served as-is; anything older
/// is served while a background refresh runs.
const FRESH_WINDOW: Duration = Duration::from_secs(30);
/// Listing size when the caller does not specify one.
const DEFAULT_RECENT_LIMIT: u32 = 50;
/// Date window for incremental catch-up on a warm cache.
const CATCH_UP_WINDOW_DAYS: u64 = 2;

/// Options for [`SyncOrchestrator::get_messages`].
#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Skip the freshness policy and fetch live.
    pub force_refresh: bool,
    /// Maximum number of messages to return.
    pub limit: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            force_refresh: false,
            limit: DEFAULT_RECENT_LIMIT,
        }
    }
}

/// Where a listing's data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchSource {
    /// Served entirely from the cache.
    Cache,
    /// Refreshed from the server before answering.
    Live,
    /// Served from the cache while a refresh runs in the background.
    Hybrid,
}

/// A listing plus provenance.
#[derive(Debug, Clone)]
pub struct MessageBatch {
    /// Summaries, newest UID first.
    pub messages: Vec<MessageSummary>,
    /// Where the data came from.
    pub source: BatchSource,
    /// Whether a background refresh is currently in flight.
    pub is_refreshing: bool,
}

/// Per-account synchronization state.
struct AccountSession {
    credentials: ImapCredentials,
    last_sync: Mutex<Option<Instant>>,
    refreshing: AtomicBool,
    refresh_done: Notify,
    cursor: Mutex<SyncCursor>,
}

impl AccountSession {
    fn new(credentials: ImapCredentials) -> Self {
        Self {
            credentials,
            last_sync: Mutex::new(None),
            refreshing: AtomicBool::new(false),
            refresh_done: Notify::new(),
            cursor: Mutex::new(SyncCursor::default()),
        }
    }

    async fn age(&self) -> Option<Duration> {
        self.last_sync.lock().await.map(|at| at.elapsed())
    }

    async fn mark_synced(&self, highest_uid: Option<u32>) {
        *self.last_sync.lock().await = Some(Instant::now());
        self.cursor.lock().await.advance(highest_uid);
    }

    /// Claims the single-flight refresh slot for this account.
    fn begin_refresh(&self) -> bool {
        self.refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish_refresh(&self) {
        self.refreshing.store(false, Ordering::Release);
        self.refresh_done.notify_waiters();
    }

    /// Waits for the refresh that currently holds the slot.
    async fn await_refresh(&self) {
        let notified = self.refresh_done.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.refreshing.load(Ordering::Acquire) {
            notified.await;
        }
    }
}

struct Inner<M> {
    live: M,
    cache: Arc<CacheStore>,
    sessions: RwLock<HashMap<AccountId, Arc<AccountSession>>>,
    events: EventSender,
}

/// Cache-aware mail access for registered accounts.
///
/// Cheap to clone; clones share sessions and cache.
pub struct SyncOrchestrator<M: LiveMail> {
    inner: Arc<Inner<M>>,
}

impl<M: LiveMail> Clone for SyncOrchestrator<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: LiveMail> SyncOrchestrator<M> {
    /// Creates an orchestrator over a live-mail source and a cache.
    ///
    /// Events (new mail after merges, forwarded monitor events) go to
    /// `events`.
    pub fn new(live: M, cache: Arc<CacheStore>, events: EventSender) -> Self {
        Self {
            inner: Arc::new(Inner {
                live,
                cache,
                sessions: RwLock::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Registers an account, replacing any previous credentials.
    pub async fn register_account(&self, account_id: AccountId, credentials: ImapCredentials) {
        let session = Arc::new(AccountSession::new(credentials));
        self.inner
            .sessions
            .write()
            .await
            .insert(account_id, session);
    }

    /// Drops an account's session. Cached messages stay on disk.
    pub async fn remove_account(&self, account_id: &AccountId) {
        self.inner.sessions.write().await.remove(account_id);
    }

    /// Lists messages for an account under the freshness policy.
    ///
    /// An empty cache (or `force_refresh`) fetches live before
    /// answering; a fresh cache is served directly; anything else is
    /// served from the cache while exactly one background refresh
    /// runs. Any live failure falls back to whatever is cached.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownAccount`] for unregistered accounts, or
    /// a cache error with no live fallback.
    pub async fn get_messages(
        &self,
        account_id: &AccountId,
        options: SyncOptions,
    ) -> Result<MessageBatch> {
        let session = self.session(account_id).await?;

        if options.force_refresh {
            return self.live_first(account_id, &session, options.limit).await;
        }

        let fresh = session.age().await.is_some_and(|age| age < FRESH_WINDOW);
        if fresh {
            return self
                .cache_batch(account_id, options.limit, BatchSource::Cache)
                .await;
        }

        // Nothing cached yet: a hybrid answer would be empty, so block
        // on the live fetch exactly as a forced refresh would.
        let cached_rows = match self.inner.cache.count(account_id).await {
            Ok(n) => n,
            Err(err) => {
                warn!(account = %account_id, error = %err, "cache count failed, fetching live");
                0
            }
        };
        if cached_rows == 0 {
            return self.live_first(account_id, &session, options.limit).await;
        }

        self.spawn_refresh(account_id, &session, options.limit);
        self.cache_batch(account_id, options.limit, BatchSource::Hybrid)
            .await
    }

    /// Full content of one message, cache-first.
    ///
    /// On a cache miss the message is fetched live, parsed, and
    /// persisted. When the full parse finds attachments the listing
    /// pass missed, the cached summary flag is corrected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownAccount`], a live fetch error on cache
    /// miss, or a cache error.
    pub async fn get_content(&self, account_id: &AccountId, uid: u32) -> Result<MessageContent> {
        let session = self.session(account_id).await?;

        // A cache read failure is treated as a miss: the live path can
        // still answer.
        match self.inner.cache.get_content(account_id, uid).await {
            Ok(Some(content)) => return Ok(content),
            Ok(None) => {}
            Err(err) => {
                warn!(account = %account_id, uid, error = %err, "content cache read failed");
            }
        }

        debug!(account = %account_id, uid, "content cache miss, fetching live");
        let content = self
            .inner
            .live
            .fetch_content(account_id, &session.credentials, uid)
            .await?;
        if let Err(err) = self.persist_content(account_id, uid, &content).await {
            warn!(account = %account_id, uid, error = %err, "caching fetched content failed");
        }
        Ok(content)
    }

    /// Metadata for one attachment, by 1-based part index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for index 0 or past the last
    /// attachment, plus anything [`Self::get_content`] can return.
    pub async fn get_attachment(
        &self,
        account_id: &AccountId,
        uid: u32,
        index: u32,
    ) -> Result<AttachmentMeta> {
        let content = self.get_content(account_id, uid).await?;
        let slot = index
            .checked_sub(1)
            .and_then(|i| content.attachments.get(usize::try_from(i).unwrap_or(usize::MAX)));
        slot.cloned()
            .ok_or_else(|| Error::NotFound(format!("attachment {index} of uid {uid}")))
    }

    /// Sets or clears the read flag on server and cache concurrently.
    ///
    /// # Errors
    ///
    /// Fails if either write fails; the two sides may then disagree
    /// until the next refresh.
    pub async fn mark_read(&self, account_id: &AccountId, uid: u32, read: bool) -> Result<()> {
        let session = self.session(account_id).await?;
        let (live, cached) = tokio::join!(
            self.inner.live.set_read(&session.credentials, uid, read),
            self.inner.cache.set_read_flag(account_id, uid, read),
        );
        live?;
        cached
    }

    /// Deletes a message on server and cache concurrently.
    ///
    /// # Errors
    ///
    /// Fails if either delete fails.
    pub async fn delete(&self, account_id: &AccountId, uid: u32) -> Result<()> {
        let session = self.session(account_id).await?;
        let (live, cached) = tokio::join!(
            self.inner.live.delete(&session.credentials, uid),
            self.inner.cache.remove(account_id, uid),
        );
        live?;
        cached
    }

    /// Searches cache and server concurrently and merges the results.
    ///
    /// Results are merged by UID with the cached entry winning, sorted
    /// newest date first, truncated to `limit`. A live search failure
    /// degrades to cache-only results.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownAccount`] or a cache error.
    pub async fn search(
        &self,
        account_id: &AccountId,
        query: &str,
        limit: u32,
    ) -> Result<Vec<MessageSummary>> {
        let session = self.session(account_id).await?;
        let (cached, live) = tokio::join!(
            self.inner.cache.search(account_id, query),
            self.inner.live.search(account_id, &session.credentials, query),
        );
        let cached = cached?;
        let live = live.unwrap_or_else(|err| {
            warn!(account = %account_id, error = %err, "live search failed, cache only");
            Vec::new()
        });

        let mut by_uid: HashMap<u32, MessageSummary> =
            live.into_iter().map(|s| (s.uid, s)).collect();
        for summary in cached {
            by_uid.insert(summary.uid, summary);
        }
        let mut merged: Vec<_> = by_uid.into_values().collect();
        merged.sort_by(|a, b| b.date.cmp(&a.date));
        merged.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(merged)
    }

    /// Catches the cache up after a new-mail signal.
    ///
    /// With a warm cache this fetches a short date window and keeps
    /// only UIDs above the cached maximum; a cold cache fetches the
    /// most recent messages. Returns how many messages were merged and
    /// emits `NewMail` when that count is non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownAccount`], a live fetch error, or a
    /// cache error.
    pub async fn incremental_catch_up(&self, account_id: &AccountId) -> Result<usize> {
        let session = self.session(account_id).await?;
        let max_uid = self.inner.cache.max_uid(account_id).await?;

        let fetched = match max_uid {
            Some(max) => {
                let today = Utc::now().date_naive();
                let since = today.checked_sub_days(Days::new(CATCH_UP_WINDOW_DAYS)).unwrap_or(today);
                self.inner
                    .live
                    .fetch_since(account_id, &session.credentials, since)
                    .await?
                    .into_iter()
                    .filter(|s| s.uid > max)
                    .collect::<Vec<_>>()
            }
            None => {
                self.inner
                    .live
                    .fetch_recent(account_id, &session.credentials, DEFAULT_RECENT_LIMIT)
                    .await?
            }
        };

        let merged = self.merge_and_advance(account_id, &session, &fetched).await?;
        debug!(account = %account_id, fetched = fetched.len(), merged, "catch-up complete");
        Ok(merged)
    }

    /// Consumes a monitor's event stream in a dedicated task.
    ///
    /// New-mail and refresh signals trigger an incremental catch-up;
    /// everything else is forwarded to the orchestrator's outbound
    /// channel. The task ends when the monitor side closes.
    pub fn spawn_event_pump(&self, mut monitor_events: EventReceiver) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = monitor_events.recv().await {
                match event.kind {
                    MailEventKind::NewMail { .. } | MailEventKind::RefreshRequested => {
                        if let Err(err) = this.incremental_catch_up(&event.account_id).await {
                            warn!(account = %event.account_id, error = %err, "catch-up failed");
                            events::emit(
                                &this.inner.events,
                                &event.account_id,
                                MailEventKind::Error {
                                    message: err.to_string(),
                                },
                            );
                        }
                    }
                    kind => events::emit(&this.inner.events, &event.account_id, kind),
                }
            }
        })
    }

    async fn persist_content(
        &self,
        account_id: &AccountId,
        uid: u32,
        content: &MessageContent,
    ) -> Result<()> {
        self.inner.cache.upsert_content(content).await?;
        if !content.attachments.is_empty() {
            self.inner
                .cache
                .set_has_attachments(account_id, uid, true)
                .await?;
        }
        Ok(())
    }

    async fn session(&self, account_id: &AccountId) -> Result<Arc<AccountSession>> {
        self.inner
            .sessions
            .read()
            .await
            .get(account_id)
            .cloned()
            .ok_or_else(|| Error::UnknownAccount(account_id.to_string()))
    }

    async fn cache_batch(
        &self,
        account_id: &AccountId,
        limit: u32,
        source: BatchSource,
    ) -> Result<MessageBatch> {
        let session = self.session(account_id).await?;
        // A broken cache must not take reads down while the server is
        // reachable; answer from a direct live fetch instead.
        let mut messages = match self.inner.cache.get_all(account_id).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(account = %account_id, error = %err, "cache read failed, fetching live");
                self.inner
                    .live
                    .fetch_recent(account_id, &session.credentials, limit)
                    .await?
            }
        };
        messages.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(MessageBatch {
            messages,
            source,
            is_refreshing: session.refreshing.load(Ordering::Acquire),
        })
    }

    /// Refreshes live before answering, falling back to the cache.
    async fn live_first(
        &self,
        account_id: &AccountId,
        session: &Arc<AccountSession>,
        limit: u32,
    ) -> Result<MessageBatch> {
        match self.refresh_single_flight(account_id, session, limit).await {
            Ok(()) => self.cache_batch(account_id, limit, BatchSource::Live).await,
            Err(err) => {
                warn!(account = %account_id, error = %err, "live refresh failed, serving cache");
                self.cache_batch(account_id, limit, BatchSource::Cache)
                    .await
            }
        }
    }

    /// Runs a refresh under the account's single-flight flag.
    ///
    /// A caller that finds a refresh already in flight does not start a
    /// second one; it waits for the in-flight refresh and adopts its
    /// result.
    async fn refresh_single_flight(
        &self,
        account_id: &AccountId,
        session: &Arc<AccountSession>,
        limit: u32,
    ) -> Result<()> {
        if !session.begin_refresh() {
            session.await_refresh().await;
            return Ok(());
        }
        let result = self.refresh_now(account_id, session, limit).await;
        session.finish_refresh();
        result.map(|_| ())
    }

    /// Fetches the newest messages and merges them, updating the cursor.
    async fn refresh_now(
        &self,
        account_id: &AccountId,
        session: &AccountSession,
        limit: u32,
    ) -> Result<usize> {
        let fetched = self
            .inner
            .live
            .fetch_recent(account_id, &session.credentials, limit)
            .await?;
        self.merge_and_advance(account_id, session, &fetched).await
    }

    /// Spawns a background refresh unless one is already in flight.
    fn spawn_refresh(&self, account_id: &AccountId, session: &Arc<AccountSession>, limit: u32) {
        if !session.begin_refresh() {
            return;
        }
        let this = self.clone();
        let account_id = account_id.clone();
        let session = Arc::clone(session);
        tokio::spawn(async move {
            let result = this.refresh_now(&account_id, &session, limit).await;
            session.finish_refresh();
            if let Err(err) = result {
                warn!(account = %account_id, error = %err, "background refresh failed");
            }
        });
    }

    async fn merge_and_advance(
        &self,
        account_id: &AccountId,
        session: &AccountSession,
        fetched: &[MessageSummary],
    ) -> Result<usize> {
        let merged = self.inner.cache.merge_new(account_id, fetched).await?;
        let highest = fetched.iter().map(|s| s.uid).max();
        session.mark_synced(highest).await;
        if merged > 0 {
            events::emit(
                &self.inner.events,
                account_id,
                MailEventKind::NewMail {
                    count: u32::try_from(merged).unwrap_or(u32::MAX),
                },
            );
        }
        Ok(merged)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;

    use chrono::NaiveDate;

    use super::*;

    struct MockState {
        recent: StdMutex<Vec<MessageSummary>>,
        since: StdMutex<Vec<MessageSummary>>,
        content: StdMutex<HashMap<u32, MessageContent>>,
        search_hits: StdMutex<Vec<MessageSummary>>,
        recent_calls: AtomicU32,
        since_calls: AtomicU32,
        set_read_calls: AtomicU32,
        delete_calls: AtomicU32,
        fail_listings: AtomicU32,
        fail_mutations: AtomicU32,
        // Closed gate: listing calls block until permits are added.
        gated: AtomicU32,
        gate: tokio::sync::Semaphore,
    }

    impl Default for MockState {
        fn default() -> Self {
            Self {
                recent: StdMutex::default(),
                since: StdMutex::default(),
                content: StdMutex::default(),
                search_hits: StdMutex::default(),
                recent_calls: AtomicU32::default(),
                since_calls: AtomicU32::default(),
                set_read_calls: AtomicU32::default(),
                delete_calls: AtomicU32::default(),
                fail_listings: AtomicU32::default(),
                fail_mutations: AtomicU32::default(),
                gated: AtomicU32::default(),
                gate: tokio::sync::Semaphore::new(0),
            }
        }
    }

    #[derive(Clone, Default)]
    struct MockLive {
        state: Arc<MockState>,
    }

    impl MockLive {
        fn maybe_fail(&self, flag: &AtomicU32) -> Result<()> {
            if flag.load(Ordering::Relaxed) > 0 {
                return Err(Error::NotFound("mock failure".to_string()));
            }
            Ok(())
        }

        async fn pass_gate(&self) {
            if self.state.gated.load(Ordering::Relaxed) > 0 {
                self.state.gate.acquire().await.unwrap().forget();
            }
        }
    }

    impl LiveMail for MockLive {
        async fn fetch_recent(
            &self,
            _account_id: &AccountId,
            _credentials: &ImapCredentials,
            _limit: u32,
        ) -> Result<Vec<MessageSummary>> {
            self.state.recent_calls.fetch_add(1, Ordering::SeqCst);
            self.pass_gate().await;
            self.maybe_fail(&self.state.fail_listings)?;
            Ok(self.state.recent.lock().unwrap().clone())
        }

        async fn fetch_since(
            &self,
            _account_id: &AccountId,
            _credentials: &ImapCredentials,
            _since: NaiveDate,
        ) -> Result<Vec<MessageSummary>> {
            self.state.since_calls.fetch_add(1, Ordering::SeqCst);
            self.maybe_fail(&self.state.fail_listings)?;
            Ok(self.state.since.lock().unwrap().clone())
        }

        async fn fetch_content(
            &self,
            _account_id: &AccountId,
            _credentials: &ImapCredentials,
            uid: u32,
        ) -> Result<MessageContent> {
            self.state
                .content
                .lock()
                .unwrap()
                .get(&uid)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("uid {uid}")))
        }

        async fn search(
            &self,
            _account_id: &AccountId,
            _credentials: &ImapCredentials,
            _query: &str,
        ) -> Result<Vec<MessageSummary>> {
            self.maybe_fail(&self.state.fail_listings)?;
            Ok(self.state.search_hits.lock().unwrap().clone())
        }

        async fn set_read(
            &self,
            _credentials: &ImapCredentials,
            _uid: u32,
            _read: bool,
        ) -> Result<()> {
            self.maybe_fail(&self.state.fail_mutations)?;
            self.state.set_read_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete(&self, _credentials: &ImapCredentials, _uid: u32) -> Result<()> {
            self.maybe_fail(&self.state.fail_mutations)?;
            self.state.delete_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn summary(account: &str, uid: u32) -> MessageSummary {
        MessageSummary {
            account_id: AccountId::from(account),
            uid,
            from_name: None,
            from_address: "a@example.com".to_string(),
            to: String::new(),
            subject: format!("msg {uid}"),
            date: Utc::now(),
            is_read: false,
            has_attachments: false,
            preview_text: String::new(),
            size_bytes: 100,
            message_id: None,
        }
    }

    fn credentials() -> ImapCredentials {
        ImapCredentials::new("imap.example.com", 993, "user", "secret")
    }

    async fn setup() -> (SyncOrchestrator<MockLive>, MockLive, EventReceiver, AccountId) {
        let live = MockLive::default();
        let cache = Arc::new(CacheStore::in_memory().await.unwrap());
        let (tx, rx) = events::channel();
        let orchestrator = SyncOrchestrator::new(live.clone(), cache, tx);
        let account = AccountId::from("acct");
        orchestrator
            .register_account(account.clone(), credentials())
            .await;
        (orchestrator, live, rx, account)
    }

    /// Waits until the in-flight background refresh has drained.
    async fn settle(orchestrator: &SyncOrchestrator<MockLive>, account: &AccountId) -> MessageBatch {
        for _ in 0..200 {
            let batch = orchestrator
                .get_messages(account, SyncOptions::default())
                .await
                .unwrap();
            if batch.source == BatchSource::Cache && !batch.is_refreshing {
                return batch;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("background refresh never settled");
    }

    #[tokio::test]
    async fn stale_cache_triggers_exactly_one_background_refresh() {
        let (orchestrator, live, _rx, account) = setup().await;
        *live.state.recent.lock().unwrap() = vec![summary("acct", 10), summary("acct", 11)];
        // Warm cache, never synced: the stale path applies.
        orchestrator
            .inner
            .cache
            .merge_new(&account, &[summary("acct", 10)])
            .await
            .unwrap();
        // Hold the refresh in flight so the second call observes it.
        live.state.gated.store(1, Ordering::Relaxed);

        let first = orchestrator
            .get_messages(&account, SyncOptions::default())
            .await
            .unwrap();
        let second = orchestrator
            .get_messages(&account, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(first.source, BatchSource::Hybrid);
        assert!(first.is_refreshing);
        assert_eq!(second.source, BatchSource::Hybrid);
        assert!(second.is_refreshing);

        live.state.gate.add_permits(1);
        let settled = settle(&orchestrator, &account).await;
        assert_eq!(settled.messages.len(), 2);
        assert_eq!(live.state.recent_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cold_cache_blocks_on_live_fetch() {
        let (orchestrator, live, _rx, account) = setup().await;
        *live.state.recent.lock().unwrap() = vec![summary("acct", 1)];

        // Nothing cached: the first listing must come back populated,
        // not as an empty hybrid answer.
        let batch = orchestrator
            .get_messages(&account, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(batch.source, BatchSource::Live);
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(live.state.recent_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mid_window_age_serves_hybrid_with_refresh() {
        let (orchestrator, live, _rx, account) = setup().await;
        *live.state.recent.lock().unwrap() = vec![summary("acct", 1)];

        // Sync once, then age the session past the fresh window.
        orchestrator
            .get_messages(
                &account,
                SyncOptions {
                    force_refresh: true,
                    ..SyncOptions::default()
                },
            )
            .await
            .unwrap();
        // Back-date the sync instead of advancing a paused clock: the
        // paused clock's auto-advance trips sqlx pool timeouts while
        // SQLite runs real I/O on a blocking thread.
        {
            let session = orchestrator
                .inner
                .sessions
                .read()
                .await
                .get(&account)
                .cloned()
                .unwrap();
            *session.last_sync.lock().await = Some(Instant::now() - Duration::from_secs(45));
        }

        live.state.gated.store(1, Ordering::Relaxed);
        let batch = orchestrator
            .get_messages(&account, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(batch.source, BatchSource::Hybrid);
        assert!(batch.is_refreshing);

        live.state.gate.add_permits(1);
        let settled = settle(&orchestrator, &account).await;
        assert_eq!(settled.source, BatchSource::Cache);
        assert_eq!(live.state.recent_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn forced_refresh_adopts_inflight_refresh() {
        let (orchestrator, live, _rx, account) = setup().await;
        *live.state.recent.lock().unwrap() = vec![summary("acct", 10), summary("acct", 11)];
        orchestrator
            .inner
            .cache
            .merge_new(&account, &[summary("acct", 10)])
            .await
            .unwrap();
        live.state.gated.store(1, Ordering::Relaxed);

        // Stale path claims the single-flight slot and blocks in flight.
        let hybrid = orchestrator
            .get_messages(&account, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(hybrid.source, BatchSource::Hybrid);

        // A forced refresh must observe that refresh, not start its own.
        let forced = tokio::spawn({
            let orchestrator = orchestrator.clone();
            let account = account.clone();
            async move {
                orchestrator
                    .get_messages(
                        &account,
                        SyncOptions {
                            force_refresh: true,
                            ..SyncOptions::default()
                        },
                    )
                    .await
            }
        });
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        live.state.gate.add_permits(1);
        let batch = forced.await.unwrap().unwrap();
        assert_eq!(batch.source, BatchSource::Live);
        assert_eq!(batch.messages.len(), 2);
        assert_eq!(live.state.recent_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listing_degrades_to_live_when_cache_fails() {
        let (orchestrator, live, _rx, account) = setup().await;
        *live.state.recent.lock().unwrap() = vec![summary("acct", 1), summary("acct", 2)];
        orchestrator.inner.cache.close().await;

        let batch = orchestrator
            .get_messages(&account, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(batch.messages.len(), 2);
    }

    #[tokio::test]
    async fn content_degrades_to_live_when_cache_fails() {
        let (orchestrator, live, _rx, account) = setup().await;
        live.state.content.lock().unwrap().insert(
            5,
            MessageContent {
                summary: summary("acct", 5),
                text_body: "still reachable".to_string(),
                html_body: None,
                attachments: Vec::new(),
            },
        );
        orchestrator.inner.cache.close().await;

        let content = orchestrator.get_content(&account, 5).await.unwrap();
        assert_eq!(content.text_body, "still reachable");
    }

    #[tokio::test]
    async fn force_refresh_fetches_live_and_marks_fresh() {
        let (orchestrator, live, _rx, account) = setup().await;
        *live.state.recent.lock().unwrap() = vec![summary("acct", 5)];

        let batch = orchestrator
            .get_messages(
                &account,
                SyncOptions {
                    force_refresh: true,
                    ..SyncOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(batch.source, BatchSource::Live);
        assert_eq!(batch.messages.len(), 1);

        let again = orchestrator
            .get_messages(&account, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(again.source, BatchSource::Cache);
        assert_eq!(live.state.recent_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_force_refresh_falls_back_to_cache() {
        let (orchestrator, live, _rx, account) = setup().await;
        orchestrator
            .inner
            .cache
            .merge_new(&account, &[summary("acct", 3)])
            .await
            .unwrap();
        live.state.fail_listings.store(1, Ordering::Relaxed);

        let batch = orchestrator
            .get_messages(
                &account,
                SyncOptions {
                    force_refresh: true,
                    ..SyncOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(batch.source, BatchSource::Cache);
        assert_eq!(batch.messages.len(), 1);
    }

    #[tokio::test]
    async fn catch_up_merges_only_uids_above_cached_maximum() {
        let (orchestrator, live, mut rx, account) = setup().await;
        orchestrator
            .inner
            .cache
            .merge_new(&account, &[summary("acct", 100)])
            .await
            .unwrap();
        *live.state.since.lock().unwrap() = vec![
            summary("acct", 100),
            summary("acct", 101),
            summary("acct", 102),
        ];

        let merged = orchestrator.incremental_catch_up(&account).await.unwrap();
        assert_eq!(merged, 2);
        assert_eq!(live.state.since_calls.load(Ordering::SeqCst), 1);
        assert_eq!(live.state.recent_calls.load(Ordering::SeqCst), 0);
        assert_eq!(orchestrator.inner.cache.count(&account).await.unwrap(), 3);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, MailEventKind::NewMail { count: 2 });
    }

    #[tokio::test]
    async fn catch_up_on_cold_cache_fetches_recent() {
        let (orchestrator, live, _rx, account) = setup().await;
        *live.state.recent.lock().unwrap() = vec![summary("acct", 1), summary("acct", 2)];

        let merged = orchestrator.incremental_catch_up(&account).await.unwrap();
        assert_eq!(merged, 2);
        assert_eq!(live.state.recent_calls.load(Ordering::SeqCst), 1);
        assert_eq!(live.state.since_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn attachment_index_is_one_based_and_bounded() {
        let (orchestrator, live, _rx, account) = setup().await;
        let content = MessageContent {
            summary: summary("acct", 7),
            text_body: "body".to_string(),
            html_body: None,
            attachments: vec![AttachmentMeta {
                filename: "a.pdf".to_string(),
                size_bytes: 10,
                content_type: "application/pdf".to_string(),
            }],
        };
        live.state.content.lock().unwrap().insert(7, content);

        let meta = orchestrator.get_attachment(&account, 7, 1).await.unwrap();
        assert_eq!(meta.filename, "a.pdf");

        assert!(matches!(
            orchestrator.get_attachment(&account, 7, 0).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            orchestrator.get_attachment(&account, 7, 2).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn content_miss_fetches_live_and_corrects_attachment_flag() {
        let (orchestrator, live, _rx, account) = setup().await;
        // Listing pass cached the summary without the attachment flag.
        let mut listed = summary("acct", 9);
        listed.has_attachments = false;
        orchestrator
            .inner
            .cache
            .merge_new(&account, &[listed])
            .await
            .unwrap();

        let mut full = summary("acct", 9);
        full.has_attachments = true;
        live.state.content.lock().unwrap().insert(
            9,
            MessageContent {
                summary: full,
                text_body: "hello".to_string(),
                html_body: None,
                attachments: vec![AttachmentMeta {
                    filename: "x.zip".to_string(),
                    size_bytes: 3,
                    content_type: "application/zip".to_string(),
                }],
            },
        );

        let content = orchestrator.get_content(&account, 9).await.unwrap();
        assert_eq!(content.attachments.len(), 1);

        let all = orchestrator.inner.cache.get_all(&account).await.unwrap();
        assert!(all[0].has_attachments);

        // Second read is served from the cache.
        live.state.content.lock().unwrap().clear();
        let cached = orchestrator.get_content(&account, 9).await.unwrap();
        assert_eq!(cached.text_body, "hello");
    }

    #[tokio::test]
    async fn mark_read_writes_both_sides() {
        let (orchestrator, live, _rx, account) = setup().await;
        orchestrator
            .inner
            .cache
            .merge_new(&account, &[summary("acct", 4)])
            .await
            .unwrap();

        orchestrator.mark_read(&account, 4, true).await.unwrap();
        assert_eq!(live.state.set_read_calls.load(Ordering::SeqCst), 1);
        let all = orchestrator.inner.cache.get_all(&account).await.unwrap();
        assert!(all[0].is_read);
    }

    #[tokio::test]
    async fn mark_read_fails_when_server_write_fails() {
        let (orchestrator, live, _rx, account) = setup().await;
        orchestrator
            .inner
            .cache
            .merge_new(&account, &[summary("acct", 4)])
            .await
            .unwrap();
        live.state.fail_mutations.store(1, Ordering::Relaxed);

        assert!(orchestrator.mark_read(&account, 4, true).await.is_err());
    }

    #[tokio::test]
    async fn delete_removes_from_both_sides() {
        let (orchestrator, live, _rx, account) = setup().await;
        orchestrator
            .inner
            .cache
            .merge_new(&account, &[summary("acct", 6)])
            .await
            .unwrap();

        orchestrator.delete(&account, 6).await.unwrap();
        assert_eq!(live.state.delete_calls.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.inner.cache.count(&account).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn search_merges_by_uid_with_cache_winning() {
        let (orchestrator, live, _rx, account) = setup().await;
        let mut cached = summary("acct", 1);
        cached.subject = "cached copy".to_string();
        orchestrator
            .inner
            .cache
            .merge_new(&account, &[cached])
            .await
            .unwrap();

        let mut live_dup = summary("acct", 1);
        live_dup.subject = "server copy".to_string();
        *live.state.search_hits.lock().unwrap() = vec![live_dup, summary("acct", 2)];

        let hits = orchestrator.search(&account, "copy", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        let uid1 = hits.iter().find(|s| s.uid == 1).unwrap();
        assert_eq!(uid1.subject, "cached copy");
    }

    #[tokio::test]
    async fn search_degrades_to_cache_when_live_fails() {
        let (orchestrator, live, _rx, account) = setup().await;
        orchestrator
            .inner
            .cache
            .merge_new(&account, &[summary("acct", 1)])
            .await
            .unwrap();
        live.state.fail_listings.store(1, Ordering::Relaxed);

        let hits = orchestrator.search(&account, "msg", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn unknown_account_is_rejected() {
        let (orchestrator, _live, _rx, _account) = setup().await;
        let ghost = AccountId::from("ghost");
        assert!(matches!(
            orchestrator.get_messages(&ghost, SyncOptions::default()).await,
            Err(Error::UnknownAccount(_))
        ));
    }

    #[tokio::test]
    async fn event_pump_catches_up_on_refresh_requests() {
        let (orchestrator, live, mut rx, account) = setup().await;
        *live.state.recent.lock().unwrap() = vec![summary("acct", 1)];

        let (monitor_tx, monitor_rx) = events::channel();
        let pump = orchestrator.spawn_event_pump(monitor_rx);

        events::emit(&monitor_tx, &account, MailEventKind::Connected);
        events::emit(&monitor_tx, &account, MailEventKind::RefreshRequested);
        drop(monitor_tx);
        pump.await.unwrap();

        // Connected is forwarded; the catch-up merge emits NewMail.
        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, MailEventKind::Connected);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, MailEventKind::NewMail { count: 1 });
        assert_eq!(live.state.recent_calls.load(Ordering::SeqCst), 1);
    }
}
