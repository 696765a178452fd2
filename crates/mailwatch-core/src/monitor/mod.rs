//! Real-time mailbox monitoring.
//!
//! One monitor per account, on a dedicated connection. Prefers IDLE
//! (RFC 2177) and falls back to interval polling when the server lacks
//! it. Reconnects with linear backoff and reports everything through the
//! event channel; it never performs mutations.

pub mod transport;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use transport::{IdleSession, IdleTransport, ImapIdleTransport, WatchOutcome};

use crate::account::{AccountId, ImapCredentials};
use crate::events::{EventSender, MailEventKind, emit};
use crate::Error;

/// Hosts known to support IDLE even when capability discovery fails.
const KNOWN_IDLE_HOSTS: [&str; 4] = [
    "imap.gmail.com",
    "outlook.office365.com",
    "imap.mail.yahoo.com",
    "imap.fastmail.com",
];

/// Tuning knobs for the monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Poll interval when IDLE is unavailable.
    pub poll_interval: Duration,
    /// Ceiling on one IDLE wait; the session is re-issued on expiry.
    /// Kept below the RFC 2177 29-minute limit.
    pub idle_ceiling: Duration,
    /// Consecutive failures tolerated before giving up.
    pub max_attempts: u32,
    /// Linear backoff unit; the sleep is `unit * attempts`.
    pub backoff_unit: Duration,
    /// Pause before resuming after a manual refresh interrupt.
    pub resume_delay: Duration,
    /// Hostname suffixes assumed to support IDLE when discovery fails.
    pub idle_hosts: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            idle_ceiling: Duration::from_secs(28 * 60),
            max_attempts: 5,
            backoff_unit: Duration::from_secs(2),
            resume_delay: Duration::from_secs(1),
            idle_hosts: KNOWN_IDLE_HOSTS.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Point-in-time view of the monitor, safe to read from any task.
#[derive(Debug, Clone, Default)]
pub struct MonitorStatus {
    /// A session is currently established.
    pub is_connected: bool,
    /// The session is in IDLE (as opposed to polling).
    pub is_idling: bool,
    /// Whether the server was determined to support IDLE.
    pub supports_idle: bool,
    /// Last time the server showed signs of life.
    pub last_activity: Option<DateTime<Utc>>,
    /// Consecutive failures since the last healthy session.
    pub attempts: u32,
}

enum Command {
    Stop,
    Refresh,
}

enum LoopExit {
    Stopped,
    Interrupted,
    Failed(Error),
}

/// Handle to a running per-account monitor task.
pub struct IdleMonitor {
    commands: mpsc::Sender<Command>,
    status: Arc<RwLock<MonitorStatus>>,
    handle: Option<JoinHandle<()>>,
}

impl IdleMonitor {
    /// Spawns the monitor task for one account.
    pub fn start<T: IdleTransport>(
        account_id: AccountId,
        credentials: ImapCredentials,
        transport: T,
        config: MonitorConfig,
        events: EventSender,
    ) -> Self {
        let (commands, rx) = mpsc::channel(8);
        let status = Arc::new(RwLock::new(MonitorStatus::default()));
        let worker = Worker {
            account_id,
            credentials,
            transport,
            config,
            events,
            status: Arc::clone(&status),
        };
        let handle = tokio::spawn(worker.run(rx));
        Self {
            commands,
            status,
            handle: Some(handle),
        }
    }

    /// Snapshot of the monitor state.
    #[must_use]
    pub fn status(&self) -> MonitorStatus {
        self.status
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Requests an out-of-band refresh. When idling, the session is
    /// interrupted and re-established after a short delay; when polling,
    /// the refresh event fires immediately.
    pub fn manual_refresh(&self) {
        let _ = self.commands.try_send(Command::Refresh);
    }

    /// Stops the monitor. Idempotent; bounded by a teardown deadline
    /// after which the task is aborted.
    pub async fn stop(&mut self) {
        let _ = self.commands.try_send(Command::Stop);
        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(Duration::from_secs(5), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
    }
}

struct Worker<T: IdleTransport> {
    account_id: AccountId,
    credentials: ImapCredentials,
    transport: T,
    config: MonitorConfig,
    events: EventSender,
    status: Arc<RwLock<MonitorStatus>>,
}

impl<T: IdleTransport> Worker<T> {
    async fn run(self, mut rx: mpsc::Receiver<Command>) {
        let mut attempts = 0u32;

        loop {
            match self.transport.connect(&self.credentials).await {
                Ok(mut session) => {
                    self.update(|s| {
                        s.is_connected = true;
                        s.last_activity = Some(Utc::now());
                    });
                    emit(&self.events, &self.account_id, MailEventKind::Connected);

                    let supports_idle = self.detect_idle(&mut session).await;
                    self.update(|s| {
                        s.supports_idle = supports_idle;
                        s.is_idling = supports_idle;
                    });
                    info!(account = %self.account_id, supports_idle, "monitor session up");

                    // The counter resets inside the loops, once the
                    // session has survived a full wait or poll cycle; a
                    // server that accepts connections only to drop the
                    // session keeps accumulating failures.
                    let exit = if supports_idle {
                        self.idle_loop(&mut session, &mut rx, &mut attempts).await
                    } else {
                        self.poll_loop(&mut rx, &mut attempts).await
                    };

                    session.disconnect().await;
                    self.update(|s| {
                        s.is_connected = false;
                        s.is_idling = false;
                    });
                    emit(&self.events, &self.account_id, MailEventKind::Disconnected);

                    match exit {
                        LoopExit::Stopped => return,
                        LoopExit::Interrupted => {
                            tokio::time::sleep(self.config.resume_delay).await;
                            continue;
                        }
                        LoopExit::Failed(e) => {
                            warn!(account = %self.account_id, error = %e, "monitor session failed");
                            emit(
                                &self.events,
                                &self.account_id,
                                MailEventKind::Error {
                                    message: e.to_string(),
                                },
                            );
                            attempts += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(account = %self.account_id, error = %e, "monitor connect failed");
                    emit(
                        &self.events,
                        &self.account_id,
                        MailEventKind::Error {
                            message: e.to_string(),
                        },
                    );
                    attempts += 1;
                }
            }

            self.update(|s| s.attempts = attempts);
            if attempts >= self.config.max_attempts {
                emit(
                    &self.events,
                    &self.account_id,
                    MailEventKind::Error {
                        message: format!("monitoring stopped after {attempts} failed attempts"),
                    },
                );
                return;
            }

            let backoff = self.config.backoff_unit * attempts;
            debug!(account = %self.account_id, ?backoff, "monitor backing off");
            tokio::select! {
                cmd = rx.recv() => {
                    if matches!(cmd, None | Some(Command::Stop)) {
                        return;
                    }
                }
                () = tokio::time::sleep(backoff) => {}
            }
        }
    }

    /// Capability detection: session discovery first (advertised
    /// capabilities, then an explicit query), host allow-list last.
    async fn detect_idle(&self, session: &mut T::Session) -> bool {
        match session.supports_idle().await {
            Ok(supported) => supported,
            Err(e) => {
                debug!(error = %e, "capability discovery failed, consulting allow-list");
                self.config
                    .idle_hosts
                    .iter()
                    .any(|h| self.credentials.host.ends_with(h.as_str()))
            }
        }
    }

    async fn idle_loop(
        &self,
        session: &mut T::Session,
        rx: &mut mpsc::Receiver<Command>,
        attempts: &mut u32,
    ) -> LoopExit {
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    None | Some(Command::Stop) => return LoopExit::Stopped,
                    Some(Command::Refresh) => {
                        emit(&self.events, &self.account_id, MailEventKind::RefreshRequested);
                        // The interrupted wait may have left the session
                        // mid-IDLE; rebuild it rather than reuse it.
                        return LoopExit::Interrupted;
                    }
                },
                outcome = session.wait(self.config.idle_ceiling) => match outcome {
                    Ok(WatchOutcome::NewActivity { count }) => {
                        self.record_healthy(attempts);
                        emit(&self.events, &self.account_id, MailEventKind::NewMail { count });
                    }
                    Ok(WatchOutcome::Deleted { seq }) => {
                        self.record_healthy(attempts);
                        emit(&self.events, &self.account_id, MailEventKind::MailDeleted { seq });
                    }
                    // Ceiling reached; loop to re-issue the wait.
                    Ok(WatchOutcome::Quiet) => {
                        self.record_healthy(attempts);
                    }
                    Err(e) => return LoopExit::Failed(e),
                },
            }
        }
    }

    async fn poll_loop(&self, rx: &mut mpsc::Receiver<Command>, attempts: &mut u32) -> LoopExit {
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    None | Some(Command::Stop) => return LoopExit::Stopped,
                    Some(Command::Refresh) => {
                        emit(&self.events, &self.account_id, MailEventKind::RefreshRequested);
                    }
                },
                () = tokio::time::sleep(self.config.poll_interval) => {
                    self.record_healthy(attempts);
                    emit(&self.events, &self.account_id, MailEventKind::RefreshRequested);
                }
            }
        }
    }

    /// A completed wait or poll cycle proves the session healthy.
    fn record_healthy(&self, attempts: &mut u32) {
        *attempts = 0;
        self.update(|s| {
            s.attempts = 0;
            s.last_activity = Some(Utc::now());
        });
    }

    fn update<F: FnOnce(&mut MonitorStatus)>(&self, f: F) {
        if let Ok(mut guard) = self.status.write() {
            f(&mut guard);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::events;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Clone)]
    struct MockTransport {
        supports_idle: bool,
        fail_waits: bool,
        failing_connects: Arc<AtomicU32>,
        connects: Arc<AtomicU32>,
        outcomes: Arc<Mutex<VecDeque<WatchOutcome>>>,
    }

    impl MockTransport {
        fn new(supports_idle: bool, outcomes: Vec<WatchOutcome>) -> Self {
            Self {
                supports_idle,
                fail_waits: false,
                failing_connects: Arc::new(AtomicU32::new(0)),
                connects: Arc::new(AtomicU32::new(0)),
                outcomes: Arc::new(Mutex::new(outcomes.into())),
            }
        }
    }

    struct MockSession {
        supports_idle: bool,
        fail_waits: bool,
        outcomes: Arc<Mutex<VecDeque<WatchOutcome>>>,
    }

    impl IdleTransport for MockTransport {
        type Session = MockSession;

        async fn connect(&self, _credentials: &ImapCredentials) -> crate::Result<Self::Session> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.failing_connects.load(Ordering::SeqCst) > 0 {
                self.failing_connects.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::MutationFailed("connect refused".to_string()));
            }
            Ok(MockSession {
                supports_idle: self.supports_idle,
                fail_waits: self.fail_waits,
                outcomes: Arc::clone(&self.outcomes),
            })
        }
    }

    impl IdleSession for MockSession {
        async fn supports_idle(&mut self) -> crate::Result<bool> {
            Ok(self.supports_idle)
        }

        async fn wait(&mut self, ceiling: Duration) -> crate::Result<WatchOutcome> {
            if self.fail_waits {
                return Err(Error::MutationFailed("session dropped".to_string()));
            }
            let next = self.outcomes.lock().unwrap().pop_front();
            match next {
                Some(outcome) => Ok(outcome),
                None => {
                    tokio::time::sleep(ceiling).await;
                    Ok(WatchOutcome::Quiet)
                }
            }
        }

        async fn disconnect(&mut self) {}
    }

    fn credentials() -> ImapCredentials {
        ImapCredentials::new("mail.example.com", 993, "u", "p")
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(50),
            idle_ceiling: Duration::from_millis(100),
            max_attempts: 3,
            backoff_unit: Duration::from_millis(10),
            resume_delay: Duration::from_millis(10),
            idle_hosts: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_activity_emits_new_mail() {
        let transport =
            MockTransport::new(true, vec![WatchOutcome::NewActivity { count: 5 }]);
        let (tx, mut rx) = events::channel();
        let mut monitor = IdleMonitor::start(
            AccountId::from("a"),
            credentials(),
            transport,
            config(),
            tx,
        );

        assert_eq!(rx.recv().await.unwrap().kind, MailEventKind::Connected);
        assert_eq!(
            rx.recv().await.unwrap().kind,
            MailEventKind::NewMail { count: 5 }
        );
        let status = monitor.status();
        assert!(status.is_connected);
        assert!(status.is_idling);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_ceiling_expiry_keeps_connection() {
        // No scripted outcomes: every wait runs to the ceiling and the
        // loop re-issues it. The monitor must stay connected throughout.
        let transport = MockTransport::new(true, Vec::new());
        let (tx, mut rx) = events::channel();
        let mut monitor = IdleMonitor::start(
            AccountId::from("a"),
            credentials(),
            transport.clone(),
            config(),
            tx,
        );

        assert_eq!(rx.recv().await.unwrap().kind, MailEventKind::Connected);
        // Let several ceilings elapse.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let status = monitor.status();
        assert!(status.is_connected);
        assert!(status.last_activity.is_some());
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn polling_fallback_emits_refreshes() {
        let transport = MockTransport::new(false, Vec::new());
        let (tx, mut rx) = events::channel();
        let mut monitor = IdleMonitor::start(
            AccountId::from("a"),
            credentials(),
            transport,
            config(),
            tx,
        );

        assert_eq!(rx.recv().await.unwrap().kind, MailEventKind::Connected);
        assert_eq!(
            rx.recv().await.unwrap().kind,
            MailEventKind::RefreshRequested
        );
        assert_eq!(
            rx.recv().await.unwrap().kind,
            MailEventKind::RefreshRequested
        );
        assert!(!monitor.status().is_idling);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn manual_refresh_interrupts_idle_and_reconnects() {
        let transport = MockTransport::new(true, Vec::new());
        let (tx, mut rx) = events::channel();
        let mut monitor = IdleMonitor::start(
            AccountId::from("a"),
            credentials(),
            transport.clone(),
            config(),
            tx,
        );

        assert_eq!(rx.recv().await.unwrap().kind, MailEventKind::Connected);
        monitor.manual_refresh();
        assert_eq!(
            rx.recv().await.unwrap().kind,
            MailEventKind::RefreshRequested
        );
        assert_eq!(rx.recv().await.unwrap().kind, MailEventKind::Disconnected);
        assert_eq!(rx.recv().await.unwrap().kind, MailEventKind::Connected);
        assert!(transport.connects.load(Ordering::SeqCst) >= 2);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failures_exhaust_attempts() {
        let transport = MockTransport::new(true, Vec::new());
        transport.failing_connects.store(u32::MAX, Ordering::SeqCst);
        let (tx, mut rx) = events::channel();
        let mut monitor = IdleMonitor::start(
            AccountId::from("a"),
            credentials(),
            transport.clone(),
            config(),
            tx,
        );

        let mut errors = 0;
        while let Some(event) = rx.recv().await {
            if matches!(event.kind, MailEventKind::Error { .. }) {
                errors += 1;
            }
        }
        // Three connect errors plus the final give-up notice.
        assert_eq!(errors, 4);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 3);
        assert!(!monitor.status().is_connected);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_dropped_right_after_connect_exhaust_attempts() {
        // The server accepts every connection and then kills the
        // session before a single wait completes. Successful connects
        // alone must not reset the failure counter.
        let mut transport = MockTransport::new(true, Vec::new());
        transport.fail_waits = true;
        let (tx, mut rx) = events::channel();
        let mut monitor = IdleMonitor::start(
            AccountId::from("a"),
            credentials(),
            transport.clone(),
            config(),
            tx,
        );

        let mut errors = 0;
        while let Some(event) = rx.recv().await {
            if matches!(event.kind, MailEventKind::Error { .. }) {
                errors += 1;
            }
        }
        // Three session failures plus the final give-up notice.
        assert_eq!(errors, 4);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 3);
        assert!(!monitor.status().is_connected);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let transport = MockTransport::new(true, Vec::new());
        let (tx, _rx) = events::channel();
        let mut monitor = IdleMonitor::start(
            AccountId::from("a"),
            credentials(),
            transport,
            config(),
            tx,
        );
        monitor.stop().await;
        monitor.stop().await;
    }
}
