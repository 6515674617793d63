//! Connection manager actor
//!
//! A single task owns the current [`Session`], the [`Ledger`] of requests
//! written to it, and the queue of requests waiting for a connection. Client
//! handles talk to it only through an unbounded command channel, so all state
//! changes happen in one place and need no locking.
//!
//! # Connection lifecycle
//!
//! ```text
//! Connecting ──ready──▶ Ready ──lost──▶ Disconnected ──backoff──▶ Connecting
//!      ▲                  │
//!      └──reset/recycle───┘            close() from any state ──▶ Draining
//! ```
//!
//! - A lost connection fails every request written to it with
//!   `ConnectionLost`; requests are never replayed on the next connection.
//! - A malformed reply, a reply nobody is waiting for, or a request timeout
//!   throws the connection away and opens a new one at once, since replies can
//!   no longer be paired with requests by position.
//! - Failed connection attempts back off exponentially between
//!   `reconnect_backoff_min` and `reconnect_backoff_max`; the delay returns to
//!   the minimum as soon as a connection becomes ready.

use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};

use crate::config::{ClientConfig, MAX_TIMEOUT, NotReadyPolicy};
use crate::error::{ClientError, Result};
use crate::ledger::{Completion, Ledger};
use crate::protocol::{self, Decision};
use crate::session::{Session, SessionEvent, SessionId, SessionOptions};

/// Message types for the connection manager actor
pub(crate) enum Command {
    Submit {
        frame: Bytes,
        timeout: Duration,
        completion: Completion,
    },
    WaitReady {
        reply: oneshot::Sender<Result<()>>,
    },
    Stats {
        reply: oneshot::Sender<ClientStats>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Lifecycle state of the client's connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Draining,
}

/// Snapshot of the manager's bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStats {
    pub state: ConnectionState,
    /// Requests written and waiting for a reply
    pub pending: usize,
    /// Requests waiting for a connection
    pub held: usize,
    pub connections_opened: u64,
    pub requests_sent: u64,
}

/// Handle to communicate with the connection manager
#[derive(Clone)]
pub(crate) struct ManagerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ManagerHandle {
    pub async fn submit(&self, frame: Bytes, timeout: Duration) -> Result<Decision> {
        let (completion, response) = oneshot::channel();

        self.tx
            .send(Command::Submit {
                frame,
                timeout,
                completion,
            })
            .map_err(|_| ClientError::ClientClosed)?;

        response.await.map_err(|_| ClientError::ClientClosed)?
    }

    pub async fn wait_ready(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Command::WaitReady { reply })
            .map_err(|_| ClientError::ClientClosed)?;
        response.await.map_err(|_| ClientError::ClientClosed)?
    }

    pub async fn stats(&self) -> Result<ClientStats> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Command::Stats { reply })
            .map_err(|_| ClientError::ClientClosed)?;
        response.await.map_err(|_| ClientError::ClientClosed)
    }

    pub async fn close(&self) {
        let (reply, response) = oneshot::channel();
        if self.tx.send(Command::Close { reply }).is_ok() {
            let _ = response.await;
        }
    }
}

/// Capped exponential delay between connection attempts
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Delay to wait now; the following call returns twice as much, up to `max`
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// A request waiting for a connection to become ready
struct HeldRequest {
    frame: Bytes,
    completion: Completion,
    deadline: Instant,
}

enum State {
    Disconnected { retry_at: Instant },
    Connecting(Session),
    Ready(Session),
    Draining,
}

enum Flow {
    Continue,
    /// Shut down, acknowledging the caller of `close` once drained
    Stop(oneshot::Sender<()>),
}

pub(crate) struct ConnectionManager {
    addr: String,
    config: ClientConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    state: State,
    ledger: Ledger,
    held: VecDeque<HeldRequest>,
    held_deadline: Option<Instant>,
    backoff: Backoff,
    ready_waiters: Vec<oneshot::Sender<Result<()>>>,
    next_session_id: SessionId,
    /// Requests written to the current connection
    sent_on_connection: u64,
    /// The current connection has reached `reconnect_after` and is being
    /// replaced once its outstanding replies arrive
    retiring: bool,
    /// A replacement for a retired connection is being opened
    recycling: bool,
    connections_opened: u64,
    requests_sent: u64,
}

impl ConnectionManager {
    /// Spawn the manager on the current Tokio runtime and start connecting
    pub fn spawn(config: ClientConfig) -> ManagerHandle {
        let (mut manager, handle) = Self::new(config);
        manager.start_session();

        tokio::spawn(manager.run());

        handle
    }

    fn new(config: ClientConfig) -> (Self, ManagerHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();

        let manager = ConnectionManager {
            addr: config.addr(),
            backoff: Backoff::new(config.reconnect_backoff_min, config.reconnect_backoff_max),
            config,
            commands,
            events_tx,
            events,
            state: State::Draining,
            ledger: Ledger::new(),
            held: VecDeque::new(),
            held_deadline: None,
            ready_waiters: Vec::new(),
            next_session_id: 0,
            sent_on_connection: 0,
            retiring: false,
            recycling: false,
            connections_opened: 0,
            requests_sent: 0,
        };

        (manager, ManagerHandle { tx })
    }

    async fn run(mut self) {
        let closed_by = loop {
            let wake_at = self.next_wake();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Flow::Stop(reply) = self.handle_command(command) {
                            break Some(reply);
                        }
                    }
                    // Every client handle has been dropped
                    None => break None,
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                _ = sleep_until_opt(wake_at) => self.handle_timers(Instant::now()),
            }
        };

        self.drain();
        if let Some(reply) = closed_by {
            let _ = reply.send(());
        }
        tracing::debug!("Connection manager for {} shutting down", self.addr);
    }

    fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Submit {
                frame,
                timeout,
                completion,
            } => self.submit(frame, deadline_after(timeout), completion),
            Command::WaitReady { reply } => {
                if matches!(self.state, State::Ready(_)) {
                    let _ = reply.send(Ok(()));
                } else {
                    self.ready_waiters.push(reply);
                }
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Close { reply } => return Flow::Stop(reply),
        }
        Flow::Continue
    }

    fn submit(&mut self, frame: Bytes, deadline: Instant, completion: Completion) {
        match self.state {
            State::Ready(_) if !self.retiring => self.dispatch(frame, completion, deadline),
            State::Draining => {
                let _ = completion.send(Err(ClientError::ClientClosed));
            }
            _ if self.retiring
                || self.recycling
                || self.config.not_ready_policy == NotReadyPolicy::Queue =>
            {
                self.hold(frame, completion, deadline);
            }
            _ => {
                let _ = completion.send(Err(ClientError::NotConnected));
            }
        }
    }

    /// Write a request to the ready session and start waiting for its reply
    fn dispatch(&mut self, frame: Bytes, completion: Completion, deadline: Instant) {
        let State::Ready(session) = &self.state else {
            self.hold(frame, completion, deadline);
            return;
        };

        if let Err(e) = session.send_frame(frame) {
            let _ = completion.send(Err(e));
            return;
        }

        self.ledger.enqueue(completion, deadline);
        self.sent_on_connection += 1;
        self.requests_sent += 1;

        let limit_reached = self
            .config
            .reconnect_after
            .is_some_and(|limit| self.sent_on_connection >= limit);
        if limit_reached && !self.retiring {
            tracing::debug!(
                "Connection reached {} requests, replacing it once {} replies arrive",
                self.sent_on_connection,
                self.ledger.len()
            );
            self.retiring = true;
        }
    }

    fn hold(&mut self, frame: Bytes, completion: Completion, deadline: Instant) {
        self.held_deadline = Some(match self.held_deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self.held.push_back(HeldRequest {
            frame,
            completion,
            deadline,
        });
    }

    /// Send held requests, oldest first, while the connection can take them
    fn flush_held(&mut self) {
        let now = Instant::now();
        while matches!(self.state, State::Ready(_)) && !self.retiring {
            let Some(request) = self.held.pop_front() else {
                break;
            };
            if request.deadline <= now {
                let _ = request.completion.send(Err(ClientError::Timeout));
            } else {
                self.dispatch(request.frame, request.completion, request.deadline);
            }
        }
        self.refresh_held_deadline();
    }

    fn expire_held(&mut self, now: Instant) {
        if self.held_deadline.is_none_or(|deadline| deadline > now) {
            return;
        }

        let before = self.held.len();
        let mut kept = VecDeque::with_capacity(before);
        for request in self.held.drain(..) {
            if request.deadline <= now {
                let _ = request.completion.send(Err(ClientError::Timeout));
            } else {
                kept.push_back(request);
            }
        }
        self.held = kept;
        tracing::debug!(
            "{} requests timed out waiting for a connection",
            before - self.held.len()
        );
        self.refresh_held_deadline();
    }

    fn refresh_held_deadline(&mut self) {
        self.held_deadline = self.held.iter().map(|request| request.deadline).min();
    }

    fn handle_event(&mut self, event: SessionEvent) {
        if Some(event.session()) != self.current_session() {
            tracing::trace!("Ignoring event from retired session {}", event.session());
            return;
        }

        match event {
            SessionEvent::Ready(_) => self.on_ready(),
            SessionEvent::Line(_, line) => self.on_line(line),
            SessionEvent::Closed(_, cause) => self.on_closed(cause),
        }
    }

    fn on_ready(&mut self) {
        let mut session = match std::mem::replace(&mut self.state, State::Draining) {
            State::Connecting(session) => session,
            other => {
                self.state = other;
                return;
            }
        };

        session.mark_ready();
        tracing::info!("Connected to divvy at {} (session {})", self.addr, session.id());
        self.state = State::Ready(session);
        self.backoff.reset();
        self.sent_on_connection = 0;
        self.retiring = false;
        self.recycling = false;
        self.connections_opened += 1;

        for waiter in self.ready_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        self.flush_held();
    }

    fn on_line(&mut self, line: Bytes) {
        match protocol::decode(&line) {
            Ok(reply) => {
                if self.ledger.resolve_oldest(reply.into_result()).is_err() {
                    tracing::warn!(
                        "Reply with no outstanding request from {}, resetting",
                        self.addr
                    );
                    self.reset_connection("unexpected reply from server");
                    return;
                }
                if self.retiring && self.ledger.is_empty() {
                    tracing::debug!("Recycling connection to {}", self.addr);
                    self.start_session();
                    self.recycling = true;
                }
            }
            Err(error) => {
                tracing::warn!("{} from {}, resetting connection", error, self.addr);
                let _ = self.ledger.resolve_oldest(Err(error));
                self.reset_connection("malformed reply from server");
            }
        }
    }

    fn on_closed(&mut self, cause: ClientError) {
        let was_ready = matches!(self.state, State::Ready(_));
        let delay = self.backoff.next_delay();
        self.state = State::Disconnected {
            retry_at: deadline_after(delay),
        };
        self.retiring = false;
        self.recycling = false;

        if was_ready {
            let lost = match cause {
                lost @ ClientError::ConnectionLost(_) => lost,
                other => ClientError::ConnectionLost(other.to_string()),
            };
            let failed = self.ledger.fail_all(lost.clone());
            tracing::warn!(
                "{} ({} requests failed), reconnecting in {:?}",
                lost,
                failed,
                delay
            );
        } else {
            tracing::warn!("{}, retrying in {:?}", cause, delay);
            for waiter in self.ready_waiters.drain(..) {
                let _ = waiter.send(Err(cause.clone()));
            }
        }
    }

    fn handle_timers(&mut self, now: Instant) {
        if matches!(self.state, State::Disconnected { retry_at } if retry_at <= now) {
            self.start_session();
        }

        let expired = self.ledger.expire(now);
        if expired > 0 {
            tracing::warn!(
                "{} requests to {} timed out, resetting connection",
                expired,
                self.addr
            );
            self.reset_connection("request timed out");
        }

        self.expire_held(now);
    }

    /// Fail everything written to the current connection and replace it
    fn reset_connection(&mut self, reason: &str) {
        self.ledger.fail_all(ClientError::ConnectionLost(format!(
            "connection reset after {reason}"
        )));
        if !matches!(self.state, State::Draining) {
            self.start_session();
        }
    }

    /// Open a new session, dropping the current one
    fn start_session(&mut self) {
        let id = self.next_session_id;
        self.next_session_id += 1;
        self.retiring = false;

        let options = SessionOptions {
            connect_timeout: self.config.connect_timeout,
            tcp_nodelay: self.config.tcp_nodelay,
            tcp_keepalive: self.config.tcp_keepalive,
            debug: self.config.debug,
        };
        tracing::debug!("Connecting to {} (session {})", self.addr, id);
        self.state = State::Connecting(Session::spawn(
            id,
            self.addr.clone(),
            options,
            self.events_tx.clone(),
        ));
    }

    /// Stop for good: fail everything outstanding and release the session
    fn drain(&mut self) {
        self.state = State::Draining;
        self.retiring = false;
        self.recycling = false;

        let failed = self.ledger.fail_all(ClientError::ClientClosed);
        let held = self.held.len();
        for request in self.held.drain(..) {
            let _ = request.completion.send(Err(ClientError::ClientClosed));
        }
        self.held_deadline = None;
        for waiter in self.ready_waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::ClientClosed));
        }

        if failed + held > 0 {
            tracing::info!("Client closed with {} requests outstanding", failed + held);
        }
    }

    fn current_session(&self) -> Option<SessionId> {
        match &self.state {
            State::Connecting(session) | State::Ready(session) => Some(session.id()),
            State::Disconnected { .. } | State::Draining => None,
        }
    }

    fn next_wake(&mut self) -> Option<Instant> {
        let retry_at = match self.state {
            State::Disconnected { retry_at } => Some(retry_at),
            _ => None,
        };
        [retry_at, self.ledger.next_deadline(), self.held_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    fn stats(&self) -> ClientStats {
        let state = match self.state {
            State::Disconnected { .. } => ConnectionState::Disconnected,
            State::Connecting(_) => ConnectionState::Connecting,
            State::Ready(_) => ConnectionState::Ready,
            State::Draining => ConnectionState::Draining,
        };

        ClientStats {
            state,
            pending: self.ledger.len(),
            held: self.held.len(),
            connections_opened: self.connections_opened,
            requests_sent: self.requests_sent,
        }
    }
}

/// `now + timeout`, with timeouts beyond `MAX_TIMEOUT` shortened to it
fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout.min(MAX_TIMEOUT)
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_saturates_at_huge_bounds() {
        let mut backoff = Backoff::new(Duration::MAX / 2 + Duration::from_secs(1), Duration::MAX);
        assert_eq!(backoff.next_delay(), Duration::MAX / 2 + Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::MAX);
        assert_eq!(backoff.next_delay(), Duration::MAX);
    }

    #[test]
    fn test_deadline_after_clamps_huge_timeouts() {
        let before = Instant::now();
        let deadline = deadline_after(Duration::MAX);
        assert!(deadline >= before + MAX_TIMEOUT);
        assert!(deadline <= Instant::now() + MAX_TIMEOUT);
    }

    #[tokio::test]
    async fn test_events_from_replaced_session_are_ignored() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (mut manager, _handle) = ConnectionManager::new(ClientConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        });
        manager.start_session();
        manager.start_session();
        assert_eq!(manager.current_session(), Some(1));

        let (completion, mut response) = oneshot::channel();
        manager
            .ledger
            .enqueue(completion, Instant::now() + Duration::from_secs(60));

        manager.handle_event(SessionEvent::Ready(0));
        manager.handle_event(SessionEvent::Line(0, Bytes::from_static(b"OK true 999 1\n")));
        manager.handle_event(SessionEvent::Closed(
            0,
            ClientError::ConnectionLost("reset by peer".to_string()),
        ));

        assert!(response.try_recv().is_err());
        assert_eq!(manager.ledger.len(), 1);
        assert_eq!(manager.stats().state, ConnectionState::Connecting);
        assert_eq!(manager.connections_opened, 0);
    }

    #[tokio::test]
    async fn test_fail_fast_while_connecting() {
        // Nothing listens on this port, so the manager never becomes ready
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let handle = ConnectionManager::spawn(ClientConfig {
            host: "127.0.0.1".to_string(),
            port,
            not_ready_policy: NotReadyPolicy::FailFast,
            ..Default::default()
        });

        let result = handle
            .submit(Bytes::from_static(b"HIT\n"), Duration::from_secs(1))
            .await;
        assert_eq!(result, Err(ClientError::NotConnected));
    }

    #[tokio::test]
    async fn test_held_request_times_out_without_connection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let handle = ConnectionManager::spawn(ClientConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        });

        let result = handle
            .submit(Bytes::from_static(b"HIT\n"), Duration::from_millis(50))
            .await;
        assert_eq!(result, Err(ClientError::Timeout));

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.held, 0);
        assert_eq!(stats.requests_sent, 0);
        assert_ne!(stats.state, ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_wait_ready_reports_connect_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let handle = ConnectionManager::spawn(ClientConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        });

        assert!(matches!(
            handle.wait_ready().await,
            Err(ClientError::ConnectFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let handle = ConnectionManager::spawn(ClientConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        });

        let pending = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .submit(Bytes::from_static(b"HIT\n"), Duration::from_secs(30))
                    .await
            })
        };
        // Let the request reach the hold queue
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.close().await;
        assert_eq!(pending.await.unwrap(), Err(ClientError::ClientClosed));
        assert_eq!(
            handle
                .submit(Bytes::from_static(b"HIT\n"), Duration::from_secs(1))
                .await,
            Err(ClientError::ClientClosed)
        );
        assert_eq!(handle.stats().await, Err(ClientError::ClientClosed));
    }
}
