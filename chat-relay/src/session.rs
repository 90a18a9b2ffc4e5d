use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use tokio::sync::{mpsc, watch};

use crate::{message::ServerEvent, registry::SessionHandle};

pub type SessionId = u64;

/// Upper bound on a session's outbound queue.
pub const MAX_QUEUE_DEPTH: usize = 65_536;

/// Outbound queue capacity for a configured depth, kept within `1..=MAX_QUEUE_DEPTH`.
pub fn queue_capacity(depth: usize) -> usize {
    depth.clamp(1, MAX_QUEUE_DEPTH)
}

/// Which wire protocol a session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Unframed UTF-8 text over a TCP stream (terminal client).
    RawStream,
    /// JSON objects carried in web-socket text frames (browser client).
    WebFrame,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::RawStream => f.write_str("raw-stream"),
            TransportKind::WebFrame => f.write_str("web-socket"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingNickname,
    Chatting,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NicknameError {
    AlreadySet,
    SessionClosed,
}

/// Shared close flag for one session.
///
/// Triggering it unblocks the session's read loop and its writer task. It is
/// level-triggered: waiting on an already triggered signal returns at once.
#[derive(Clone, Debug)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseSignal {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once flagged.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Per-connection state, owned by the task that drives the connection.
///
/// The registry only ever holds a clone of the [`SessionHandle`]: the
/// outbound queue sender and the close signal.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    kind: TransportKind,
    peer: Option<SocketAddr>,
    nickname: String,
    state: SessionState,
    handle: SessionHandle,
}

impl Session {
    /// Creates a session with its outbound queue.
    ///
    /// Raw-stream sessions start in `AwaitingNickname`; web sessions have an
    /// implicit handshake and start in `Chatting` with an empty nickname.
    pub fn open(
        id: SessionId,
        kind: TransportKind,
        peer: Option<SocketAddr>,
        queue_depth: usize,
    ) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (outbound, inbox) = mpsc::channel(queue_capacity(queue_depth));
        let state = match kind {
            TransportKind::RawStream => SessionState::AwaitingNickname,
            TransportKind::WebFrame => SessionState::Chatting,
        };

        let session = Self {
            id,
            kind,
            peer,
            nickname: String::new(),
            state,
            handle: SessionHandle::new(id, kind, outbound, CloseSignal::new()),
        };
        (session, inbox)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn has_nickname(&self) -> bool {
        !self.nickname.is_empty()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn close_signal(&self) -> CloseSignal {
        self.handle.close_signal()
    }

    /// Sets the nickname once and moves the session to `Chatting`.
    pub fn accept_nickname(&mut self, nickname: String) -> Result<(), NicknameError> {
        match self.state {
            SessionState::Closed => Err(NicknameError::SessionClosed),
            _ if self.has_nickname() => Err(NicknameError::AlreadySet),
            _ => {
                self.nickname = nickname;
                self.state = SessionState::Chatting;
                Ok(())
            }
        }
    }

    /// Moves the session to `Closed`. Returns `true` only for the first call.
    pub fn close(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.state = SessionState::Closed;
        self.handle.close();
        true
    }
}

/// Awaits `future`, giving up after `idle` when a limit is configured.
pub async fn with_idle_timeout<F>(idle: Option<Duration>, future: F) -> Option<F::Output>
where
    F: std::future::Future,
{
    match idle {
        Some(limit) => tokio::time::timeout(limit, future).await.ok(),
        None => Some(future.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_sessions_wait_for_a_nickname() {
        let (mut session, _inbox) = Session::open(1, TransportKind::RawStream, None, 4);
        assert_eq!(session.state(), SessionState::AwaitingNickname);

        session.accept_nickname("alice".into()).expect("first nickname");
        assert_eq!(session.state(), SessionState::Chatting);
        assert_eq!(session.nickname(), "alice");

        let again = session.accept_nickname("bob".into());
        assert_eq!(again, Err(NicknameError::AlreadySet));
        assert_eq!(session.nickname(), "alice");
    }

    #[test]
    fn web_sessions_start_chatting_without_a_nickname() {
        let (session, _inbox) = Session::open(2, TransportKind::WebFrame, None, 4);
        assert_eq!(session.state(), SessionState::Chatting);
        assert!(!session.has_nickname());
    }

    #[tokio::test]
    async fn close_happens_once_and_fires_the_signal() {
        let (mut session, _inbox) = Session::open(3, TransportKind::RawStream, None, 4);
        let handle = session.handle().clone();
        let signal = session.close_signal();
        assert!(!signal.is_triggered());

        assert!(session.close());
        assert!(!session.close());
        assert!(handle.is_closed());

        tokio::time::timeout(Duration::from_secs(1), signal.triggered())
            .await
            .expect("signal should already be set");
        assert_eq!(
            session.accept_nickname("late".into()),
            Err(NicknameError::SessionClosed)
        );
    }

    #[tokio::test]
    async fn idle_timeout_gives_up_on_silent_futures() {
        let result = with_idle_timeout(
            Some(Duration::from_millis(20)),
            std::future::pending::<()>(),
        )
        .await;
        assert!(result.is_none());

        let result = with_idle_timeout(None, async { 7 }).await;
        assert_eq!(result, Some(7));
    }

    #[test]
    fn oversized_queue_depths_are_clamped() {
        assert_eq!(queue_capacity(0), 1);
        assert_eq!(queue_capacity(usize::MAX), MAX_QUEUE_DEPTH);

        let (session, _inbox) = Session::open(4, TransportKind::WebFrame, None, usize::MAX);
        session
            .handle()
            .deliver(ServerEvent::NickPrompt)
            .expect("queue accepts events");
    }

    #[test]
    fn sessions_remember_their_peer() {
        let peer: SocketAddr = "127.0.0.1:4000".parse().expect("addr");
        let (session, _inbox) = Session::open(5, TransportKind::RawStream, Some(peer), 4);
        assert_eq!(session.peer(), Some(peer));
    }
}
