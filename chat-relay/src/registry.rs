use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use thiserror::Error;
use tokio::sync::{
    Mutex,
    mpsc::{self, error::TrySendError},
};

use crate::{
    message::ServerEvent,
    session::{CloseSignal, SessionId, SessionState, TransportKind},
};

/// The registry's view of a session: where to queue outbound events and how
/// to ask the owning task to shut the connection down.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: SessionId,
    kind: TransportKind,
    outbound: mpsc::Sender<ServerEvent>,
    close: CloseSignal,
    /// Chats with this id or lower were already replayed from history.
    replayed_through: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("outbound queue is full")]
    QueueFull,
    #[error("session is closed")]
    Closed,
}

impl SessionHandle {
    pub(crate) fn new(
        id: SessionId,
        kind: TransportKind,
        outbound: mpsc::Sender<ServerEvent>,
        close: CloseSignal,
    ) -> Self {
        Self {
            id,
            kind,
            outbound,
            close,
            replayed_through: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Queues `event` without waiting. A full queue counts as a failed
    /// delivery rather than back-pressure on the sender.
    pub fn deliver(&self, event: ServerEvent) -> Result<(), DeliveryError> {
        if self.close.is_triggered() {
            return Err(DeliveryError::Closed);
        }
        if let ServerEvent::Chat(message) = &event {
            if message.id <= self.replayed_through {
                return Ok(());
            }
        }
        self.outbound.try_send(event).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::QueueFull,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    pub fn close(&self) {
        self.close.trigger();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_triggered()
    }

    pub(crate) fn close_signal(&self) -> CloseSignal {
        self.close.clone()
    }
}

struct Entry {
    handle: SessionHandle,
    nickname: String,
    state: SessionState,
}

/// What the registry knew about a session when it was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departed {
    pub id: SessionId,
    pub kind: TransportKind,
    pub nickname: String,
    pub state: SessionState,
}

/// Live sessions keyed by id. A session is present here exactly while it is
/// not closed.
pub struct Registry {
    sessions: Mutex<HashMap<SessionId, Entry>>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Ids are never reused for the lifetime of the registry.
    pub fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn insert(&self, handle: SessionHandle, state: SessionState) {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            handle.id(),
            Entry {
                handle,
                nickname: String::new(),
                state,
            },
        );
    }

    /// Registers `handle` once `replay` has queued its backlog, all under the
    /// registry lock, so no broadcast can land between the two. `replay`
    /// returns the newest chat id it covered; the registered handle skips
    /// that chat and older ones when they arrive live.
    pub async fn insert_replaying<F>(&self, mut handle: SessionHandle, state: SessionState, replay: F)
    where
        F: FnOnce(&SessionHandle) -> u64,
    {
        let mut sessions = self.sessions.lock().await;
        handle.replayed_through = replay(&handle);
        sessions.insert(
            handle.id(),
            Entry {
                handle,
                nickname: String::new(),
                state,
            },
        );
    }

    /// Records the nickname and makes the session a broadcast recipient.
    pub async fn mark_chatting(&self, id: SessionId, nickname: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&id) {
            Some(entry) => {
                entry.nickname = nickname.to_string();
                entry.state = SessionState::Chatting;
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, id: SessionId) -> Option<Departed> {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(&id).map(|entry| Departed {
            id,
            kind: entry.handle.kind(),
            nickname: entry.nickname,
            state: entry.state,
        })
    }

    /// Point-in-time list of chatting sessions. Sessions that join after the
    /// call are not included.
    pub async fn snapshot(&self) -> Vec<SessionHandle> {
        let sessions = self.sessions.lock().await;
        sessions
            .values()
            .filter(|entry| entry.state == SessionState::Chatting)
            .map(|entry| entry.handle.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Signals every registered session to close. Removal happens when each
    /// session's own task runs its disconnect path.
    pub async fn close_all(&self) -> usize {
        let sessions = self.sessions.lock().await;
        for entry in sessions.values() {
            entry.handle.close();
        }
        sessions.len()
    }
}
