use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};

use crate::{message::ChatMessage, session::TransportKind};

/// Stamps accepted chat messages and keeps the most recent ones for replay.
///
/// Ids and timestamps are handed out under one lock, so ids strictly
/// increase and timestamps never go backwards even if the wall clock does.
pub struct MessageLog {
    capacity: usize,
    inner: Mutex<LogState>,
}

struct LogState {
    next_id: u64,
    last_stamp: Option<DateTime<Utc>>,
    recent: VecDeque<ChatMessage>,
}

impl LogState {
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_stamp {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }
}

impl MessageLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(LogState {
                next_id: 1,
                last_stamp: None,
                recent: VecDeque::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, from: String, text: String, origin: TransportKind) -> ChatMessage {
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;

        let message = ChatMessage {
            id,
            from,
            text,
            timestamp: state.stamp(),
            origin,
        };

        if self.capacity > 0 {
            if state.recent.len() == self.capacity {
                state.recent.pop_front();
            }
            state.recent.push_back(message.clone());
        }
        message
    }

    /// Timestamp for a notice, on the same monotonic clock as chat messages.
    pub fn stamp(&self) -> DateTime<Utc> {
        self.state().stamp()
    }

    /// Recent messages, oldest first.
    pub fn recent(&self) -> Vec<ChatMessage> {
        self.state().recent.iter().cloned().collect()
    }
}
