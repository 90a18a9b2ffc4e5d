use chrono::{DateTime, Utc};

use crate::session::TransportKind;

/// Prompt the raw-stream client waits for before asking its user for a nickname.
pub const NICK_PROMPT: &str = "NICK";
/// Username used for web messages that arrive without one.
pub const ANONYMOUS: &str = "Anonymous";

/// A chat line accepted by the relay, stamped on arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: u64,
    pub from: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub origin: TransportKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// Addressed to one session, e.g. the welcome greeting.
    System,
    /// Broadcast presence changes such as joins and departures.
    Notification,
}

impl NoticeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NoticeKind::System => "system",
            NoticeKind::Notification => "notification",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Everything the relay can queue for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    NickPrompt,
    Chat(ChatMessage),
    Notice(Notice),
}

pub fn joined_text(nickname: Option<&str>) -> String {
    match nickname {
        Some(nickname) => format!("{nickname} joined the chat!"),
        None => "A user joined the chat!".to_string(),
    }
}

pub fn left_text(nickname: Option<&str>) -> String {
    match nickname {
        Some(nickname) => format!("{nickname} left the chat!"),
        None => "A user left the chat!".to_string(),
    }
}

pub const CONNECTED_TEXT: &str = "Connected to server!";
pub const WELCOME_TEXT: &str = "Welcome to the chat!";
pub const SHUTDOWN_TEXT: &str = "Server shutting down";
