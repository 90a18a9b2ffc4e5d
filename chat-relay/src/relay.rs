//! Session lifecycle and fan-out shared by both transports.
//!
//! Each connection task owns its [`Session`] and calls into the [`Relay`] at
//! three points: [`Relay::on_connect`] once, [`Relay::on_inbound`] for every
//! unit read off the wire, and [`Relay::on_disconnect`] when the read loop
//! ends for any reason. Outbound traffic never touches a socket from here; it
//! is queued on each recipient's [`SessionHandle`] and written by that
//! connection's writer task.

use std::{net::SocketAddr, time::Duration};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    codec::{self, ClientFrame, RawUnit},
    history::MessageLog,
    message::{
        self, ANONYMOUS, CONNECTED_TEXT, Notice, NoticeKind, SHUTDOWN_TEXT, ServerEvent,
        WELCOME_TEXT,
    },
    registry::{Registry, SessionHandle},
    session::{Session, SessionId, SessionState, TransportKind, queue_capacity},
};

/// Most chat messages kept for replay.
pub const MAX_HISTORY: usize = 10_000;
/// Longest web chat text that can be configured, in characters.
pub const MAX_TEXT_CHARS: usize = 100_000;
/// Largest raw-stream read buffer, in bytes.
pub const MAX_READ_CHUNK: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Chat messages replayed to newly connected web sessions.
    pub history: usize,
    /// Longest accepted web chat text, in characters.
    pub max_text_chars: usize,
    /// Largest single raw-stream read, i.e. the largest raw unit.
    pub read_chunk: usize,
    /// Capacity of each session's outbound queue.
    pub queue_depth: usize,
    pub idle_timeout: Option<Duration>,
    pub leave_notice: bool,
}

impl RelayConfig {
    /// Raw-stream read buffer size, kept within `1..=MAX_READ_CHUNK`.
    pub fn read_buffer_len(&self) -> usize {
        self.read_chunk.clamp(1, MAX_READ_CHUNK)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            history: 50,
            max_text_chars: 500,
            read_chunk: 1024,
            queue_depth: 256,
            idle_timeout: None,
            leave_notice: true,
        }
    }
}

/// One unit read off a transport, before decoding.
#[derive(Debug, Clone, Copy)]
pub enum Inbound<'a> {
    Raw(&'a [u8]),
    Web(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// A freshly opened session plus the queue its writer task drains.
pub struct Connection {
    pub session: Session,
    pub outbound: mpsc::Receiver<ServerEvent>,
}

pub struct Relay {
    config: RelayConfig,
    registry: Registry,
    log: MessageLog,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let log = MessageLog::new(config.history);
        Self {
            config,
            registry: Registry::new(),
            log,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn on_connect(&self, kind: TransportKind, peer: Option<SocketAddr>) -> Connection {
        let id = self.registry.next_id();
        let (session, outbound) = Session::open(id, kind, peer, self.config.queue_depth);
        let handle = session.handle().clone();

        match kind {
            TransportKind::RawStream => {
                send_to(&handle, ServerEvent::NickPrompt);
                self.registry.insert(handle, session.state()).await;
            }
            TransportKind::WebFrame => {
                self.registry
                    .insert_replaying(handle, session.state(), |handle| {
                        let recent = self.log.recent();
                        let replayed_through = recent.last().map_or(0, |message| message.id);
                        // Leave room in the queue for the welcome notice.
                        let skip = recent
                            .len()
                            .saturating_sub(queue_capacity(self.config.queue_depth) - 1);
                        for message in recent.into_iter().skip(skip) {
                            send_to(handle, ServerEvent::Chat(message));
                        }
                        send_to(handle, self.notice(NoticeKind::System, WELCOME_TEXT.to_string()));
                        replayed_through
                    })
                    .await;
                self.broadcast(
                    self.notice(NoticeKind::Notification, message::joined_text(None)),
                    Some(id),
                )
                .await;
            }
        }

        info!(session = id, %kind, ?peer, "session opened");
        Connection { session, outbound }
    }

    /// Decodes one inbound unit and advances the session's state machine.
    pub async fn on_inbound(&self, session: &mut Session, unit: Inbound<'_>) -> Flow {
        if session.state() == SessionState::Closed {
            return Flow::Close;
        }
        match unit {
            Inbound::Raw(chunk) => self.on_raw_unit(session, chunk).await,
            Inbound::Web(payload) => self.on_web_frame(session, payload).await,
        }
    }

    async fn on_raw_unit(&self, session: &mut Session, chunk: &[u8]) -> Flow {
        if session.state() == SessionState::AwaitingNickname {
            let nickname = codec::decode_raw_nickname(chunk);
            return self.complete_raw_handshake(session, nickname).await;
        }

        match codec::decode_raw(chunk) {
            RawUnit::Quit => {
                debug!(session = session.id(), nickname = %session.nickname(), "client asked to leave");
                Flow::Close
            }
            RawUnit::Line(text) => {
                let message =
                    self.log
                        .record(session.nickname().to_string(), text, TransportKind::RawStream);
                // The terminal client prints its own input, so skip the echo.
                self.broadcast(ServerEvent::Chat(message), Some(session.id()))
                    .await;
                Flow::Continue
            }
        }
    }

    async fn complete_raw_handshake(&self, session: &mut Session, nickname: String) -> Flow {
        if let Err(err) = session.accept_nickname(nickname) {
            warn!(session = session.id(), error = ?err, "unexpected nickname");
            return Flow::Close;
        }

        let id = session.id();
        let nickname = session.nickname().to_string();
        self.registry.mark_chatting(id, &nickname).await;
        info!(session = id, %nickname, "client joined");

        let announced = (!nickname.is_empty()).then_some(nickname.as_str());
        self.broadcast(
            self.notice(NoticeKind::Notification, message::joined_text(announced)),
            Some(id),
        )
        .await;
        send_to(
            session.handle(),
            self.notice(NoticeKind::System, CONNECTED_TEXT.to_string()),
        );
        Flow::Continue
    }

    async fn on_web_frame(&self, session: &mut Session, payload: &str) -> Flow {
        let frame = match codec::decode_web(payload) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(session = session.id(), error = %err, "dropping undecodable frame");
                return Flow::Continue;
            }
        };

        let (username, text) = match frame {
            ClientFrame::Message { username, text } => (username, text),
            ClientFrame::Other(kind) => {
                debug!(session = session.id(), %kind, "ignoring frame");
                return Flow::Continue;
            }
        };

        // The first message names the connection; later usernames are ignored.
        if !session.has_nickname() {
            let nickname = username
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| ANONYMOUS.to_string());
            if session.accept_nickname(nickname).is_ok() {
                self.registry
                    .mark_chatting(session.id(), session.nickname())
                    .await;
                info!(session = session.id(), nickname = %session.nickname(), "client identified");
            }
        }

        let text = codec::cap_text(text, self.config.max_text_chars);
        let message = self
            .log
            .record(session.nickname().to_string(), text, TransportKind::WebFrame);
        // Web clients tell their own bubbles apart by username.
        self.broadcast(ServerEvent::Chat(message), None).await;
        Flow::Continue
    }

    /// Closes and deregisters the session. Safe to call more than once; only
    /// the first call has any effect.
    pub async fn on_disconnect(&self, session: &mut Session) {
        if !session.close() {
            return;
        }
        let Some(departed) = self.registry.remove(session.id()).await else {
            return;
        };
        info!(
            session = departed.id,
            kind = %departed.kind,
            peer = ?session.peer(),
            nickname = %departed.nickname,
            "session closed"
        );

        // A raw client that never picked a nickname was never announced.
        if !self.config.leave_notice || departed.state != SessionState::Chatting {
            return;
        }
        let nickname = (!departed.nickname.is_empty()).then_some(departed.nickname.as_str());
        self.broadcast(
            self.notice(NoticeKind::Notification, message::left_text(nickname)),
            None,
        )
        .await;
    }

    /// Queues `event` for every chatting session in the registry at call
    /// time, except `exclude`. Returns how many recipients accepted it.
    ///
    /// A recipient that cannot take the event is told to close; its own task
    /// then runs the disconnect path. Other recipients are unaffected.
    pub async fn broadcast(&self, event: ServerEvent, exclude: Option<SessionId>) -> usize {
        let recipients = self.registry.snapshot().await;
        let mut delivered = 0;
        for recipient in recipients {
            if Some(recipient.id()) == exclude {
                continue;
            }
            match recipient.deliver(event.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    debug!(session = recipient.id(), error = %err, "delivery failed, disconnecting");
                    recipient.close();
                }
            }
        }
        delivered
    }

    /// Tells everyone the relay is going away and signals every session to close.
    pub async fn shutdown(&self) {
        self.broadcast(self.notice(NoticeKind::System, SHUTDOWN_TEXT.to_string()), None)
            .await;
        let sessions = self.registry.close_all().await;
        info!(sessions, "relay shutting down");
    }

    fn notice(&self, kind: NoticeKind, text: String) -> ServerEvent {
        ServerEvent::Notice(Notice {
            kind,
            text,
            timestamp: self.log.stamp(),
        })
    }
}

fn send_to(handle: &SessionHandle, event: ServerEvent) {
    if let Err(err) = handle.deliver(event) {
        debug!(session = handle.id(), error = %err, "could not queue event");
        handle.close();
    }
}
