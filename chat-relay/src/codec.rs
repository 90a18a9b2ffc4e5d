//! Wire formats for the two transports.
//!
//! The raw-stream protocol has no framing of its own: each chunk handed over
//! by the socket is one unit, and outbound text is written without a trailing
//! delimiter. The web-socket protocol carries one JSON object per text frame.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    message::{ChatMessage, NICK_PROMPT, ServerEvent},
    session::TransportKind,
};

/// Command a raw-stream client sends to leave, compared case-insensitively.
pub const QUIT_COMMAND: &str = "sair";
/// `type` of web frames that carry chat text.
pub const MESSAGE_TYPE: &str = "message";

const LINE_ENDINGS: &[char] = &['\n', '\r'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawUnit {
    Quit,
    Line(String),
}

/// Interprets one chunk received from a chatting raw-stream client.
pub fn decode_raw(chunk: &[u8]) -> RawUnit {
    let text = String::from_utf8_lossy(chunk);
    if text.trim().eq_ignore_ascii_case(QUIT_COMMAND) {
        return RawUnit::Quit;
    }
    RawUnit::Line(text.into_owned())
}

/// Interprets the chunk answering the `NICK` prompt. Only line endings are
/// stripped; anything else the user typed is kept.
pub fn decode_raw_nickname(chunk: &[u8]) -> String {
    String::from_utf8_lossy(chunk)
        .trim_end_matches(LINE_ENDINGS)
        .to_string()
}

pub fn encode_raw(event: &ServerEvent) -> String {
    match event {
        ServerEvent::NickPrompt => NICK_PROMPT.to_string(),
        ServerEvent::Chat(message) => match message.origin {
            // Terminal clients pre-format "<nick>: <text>"; relay it untouched.
            TransportKind::RawStream => message.text.clone(),
            TransportKind::WebFrame => format!("{}: {}", message.from, message.text),
        },
        ServerEvent::Notice(notice) => notice.text.clone(),
    }
}

/// JSON object exchanged with web clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// What a web client asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Message {
        username: Option<String>,
        text: String,
    },
    Other(String),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed JSON frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame has no `type` field")]
    MissingType,
}

#[derive(Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    username: Option<String>,
    text: Option<String>,
}

pub fn decode_web(payload: &str) -> Result<ClientFrame, DecodeError> {
    let frame: InboundFrame = serde_json::from_str(payload)?;
    let kind = frame.kind.ok_or(DecodeError::MissingType)?;
    if kind != MESSAGE_TYPE {
        return Ok(ClientFrame::Other(kind));
    }
    Ok(ClientFrame::Message {
        username: frame.username,
        text: frame.text.unwrap_or_default(),
    })
}

/// Maps an event onto the JSON shape the browser renders. The nickname
/// prompt belongs to the raw-stream handshake and has no web form.
pub fn web_frame(event: &ServerEvent) -> Option<WebFrame> {
    match event {
        ServerEvent::NickPrompt => None,
        ServerEvent::Chat(message) => Some(WebFrame {
            kind: MESSAGE_TYPE.to_string(),
            id: Some(message.id),
            username: Some(message.from.clone()),
            text: web_text(message),
            timestamp: Some(format_timestamp(message.timestamp)),
        }),
        ServerEvent::Notice(notice) => Some(WebFrame {
            kind: notice.kind.as_str().to_string(),
            id: None,
            username: None,
            text: notice.text.clone(),
            timestamp: Some(format_timestamp(notice.timestamp)),
        }),
    }
}

pub fn encode_web(event: &ServerEvent) -> serde_json::Result<Option<String>> {
    web_frame(event)
        .map(|frame| serde_json::to_string(&frame))
        .transpose()
}

fn web_text(message: &ChatMessage) -> String {
    match message.origin {
        TransportKind::WebFrame => message.text.clone(),
        TransportKind::RawStream => {
            let prefix = format!("{}: ", message.from);
            message
                .text
                .strip_prefix(prefix.as_str())
                .unwrap_or(&message.text)
                .to_string()
        }
    }
}

pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Truncates `text` to at most `max_chars` characters on a char boundary.
pub fn cap_text(mut text: String, max_chars: usize) -> String {
    if let Some((cut, _)) = text.char_indices().nth(max_chars) {
        text.truncate(cut);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Notice, NoticeKind};

    fn chat(origin: TransportKind, from: &str, text: &str) -> ChatMessage {
        ChatMessage {
            id: 7,
            from: from.into(),
            text: text.into(),
            timestamp: Utc::now(),
            origin,
        }
    }

    #[test]
    fn quit_command_ignores_case_and_line_endings() {
        assert_eq!(decode_raw(b"sair"), RawUnit::Quit);
        assert_eq!(decode_raw(b"SAIR\r\n"), RawUnit::Quit);
        assert_eq!(decode_raw(b"Sair\n"), RawUnit::Quit);
        assert_eq!(
            decode_raw(b"alice: sair"),
            RawUnit::Line("alice: sair".into())
        );
    }

    #[test]
    fn raw_lines_are_kept_verbatim() {
        assert_eq!(
            decode_raw(b"alice: hi \n"),
            RawUnit::Line("alice: hi \n".into())
        );
        assert_eq!(decode_raw_nickname(b" alice \r\n"), " alice ");
    }

    #[test]
    fn raw_encoding_adds_no_delimiter() {
        let from_raw = ServerEvent::Chat(chat(TransportKind::RawStream, "alice", "alice: hi"));
        assert_eq!(encode_raw(&from_raw), "alice: hi");

        let from_web = ServerEvent::Chat(chat(TransportKind::WebFrame, "bob", "hello"));
        assert_eq!(encode_raw(&from_web), "bob: hello");

        assert_eq!(encode_raw(&ServerEvent::NickPrompt), "NICK");
    }

    #[test]
    fn web_encoding_matches_the_browser_shape() {
        let event = ServerEvent::Chat(chat(TransportKind::WebFrame, "bob", "hello"));
        let encoded = encode_web(&event).expect("encode").expect("chat has a web form");
        let value: serde_json::Value = serde_json::from_str(&encoded).expect("valid json");

        assert_eq!(value["type"], "message");
        assert_eq!(value["id"], 7);
        assert_eq!(value["username"], "bob");
        assert_eq!(value["text"], "hello");
        let stamp = value["timestamp"].as_str().expect("timestamp string");
        DateTime::parse_from_rfc3339(stamp).expect("rfc3339 timestamp");
    }

    #[test]
    fn notices_carry_their_type_and_no_username() {
        let event = ServerEvent::Notice(Notice {
            kind: NoticeKind::Notification,
            text: "alice left the chat!".into(),
            timestamp: Utc::now(),
        });
        let frame = web_frame(&event).expect("notice has a web form");
        assert_eq!(frame.kind, "notification");
        assert_eq!(frame.username, None);
        assert_eq!(encode_raw(&event), "alice left the chat!");
        assert!(web_frame(&ServerEvent::NickPrompt).is_none());
    }

    #[test]
    fn raw_chat_reaches_web_without_the_nick_prefix() {
        let event = ServerEvent::Chat(chat(TransportKind::RawStream, "alice", "alice: hi"));
        let frame = web_frame(&event).expect("web form");
        assert_eq!(frame.username.as_deref(), Some("alice"));
        assert_eq!(frame.text, "hi");

        let unprefixed = ServerEvent::Chat(chat(TransportKind::RawStream, "alice", "hi"));
        assert_eq!(web_frame(&unprefixed).expect("web form").text, "hi");
    }

    #[test]
    fn encoded_chat_decodes_to_the_same_username_and_text() {
        let event = ServerEvent::Chat(chat(TransportKind::WebFrame, "carol", "ol\u{e1} \"mundo\""));
        let encoded = encode_web(&event).expect("encode").expect("web form");
        match decode_web(&encoded).expect("decode") {
            ClientFrame::Message { username, text } => {
                assert_eq!(username.as_deref(), Some("carol"));
                assert_eq!(text, "ol\u{e1} \"mundo\"");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_bad_frames_without_panicking() {
        assert!(matches!(decode_web("{not json"), Err(DecodeError::Json(_))));
        assert!(matches!(decode_web("[1, 2]"), Err(DecodeError::Json(_))));
        assert!(matches!(
            decode_web(r#"{"text":"hi"}"#),
            Err(DecodeError::MissingType)
        ));
        assert_eq!(
            decode_web(r#"{"type":"typing","username":"bob"}"#).expect("decode"),
            ClientFrame::Other("typing".into())
        );
        assert_eq!(
            decode_web(r#"{"type":"message"}"#).expect("decode"),
            ClientFrame::Message {
                username: None,
                text: String::new()
            }
        );
    }

    #[test]
    fn cap_text_cuts_on_char_boundaries() {
        assert_eq!(cap_text("hello".into(), 10), "hello");
        assert_eq!(cap_text("hello".into(), 3), "hel");
        assert_eq!(cap_text("\u{e9}\u{e9}\u{e9}".into(), 2), "\u{e9}\u{e9}");
        assert_eq!(cap_text("abc".into(), 0), "");
    }
}
