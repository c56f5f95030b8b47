//! Length-prefixed text frame codec.
//!
//! Every frame is seven fields, each written as a 5-digit zero-padded
//! decimal byte length followed by the raw value:
//!
//! ```text
//! ┌────────┬────────┬────────────┬───────────┬────────┬────────┬─────────┐
//! │ action │ store  │ historical │ timestamp │ topic  │ sender │ payload │
//! │ "12"   │ t / f  │ t / f      │ RFC 3339  │        │ connId │ JSON    │
//! └────────┴────────┴────────────┴───────────┴────────┴────────┴─────────┘
//!   00002 12 00001 t 00001 f 00000 00005 topic 00000 00016 {"message":"hi"}
//! ```
//!
//! Lengths count bytes, not characters, so any field larger than
//! 99 999 bytes cannot be represented and is refused by the encoder.

use crate::action::SocketAction;
use std::fmt::{self, Write};

/// Width of every length prefix.
pub const FIELD_WIDTH: usize = 5;

/// Largest field value a 5-digit prefix can describe.
pub const MAX_FIELD_LEN: usize = 99_999;

/// Heartbeat payload sent by the server.
pub const PING: &str = "PING";

/// Heartbeat reply payload.
pub const PONG: &str = "PONG";

/// Field names, used for error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameField {
    Action,
    Store,
    Historical,
    Timestamp,
    Topic,
    Sender,
    Payload,
}

impl fmt::Display for FrameField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameField::Action => "action",
            FrameField::Store => "store",
            FrameField::Historical => "historical",
            FrameField::Timestamp => "timestamp",
            FrameField::Topic => "topic",
            FrameField::Sender => "sender",
            FrameField::Payload => "payload",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("{field} is {len} bytes, larger than a frame field can hold")]
    FieldTooLong { field: FrameField, len: usize },

    #[error("truncated {field}: needs {declared} bytes, {remaining} left")]
    Truncated {
        field: FrameField,
        declared: usize,
        remaining: usize,
    },

    #[error("{field} has a malformed length prefix")]
    InvalidLength { field: FrameField },

    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: FrameField },

    #[error("unknown action code '{0}'")]
    UnknownAction(String),
}

/// One decoded wire frame. The payload is left as raw text; see
/// [`crate::event`] for the typed view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub action: SocketAction,
    /// Ask the server to persist this frame into the topic backlog
    pub store: bool,
    /// Set by the server on backlog replays
    pub historical: bool,
    pub timestamp: String,
    pub topic: String,
    /// Connection id of the originating socket, filled in by the server
    pub sender: String,
    pub payload: String,
}

impl Frame {
    /// A frame for `topic` with empty metadata and payload.
    pub fn new(action: SocketAction, topic: impl Into<String>) -> Self {
        Self {
            action,
            store: false,
            historical: false,
            timestamp: String::new(),
            topic: topic.into(),
            sender: String::new(),
            payload: String::new(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_store(mut self, store: bool) -> Self {
        self.store = store;
        self
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    /// Heartbeat reply: empty topic, sender and timestamp, payload `PONG`.
    pub fn pong() -> Self {
        Frame::new(SocketAction::PingChannel, "").with_payload(PONG)
    }

    /// Whether this is a server heartbeat rather than a topic message.
    pub fn is_heartbeat(&self) -> bool {
        self.payload == PING
    }

    /// Serialize to wire text.
    pub fn encode(&self) -> Result<String, FrameError> {
        let action = self.action.ordinal().to_string();
        let capacity = FIELD_WIDTH * 7
            + action.len()
            + 2
            + self.timestamp.len()
            + self.topic.len()
            + self.sender.len()
            + self.payload.len();
        let mut out = String::with_capacity(capacity);

        push_field(&mut out, FrameField::Action, &action)?;
        push_field(&mut out, FrameField::Store, flag(self.store))?;
        push_field(&mut out, FrameField::Historical, flag(self.historical))?;
        push_field(&mut out, FrameField::Timestamp, &self.timestamp)?;
        push_field(&mut out, FrameField::Topic, &self.topic)?;
        push_field(&mut out, FrameField::Sender, &self.sender)?;
        push_field(&mut out, FrameField::Payload, &self.payload)?;
        Ok(out)
    }

    /// Parse wire bytes. Bytes after the payload field are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut reader = FieldReader { data: bytes, cursor: 0 };

        let action_text = reader.next_field(FrameField::Action)?;
        let action = action_text
            .parse::<i64>()
            .ok()
            .and_then(SocketAction::from_ordinal)
            .ok_or_else(|| FrameError::UnknownAction(action_text.to_string()))?;

        let store = reader.next_field(FrameField::Store)? == "t";
        let historical = reader.next_field(FrameField::Historical)? == "t";
        let timestamp = reader.next_field(FrameField::Timestamp)?.to_string();
        let topic = reader.next_field(FrameField::Topic)?.to_string();
        let sender = reader.next_field(FrameField::Sender)?.to_string();
        let payload = reader.next_field(FrameField::Payload)?.to_string();

        Ok(Self {
            action,
            store,
            historical,
            timestamp,
            topic,
            sender,
            payload,
        })
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "t"
    } else {
        "f"
    }
}

fn push_field(out: &mut String, field: FrameField, value: &str) -> Result<(), FrameError> {
    if value.len() > MAX_FIELD_LEN {
        return Err(FrameError::FieldTooLong {
            field,
            len: value.len(),
        });
    }
    // Writing into a String cannot fail.
    let _ = write!(out, "{:05}", value.len());
    out.push_str(value);
    Ok(())
}

struct FieldReader<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> FieldReader<'a> {
    fn next_field(&mut self, field: FrameField) -> Result<&'a str, FrameError> {
        let remaining = self.data.len() - self.cursor;
        if remaining < FIELD_WIDTH {
            return Err(FrameError::Truncated {
                field,
                declared: FIELD_WIDTH,
                remaining,
            });
        }

        let header = &self.data[self.cursor..self.cursor + FIELD_WIDTH];
        if !header.iter().all(u8::is_ascii_digit) {
            return Err(FrameError::InvalidLength { field });
        }
        let declared = header
            .iter()
            .fold(0usize, |acc, digit| acc * 10 + usize::from(digit - b'0'));

        let start = self.cursor + FIELD_WIDTH;
        let remaining = self.data.len() - start;
        if declared > remaining {
            return Err(FrameError::Truncated {
                field,
                declared,
                remaining,
            });
        }

        let end = start + declared;
        let value = std::str::from_utf8(&self.data[start..end])
            .map_err(|_| FrameError::InvalidUtf8 { field })?;
        self.cursor = end;
        Ok(value)
    }
}
