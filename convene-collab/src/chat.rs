//! Topic chat log built from a session's events.
//!
//! Text is attributed through the roster: the entry whose device/tab ids
//! include the frame's sender. Live lines go to the bottom; backlog pages
//! arrive newest-first and are pushed on top, so each loaded page ends up
//! above the previous one in reading order.

use crate::presence::SessionEvent;
use crate::roster::Roster;
use chrono::{DateTime, Utc};
use convene_core::{Message, SocketEvent, TextStyle};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    /// Connection id the line was sent from
    pub sender: String,
    /// Roster entry it belongs to, if known
    pub scid: Option<String>,
    pub name: String,
    pub color: String,
    pub role: String,
    pub message: String,
    pub style: TextStyle,
    pub timestamp: Option<DateTime<Utc>>,
    pub historical: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ChatLog {
    entries: VecDeque<ChatEntry>,
    more_available: bool,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one session event into the log. Returns true if the log changed.
    ///
    /// A live line from a connection the roster does not know is dropped; a
    /// historical one is kept without attribution since its author may have
    /// left long ago.
    pub fn apply(&mut self, event: &SessionEvent, roster: &Roster) -> bool {
        match event {
            SessionEvent::Message(message) => self.apply_message(message, roster),
            SessionEvent::MoreHistory => {
                self.more_available = true;
                true
            }
            _ => false,
        }
    }

    fn apply_message(&mut self, message: &Message, roster: &Roster) -> bool {
        let SocketEvent::Text(text) = &message.event else {
            return false;
        };

        let author = roster.by_connection(&message.sender);
        if author.is_none() && !message.historical {
            log::debug!("text from unknown connection {} dropped", message.sender);
            return false;
        }

        let timestamp = DateTime::parse_from_rfc3339(&message.timestamp)
            .ok()
            .map(|t| t.with_timezone(&Utc));
        let entry = ChatEntry {
            sender: message.sender.clone(),
            scid: author.map(|p| p.scid.clone()),
            name: author.map(|p| p.name.clone()).unwrap_or_default(),
            color: author.map(|p| p.color.clone()).unwrap_or_default(),
            role: author.map(|p| p.role.clone()).unwrap_or_default(),
            message: text.message.clone(),
            style: text.style,
            timestamp,
            historical: message.historical,
        };

        if message.historical {
            self.entries.push_front(entry);
        } else {
            self.entries.push_back(entry);
        }
        true
    }

    pub fn entries(&self) -> impl Iterator<Item = &ChatEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn more_available(&self) -> bool {
        self.more_available
    }

    /// Clear the flag when the next page is requested.
    pub fn clear_more(&mut self) {
        self.more_available = false;
    }
}
