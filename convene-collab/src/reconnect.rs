//! Reconnect decisions driven by the on-call marker.
//!
//! ```text
//!  close ──► marker?
//!             ├─ absent  ──► stay closed (intentional shutdown)
//!             ├─ blurred ──► clear marker, reconnect now
//!             └─ true    ──► reconnect after delay
//!                            (warning notice once per outage)
//!
//!  open  ──► marker = true, "Reconnected!" if the warning was shown
//!  blur  ──► true → blurred
//!  focus ──► blurred → true, only while the socket is open
//! ```
//!
//! The policy holds no socket; the connection manager feeds it events and
//! acts on what it returns.

use crate::marker::{MarkerStore, OnCallMarker};
use crate::notice::{Notice, RECONNECTED, RECONNECTING};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    Stay,
    Immediate,
    After(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseDecision {
    pub action: ReconnectAction,
    pub notice: Option<Notice>,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    delay: Duration,
    notice_shown: bool,
}

impl ReconnectPolicy {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            notice_shown: false,
        }
    }

    pub fn on_close(&mut self, markers: &dyn MarkerStore) -> CloseDecision {
        match markers.load() {
            OnCallMarker::Absent => CloseDecision {
                action: ReconnectAction::Stay,
                notice: None,
            },
            OnCallMarker::Blurred => {
                markers.store(OnCallMarker::Absent);
                CloseDecision {
                    action: ReconnectAction::Immediate,
                    notice: None,
                }
            }
            OnCallMarker::Active => {
                let notice = if self.notice_shown {
                    None
                } else {
                    self.notice_shown = true;
                    Some(Notice::warning(RECONNECTING))
                };
                CloseDecision {
                    action: ReconnectAction::After(self.delay),
                    notice,
                }
            }
        }
    }

    pub fn on_open(&mut self, markers: &dyn MarkerStore) -> Option<Notice> {
        markers.store(OnCallMarker::Active);
        std::mem::take(&mut self.notice_shown).then(|| Notice::success(RECONNECTED))
    }

    pub fn on_focus_change(&self, focused: bool, socket_open: bool, markers: &dyn MarkerStore) {
        match (focused, markers.load()) {
            (false, OnCallMarker::Active) => markers.store(OnCallMarker::Blurred),
            (true, OnCallMarker::Blurred) if socket_open => markers.store(OnCallMarker::Active),
            _ => {}
        }
    }

    pub fn notice_shown(&self) -> bool {
        self.notice_shown
    }
}
