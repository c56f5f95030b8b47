//! User-facing notices and client lifecycle events.

pub const RECONNECTING: &str = "Connection lost, attempting to reconnect...";
pub const RECONNECTED: &str = "Reconnected!";
pub const CONNECTION_LOST: &str = "Connection lost, please refresh the page.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Success,
    Warning,
    Error,
}

/// Something the user should see. Persistent notices stay until dismissed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub message: String,
    pub kind: NoticeKind,
    pub persistent: bool,
}

impl Notice {
    fn new(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            persistent: false,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(NoticeKind::Success, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(NoticeKind::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(NoticeKind::Error, message)
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }
}

/// Events emitted by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Socket open under a fresh connection id
    Connected { connection_id: String },
    Disconnected,
    Notice(Notice),
    /// Own profile changed server-side and should be fetched again
    ProfileRefresh,
}
