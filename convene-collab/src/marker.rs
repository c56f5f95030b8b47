//! Persisted on-call marker.
//!
//! Three states, stored as a missing value, `"true"` or `"blurred"`. The
//! transport reads it on every close to pick a reconnect strategy.

use parking_lot::Mutex;
use std::io::ErrorKind;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnCallMarker {
    /// No active session; a close is intentional
    #[default]
    Absent,
    /// Socket open and the window focused
    Active,
    /// Window lost focus while the socket was open
    Blurred,
}

impl OnCallMarker {
    pub fn as_stored(self) -> Option<&'static str> {
        match self {
            OnCallMarker::Absent => None,
            OnCallMarker::Active => Some("true"),
            OnCallMarker::Blurred => Some("blurred"),
        }
    }

    /// Unknown values read as absent.
    pub fn from_stored(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("true") => OnCallMarker::Active,
            Some("blurred") => OnCallMarker::Blurred,
            _ => OnCallMarker::Absent,
        }
    }
}

pub trait MarkerStore: Send + Sync {
    fn load(&self) -> OnCallMarker;
    fn store(&self, marker: OnCallMarker);
}

#[derive(Debug, Default)]
pub struct MemoryMarkerStore {
    marker: Mutex<OnCallMarker>,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MarkerStore for MemoryMarkerStore {
    fn load(&self) -> OnCallMarker {
        *self.marker.lock()
    }

    fn store(&self, marker: OnCallMarker) {
        *self.marker.lock() = marker;
    }
}

/// Marker kept in a small text file so it survives process restarts.
/// An absent marker is an absent file.
#[derive(Debug, Clone)]
pub struct FileMarkerStore {
    path: PathBuf,
}

impl FileMarkerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MarkerStore for FileMarkerStore {
    fn load(&self) -> OnCallMarker {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => OnCallMarker::from_stored(Some(&text)),
            Err(e) if e.kind() == ErrorKind::NotFound => OnCallMarker::Absent,
            Err(e) => {
                log::warn!("reading on-call marker {}: {e}", self.path.display());
                OnCallMarker::Absent
            }
        }
    }

    fn store(&self, marker: OnCallMarker) {
        let result = match marker.as_stored() {
            Some(value) => std::fs::write(&self.path, value),
            None => match std::fs::remove_file(&self.path) {
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        if let Err(e) = result {
            log::warn!("writing on-call marker {}: {e}", self.path.display());
        }
    }
}
