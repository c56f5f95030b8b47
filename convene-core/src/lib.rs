//! # convene-core: wire layer for the Convene real-time core
//!
//! Pure types with no I/O: everything both ends of a socket must agree on.
//!
//! ## Modules
//!
//! - [`action`]: ordinal-stable action codes
//! - [`frame`]: 5-digit length-prefixed frame codec
//! - [`event`]: typed payload union decoded from a frame
//! - [`participant`]: roster entry
//! - [`signal`]: session descriptions, ICE candidates, RTC envelope

pub mod action;
pub mod event;
pub mod frame;
pub mod participant;
pub mod signal;

pub use action::SocketAction;
pub use event::{
    CallTarget, Message, PageRequest, PayloadError, SocketEvent, TextMessage, TextStyle,
};
pub use frame::{Frame, FrameError, FrameField, MAX_FIELD_LEN, PING, PONG};
pub use participant::Participant;
pub use signal::{IceCandidate, SdpKind, SessionDescription, SignalEnvelope};
