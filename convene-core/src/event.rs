//! Typed view of frame payloads.
//!
//! Each action code maps to exactly one [`SocketEvent`] variant. Payloads are
//! decoded once, when a frame is routed, instead of by every listener.
//!
//! ```text
//! Frame { action: RTC, payload: "{\"target\":\"b\",\"sdp\":{…}}" }
//!       │  Message::from_frame
//!       ▼
//! Message { sender, topic, …, event: SocketEvent::Signal(SignalEnvelope { … }) }
//! ```

use crate::action::SocketAction;
use crate::frame::Frame;
use crate::participant::Participant;
use crate::signal::SignalEnvelope;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("invalid {action} payload: {source}")]
    Json {
        action: SocketAction,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} does not carry whiteboard data")]
    NotWhiteboard(SocketAction),
}

/// Optional recipient of a call-control message. Absent means "everyone on
/// the topic".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl CallTarget {
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
        }
    }

    pub fn everyone() -> Self {
        Self::default()
    }
}

/// Backlog page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    #[serde(rename = "pageSize")]
    pub page_size: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextStyle {
    /// Spoken, transcribed
    #[default]
    Utterance,
    /// Typed
    Written,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMessage {
    pub message: String,
    #[serde(default)]
    pub style: TextStyle,
}

impl TextMessage {
    pub fn written(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            style: TextStyle::Written,
        }
    }
}

/// Decoded payload, one variant per action code.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    PingChannel(CallTarget),
    StartStream(CallTarget),
    StopStream(CallTarget),
    StreamInquiry(CallTarget),
    /// `<scoped id>:<connection id>` of the socket that left
    TopicUnsubscribed { socket_id: String },
    SubscribeTopic(Value),
    LoadMessages(PageRequest),
    HasMoreMessages,
    Subscribe,
    Unsubscribe,
    /// Roster keyed by scoped connection id. Empty on the outbound request.
    Subscribers(BTreeMap<String, Participant>),
    SubscribersPresent(Value),
    Text(TextMessage),
    Signal(SignalEnvelope),
    Whiteboard { action: SocketAction, data: Value },
    SubscribeInit(Value),
    RoleCall,
}

impl SocketEvent {
    /// Decode `payload` as the variant belonging to `action`.
    ///
    /// An empty payload is read as `{}` for object payloads and as `null`
    /// for opaque ones.
    pub fn decode(action: SocketAction, payload: &str) -> Result<Self, PayloadError> {
        let event = match action {
            SocketAction::PingChannel => SocketEvent::PingChannel(object(action, payload)?),
            SocketAction::StartStream => SocketEvent::StartStream(object(action, payload)?),
            SocketAction::StopStream => SocketEvent::StopStream(object(action, payload)?),
            SocketAction::StreamInquiry => SocketEvent::StreamInquiry(object(action, payload)?),
            SocketAction::UnsubscribeTopic => SocketEvent::TopicUnsubscribed {
                socket_id: socket_id(payload),
            },
            SocketAction::SubscribeTopic => SocketEvent::SubscribeTopic(opaque(action, payload)?),
            SocketAction::LoadMessages => SocketEvent::LoadMessages(object(action, payload)?),
            SocketAction::HasMoreMessages => SocketEvent::HasMoreMessages,
            SocketAction::Subscribe => SocketEvent::Subscribe,
            SocketAction::Unsubscribe => SocketEvent::Unsubscribe,
            SocketAction::LoadSubscribers => SocketEvent::Subscribers(object(action, payload)?),
            SocketAction::SubscribersPresent => {
                SocketEvent::SubscribersPresent(opaque(action, payload)?)
            }
            SocketAction::Text => SocketEvent::Text(object(action, payload)?),
            SocketAction::Rtc => SocketEvent::Signal(object(action, payload)?),
            SocketAction::SubscribeInit => SocketEvent::SubscribeInit(opaque(action, payload)?),
            SocketAction::RoleCall => SocketEvent::RoleCall,
            SocketAction::SetPosition
            | SocketAction::SetPage
            | SocketAction::SetScale
            | SocketAction::SetStroke
            | SocketAction::DrawLines
            | SocketAction::ShareFile
            | SocketAction::ChangeSetting
            | SocketAction::SetSelectedText => SocketEvent::Whiteboard {
                action,
                data: opaque(action, payload)?,
            },
        };
        Ok(event)
    }

    /// Build a whiteboard event, refusing non-whiteboard actions.
    pub fn whiteboard(action: SocketAction, data: Value) -> Result<Self, PayloadError> {
        if !action.is_whiteboard() {
            return Err(PayloadError::NotWhiteboard(action));
        }
        Ok(SocketEvent::Whiteboard { action, data })
    }

    pub fn action(&self) -> SocketAction {
        match self {
            SocketEvent::PingChannel(_) => SocketAction::PingChannel,
            SocketEvent::StartStream(_) => SocketAction::StartStream,
            SocketEvent::StopStream(_) => SocketAction::StopStream,
            SocketEvent::StreamInquiry(_) => SocketAction::StreamInquiry,
            SocketEvent::TopicUnsubscribed { .. } => SocketAction::UnsubscribeTopic,
            SocketEvent::SubscribeTopic(_) => SocketAction::SubscribeTopic,
            SocketEvent::LoadMessages(_) => SocketAction::LoadMessages,
            SocketEvent::HasMoreMessages => SocketAction::HasMoreMessages,
            SocketEvent::Subscribe => SocketAction::Subscribe,
            SocketEvent::Unsubscribe => SocketAction::Unsubscribe,
            SocketEvent::Subscribers(_) => SocketAction::LoadSubscribers,
            SocketEvent::SubscribersPresent(_) => SocketAction::SubscribersPresent,
            SocketEvent::Text(_) => SocketAction::Text,
            SocketEvent::Signal(_) => SocketAction::Rtc,
            SocketEvent::Whiteboard { action, .. } => *action,
            SocketEvent::SubscribeInit(_) => SocketAction::SubscribeInit,
            SocketEvent::RoleCall => SocketAction::RoleCall,
        }
    }

    /// Payload text for the wire.
    pub fn encode_payload(&self) -> Result<String, PayloadError> {
        let action = self.action();
        match self {
            SocketEvent::PingChannel(target)
            | SocketEvent::StartStream(target)
            | SocketEvent::StopStream(target)
            | SocketEvent::StreamInquiry(target) => {
                if target.target.is_none() {
                    Ok(String::new())
                } else {
                    to_json(action, target)
                }
            }
            SocketEvent::TopicUnsubscribed { socket_id } => Ok(socket_id.clone()),
            SocketEvent::LoadMessages(page) => to_json(action, page),
            SocketEvent::Subscribers(roster) if roster.is_empty() => Ok(String::new()),
            SocketEvent::Subscribers(roster) => to_json(action, roster),
            SocketEvent::Text(text) => to_json(action, text),
            SocketEvent::Signal(envelope) => to_json(action, envelope),
            SocketEvent::SubscribeTopic(data)
            | SocketEvent::SubscribersPresent(data)
            | SocketEvent::SubscribeInit(data)
            | SocketEvent::Whiteboard { data, .. } => {
                if data.is_null() {
                    Ok(String::new())
                } else {
                    to_json(action, data)
                }
            }
            SocketEvent::HasMoreMessages
            | SocketEvent::Subscribe
            | SocketEvent::Unsubscribe
            | SocketEvent::RoleCall => Ok(String::new()),
        }
    }

    /// Recipient named in the payload, for call-control and RTC events.
    pub fn target(&self) -> Option<&str> {
        match self {
            SocketEvent::PingChannel(t)
            | SocketEvent::StartStream(t)
            | SocketEvent::StopStream(t)
            | SocketEvent::StreamInquiry(t) => t.target.as_deref(),
            SocketEvent::Signal(envelope) => envelope.target.as_deref(),
            _ => None,
        }
    }
}

fn object<T: DeserializeOwned>(action: SocketAction, payload: &str) -> Result<T, PayloadError> {
    let text = if payload.trim().is_empty() { "{}" } else { payload };
    serde_json::from_str(text).map_err(|source| PayloadError::Json { action, source })
}

fn opaque(action: SocketAction, payload: &str) -> Result<Value, PayloadError> {
    if payload.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(payload).map_err(|source| PayloadError::Json { action, source })
}

fn to_json<T: Serialize + ?Sized>(action: SocketAction, value: &T) -> Result<String, PayloadError> {
    serde_json::to_string(value).map_err(|source| PayloadError::Json { action, source })
}

/// Departure payloads arrive either raw or as a JSON string.
fn socket_id(payload: &str) -> String {
    serde_json::from_str::<String>(payload).unwrap_or_else(|_| payload.to_string())
}

/// A routed frame: wire metadata plus the decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub store: bool,
    pub historical: bool,
    pub timestamp: String,
    pub topic: String,
    pub sender: String,
    pub event: SocketEvent,
}

impl Message {
    pub fn from_frame(frame: &Frame) -> Result<Self, PayloadError> {
        Ok(Self {
            store: frame.store,
            historical: frame.historical,
            timestamp: frame.timestamp.clone(),
            topic: frame.topic.clone(),
            sender: frame.sender.clone(),
            event: SocketEvent::decode(frame.action, &frame.payload)?,
        })
    }

    pub fn action(&self) -> SocketAction {
        self.event.action()
    }

    pub fn target(&self) -> Option<&str> {
        self.event.target()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{IceCandidate, SessionDescription};

    #[test]
    fn test_roster_response() {
        let payload = r#"{"s1":{"scid":"s1","cids":["c1","c2"],"name":"Ada","role":"Admin","color":"","exists":true,"online":true}}"#;
        let event = SocketEvent::decode(SocketAction::LoadSubscribers, payload).unwrap();

        let SocketEvent::Subscribers(roster) = event else {
            panic!("expected roster");
        };
        let ada = &roster["s1"];
        assert_eq!(ada.cids, vec!["c1", "c2"]);
        assert!(ada.online);
    }

    #[test]
    fn test_empty_payload_reads_as_empty_object() {
        assert_eq!(
            SocketEvent::decode(SocketAction::LoadSubscribers, "").unwrap(),
            SocketEvent::Subscribers(BTreeMap::new())
        );
        assert_eq!(
            SocketEvent::decode(SocketAction::StreamInquiry, "").unwrap(),
            SocketEvent::StreamInquiry(CallTarget::everyone())
        );
    }

    #[test]
    fn test_departure_raw_and_quoted() {
        for payload in ["s1:c9", "\"s1:c9\""] {
            assert_eq!(
                SocketEvent::decode(SocketAction::UnsubscribeTopic, payload).unwrap(),
                SocketEvent::TopicUnsubscribed {
                    socket_id: "s1:c9".into()
                }
            );
        }
    }

    #[test]
    fn test_text_defaults_to_utterance() {
        let event = SocketEvent::decode(SocketAction::Text, r#"{"message":"hi"}"#).unwrap();
        assert_eq!(
            event,
            SocketEvent::Text(TextMessage {
                message: "hi".into(),
                style: TextStyle::Utterance,
            })
        );
    }

    #[test]
    fn test_signal_target() {
        let envelope = SignalEnvelope::description("b", SessionDescription::offer("v=0"));
        let payload = SocketEvent::Signal(envelope).encode_payload().unwrap();
        let decoded = SocketEvent::decode(SocketAction::Rtc, &payload).unwrap();
        assert_eq!(decoded.target(), Some("b"));

        let ice = SocketEvent::Signal(SignalEnvelope::candidate("c", IceCandidate::new("x")));
        assert_eq!(ice.target(), Some("c"));
        assert_eq!(SocketEvent::Subscribe.target(), None);
    }

    #[test]
    fn test_untargeted_control_has_empty_payload() {
        assert_eq!(
            SocketEvent::PingChannel(CallTarget::everyone())
                .encode_payload()
                .unwrap(),
            ""
        );
        assert_eq!(
            SocketEvent::StartStream(CallTarget::to("a"))
                .encode_payload()
                .unwrap(),
            r#"{"target":"a"}"#
        );
    }

    #[test]
    fn test_page_request_field_names() {
        let event = SocketEvent::LoadMessages(PageRequest {
            page: 1,
            page_size: 10,
        });
        assert_eq!(event.encode_payload().unwrap(), r#"{"page":1,"pageSize":10}"#);
    }

    #[test]
    fn test_whiteboard_passthrough() {
        let event = SocketEvent::decode(SocketAction::SetScale, r#"{"scale":2}"#).unwrap();
        assert_eq!(event.action(), SocketAction::SetScale);
        assert!(SocketEvent::whiteboard(SocketAction::Text, Value::Null).is_err());
    }

    #[test]
    fn test_bad_json_is_an_error() {
        let err = SocketEvent::decode(SocketAction::Text, "{not json").unwrap_err();
        assert!(err.to_string().starts_with("invalid TEXT payload"));
    }

    #[test]
    fn test_message_from_frame() {
        let frame = Frame::new(SocketAction::Text, "exchange/1:session42")
            .with_sender("c1")
            .with_payload(r#"{"message":"hello","style":"written"}"#);
        let message = Message::from_frame(&frame).unwrap();

        assert_eq!(message.action(), SocketAction::Text);
        assert_eq!(message.sender, "c1");
        assert_eq!(
            message.event,
            SocketEvent::Text(TextMessage::written("hello"))
        );
    }
}
