//! Action codes carried in the first field of every frame.
//!
//! The ordinal is what goes on the wire, so it must never change between
//! client and server releases. New codes are appended at the end.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Every action the transport understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u16)]
pub enum SocketAction {
    /// Channel-wide "is anyone streaming?" ping sent by a new subscriber
    PingChannel = 0,
    /// Targeted request asking a peer to start negotiating with the sender
    StartStream = 1,
    /// Sender stopped publishing local media
    StopStream = 2,
    /// Sender is streaming and ready to connect with anyone not yet linked
    StreamInquiry = 3,
    /// A participant's socket left the topic
    UnsubscribeTopic = 4,
    SubscribeTopic = 5,
    /// Backlog page request
    LoadMessages = 6,
    /// Server has further backlog beyond the last page
    HasMoreMessages = 7,
    /// Topic subscribe request and its acknowledgement
    Subscribe = 8,
    Unsubscribe = 9,
    /// Roster request and response
    LoadSubscribers = 10,
    SubscribersPresent = 11,
    Text = 12,
    /// Generic signaling envelope (session descriptions and ICE candidates)
    Rtc = 13,
    SetPosition = 14,
    SetPage = 15,
    SetScale = 16,
    SetStroke = 17,
    DrawLines = 18,
    ShareFile = 19,
    ChangeSetting = 20,
    SubscribeInit = 21,
    SetSelectedText = 22,
    /// Own profile changed server-side; refetch it over REST
    RoleCall = 23,
}

impl SocketAction {
    /// All actions, indexed by ordinal.
    pub const ALL: [SocketAction; 24] = [
        SocketAction::PingChannel,
        SocketAction::StartStream,
        SocketAction::StopStream,
        SocketAction::StreamInquiry,
        SocketAction::UnsubscribeTopic,
        SocketAction::SubscribeTopic,
        SocketAction::LoadMessages,
        SocketAction::HasMoreMessages,
        SocketAction::Subscribe,
        SocketAction::Unsubscribe,
        SocketAction::LoadSubscribers,
        SocketAction::SubscribersPresent,
        SocketAction::Text,
        SocketAction::Rtc,
        SocketAction::SetPosition,
        SocketAction::SetPage,
        SocketAction::SetScale,
        SocketAction::SetStroke,
        SocketAction::DrawLines,
        SocketAction::ShareFile,
        SocketAction::ChangeSetting,
        SocketAction::SubscribeInit,
        SocketAction::SetSelectedText,
        SocketAction::RoleCall,
    ];

    /// Wire ordinal.
    pub fn ordinal(self) -> u16 {
        self as u16
    }

    /// Look up an action by its wire ordinal.
    pub fn from_ordinal(ordinal: i64) -> Option<Self> {
        let index = usize::try_from(ordinal).ok()?;
        Self::ALL.get(index).copied()
    }

    /// Control actions drive the protocol itself; the rest carry application data.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            SocketAction::PingChannel
                | SocketAction::StartStream
                | SocketAction::StopStream
                | SocketAction::StreamInquiry
                | SocketAction::UnsubscribeTopic
                | SocketAction::SubscribeTopic
                | SocketAction::LoadMessages
                | SocketAction::HasMoreMessages
                | SocketAction::Subscribe
                | SocketAction::Unsubscribe
                | SocketAction::LoadSubscribers
                | SocketAction::SubscribersPresent
                | SocketAction::Rtc
                | SocketAction::SubscribeInit
                | SocketAction::RoleCall
        )
    }

    /// Whiteboard and drawing updates.
    pub fn is_whiteboard(self) -> bool {
        matches!(
            self,
            SocketAction::SetPosition
                | SocketAction::SetPage
                | SocketAction::SetScale
                | SocketAction::SetStroke
                | SocketAction::DrawLines
                | SocketAction::ShareFile
                | SocketAction::ChangeSetting
                | SocketAction::SetSelectedText
        )
    }

    /// Upper snake case name, as used in logs and by the server.
    pub fn name(self) -> &'static str {
        match self {
            SocketAction::PingChannel => "PING_CHANNEL",
            SocketAction::StartStream => "START_STREAM",
            SocketAction::StopStream => "STOP_STREAM",
            SocketAction::StreamInquiry => "STREAM_INQUIRY",
            SocketAction::UnsubscribeTopic => "UNSUBSCRIBE_TOPIC",
            SocketAction::SubscribeTopic => "SUBSCRIBE_TOPIC",
            SocketAction::LoadMessages => "LOAD_MESSAGES",
            SocketAction::HasMoreMessages => "HAS_MORE_MESSAGES",
            SocketAction::Subscribe => "SUBSCRIBE",
            SocketAction::Unsubscribe => "UNSUBSCRIBE",
            SocketAction::LoadSubscribers => "LOAD_SUBSCRIBERS",
            SocketAction::SubscribersPresent => "SUBSCRIBERS_PRESENT",
            SocketAction::Text => "TEXT",
            SocketAction::Rtc => "RTC",
            SocketAction::SetPosition => "SET_POSITION",
            SocketAction::SetPage => "SET_PAGE",
            SocketAction::SetScale => "SET_SCALE",
            SocketAction::SetStroke => "SET_STROKE",
            SocketAction::DrawLines => "DRAW_LINES",
            SocketAction::ShareFile => "SHARE_FILE",
            SocketAction::ChangeSetting => "CHANGE_SETTING",
            SocketAction::SubscribeInit => "SUBSCRIBE_INIT",
            SocketAction::SetSelectedText => "SET_SELECTED_TEXT",
            SocketAction::RoleCall => "ROLE_CALL",
        }
    }
}

impl fmt::Display for SocketAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
