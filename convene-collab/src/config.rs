//! Client and call configuration.

use crate::ticket::Ticket;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection settings for one client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host[:port]` serving both the ticket endpoint and the socket
    pub host: String,
    /// `https`/`wss` when set, `http`/`ws` otherwise
    pub secure: bool,
    pub ticket_path: String,
    pub socket_path: String,
    /// Wait before reconnecting after an unexpected close during a call
    pub reconnect_delay: Duration,
    /// Backlog page size requested on join and on "load more"
    pub history_page_size: u32,
    /// Sent as `Authorization: Bearer …` on the ticket request
    pub bearer_token: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            secure: true,
            ticket_path: "/api/v1/sock/ticket".to_string(),
            socket_path: "/sock".to_string(),
            reconnect_delay: Duration::from_secs(2),
            history_page_size: 10,
            bearer_token: None,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Plain `http`/`ws`, for local servers.
    pub fn insecure(mut self) -> Self {
        self.secure = false;
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn ticket_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}{}", self.host, self.ticket_path)
    }

    pub fn socket_url(&self, ticket: &Ticket) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!(
            "{scheme}://{}{}?ticket={}",
            self.host,
            self.socket_path,
            urlencoding::encode(ticket.as_str())
        )
    }
}

/// A TURN or STUN server handed to every peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub channel_count: u8,
    pub sample_rate: u32,
    pub sample_size: u8,
    /// Target latency in seconds
    pub latency: f32,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            channel_count: 2,
            sample_rate: 48_000,
            sample_size: 16,
            latency: 0.01,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub max_frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: 520,
            height: 390,
            max_frame_rate: 30,
        }
    }
}

/// What to ask the device layer for when starting local media.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: AudioConstraints,
    /// `None` for voice-only calls
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    pub fn voice() -> Self {
        Self {
            audio: AudioConstraints::default(),
            video: None,
        }
    }

    pub fn with_video() -> Self {
        Self {
            audio: AudioConstraints::default(),
            video: Some(VideoConstraints::default()),
        }
    }
}

/// Settings for the peer signaling orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct CallConfig {
    pub ice_servers: Vec<IceServer>,
    pub video: VideoConstraints,
    pub audio: AudioConstraints,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            video: VideoConstraints::default(),
            audio: AudioConstraints::default(),
        }
    }
}

impl CallConfig {
    /// TURN and STUN on port 3478 of `hostname`, the usual self-hosted layout.
    pub fn for_host(hostname: &str, turn_user: &str, turn_pass: &str) -> Self {
        Self {
            ice_servers: vec![
                IceServer::turn(format!("turn:{hostname}:3478"), turn_user, turn_pass),
                IceServer::stun(format!("stun:{hostname}:3478")),
            ],
            ..Self::default()
        }
    }

    pub fn constraints(&self, video: bool) -> MediaConstraints {
        MediaConstraints {
            audio: self.audio.clone(),
            video: video.then_some(self.video),
        }
    }
}
