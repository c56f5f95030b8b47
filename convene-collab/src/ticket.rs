//! One-time socket tickets.
//!
//! The ticket endpoint returns `{"ticket": "<opaque>:<connection id>"}`. The
//! whole string goes into the socket URL; the part after the colon is this
//! client's connection id for the lifetime of that socket.

use crate::config::ClientConfig;
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum TicketError {
    #[error("ticket request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ticket endpoint answered {0}")]
    Status(u16),

    #[error("malformed ticket '{0}'")]
    Malformed(String),

    #[error("ticket issuer unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    raw: String,
    split: usize,
}

impl Ticket {
    /// Accepts exactly `<opaque>:<connection id>`, both parts non-empty.
    pub fn parse(raw: impl Into<String>) -> Result<Self, TicketError> {
        let raw = raw.into();
        match raw.split_once(':') {
            Some((opaque, id)) if !opaque.is_empty() && !id.is_empty() && !id.contains(':') => {
                let split = opaque.len();
                Ok(Self { raw, split })
            }
            _ => Err(TicketError::Malformed(raw)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn connection_id(&self) -> &str {
        &self.raw[self.split + 1..]
    }
}

/// Source of socket tickets.
#[async_trait]
pub trait TicketIssuer: Send + Sync {
    async fn issue(&self) -> Result<Ticket, TicketError>;
}

#[derive(Deserialize)]
struct TicketResponse {
    ticket: String,
}

/// Fetches tickets from the REST layer.
pub struct HttpTicketIssuer {
    client: reqwest::Client,
    url: String,
    bearer_token: Option<String>,
}

impl HttpTicketIssuer {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.ticket_url(),
            bearer_token: config.bearer_token.clone(),
        }
    }
}

#[async_trait]
impl TicketIssuer for HttpTicketIssuer {
    async fn issue(&self) -> Result<Ticket, TicketError> {
        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(TicketError::Status(response.status().as_u16()));
        }

        let body: TicketResponse = response.json().await?;
        log::debug!("ticket issued by {}", self.url);
        Ticket::parse(body.ticket)
    }
}
