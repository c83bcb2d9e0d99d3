use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors reported by the chat transport
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The platform refused the operation, e.g. a request already handled
    #[error("platform rejected the operation: {0}")]
    Rejected(String),
    /// Network or API failure
    #[error("transport request failed: {0}")]
    Request(String),
}

/// Parameters of a new invite link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteLinkSpec {
    /// Target channel
    pub channel_id: i64,
    /// Administrator-chosen name
    pub name: String,
    /// Expiration point
    pub expire_date: DateTime<Utc>,
    /// Joining through the link requires approval
    pub creates_join_request: bool,
}

/// An invite link returned by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedInviteLink {
    /// Link URL
    pub link: String,
    /// Administrator the platform attributes the link to
    pub creator_id: Option<i64>,
}

/// A file to deliver as a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundDocument {
    /// File name shown to the recipient
    pub file_name: String,
    /// File content
    pub bytes: Vec<u8>,
}

/// Outbound capabilities the domain needs from the chat platform.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelGateway: Send + Sync {
    /// Title of a channel.
    async fn channel_title(&self, channel_id: i64) -> Result<String, GatewayError>;

    /// Creates an invite link.
    async fn create_invite_link(&self, spec: InviteLinkSpec) -> Result<CreatedInviteLink, GatewayError>;

    /// Revokes an invite link.
    async fn revoke_invite_link(&self, channel_id: i64, link: &str) -> Result<(), GatewayError>;

    /// Approves a pending join request.
    async fn approve_join_request(&self, channel_id: i64, user_id: i64) -> Result<(), GatewayError>;

    /// Declines a pending join request.
    async fn decline_join_request(&self, channel_id: i64, user_id: i64) -> Result<(), GatewayError>;

    /// Sends an HTML-formatted text message.
    async fn send_text(&self, recipient: i64, text: &str) -> Result<(), GatewayError>;

    /// Sends a document.
    async fn send_document(&self, recipient: i64, document: OutboundDocument) -> Result<(), GatewayError>;
}

/// Title of a channel, falling back to its id when the lookup fails.
pub async fn channel_title_or_id(gateway: &dyn ChannelGateway, channel_id: i64) -> String {
    match gateway.channel_title(channel_id).await {
        Ok(title) if !title.trim().is_empty() => title,
        Ok(_) => channel_id.to_string(),
        Err(e) => {
            tracing::warn!(channel_id, error = %e, "Could not fetch channel title");
            channel_id.to_string()
        }
    }
}
