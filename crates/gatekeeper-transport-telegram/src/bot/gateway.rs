//! Telegram implementation of the outbound channel capabilities.

use async_trait::async_trait;
use gatekeeper_core::gateway::{
    ChannelGateway, CreatedInviteLink, GatewayError, InviteLinkSpec, OutboundDocument,
};
use gatekeeper_core::utils::retry_transport_operation;
use teloxide::prelude::*;
use teloxide::types::{InputFile, ParseMode, UserId};
use teloxide::RequestError;

fn gateway_error(e: RequestError) -> GatewayError {
    match e {
        RequestError::Api(api) => GatewayError::Rejected(api.to_string()),
        other => GatewayError::Request(other.to_string()),
    }
}

const fn user_id(id: i64) -> UserId {
    UserId(id.cast_unsigned())
}

/// [`ChannelGateway`] over the Bot API.
///
/// Sends are retried on failure; approvals, declines and link changes are
/// issued once since the platform may have applied them already.
#[derive(Clone)]
pub struct TelegramGateway {
    bot: Bot,
}

impl TelegramGateway {
    /// Wraps a bot handle.
    #[must_use]
    pub const fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl ChannelGateway for TelegramGateway {
    async fn channel_title(&self, channel_id: i64) -> Result<String, GatewayError> {
        let chat = retry_transport_operation(|| async { self.bot.get_chat(ChatId(channel_id)).await })
            .await
            .map_err(gateway_error)?;
        Ok(chat.title().map_or_else(|| channel_id.to_string(), str::to_owned))
    }

    async fn create_invite_link(&self, spec: InviteLinkSpec) -> Result<CreatedInviteLink, GatewayError> {
        let link = self
            .bot
            .create_chat_invite_link(ChatId(spec.channel_id))
            .name(spec.name)
            .expire_date(spec.expire_date)
            .creates_join_request(spec.creates_join_request)
            .await
            .map_err(gateway_error)?;
        Ok(CreatedInviteLink {
            link: link.invite_link,
            creator_id: Some(link.creator.id.0.cast_signed()),
        })
    }

    async fn revoke_invite_link(&self, channel_id: i64, link: &str) -> Result<(), GatewayError> {
        self.bot
            .revoke_chat_invite_link(ChatId(channel_id), link)
            .await
            .map_err(gateway_error)?;
        Ok(())
    }

    async fn approve_join_request(&self, channel_id: i64, user: i64) -> Result<(), GatewayError> {
        self.bot
            .approve_chat_join_request(ChatId(channel_id), user_id(user))
            .await
            .map_err(gateway_error)?;
        Ok(())
    }

    async fn decline_join_request(&self, channel_id: i64, user: i64) -> Result<(), GatewayError> {
        self.bot
            .decline_chat_join_request(ChatId(channel_id), user_id(user))
            .await
            .map_err(gateway_error)?;
        Ok(())
    }

    async fn send_text(&self, recipient: i64, text: &str) -> Result<(), GatewayError> {
        retry_transport_operation(|| async {
            self.bot
                .send_message(ChatId(recipient), text)
                .parse_mode(ParseMode::Html)
                .await
        })
        .await
        .map_err(gateway_error)?;
        Ok(())
    }

    async fn send_document(&self, recipient: i64, document: OutboundDocument) -> Result<(), GatewayError> {
        retry_transport_operation(|| async {
            let file = InputFile::memory(document.bytes.clone()).file_name(document.file_name.clone());
            self.bot.send_document(ChatId(recipient), file).await
        })
        .await
        .map_err(gateway_error)?;
        Ok(())
    }
}
