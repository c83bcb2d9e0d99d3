use crate::bot::events::{join_request_notice, membership_update};
use crate::bot::resilient::{edit_message_resilient, send_message_resilient};
use crate::bot::views::{inline_keyboard, reply_markup};
use crate::bot::DenialCache;
use anyhow::Result;
use gatekeeper_core::events::SubscriptionEventProcessor;
use gatekeeper_core::router::{self, Conversation, ConversationRouter, Inbound};
use gatekeeper_core::workflow::{Markup, Reply};
use gatekeeper_runtime::{SessionKey, SessionRegistry};
use std::sync::Arc;
use teloxide::{
    prelude::*,
    types::{ChatJoinRequest, ChatMemberUpdated},
    utils::command::BotCommands,
};
use tracing::{debug, error, info};

/// Registry type the bot keeps conversations in
pub type Sessions = SessionRegistry<Conversation>;

const ACCESS_DENIED: &str = "⛔️ Access denied";

/// Supported commands for the bot
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "snake_case", description = "Supported commands:")]
pub enum Command {
    /// Show the main menu
    #[command(description = "Show the main menu.")]
    Start,
    /// Create an invite link
    #[command(description = "Create an invite link.")]
    CreateLink,
    /// Review pending join requests
    #[command(description = "Review pending join requests.")]
    ManageRequests,
    /// Subscribers per invite link
    #[command(description = "Show subscribers per invite link.")]
    Statistics,
    /// Revoke an invite link
    #[command(description = "Revoke an invite link: /revoke_link <link>.")]
    RevokeLink(String),
    /// Abandon the current action
    #[command(description = "Cancel the current action.")]
    Cancel,
    /// List the commands
    #[command(description = "Show this help.")]
    Help,
}

impl Command {
    /// Router command for a bot command; `None` for transport-only ones.
    #[must_use]
    pub fn into_router_command(self) -> Option<router::Command> {
        match self {
            Self::Start => Some(router::Command::Start),
            Self::CreateLink => Some(router::Command::CreateLink),
            Self::ManageRequests => Some(router::Command::ManageRequests),
            Self::Statistics => Some(router::Command::Statistics),
            Self::RevokeLink(link) => Some(router::Command::RevokeLink(link.trim().to_string())),
            Self::Cancel => Some(router::Command::Cancel),
            Self::Help => None,
        }
    }
}

/// Safe extraction of user ID from a message.
/// Returns 0 if the user information is missing.
pub fn get_user_id_safe(msg: &Message) -> i64 {
    msg.from.as_ref().map_or(0, |u| u.id.0.cast_signed())
}

/// Runs one event through the router inside the caller's session.
async fn route(
    router: &Arc<ConversationRouter>,
    sessions: &Sessions,
    chat_id: ChatId,
    actor: i64,
    inbound: Inbound,
) -> Vec<Reply> {
    let router = Arc::clone(router);
    sessions
        .transition(SessionKey::new(chat_id.0, actor), |current| async move {
            let outcome = router.handle(actor, &current, inbound).await;
            (outcome.conversation, outcome.replies)
        })
        .await
}

async fn send_replies(bot: &Bot, chat_id: ChatId, replies: &[Reply]) {
    for reply in replies {
        if let Err(e) = send_message_resilient(bot, chat_id, &reply.text, reply_markup(&reply.markup)).await {
            error!(chat_id = chat_id.0, error = %e, "Failed to deliver reply");
        }
    }
}

/// Command handler
///
/// # Errors
///
/// Returns an error if the help text cannot be sent.
pub async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    router: Arc<ConversationRouter>,
    sessions: Arc<Sessions>,
) -> Result<()> {
    let actor = get_user_id_safe(&msg);
    info!(user_id = actor, command = ?cmd, "Command received");

    let Some(command) = cmd.into_router_command() else {
        send_message_resilient(&bot, msg.chat.id, &Command::descriptions().to_string(), None).await?;
        return Ok(());
    };
    let replies = route(&router, &sessions, msg.chat.id, actor, Inbound::Command(command)).await;
    send_replies(&bot, msg.chat.id, &replies).await;
    Ok(())
}

/// Free text and main menu buttons
pub async fn handle_text(
    bot: Bot,
    msg: Message,
    router: Arc<ConversationRouter>,
    sessions: Arc<Sessions>,
) -> Result<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let actor = get_user_id_safe(&msg);
    let replies = route(&router, &sessions, msg.chat.id, actor, Inbound::Text(text.to_string())).await;
    send_replies(&bot, msg.chat.id, &replies).await;
    Ok(())
}

/// Inline button presses.
///
/// The first reply replaces the pressed menu when it carries no reply
/// keyboard; everything else is sent as new messages.
pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    router: Arc<ConversationRouter>,
    sessions: Arc<Sessions>,
) -> Result<()> {
    if let Err(e) = bot.answer_callback_query(q.id.clone()).await {
        debug!(error = %e, "Failed to answer callback query");
    }
    let Some(payload) = q.data.clone() else {
        return Ok(());
    };

    let actor = q.from.id.0.cast_signed();
    let origin = q.message.as_ref().map(|m| (m.chat().id, m.id()));
    let chat_id = origin.map_or(ChatId(actor), |(chat_id, _)| chat_id);

    let replies = route(&router, &sessions, chat_id, actor, Inbound::Callback(payload)).await;
    let Some((first, rest)) = replies.split_first() else {
        return Ok(());
    };

    let edited = match (origin, &first.markup) {
        (Some((chat_id, msg_id)), Markup::Inline(rows)) => {
            edit_message_resilient(&bot, chat_id, msg_id, &first.text, Some(inline_keyboard(rows))).await
        }
        (Some((chat_id, msg_id)), Markup::None) => {
            edit_message_resilient(&bot, chat_id, msg_id, &first.text, None).await
        }
        _ => false,
    };
    if !edited {
        send_replies(&bot, chat_id, std::slice::from_ref(first)).await;
    }
    send_replies(&bot, chat_id, rest).await;
    Ok(())
}

/// Denies a message from a non-administrator, at most once per cooldown.
pub async fn handle_unauthorized(bot: Bot, msg: Message, denials: Arc<DenialCache>) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    if !denials.should_send(user_id).await {
        return Ok(());
    }
    info!(user_id, "Unauthorized access, sending denial");
    bot.send_message(msg.chat.id, ACCESS_DENIED).await?;
    denials.mark_sent(user_id).await;
    Ok(())
}

/// Denies an inline button press from a non-administrator.
pub async fn handle_unauthorized_callback(bot: Bot, q: CallbackQuery) -> Result<()> {
    info!(user_id = q.from.id.0, "Unauthorized callback");
    bot.answer_callback_query(q.id.clone()).text(ACCESS_DENIED).await?;
    Ok(())
}

/// Records a membership change of a managed channel.
pub async fn handle_member_update(
    update: ChatMemberUpdated,
    processor: Arc<SubscriptionEventProcessor>,
) -> Result<()> {
    let event = membership_update(&update);
    let outcome = processor.process_membership(&event).await?;
    debug!(
        channel_id = event.channel_id,
        user_id = event.user.id,
        outcome = ?outcome,
        "Membership update processed"
    );
    Ok(())
}

/// Records a join request to a managed channel.
pub async fn handle_join_request(
    request: ChatJoinRequest,
    processor: Arc<SubscriptionEventProcessor>,
) -> Result<()> {
    let notice = join_request_notice(&request);
    let outcome = processor.process_join_request(&notice).await?;
    debug!(
        channel_id = notice.channel_id,
        user_id = notice.user.id,
        outcome = ?outcome,
        "Join request processed"
    );
    Ok(())
}
