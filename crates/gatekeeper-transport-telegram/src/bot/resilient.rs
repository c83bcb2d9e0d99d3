//! Resilient messaging with automatic retry for Telegram API operations.
//!
//! These wrappers retry transient network failures with exponential backoff
//! and jitter. Only idempotent calls go through them: a retried send may at
//! worst duplicate a message, never a state change.

use anyhow::Result;
use gatekeeper_core::utils::{retry_transport_operation, truncate_str};
use teloxide::prelude::*;
use teloxide::types::{ChatId, InlineKeyboardMarkup, Message, MessageId, ParseMode, ReplyMarkup};
use tracing::{debug, warn};

/// Telegram rejects longer messages; keep some room for markup.
pub const MAX_MESSAGE_CHARS: usize = 4000;

fn fit(text: &str) -> String {
    if text.chars().count() > MAX_MESSAGE_CHARS {
        truncate_str(text, MAX_MESSAGE_CHARS)
    } else {
        text.to_string()
    }
}

/// Send an HTML message with automatic retry on network failures.
///
/// # Errors
///
/// Returns the last error after all retries are exhausted.
pub async fn send_message_resilient(
    bot: &Bot,
    chat_id: ChatId,
    text: &str,
    markup: Option<ReplyMarkup>,
) -> Result<Message> {
    let text = fit(text);
    retry_transport_operation(|| async {
        let mut req = bot
            .send_message(chat_id, text.clone())
            .parse_mode(ParseMode::Html);
        if let Some(markup) = markup.clone() {
            req = req.reply_markup(markup);
        }
        req.await
            .map_err(|e| anyhow::anyhow!("Telegram send error: {e}"))
    })
    .await
}

/// Edit an HTML message in place with automatic retry.
///
/// Returns `true` when the message shows `text` afterwards, including the
/// case where it already did.
pub async fn edit_message_resilient(
    bot: &Bot,
    chat_id: ChatId,
    msg_id: MessageId,
    text: &str,
    markup: Option<InlineKeyboardMarkup>,
) -> bool {
    const NOT_MODIFIED: &str = "message is not modified";
    const NOT_FOUND: &str = "message to edit not found";

    let text = fit(text);
    let result = retry_transport_operation(|| async {
        let mut req = bot
            .edit_message_text(chat_id, msg_id, text.clone())
            .parse_mode(ParseMode::Html);
        if let Some(markup) = markup.clone() {
            req = req.reply_markup(markup);
        }
        match req.await {
            Ok(_) => Ok(true),
            Err(e) if e.to_string().contains(NOT_MODIFIED) => Ok(true),
            Err(e) if e.to_string().contains(NOT_FOUND) => Ok(false),
            Err(e) => Err(anyhow::anyhow!("Telegram edit error: {e}")),
        }
    })
    .await;

    match result {
        Ok(true) => true,
        Ok(false) => {
            debug!(message_id = msg_id.0, "Message to edit is gone");
            false
        }
        Err(e) => {
            warn!(error = %e, "Failed to edit message after retries");
            false
        }
    }
}
