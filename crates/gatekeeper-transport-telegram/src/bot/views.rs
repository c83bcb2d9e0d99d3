//! Keyboards.
//!
//! Renders the transport-neutral [`Markup`] of a reply into Telegram
//! keyboards.

use gatekeeper_core::router::buttons;
use gatekeeper_core::workflow::{Button, Markup};
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, KeyboardButton, KeyboardMarkup, ReplyMarkup,
};

/// Main menu keyboard
#[must_use]
pub fn main_menu_keyboard() -> KeyboardMarkup {
    let keyboard = vec![
        vec![
            KeyboardButton::new(buttons::CREATE_LINK),
            KeyboardButton::new(buttons::MANAGE_REQUESTS),
        ],
        vec![
            KeyboardButton::new(buttons::STATISTICS),
            KeyboardButton::new(buttons::OPEN_SHEET),
        ],
    ];
    KeyboardMarkup::new(keyboard).resize_keyboard()
}

/// Inline keyboard with one row per button row
#[must_use]
pub fn inline_keyboard(rows: &[Vec<Button>]) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(rows.iter().map(|row| {
        row.iter()
            .map(|button| InlineKeyboardButton::callback(button.label.clone(), button.action.to_string()))
            .collect::<Vec<_>>()
    }))
}

/// Telegram markup for a reply, `None` when the keyboard stays as is.
#[must_use]
pub fn reply_markup(markup: &Markup) -> Option<ReplyMarkup> {
    match markup {
        Markup::None => None,
        Markup::MainMenu => Some(ReplyMarkup::Keyboard(main_menu_keyboard())),
        Markup::Inline(rows) => Some(ReplyMarkup::InlineKeyboard(inline_keyboard(rows))),
    }
}
