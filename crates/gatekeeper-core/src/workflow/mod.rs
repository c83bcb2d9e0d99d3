//! Conversational workflows.
//!
//! A workflow is a set of transitions over its own state enum. Each
//! transition returns a [`Step`]: the next state, if any, and the reply to
//! show. Workflows never touch the session store; the router decides where
//! state lives.

use chrono::Duration;
use std::collections::HashSet;
use std::sync::Arc;

use crate::callback::CallbackAction;
use crate::config::CoreSettings;
use crate::gateway::{channel_title_or_id, ChannelGateway};
use crate::sheets::SheetStore;

/// Invite link creation
pub mod link;
/// Join request review
pub mod requests;
/// Per-link subscriber statistics
pub mod stats;

pub use link::{LinkState, LinkWorkflow};
pub use requests::{PendingRequest, RequestState, RequestWorkflow};
pub use stats::{StatsState, StatsWorkflow};

/// Who may administer the bot and which channels it manages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessPolicy {
    admins: HashSet<i64>,
    channels: Vec<i64>,
}

impl AccessPolicy {
    /// Creates a policy from admin ids and managed channel ids.
    #[must_use]
    pub fn new(admins: impl IntoIterator<Item = i64>, channels: Vec<i64>) -> Self {
        Self {
            admins: admins.into_iter().collect(),
            channels,
        }
    }

    /// Creates the policy described by the settings.
    #[must_use]
    pub fn from_settings(settings: &CoreSettings) -> Self {
        Self::new(settings.admin_ids(), settings.channel_ids())
    }

    /// Whether `user_id` is an administrator
    #[must_use]
    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admins.contains(&user_id)
    }

    /// Whether `channel_id` is managed by the bot
    #[must_use]
    pub fn manages(&self, channel_id: i64) -> bool {
        self.channels.contains(&channel_id)
    }

    /// Managed channels, in configuration order
    #[must_use]
    pub fn channels(&self) -> &[i64] {
        &self.channels
    }

    /// Administrators, sorted
    #[must_use]
    pub fn admins(&self) -> Vec<i64> {
        let mut admins: Vec<i64> = self.admins.iter().copied().collect();
        admins.sort_unstable();
        admins
    }
}

/// An inline button
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    /// Label shown to the user
    pub label: String,
    /// Action sent back when pressed
    pub action: CallbackAction,
}

impl Button {
    /// Creates a button.
    #[must_use]
    pub fn new(label: impl Into<String>, action: CallbackAction) -> Self {
        Self {
            label: label.into(),
            action,
        }
    }
}

/// Keyboard attached to a reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Markup {
    /// No keyboard change
    #[default]
    None,
    /// The persistent main menu
    MainMenu,
    /// Inline buttons, one inner vector per row
    Inline(Vec<Vec<Button>>),
}

/// A message to show the user, HTML-formatted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    /// Message text
    pub text: String,
    /// Attached keyboard
    pub markup: Markup,
}

impl Reply {
    /// A reply without keyboard.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            markup: Markup::None,
        }
    }

    /// A reply with inline buttons.
    #[must_use]
    pub fn inline(text: impl Into<String>, rows: Vec<Vec<Button>>) -> Self {
        Self {
            text: text.into(),
            markup: Markup::Inline(rows),
        }
    }

    /// A reply restoring the main menu.
    #[must_use]
    pub fn main_menu(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            markup: Markup::MainMenu,
        }
    }
}

/// Outcome of a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step<S> {
    /// New state; `None` keeps the current one
    pub next: Option<S>,
    /// What to show the user
    pub reply: Reply,
}

impl<S> Step<S> {
    /// Moves to `state`.
    #[must_use]
    pub const fn to(state: S, reply: Reply) -> Self {
        Self {
            next: Some(state),
            reply,
        }
    }

    /// Keeps the current state.
    #[must_use]
    pub const fn stay(reply: Reply) -> Self {
        Self { next: None, reply }
    }
}

pub(crate) const ACCESS_DENIED: &str = "⛔ You do not have access to this bot.";
pub(crate) const GENERIC_FAILURE: &str = "❌ Something went wrong. Please try again later.";
pub(crate) const STALE_MENU: &str = "⌛ This menu is no longer active. Start again from the main menu.";

/// Dependencies shared by every workflow
#[derive(Clone)]
pub struct WorkflowContext {
    /// Spreadsheet store
    pub store: Arc<SheetStore>,
    /// Chat platform
    pub gateway: Arc<dyn ChannelGateway>,
    /// Administrators and channels
    pub access: Arc<AccessPolicy>,
    /// Lifetime of created invite links
    pub invite_link_ttl: Duration,
    /// Whether link creation asks for the approval mode
    pub ask_approval_mode: bool,
}

impl WorkflowContext {
    /// Creates a context with the default link options.
    #[must_use]
    pub fn new(
        store: Arc<SheetStore>,
        gateway: Arc<dyn ChannelGateway>,
        access: Arc<AccessPolicy>,
    ) -> Self {
        Self {
            store,
            gateway,
            access,
            invite_link_ttl: Duration::days(14),
            ask_approval_mode: true,
        }
    }

    /// Applies the link options from settings.
    #[must_use]
    pub fn with_settings(mut self, settings: &CoreSettings) -> Self {
        self.invite_link_ttl = settings.invite_link_ttl();
        self.ask_approval_mode = settings.link_approval_step;
        self
    }

    /// Title of a channel, or its id when unavailable.
    pub async fn channel_title(&self, channel_id: i64) -> String {
        channel_title_or_id(self.gateway.as_ref(), channel_id).await
    }

    /// One button per managed channel.
    pub async fn channel_buttons(&self, action: fn(i64) -> CallbackAction) -> Vec<Vec<Button>> {
        let mut rows = Vec::with_capacity(self.access.channels().len());
        for &channel_id in self.access.channels() {
            let title = self.channel_title(channel_id).await;
            rows.push(vec![Button::new(title, action(channel_id))]);
        }
        rows
    }
}
