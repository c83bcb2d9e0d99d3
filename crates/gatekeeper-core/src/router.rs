//! Routes inbound events to the workflow owning the session.
//!
//! The session state is a single [`Conversation`]; starting a workflow
//! replaces whatever was in progress. The router is pure with respect to
//! session storage: it takes the current state and returns the next one.

use tracing::{info, warn};

use crate::callback::CallbackAction;
use crate::utils::escape_html;
use crate::workflow::{
    LinkState, LinkWorkflow, Reply, RequestState, RequestWorkflow, StatsState, StatsWorkflow, Step,
    WorkflowContext, ACCESS_DENIED, GENERIC_FAILURE, STALE_MENU,
};

/// Main menu button labels
pub mod buttons {
    /// Starts link creation
    pub const CREATE_LINK: &str = "🔗 Create link";
    /// Starts request management
    pub const MANAGE_REQUESTS: &str = "📥 Join requests";
    /// Starts statistics
    pub const STATISTICS: &str = "📊 Statistics";
    /// Shows the spreadsheet URL
    pub const OPEN_SHEET: &str = "📄 Open spreadsheet";
}

/// Per-session conversation state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Conversation {
    /// No workflow in progress
    #[default]
    Idle,
    /// Creating an invite link
    Link(LinkState),
    /// Reviewing join requests
    Requests(RequestState),
    /// Browsing statistics
    Stats(StatsState),
}

/// Commands, typed or tapped on the main menu
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Show the main menu
    Start,
    /// Create an invite link
    CreateLink,
    /// Review join requests
    ManageRequests,
    /// Browse link statistics
    Statistics,
    /// Revoke the given invite link
    RevokeLink(String),
    /// Show the spreadsheet URL
    OpenSheet,
    /// Abandon the current workflow
    Cancel,
}

impl Command {
    /// Command bound to a main menu button label
    #[must_use]
    pub fn from_button(label: &str) -> Option<Self> {
        match label.trim() {
            buttons::CREATE_LINK => Some(Self::CreateLink),
            buttons::MANAGE_REQUESTS => Some(Self::ManageRequests),
            buttons::STATISTICS => Some(Self::Statistics),
            buttons::OPEN_SHEET => Some(Self::OpenSheet),
            _ => None,
        }
    }
}

/// An inbound event addressed to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A command
    Command(Command),
    /// Free text
    Text(String),
    /// An inline button payload
    Callback(String),
}

/// Result of routing one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// State to store for the session
    pub conversation: Conversation,
    /// Replies to show, in order
    pub replies: Vec<Reply>,
}

impl Outcome {
    fn keep(current: &Conversation, reply: Reply) -> Self {
        Self {
            conversation: current.clone(),
            replies: vec![reply],
        }
    }

    fn idle(reply: Reply) -> Self {
        Self {
            conversation: Conversation::Idle,
            replies: vec![reply],
        }
    }
}

fn apply<S>(
    current: &Conversation,
    step: Step<S>,
    wrap: fn(S) -> Conversation,
    is_terminal: fn(&S) -> bool,
) -> Outcome {
    let conversation = match step.next {
        None => current.clone(),
        Some(state) if is_terminal(&state) => Conversation::Idle,
        Some(state) => wrap(state),
    };
    Outcome {
        conversation,
        replies: vec![step.reply],
    }
}

const fn never_terminal(_: &StatsState) -> bool {
    false
}

/// Dispatches inbound events to the workflows.
#[derive(Clone)]
pub struct ConversationRouter {
    ctx: WorkflowContext,
    link: LinkWorkflow,
    requests: RequestWorkflow,
    stats: StatsWorkflow,
    spreadsheet_url: String,
}

impl ConversationRouter {
    /// Creates a router over the workflows sharing `ctx`.
    #[must_use]
    pub fn new(ctx: WorkflowContext, spreadsheet_url: impl Into<String>) -> Self {
        Self {
            link: LinkWorkflow::new(ctx.clone()),
            requests: RequestWorkflow::new(ctx.clone()),
            stats: StatsWorkflow::new(ctx.clone()),
            ctx,
            spreadsheet_url: spreadsheet_url.into(),
        }
    }

    /// Whether `actor` may use the bot
    #[must_use]
    pub fn is_admin(&self, actor: i64) -> bool {
        self.ctx.access.is_admin(actor)
    }

    /// Handles one event of `actor` given the session's current state.
    pub async fn handle(&self, actor: i64, current: &Conversation, inbound: Inbound) -> Outcome {
        if !self.is_admin(actor) {
            info!(user_id = actor, "Rejected event from a non-administrator");
            return Outcome::keep(current, Reply::text(ACCESS_DENIED));
        }
        match inbound {
            Inbound::Command(command) => self.on_command(actor, current, command).await,
            Inbound::Text(text) => self.on_text(actor, current, &text).await,
            Inbound::Callback(payload) => self.on_callback(actor, current, &payload).await,
        }
    }

    async fn on_command(&self, actor: i64, current: &Conversation, command: Command) -> Outcome {
        match command {
            Command::Start => Outcome::idle(Reply::main_menu(
                "👋 Welcome! Choose an action from the menu below.",
            )),
            Command::Cancel => Outcome::idle(Reply::main_menu("Cancelled.")),
            Command::OpenSheet => Outcome::keep(
                current,
                Reply::text(format!(
                    "📄 Spreadsheet: {}",
                    escape_html(&self.spreadsheet_url)
                )),
            ),
            Command::RevokeLink(link) => Outcome::keep(current, self.link.revoke(actor, &link).await),
            Command::CreateLink => apply(
                &Conversation::Idle,
                self.link.start(actor).await,
                Conversation::Link,
                LinkState::is_terminal,
            ),
            Command::ManageRequests => apply(
                &Conversation::Idle,
                self.requests.start(actor).await,
                Conversation::Requests,
                RequestState::is_terminal,
            ),
            Command::Statistics => apply(
                &Conversation::Idle,
                self.stats.start(actor).await,
                Conversation::Stats,
                never_terminal,
            ),
        }
    }

    async fn on_text(&self, actor: i64, current: &Conversation, text: &str) -> Outcome {
        if let Some(command) = Command::from_button(text) {
            return self.on_command(actor, current, command).await;
        }
        match current {
            Conversation::Link(state @ LinkState::AwaitingName { .. }) => apply(
                current,
                self.link.submit_name(actor, state, text).await,
                Conversation::Link,
                LinkState::is_terminal,
            ),
            Conversation::Idle => Outcome::keep(
                current,
                Reply::main_menu("Choose an action from the menu below."),
            ),
            _ => Outcome::keep(current, Reply::text("Please use the buttons above.")),
        }
    }

    async fn on_callback(&self, actor: i64, current: &Conversation, payload: &str) -> Outcome {
        let action: CallbackAction = match payload.parse() {
            Ok(action) => action,
            Err(e) => {
                warn!(user_id = actor, error = %e, "Undecodable callback");
                return Outcome::keep(current, Reply::text(GENERIC_FAILURE));
            }
        };

        match (action, current) {
            (CallbackAction::LinkChannel(id), Conversation::Link(state)) => apply(
                current,
                self.link.select_channel(state, id).await,
                Conversation::Link,
                LinkState::is_terminal,
            ),
            (CallbackAction::LinkApproval(required), Conversation::Link(state)) => apply(
                current,
                self.link.select_approval(state, required),
                Conversation::Link,
                LinkState::is_terminal,
            ),
            (CallbackAction::LinkBack, Conversation::Link(state)) => apply(
                current,
                self.link.back(state).await,
                Conversation::Link,
                LinkState::is_terminal,
            ),
            (CallbackAction::RequestsChannel(id), Conversation::Requests(state)) => apply(
                current,
                self.requests.select_channel(state, id).await,
                Conversation::Requests,
                RequestState::is_terminal,
            ),
            (CallbackAction::AcceptAll, Conversation::Requests(state)) => apply(
                current,
                self.requests.accept_all(actor, state).await,
                Conversation::Requests,
                RequestState::is_terminal,
            ),
            (CallbackAction::DeclineAll, Conversation::Requests(state)) => apply(
                current,
                self.requests.decline_all(actor, state).await,
                Conversation::Requests,
                RequestState::is_terminal,
            ),
            (CallbackAction::RequestsBack, Conversation::Requests(_)) => apply(
                current,
                self.requests.back().await,
                Conversation::Requests,
                RequestState::is_terminal,
            ),
            (CallbackAction::StatsChannel(id), Conversation::Stats(state)) => apply(
                current,
                self.stats.select_channel(state, id).await,
                Conversation::Stats,
                never_terminal,
            ),
            (CallbackAction::StatsLink(idx), Conversation::Stats(state)) => apply(
                current,
                self.stats.select_link(state, idx).await,
                Conversation::Stats,
                never_terminal,
            ),
            (CallbackAction::StatsBack, Conversation::Stats(_)) => apply(
                current,
                self.stats.back().await,
                Conversation::Stats,
                never_terminal,
            ),
            (CallbackAction::StatsClose, Conversation::Stats(_)) => Outcome::idle(self.stats.close()),
            (action, _) => {
                info!(user_id = actor, %action, "Callback does not match the session");
                Outcome::keep(current, Reply::text(STALE_MENU))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{CreatedInviteLink, MockChannelGateway};
    use crate::sheets::backend::MockSheetBackend;
    use crate::sheets::{RateLimiter, RetryPolicy, SheetStore};
    use crate::testing::{context, gateway_with_titles, test_store, ADMIN, CHANNEL, OUTSIDER};
    use crate::workflow::{AccessPolicy, Markup};
    use std::sync::Arc;
    use std::time::Duration;

    fn router_with(gateway: MockChannelGateway) -> ConversationRouter {
        let (_, store) = test_store();
        ConversationRouter::new(context(store, gateway), "https://docs.google.com/spreadsheets/d/x")
    }

    #[tokio::test]
    async fn non_admin_gets_denial_and_no_backend_calls() {
        // A mock without expectations panics on any call.
        let store = SheetStore::new(
            Arc::new(MockSheetBackend::new()),
            RateLimiter::new(Duration::ZERO),
            RetryPolicy::default(),
        );
        let ctx = WorkflowContext::new(
            Arc::new(store),
            Arc::new(MockChannelGateway::new()),
            Arc::new(AccessPolicy::new([ADMIN], vec![CHANNEL])),
        );
        let router = ConversationRouter::new(ctx, "url");
        for inbound in [
            Inbound::Command(Command::CreateLink),
            Inbound::Command(Command::RevokeLink("+abc".into())),
            Inbound::Text("spring".into()),
            Inbound::Callback("req_accept_all".into()),
        ] {
            let out = router.handle(OUTSIDER, &Conversation::Idle, inbound).await;
            assert_eq!(out.conversation, Conversation::Idle);
            assert_eq!(out.replies[0].text, ACCESS_DENIED);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn link_flow_clears_session_on_completion() {
        let mut gateway = gateway_with_titles();
        gateway.expect_create_invite_link().returning(|_| {
            Ok(CreatedInviteLink {
                link: "https://t.me/+xyz".into(),
                creator_id: None,
            })
        });
        let router = router_with(gateway);

        let out = router
            .handle(ADMIN, &Conversation::Idle, Inbound::Text(buttons::CREATE_LINK.into()))
            .await;
        assert_eq!(out.conversation, Conversation::Link(LinkState::SelectingChannel));
        assert!(matches!(out.replies[0].markup, Markup::Inline(_)));

        let out = router
            .handle(ADMIN, &out.conversation, Inbound::Callback(format!("link_channel:{CHANNEL}")))
            .await;
        let out = router
            .handle(ADMIN, &out.conversation, Inbound::Callback("link_approval:open".into()))
            .await;
        assert_eq!(
            out.conversation,
            Conversation::Link(LinkState::AwaitingName {
                channel_id: CHANNEL,
                approval_required: false
            })
        );

        let out = router
            .handle(ADMIN, &out.conversation, Inbound::Text("autumn".into()))
            .await;
        assert_eq!(out.conversation, Conversation::Idle);
        assert_eq!(out.replies[0].markup, Markup::MainMenu);
    }

    #[tokio::test]
    async fn new_command_replaces_running_workflow() {
        let router = router_with(gateway_with_titles());
        let current = Conversation::Link(LinkState::SelectingApprovalMode { channel_id: CHANNEL });
        let out = router
            .handle(ADMIN, &current, Inbound::Command(Command::ManageRequests))
            .await;
        assert_eq!(out.conversation, Conversation::Requests(RequestState::SelectingChannel));
    }

    #[tokio::test]
    async fn cancel_resets_session() {
        let router = router_with(MockChannelGateway::new());
        let current = Conversation::Requests(RequestState::SelectingChannel);
        let out = router.handle(ADMIN, &current, Inbound::Command(Command::Cancel)).await;
        assert_eq!(out.conversation, Conversation::Idle);
    }

    #[tokio::test]
    async fn mismatched_callback_keeps_state() {
        let router = router_with(MockChannelGateway::new());
        let current = Conversation::Stats(StatsState::SelectingChannel);
        let out = router
            .handle(ADMIN, &current, Inbound::Callback("req_accept_all".into()))
            .await;
        assert_eq!(out.conversation, current);
        assert_eq!(out.replies[0].text, STALE_MENU);
    }

    #[tokio::test]
    async fn malformed_callback_reports_generic_error() {
        let router = router_with(MockChannelGateway::new());
        let out = router
            .handle(ADMIN, &Conversation::Idle, Inbound::Callback("link_channel:x:y".into()))
            .await;
        assert_eq!(out.conversation, Conversation::Idle);
        assert_eq!(out.replies[0].text, GENERIC_FAILURE);
    }

    #[tokio::test]
    async fn stats_close_ends_session() {
        let router = router_with(MockChannelGateway::new());
        let current = Conversation::Stats(StatsState::SelectingChannel);
        let out = router
            .handle(ADMIN, &current, Inbound::Callback("stats_close".into()))
            .await;
        assert_eq!(out.conversation, Conversation::Idle);
    }

    #[tokio::test]
    async fn open_sheet_replies_with_url() {
        let router = router_with(MockChannelGateway::new());
        let out = router
            .handle(ADMIN, &Conversation::Idle, Inbound::Text(buttons::OPEN_SHEET.into()))
            .await;
        assert!(out.replies[0].text.contains("docs.google.com"));
    }
}
