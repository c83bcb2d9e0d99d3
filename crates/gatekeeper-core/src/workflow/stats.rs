use tracing::{error, info, warn};

use super::{Button, Reply, Step, WorkflowContext, ACCESS_DENIED, GENERIC_FAILURE, STALE_MENU};
use crate::callback::CallbackAction;
use crate::utils::{escape_html, truncate_str};

/// Longest link name shown on a button
const BUTTON_LABEL_CHARS: usize = 40;

/// State of a statistics browse
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsState {
    /// Waiting for a channel
    SelectingChannel,
    /// Waiting for a link of the chosen channel
    SelectingLink {
        /// Chosen channel
        channel_id: i64,
        /// Channel title
        channel_name: String,
        /// Link names, addressed by index from callbacks
        links: Vec<String>,
    },
}

/// Lists the subscribers who joined through each invite link.
#[derive(Clone)]
pub struct StatsWorkflow {
    ctx: WorkflowContext,
}

impl StatsWorkflow {
    /// Creates the workflow.
    #[must_use]
    pub const fn new(ctx: WorkflowContext) -> Self {
        Self { ctx }
    }

    /// Entry point. Non-administrators are turned away without a state.
    pub async fn start(&self, actor: i64) -> Step<StatsState> {
        if !self.ctx.access.is_admin(actor) {
            info!(user_id = actor, "Denied statistics");
            return Step::stay(Reply::text(ACCESS_DENIED));
        }
        Step::to(StatsState::SelectingChannel, self.channel_prompt().await)
    }

    async fn channel_prompt(&self) -> Reply {
        let mut rows = self.ctx.channel_buttons(CallbackAction::StatsChannel).await;
        rows.push(vec![Button::new("✖️ Close", CallbackAction::StatsClose)]);
        Reply::inline("📊 Choose a channel:", rows)
    }

    /// A channel was chosen: lists its invite links.
    pub async fn select_channel(&self, state: &StatsState, channel_id: i64) -> Step<StatsState> {
        if *state != StatsState::SelectingChannel {
            return Step::stay(Reply::text(STALE_MENU));
        }
        if !self.ctx.access.manages(channel_id) {
            warn!(channel_id, "Statistics requested for an unmanaged channel");
            return Step::stay(Reply::text(GENERIC_FAILURE));
        }
        let channel_name = self.ctx.channel_title(channel_id).await;
        let links = match self
            .ctx
            .store
            .invite_links_for_channel(channel_id, &channel_name)
            .await
        {
            Ok(links) => links,
            Err(e) => {
                error!(channel_id, error = %e, "Failed to load invite links");
                return Step::stay(Reply::text(GENERIC_FAILURE));
            }
        };
        let back = vec![Button::new("⬅️ Back", CallbackAction::StatsBack)];
        if links.is_empty() {
            return Step::stay(Reply::inline(
                format!("No invite links for <b>{}</b> yet.", escape_html(&channel_name)),
                vec![back],
            ));
        }

        let names: Vec<String> = links.into_iter().map(|l| l.name).collect();
        let mut rows: Vec<Vec<Button>> = names
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                vec![Button::new(
                    truncate_str(name, BUTTON_LABEL_CHARS),
                    CallbackAction::StatsLink(idx),
                )]
            })
            .collect();
        rows.push(back);
        let reply = Reply::inline(
            format!("🔗 Invite links of <b>{}</b>:", escape_html(&channel_name)),
            rows,
        );
        Step::to(
            StatsState::SelectingLink {
                channel_id,
                channel_name,
                links: names,
            },
            reply,
        )
    }

    /// A link was chosen: lists its subscribers. The state is kept so
    /// another link can be picked.
    pub async fn select_link(&self, state: &StatsState, index: usize) -> Step<StatsState> {
        let StatsState::SelectingLink { links, .. } = state else {
            return Step::stay(Reply::text(STALE_MENU));
        };
        let Some(name) = links.get(index) else {
            warn!(index, "Statistics link index out of range");
            return Step::stay(Reply::text(STALE_MENU));
        };
        let subscribers = match self.ctx.store.subscribers_for_link(name).await {
            Ok(subscribers) => subscribers,
            Err(e) => {
                error!(link = %name, error = %e, "Failed to load subscribers");
                return Step::stay(Reply::text(GENERIC_FAILURE));
            }
        };

        let mut text = format!(
            "👥 Subscribers via <b>{}</b>: {}\n",
            escape_html(name),
            subscribers.len()
        );
        for subscriber in &subscribers {
            text.push('\n');
            text.push_str(&escape_html(&subscriber.handle()));
        }
        if subscribers.is_empty() {
            text.push_str("\nNobody has joined through this link yet.");
        }
        Step::stay(Reply::text(text))
    }

    /// Back to channel selection.
    pub async fn back(&self) -> Step<StatsState> {
        Step::to(StatsState::SelectingChannel, self.channel_prompt().await)
    }

    /// Closes the menu. The caller ends the session.
    #[must_use]
    pub fn close(&self) -> Reply {
        Reply::main_menu("Statistics closed.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{InviteLink, Subscriber, SubscriberStatus, UserProfile};
    use crate::testing::{context_shared, gateway_with_titles, test_store, ADMIN, CHANNEL};
    use chrono::Utc;
    use std::sync::Arc;

    fn link(name: &str, channel_id: Option<i64>, channel_name: &str) -> InviteLink {
        InviteLink {
            name: name.into(),
            link: format!("https://t.me/+{name}"),
            creator_id: Some(ADMIN),
            channel_name: channel_name.into(),
            created_at: Utc::now(),
            is_revoked: false,
            channel_id,
        }
    }

    fn subscriber(id: i64, username: Option<&str>, link_name: &str) -> Subscriber {
        let user = UserProfile {
            id,
            full_name: "Someone".into(),
            username: username.map(str::to_string),
            ..UserProfile::default()
        };
        let mut sub = Subscriber::new(&user, SubscriberStatus::Active, Utc::now());
        sub.link_name = Some(link_name.into());
        sub
    }

    #[tokio::test(start_paused = true)]
    async fn browses_links_and_subscribers() {
        let (_, store) = test_store();
        let store = Arc::new(store);
        for l in [
            link("spring", Some(CHANNEL), "News"),
            link("other", Some(-200), "Other"),
            link("legacy", None, "News"),
        ] {
            assert!(store.append_row(&l).await.is_ok());
        }
        for s in [
            subscriber(1, Some("ada"), "spring"),
            subscriber(2, None, "spring"),
            subscriber(3, Some("bob"), "legacy"),
        ] {
            assert!(store.append_row(&s).await.is_ok());
        }
        let flow = StatsWorkflow::new(context_shared(store, gateway_with_titles()));

        let step = flow.start(ADMIN).await;
        assert_eq!(step.next, Some(StatsState::SelectingChannel));

        let step = flow.select_channel(&StatsState::SelectingChannel, CHANNEL).await;
        let Some(state) = step.next else {
            panic!("expected SelectingLink");
        };
        assert!(matches!(&state, StatsState::SelectingLink { links, .. } if links == &["spring", "legacy"]));

        let step = flow.select_link(&state, 0).await;
        assert_eq!(step.next, None);
        assert!(step.reply.text.contains("@ada"));
        assert!(step.reply.text.contains("ID: 2"));
        assert!(!step.reply.text.contains("@bob"));
    }

    #[tokio::test]
    async fn out_of_range_index_is_stale() {
        let (_, store) = test_store();
        let flow = StatsWorkflow::new(crate::testing::context(store, gateway_with_titles()));
        let state = StatsState::SelectingLink {
            channel_id: CHANNEL,
            channel_name: "News".into(),
            links: vec!["spring".into()],
        };
        let step = flow.select_link(&state, 5).await;
        assert_eq!(step.reply.text, STALE_MENU);
    }
}
