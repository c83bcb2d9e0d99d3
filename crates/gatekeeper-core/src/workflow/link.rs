use chrono::Utc;
use tracing::{error, info, warn};

use super::{Button, Reply, Step, WorkflowContext, ACCESS_DENIED, GENERIC_FAILURE, STALE_MENU};
use crate::callback::CallbackAction;
use crate::gateway::InviteLinkSpec;
use crate::records::{encode_bool, encode_time, InviteLink, Table};
use crate::utils::escape_html;

/// State of an invite link creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// Waiting for a channel
    SelectingChannel,
    /// Waiting for the approval mode
    SelectingApprovalMode {
        /// Chosen channel
        channel_id: i64,
    },
    /// Waiting for the link name as free text
    AwaitingName {
        /// Chosen channel
        channel_id: i64,
        /// Whether joining requires approval
        approval_required: bool,
    },
    /// Link created and stored
    Completed,
}

impl LinkState {
    /// Whether the conversation is over
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Guides an administrator through creating a named invite link.
#[derive(Clone)]
pub struct LinkWorkflow {
    ctx: WorkflowContext,
}

impl LinkWorkflow {
    /// Creates the workflow.
    #[must_use]
    pub const fn new(ctx: WorkflowContext) -> Self {
        Self { ctx }
    }

    /// Entry point. Non-administrators are turned away without a state.
    pub async fn start(&self, actor: i64) -> Step<LinkState> {
        if !self.ctx.access.is_admin(actor) {
            info!(user_id = actor, "Denied link creation");
            return Step::stay(Reply::text(ACCESS_DENIED));
        }
        Step::to(LinkState::SelectingChannel, self.channel_prompt().await)
    }

    async fn channel_prompt(&self) -> Reply {
        let rows = self.ctx.channel_buttons(CallbackAction::LinkChannel).await;
        Reply::inline("📢 Choose the channel for the new invite link:", rows)
    }

    fn approval_prompt(title: &str) -> Reply {
        Reply::inline(
            format!(
                "Channel: <b>{}</b>\n\nShould joining through the link require approval?",
                escape_html(title)
            ),
            vec![
                vec![
                    Button::new("✅ With approval", CallbackAction::LinkApproval(true)),
                    Button::new("🚪 Without approval", CallbackAction::LinkApproval(false)),
                ],
                vec![Button::new("⬅️ Back", CallbackAction::LinkBack)],
            ],
        )
    }

    fn name_prompt() -> Reply {
        Reply::text("✏️ Send a name for the invite link:")
    }

    /// A channel was chosen.
    pub async fn select_channel(&self, state: &LinkState, channel_id: i64) -> Step<LinkState> {
        if *state != LinkState::SelectingChannel {
            return Step::stay(Reply::text(STALE_MENU));
        }
        if !self.ctx.access.manages(channel_id) {
            warn!(channel_id, "Link creation requested for an unmanaged channel");
            return Step::stay(Reply::text(GENERIC_FAILURE));
        }
        if !self.ctx.ask_approval_mode {
            return Step::to(
                LinkState::AwaitingName {
                    channel_id,
                    approval_required: false,
                },
                Self::name_prompt(),
            );
        }
        let title = self.ctx.channel_title(channel_id).await;
        Step::to(
            LinkState::SelectingApprovalMode { channel_id },
            Self::approval_prompt(&title),
        )
    }

    /// The approval mode was chosen.
    #[must_use]
    pub fn select_approval(&self, state: &LinkState, approval_required: bool) -> Step<LinkState> {
        let LinkState::SelectingApprovalMode { channel_id } = *state else {
            return Step::stay(Reply::text(STALE_MENU));
        };
        Step::to(
            LinkState::AwaitingName {
                channel_id,
                approval_required,
            },
            Self::name_prompt(),
        )
    }

    /// Back to channel selection, dropping the chosen channel.
    pub async fn back(&self, state: &LinkState) -> Step<LinkState> {
        match state {
            LinkState::SelectingApprovalMode { .. } | LinkState::AwaitingName { .. } => {
                Step::to(LinkState::SelectingChannel, self.channel_prompt().await)
            }
            LinkState::SelectingChannel | LinkState::Completed => {
                Step::stay(Reply::text(STALE_MENU))
            }
        }
    }

    /// The link name arrived. Creates the link and records it.
    ///
    /// Any failure keeps the current state so the administrator can retry.
    pub async fn submit_name(&self, actor: i64, state: &LinkState, text: &str) -> Step<LinkState> {
        let LinkState::AwaitingName {
            channel_id,
            approval_required,
        } = *state
        else {
            return Step::stay(Reply::text(STALE_MENU));
        };

        let name = text.trim();
        if name.is_empty() {
            return Step::stay(Reply::text("⚠️ The name cannot be empty. Send a name for the link:"));
        }

        let title = self.ctx.channel_title(channel_id).await;
        let now = Utc::now();
        let spec = InviteLinkSpec {
            channel_id,
            name: name.to_string(),
            expire_date: now + self.ctx.invite_link_ttl,
            creates_join_request: approval_required,
        };
        let expire_date = spec.expire_date;
        let created = match self.ctx.gateway.create_invite_link(spec).await {
            Ok(created) => created,
            Err(e) => {
                error!(channel_id, error = %e, "Failed to create invite link");
                return Step::stay(Reply::text("❌ Could not create the invite link. Please try again."));
            }
        };

        let record = InviteLink {
            name: name.to_string(),
            link: created.link,
            creator_id: created.creator_id.or(Some(actor)),
            channel_name: title,
            created_at: now,
            is_revoked: false,
            channel_id: Some(channel_id),
        };
        if let Err(e) = self.ctx.store.append_row(&record).await {
            error!(channel_id, link = %record.link, error = %e, "Failed to store invite link");
            return Step::stay(Reply::text(GENERIC_FAILURE));
        }
        info!(user_id = actor, channel_id, name = %record.name, "Created invite link");

        let approval = if approval_required { "required" } else { "not required" };
        Step::to(
            LinkState::Completed,
            Reply::main_menu(format!(
                "✅ Invite link created\n\n\
                 <b>Channel:</b> {}\n\
                 <b>Name:</b> {}\n\
                 <b>Link:</b> {}\n\
                 <b>Approval:</b> {approval}\n\
                 <b>Expires:</b> {} UTC",
                escape_html(&record.channel_name),
                escape_html(&record.name),
                escape_html(&record.link),
                encode_time(expire_date),
            )),
        )
    }

    /// Revokes a link and flips its `is_revoked` cell.
    pub async fn revoke(&self, actor: i64, raw_link: &str) -> Reply {
        if !self.ctx.access.is_admin(actor) {
            info!(user_id = actor, "Denied link revocation");
            return Reply::text(ACCESS_DENIED);
        }
        if raw_link.trim().is_empty() {
            return Reply::text("Usage: /revoke_link &lt;link&gt;");
        }

        let (row_ref, link) = match self.ctx.store.find_invite_link(raw_link).await {
            Ok(Some(found)) => found,
            Ok(None) => return Reply::text("🔍 This link is not in the table."),
            Err(e) => {
                error!(error = %e, "Failed to look up invite link");
                return Reply::text(GENERIC_FAILURE);
            }
        };
        if link.is_revoked {
            return Reply::text("ℹ️ This link is already revoked.");
        }
        let Some(channel_id) = link.channel_id else {
            warn!(link = %link.link, "Invite link row has no channel id");
            return Reply::text(GENERIC_FAILURE);
        };

        if let Err(e) = self.ctx.gateway.revoke_invite_link(channel_id, &link.link).await {
            error!(channel_id, error = %e, "Failed to revoke invite link");
            return Reply::text("❌ Could not revoke the link. Please try again.");
        }
        if let Err(e) = self
            .ctx
            .store
            .update_cell(Table::InviteLinks.title(), row_ref, "is_revoked", &encode_bool(true))
            .await
        {
            error!(error = %e, "Link revoked but the table was not updated");
            return Reply::text(GENERIC_FAILURE);
        }
        info!(user_id = actor, channel_id, name = %link.name, "Revoked invite link");
        Reply::text(format!("🚫 Link <b>{}</b> revoked.", escape_html(&link.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{CreatedInviteLink, GatewayError, MockChannelGateway};
    use crate::records::Table;
    use crate::testing::{context, gateway_with_titles, test_store, ADMIN, CHANNEL, OUTSIDER};
    use std::sync::Arc;

    fn awaiting(approval_required: bool) -> LinkState {
        LinkState::AwaitingName {
            channel_id: CHANNEL,
            approval_required,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_creates_and_stores_link() {
        let (backend, store) = test_store();
        let mut gateway = gateway_with_titles();
        gateway
            .expect_create_invite_link()
            .withf(|spec| spec.name == "spring" && spec.creates_join_request && spec.channel_id == CHANNEL)
            .times(1)
            .returning(|_| {
                Ok(CreatedInviteLink {
                    link: "https://t.me/+abc".into(),
                    creator_id: Some(ADMIN),
                })
            });
        let flow = LinkWorkflow::new(context(store, gateway));

        let step = flow.start(ADMIN).await;
        let state = step.next.unwrap_or(LinkState::Completed);
        assert_eq!(state, LinkState::SelectingChannel);

        let step = flow.select_channel(&state, CHANNEL).await;
        let state = step.next.unwrap_or(LinkState::Completed);
        assert_eq!(state, LinkState::SelectingApprovalMode { channel_id: CHANNEL });

        let step = flow.select_approval(&state, true);
        let state = step.next.unwrap_or(LinkState::Completed);
        assert_eq!(state, awaiting(true));

        let step = flow.submit_name(ADMIN, &state, "  spring ").await;
        assert_eq!(step.next, Some(LinkState::Completed));
        assert!(step.reply.text.contains("https://t.me/+abc"));

        let rows = backend.rows(Table::InviteLinks.title()).await.unwrap_or_default();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][0], "spring");
        assert_eq!(rows[1][1], "https://t.me/+abc");
        assert_eq!(rows[1][3], "News");
        assert_eq!(rows[1][5], "❌");
        assert_eq!(rows[1][6], CHANNEL.to_string());
    }

    #[tokio::test]
    async fn empty_name_reprompts() {
        let (backend, store) = test_store();
        let flow = LinkWorkflow::new(context(store, MockChannelGateway::new()));
        let step = flow.submit_name(ADMIN, &awaiting(false), "   ").await;
        assert_eq!(step.next, None);
        assert!(step.reply.text.contains("cannot be empty"));
        assert_eq!(backend.call_count().await, 0);
    }

    #[tokio::test]
    async fn non_admin_is_denied_without_state() {
        let (backend, store) = test_store();
        let flow = LinkWorkflow::new(context(store, MockChannelGateway::new()));
        let step = flow.start(OUTSIDER).await;
        assert_eq!(step.next, None);
        assert_eq!(step.reply.text, ACCESS_DENIED);
        assert_eq!(backend.call_count().await, 0);
    }

    #[tokio::test]
    async fn back_returns_to_channel_selection() {
        let (_, store) = test_store();
        let flow = LinkWorkflow::new(context(store, gateway_with_titles()));
        let step = flow
            .back(&LinkState::SelectingApprovalMode { channel_id: CHANNEL })
            .await;
        assert_eq!(step.next, Some(LinkState::SelectingChannel));
    }

    #[tokio::test]
    async fn stale_callbacks_keep_state() {
        let (_, store) = test_store();
        let flow = LinkWorkflow::new(context(store, gateway_with_titles()));
        let step = flow.select_approval(&LinkState::SelectingChannel, true);
        assert_eq!(step.next, None);
        let step = flow.select_channel(&awaiting(true), CHANNEL).await;
        assert_eq!(step.next, None);
    }

    #[tokio::test]
    async fn unmanaged_channel_is_rejected() {
        let (_, store) = test_store();
        let flow = LinkWorkflow::new(context(store, gateway_with_titles()));
        let step = flow.select_channel(&LinkState::SelectingChannel, 999).await;
        assert_eq!(step.next, None);
    }

    #[tokio::test]
    async fn creation_failure_keeps_awaiting_name() {
        let (backend, store) = test_store();
        let mut gateway = gateway_with_titles();
        gateway
            .expect_create_invite_link()
            .returning(|_| Err(GatewayError::Request("timeout".into())));
        let flow = LinkWorkflow::new(context(store, gateway));
        let step = flow.submit_name(ADMIN, &awaiting(false), "spring").await;
        assert_eq!(step.next, None);
        assert!(backend.rows(Table::InviteLinks.title()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn revoke_flips_flag() {
        let (backend, store) = test_store();
        let store = Arc::new(store);
        let record = InviteLink {
            name: "spring".into(),
            link: "https://t.me/+abc".into(),
            creator_id: Some(ADMIN),
            channel_name: "News".into(),
            created_at: Utc::now(),
            is_revoked: false,
            channel_id: Some(CHANNEL),
        };
        assert!(store.append_row(&record).await.is_ok());

        let mut gateway = MockChannelGateway::new();
        gateway
            .expect_revoke_invite_link()
            .withf(|channel, link| *channel == CHANNEL && link == "https://t.me/+abc")
            .times(1)
            .returning(|_, _| Ok(()));
        let flow = LinkWorkflow::new(crate::testing::context_shared(store, gateway));
        let reply = flow.revoke(ADMIN, "+abc").await;
        assert!(reply.text.contains("revoked"));
        let rows = backend.rows(Table::InviteLinks.title()).await.unwrap_or_default();
        assert_eq!(rows[1][5], encode_bool(true));

        let stored = flow.ctx.store.find_invite_link("+abc").await;
        assert!(matches!(stored, Ok(Some((_, ref link))) if link.is_revoked));
        let again = flow.revoke(ADMIN, "+abc").await;
        assert!(again.text.contains("already revoked"));
    }
}
