use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::{Button, Reply, Step, WorkflowContext, ACCESS_DENIED, GENERIC_FAILURE, STALE_MENU};
use crate::callback::CallbackAction;
use crate::records::{encode_bool, encode_time, JoinMethod, JoinRequest, SubscriberStatus, Table};
use crate::sheets::SheetRow;
use crate::utils::escape_html;

/// How many requesters are listed by name before the rest is summarized
const LISTED_REQUESTS: usize = 20;

/// A pending request as loaded when the channel was opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Requesting user
    pub user_id: i64,
    /// `@username` or `ID: id`
    pub handle: String,
    /// Display name
    pub full_name: String,
}

impl From<&JoinRequest> for PendingRequest {
    fn from(request: &JoinRequest) -> Self {
        Self {
            user_id: request.subscriber.id,
            handle: request.subscriber.handle(),
            full_name: request.subscriber.full_name.clone(),
        }
    }
}

/// State of a join request review
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting for a channel
    SelectingChannel,
    /// Reviewing the snapshot of a channel's pending requests
    ManagingRequests {
        /// Chosen channel
        channel_id: i64,
        /// Channel title
        channel_name: String,
        /// Requests pending when the channel was opened
        requests: Vec<PendingRequest>,
        /// Users approved on Telegram whose rows may still need syncing
        approved: Vec<i64>,
        /// Users declined on Telegram whose rows may still need syncing
        declined: Vec<i64>,
    },
    /// Bulk decision applied
    Completed,
}

impl RequestState {
    /// Whether the conversation is over
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

#[derive(Debug, Clone, Copy)]
enum Decision {
    Approve,
    Decline,
}

/// Bulk review of pending join requests, kept in sync with the tables.
#[derive(Clone)]
pub struct RequestWorkflow {
    ctx: WorkflowContext,
}

impl RequestWorkflow {
    /// Creates the workflow.
    #[must_use]
    pub const fn new(ctx: WorkflowContext) -> Self {
        Self { ctx }
    }

    /// Entry point. Non-administrators are turned away without a state.
    pub async fn start(&self, actor: i64) -> Step<RequestState> {
        if !self.ctx.access.is_admin(actor) {
            info!(user_id = actor, "Denied request management");
            return Step::stay(Reply::text(ACCESS_DENIED));
        }
        Step::to(RequestState::SelectingChannel, self.channel_prompt().await)
    }

    async fn channel_prompt(&self) -> Reply {
        let rows = self.ctx.channel_buttons(CallbackAction::RequestsChannel).await;
        Reply::inline("📥 Choose a channel to review join requests:", rows)
    }

    /// A channel was chosen: loads its pending requests.
    pub async fn select_channel(&self, state: &RequestState, channel_id: i64) -> Step<RequestState> {
        if *state != RequestState::SelectingChannel {
            return Step::stay(Reply::text(STALE_MENU));
        }
        if !self.ctx.access.manages(channel_id) {
            warn!(channel_id, "Request review opened for an unmanaged channel");
            return Step::stay(Reply::text(GENERIC_FAILURE));
        }

        let pending = match self.ctx.store.pending_requests(channel_id).await {
            Ok(pending) => pending,
            Err(e) => {
                error!(channel_id, error = %e, "Failed to load pending requests");
                return Step::stay(Reply::text(GENERIC_FAILURE));
            }
        };
        let channel_name = self.ctx.channel_title(channel_id).await;
        if pending.is_empty() {
            return Step::stay(Reply::inline(
                format!("📭 No pending requests for <b>{}</b>.", escape_html(&channel_name)),
                vec![vec![Button::new("⬅️ Back", CallbackAction::RequestsBack)]],
            ));
        }

        let requests: Vec<PendingRequest> = pending.iter().map(PendingRequest::from).collect();
        let reply = Self::review_prompt(&channel_name, &requests);
        Step::to(
            RequestState::ManagingRequests {
                channel_id,
                channel_name,
                requests,
                approved: Vec::new(),
                declined: Vec::new(),
            },
            reply,
        )
    }

    fn review_prompt(channel_name: &str, requests: &[PendingRequest]) -> Reply {
        let mut text = format!(
            "📥 <b>{}</b>: {} pending request(s)\n",
            escape_html(channel_name),
            requests.len()
        );
        for request in requests.iter().take(LISTED_REQUESTS) {
            text.push_str(&format!(
                "\n• {} ({})",
                escape_html(&request.full_name),
                escape_html(&request.handle)
            ));
        }
        if requests.len() > LISTED_REQUESTS {
            text.push_str(&format!("\n… and {} more", requests.len() - LISTED_REQUESTS));
        }
        Reply::inline(text, Self::review_buttons())
    }

    fn review_buttons() -> Vec<Vec<Button>> {
        vec![
            vec![
                Button::new("✅ Accept all", CallbackAction::AcceptAll),
                Button::new("❌ Decline all", CallbackAction::DeclineAll),
            ],
            vec![Button::new("⬅️ Back", CallbackAction::RequestsBack)],
        ]
    }

    /// Approves every request in the snapshot and moves the approved rows
    /// into the subscribers table.
    pub async fn accept_all(&self, actor: i64, state: &RequestState) -> Step<RequestState> {
        self.decide_all(actor, state, Decision::Approve).await
    }

    /// Declines every request in the snapshot and deletes the declined rows.
    pub async fn decline_all(&self, actor: i64, state: &RequestState) -> Step<RequestState> {
        self.decide_all(actor, state, Decision::Decline).await
    }

    /// Applies `decision` to every request not decided yet, then syncs the
    /// tables for everything decided so far. When the sync fails the review
    /// stays open with the decided users remembered, so pressing a button
    /// again only retries the sync for them.
    async fn decide_all(&self, actor: i64, state: &RequestState, decision: Decision) -> Step<RequestState> {
        let RequestState::ManagingRequests {
            channel_id,
            channel_name,
            requests,
            approved,
            declined,
        } = state
        else {
            return Step::stay(Reply::text(STALE_MENU));
        };
        let channel_id = *channel_id;
        let mut approved = approved.clone();
        let mut declined = declined.clone();

        for request in requests {
            let user_id = request.user_id;
            if approved.contains(&user_id) || declined.contains(&user_id) {
                debug!(channel_id, user_id, "Join request already decided");
                continue;
            }
            let result = match decision {
                Decision::Approve => self.ctx.gateway.approve_join_request(channel_id, user_id).await,
                Decision::Decline => self.ctx.gateway.decline_join_request(channel_id, user_id).await,
            };
            match (result, decision) {
                (Ok(()), Decision::Approve) => approved.push(user_id),
                (Ok(()), Decision::Decline) => declined.push(user_id),
                (Err(e), _) => warn!(
                    channel_id,
                    user_id,
                    ?decision,
                    error = %e,
                    "Join request decision failed"
                ),
            }
        }

        let (verb, handled) = match decision {
            Decision::Approve => ("Approved", approved.len()),
            Decision::Decline => ("Declined", declined.len()),
        };
        info!(
            user_id = actor,
            channel_id,
            ?decision,
            handled,
            total = requests.len(),
            "Applied join request decision"
        );
        let summary = format!(
            "{verb} {handled} of {} request(s) for <b>{}</b>.",
            requests.len(),
            escape_html(channel_name)
        );
        if approved.is_empty() && declined.is_empty() {
            return Step::to(RequestState::Completed, Reply::main_menu(summary));
        }

        if let Err(e) = self.sync_decided(channel_id, &approved, &declined).await {
            error!(channel_id, error = %e, "Failed to sync join request rows");
            return Step::to(
                RequestState::ManagingRequests {
                    channel_id,
                    channel_name: channel_name.clone(),
                    requests: requests.clone(),
                    approved,
                    declined,
                },
                Reply::inline(
                    format!("{summary}\n⚠️ The spreadsheet could not be updated. Press the button again to retry."),
                    Self::review_buttons(),
                ),
            );
        }
        Step::to(RequestState::Completed, Reply::main_menu(format!("✅ {summary}")))
    }

    async fn sync_decided(
        &self,
        channel_id: i64,
        approved: &[i64],
        declined: &[i64],
    ) -> Result<(), crate::sheets::StoreError> {
        if !approved.is_empty() {
            self.sync_tables(channel_id, approved, Decision::Approve).await?;
        }
        if !declined.is_empty() {
            self.sync_tables(channel_id, declined, Decision::Decline).await?;
        }
        Ok(())
    }

    /// Moves the decided request rows. Approved requesters are merged into
    /// their subscriber row by id, since the membership update for the same
    /// approval may already have recorded them.
    async fn sync_tables(
        &self,
        channel_id: i64,
        decided: &[i64],
        decision: Decision,
    ) -> Result<(), crate::sheets::StoreError> {
        let channel = channel_id.to_string();
        let matches = |row: &SheetRow| {
            row.get("channel_id").map(str::trim) == Some(channel.as_str())
                && row
                    .get("id")
                    .and_then(|id| id.trim().parse::<i64>().ok())
                    .is_some_and(|id| decided.contains(&id))
        };
        let source = Table::JoinRequests.title();
        let outcome = match decision {
            Decision::Approve => {
                self.ctx.store.ensure_schema(Table::Subscribers).await?;
                let now = encode_time(Utc::now());
                self.ctx
                    .store
                    .upsert_rows_with(source, Table::Subscribers.title(), "id", matches, |row| {
                        row.set("status", SubscriberStatus::Active.as_str());
                        row.set("via_join_request", encode_bool(true));
                        row.set("join_method", JoinMethod::JoinRequest.as_str());
                        row.set("join_date", now.clone());
                    })
                    .await?
            }
            Decision::Decline => self.ctx.store.move_rows(source, None, matches).await?,
        };
        if !outcome.failed_deletes.is_empty() {
            warn!(channel_id, rows = ?outcome.failed_deletes, "Some request rows were not removed");
        }
        Ok(())
    }

    /// Back to channel selection, discarding the snapshot.
    pub async fn back(&self) -> Step<RequestState> {
        Step::to(RequestState::SelectingChannel, self.channel_prompt().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayError, MockChannelGateway};
    use crate::records::{Subscriber, UserProfile};
    use crate::testing::{context_shared, gateway_with_titles, test_store, ADMIN, CHANNEL};
    use std::sync::Arc;

    fn request(id: i64, channel_id: i64) -> JoinRequest {
        let user = UserProfile {
            id,
            full_name: format!("User {id}"),
            ..UserProfile::default()
        };
        JoinRequest {
            subscriber: Subscriber::new(&user, SubscriberStatus::Pending, Utc::now()),
            channel_id,
            channel_name: "News".into(),
        }
    }

    async fn seeded_store(requests: &[JoinRequest]) -> (Arc<crate::sheets::memory::MemoryBackend>, Arc<crate::sheets::SheetStore>) {
        let (backend, store) = test_store();
        let store = Arc::new(store);
        for r in requests {
            assert!(store.append_row(r).await.is_ok());
        }
        (backend, store)
    }

    fn managing(ids: &[i64]) -> RequestState {
        RequestState::ManagingRequests {
            channel_id: CHANNEL,
            channel_name: "News".into(),
            requests: ids
                .iter()
                .map(|id| PendingRequest {
                    user_id: *id,
                    handle: format!("ID: {id}"),
                    full_name: format!("User {id}"),
                })
                .collect(),
            approved: Vec::new(),
            declined: Vec::new(),
        }
    }

    fn ids_in(rows: &[Vec<String>]) -> Vec<String> {
        rows.iter().skip(1).map(|r| r[0].clone()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn selecting_channel_snapshots_its_requests() {
        let (_, store) = seeded_store(&[request(1, CHANNEL), request(2, -200), request(3, CHANNEL)]).await;
        let flow = RequestWorkflow::new(context_shared(store, gateway_with_titles()));
        let step = flow.select_channel(&RequestState::SelectingChannel, CHANNEL).await;
        let Some(RequestState::ManagingRequests { requests, .. }) = step.next else {
            panic!("expected ManagingRequests, got {:?}", step.next);
        };
        let ids: Vec<i64> = requests.iter().map(|r| r.user_id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_channel_does_not_enter_review() {
        let (_, store) = seeded_store(&[request(2, -200)]).await;
        let flow = RequestWorkflow::new(context_shared(store, gateway_with_titles()));
        let step = flow.select_channel(&RequestState::SelectingChannel, CHANNEL).await;
        assert_eq!(step.next, None);
        assert!(step.reply.text.contains("No pending requests"));
    }

    #[tokio::test(start_paused = true)]
    async fn accept_all_moves_only_approved_rows() {
        let (backend, store) =
            seeded_store(&[request(1, CHANNEL), request(2, CHANNEL), request(3, CHANNEL)]).await;
        let mut gateway = MockChannelGateway::new();
        gateway
            .expect_approve_join_request()
            .times(3)
            .returning(|_, user| {
                if user == 2 {
                    Err(GatewayError::Rejected("USER_CHANNELS_TOO_MUCH".into()))
                } else {
                    Ok(())
                }
            });
        let flow = RequestWorkflow::new(context_shared(store, gateway));

        let step = flow.accept_all(ADMIN, &managing(&[1, 2, 3])).await;
        assert_eq!(step.next, Some(RequestState::Completed));
        assert!(step.reply.text.contains("Approved 2 of 3"));

        let pending = backend.rows(Table::JoinRequests.title()).await.unwrap_or_default();
        assert_eq!(ids_in(&pending), vec!["2"]);
        let subscribers = backend.rows(Table::Subscribers.title()).await.unwrap_or_default();
        assert_eq!(ids_in(&subscribers), vec!["1", "3"]);
        assert_eq!(subscribers[0].len(), 21);
        assert_eq!(subscribers[1][18], "active");
        assert_eq!(subscribers[1][16], "join_request");
        assert_eq!(subscribers[1][14], "✅");
    }

    #[tokio::test(start_paused = true)]
    async fn decline_all_deletes_declined_rows() {
        let (backend, store) = seeded_store(&[request(1, CHANNEL), request(1, -200)]).await;
        let mut gateway = MockChannelGateway::new();
        gateway
            .expect_decline_join_request()
            .times(1)
            .returning(|_, _| Ok(()));
        let flow = RequestWorkflow::new(context_shared(store, gateway));

        let step = flow.decline_all(ADMIN, &managing(&[1])).await;
        assert_eq!(step.next, Some(RequestState::Completed));
        let pending = backend.rows(Table::JoinRequests.title()).await.unwrap_or_default();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[1][21], "-200");
        assert!(backend.rows(Table::Subscribers.title()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rows_removed_meanwhile_are_ignored() {
        let (backend, store) = seeded_store(&[request(1, CHANNEL)]).await;
        let mut gateway = MockChannelGateway::new();
        gateway
            .expect_approve_join_request()
            .times(2)
            .returning(|_, _| Ok(()));
        let flow = RequestWorkflow::new(context_shared(store, gateway));

        let step = flow.accept_all(ADMIN, &managing(&[1, 9])).await;
        assert_eq!(step.next, Some(RequestState::Completed));
        let subscribers = backend.rows(Table::Subscribers.title()).await.unwrap_or_default();
        assert_eq!(ids_in(&subscribers), vec!["1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sync_is_retried_without_deciding_again() {
        let (backend, store) = seeded_store(&[request(1, CHANNEL)]).await;
        assert!(store.ensure_schema(Table::Subscribers).await.is_ok());
        backend.fail_appends_to(Table::Subscribers.title()).await;
        let mut gateway = MockChannelGateway::new();
        gateway
            .expect_approve_join_request()
            .times(1)
            .returning(|_, _| Ok(()));
        let flow = RequestWorkflow::new(context_shared(store, gateway));

        let step = flow.accept_all(ADMIN, &managing(&[1])).await;
        let Some(retry @ RequestState::ManagingRequests { .. }) = step.next else {
            panic!("expected the review to stay open, got {:?}", step.next);
        };
        assert!(matches!(retry, RequestState::ManagingRequests { ref approved, .. } if approved == &[1]));
        assert!(step.reply.text.contains("could not be updated"));
        let pending = backend.rows(Table::JoinRequests.title()).await.unwrap_or_default();
        assert_eq!(ids_in(&pending), vec!["1"]);

        backend.allow_appends_to(Table::Subscribers.title()).await;
        let step = flow.accept_all(ADMIN, &retry).await;
        assert_eq!(step.next, Some(RequestState::Completed));
        assert!(step.reply.text.contains("Approved 1 of 1"));
        let pending = backend.rows(Table::JoinRequests.title()).await.unwrap_or_default();
        assert!(ids_in(&pending).is_empty());
        let subscribers = backend.rows(Table::Subscribers.title()).await.unwrap_or_default();
        assert_eq!(ids_in(&subscribers), vec!["1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn approval_merges_into_an_existing_subscriber_row() {
        let (backend, store) = seeded_store(&[request(1, CHANNEL)]).await;
        let joined = Subscriber::new(
            &UserProfile {
                id: 1,
                full_name: "User 1".into(),
                ..UserProfile::default()
            },
            SubscriberStatus::Active,
            Utc::now(),
        );
        assert!(store.append_row(&joined).await.is_ok());
        let mut gateway = MockChannelGateway::new();
        gateway
            .expect_approve_join_request()
            .times(1)
            .returning(|_, _| Ok(()));
        let flow = RequestWorkflow::new(context_shared(store, gateway));

        let step = flow.accept_all(ADMIN, &managing(&[1])).await;
        assert_eq!(step.next, Some(RequestState::Completed));
        let subscribers = backend.rows(Table::Subscribers.title()).await.unwrap_or_default();
        assert_eq!(ids_in(&subscribers), vec!["1"]);
        assert_eq!(subscribers[1][16], "join_request");
        assert_eq!(subscribers[1][18], "active");
    }

    #[tokio::test]
    async fn decisions_need_a_review_in_progress() {
        let (_, store) = test_store();
        let flow = RequestWorkflow::new(crate::testing::context(store, MockChannelGateway::new()));
        let step = flow.accept_all(ADMIN, &RequestState::SelectingChannel).await;
        assert_eq!(step.next, None);
        assert_eq!(step.reply.text, STALE_MENU);
    }
}
