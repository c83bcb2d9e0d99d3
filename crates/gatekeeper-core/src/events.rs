//! Membership and join-request event processing.
//!
//! Transport adapters translate platform updates into [`MembershipUpdate`]
//! and [`JoinRequestNotice`]; the processor turns them into rows.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::records::{
    encode_time, InviteLinkInfo, JoinMethod, JoinRequest, Subscriber, SubscriberStatus, Table,
    UserProfile,
};
use crate::sheets::{SheetStore, StoreError};

/// Membership status of a user in a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    /// Channel owner
    Owner,
    /// Channel administrator
    Administrator,
    /// Regular member
    Member,
    /// Member with restrictions
    Restricted,
    /// Not a member
    Left,
    /// Banned
    Kicked,
}

/// What a status change means for the subscribers table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The user became a member
    Joined,
    /// The user stopped being a member
    Left,
    /// Nothing to record
    Ignored,
}

/// Classifies a status change.
///
/// Only `left|kicked -> member` is a join and only
/// `member|restricted -> left|kicked` is a leave.
#[must_use]
pub const fn classify(old: MemberStatus, new: MemberStatus) -> Transition {
    use MemberStatus::{Kicked, Left, Member, Restricted};
    match (old, new) {
        (Left | Kicked, Member) => Transition::Joined,
        (Member | Restricted, Left | Kicked) => Transition::Left,
        _ => Transition::Ignored,
    }
}

/// A membership change in a managed channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipUpdate {
    /// Channel
    pub channel_id: i64,
    /// Affected user
    pub user: UserProfile,
    /// Status before the change
    pub old_status: MemberStatus,
    /// Status after the change
    pub new_status: MemberStatus,
    /// Link used to join, if any
    pub invite_link: Option<InviteLinkInfo>,
    /// The user joined through an approved join request
    pub via_join_request: bool,
    /// When the change happened
    pub date: DateTime<Utc>,
}

/// A join request to a managed channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequestNotice {
    /// Channel
    pub channel_id: i64,
    /// Channel title, when the platform sent it
    pub channel_title: Option<String>,
    /// Requesting user
    pub user: UserProfile,
    /// Link the request came through
    pub invite_link: Option<InviteLinkInfo>,
    /// When the request was sent
    pub date: DateTime<Utc>,
}

/// What the processor did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// A new row was written
    Appended,
    /// An existing row was changed
    Updated,
    /// An equivalent row already existed
    Duplicate,
    /// The event carries nothing to record
    Ignored,
}

/// Turns membership and join-request events into table rows.
///
/// Subscribers are upserted by user id: a returning user gets their row
/// rewritten rather than a second one.
pub struct SubscriptionEventProcessor {
    store: Arc<SheetStore>,
}

impl SubscriptionEventProcessor {
    /// Creates a processor writing through `store`.
    #[must_use]
    pub const fn new(store: Arc<SheetStore>) -> Self {
        Self { store }
    }

    /// Records a join or a leave.
    ///
    /// # Errors
    ///
    /// Returns the store error; the event is not retried.
    pub async fn process_membership(&self, update: &MembershipUpdate) -> Result<EventOutcome, StoreError> {
        match classify(update.old_status, update.new_status) {
            Transition::Joined => self.record_join(update).await,
            Transition::Left => self.record_leave(update).await,
            Transition::Ignored => {
                debug!(
                    user_id = update.user.id,
                    old = ?update.old_status,
                    new = ?update.new_status,
                    "Ignoring membership change"
                );
                Ok(EventOutcome::Ignored)
            }
        }
    }

    async fn existing(&self, user_id: i64) -> Result<Option<(crate::sheets::RowRef, Subscriber)>, StoreError> {
        self.store.ensure_schema(Table::Subscribers).await?;
        let Some(row) = self
            .store
            .find_row(Table::Subscribers.title(), "id", &user_id.to_string())
            .await?
        else {
            return Ok(None);
        };
        Ok(Some((row.row_ref(), row.decode::<Subscriber>()?)))
    }

    async fn record_join(&self, update: &MembershipUpdate) -> Result<EventOutcome, StoreError> {
        let _guard = self.store.lock_table(Table::Subscribers.title()).await;
        let mut subscriber = Subscriber::new(&update.user, SubscriberStatus::Active, update.date);
        if let Some(link) = &update.invite_link {
            subscriber = subscriber.with_invite_link(link);
        }
        subscriber.join_method = if update.via_join_request {
            JoinMethod::JoinRequest
        } else if update.invite_link.is_some() {
            JoinMethod::InviteLink
        } else {
            JoinMethod::DirectJoin
        };
        subscriber.via_join_request = Some(update.via_join_request);

        match self.existing(update.user.id).await? {
            Some((row_ref, previous)) => {
                subscriber.registration_date = previous.registration_date;
                subscriber.join_request_date = previous.join_request_date;
                self.store.update_row(row_ref, &subscriber).await?;
                info!(user_id = update.user.id, channel_id = update.channel_id, "Subscriber rejoined");
                Ok(EventOutcome::Updated)
            }
            None => {
                self.store.append_row(&subscriber).await?;
                info!(
                    user_id = update.user.id,
                    channel_id = update.channel_id,
                    method = subscriber.join_method.as_str(),
                    "Subscriber joined"
                );
                Ok(EventOutcome::Appended)
            }
        }
    }

    async fn record_leave(&self, update: &MembershipUpdate) -> Result<EventOutcome, StoreError> {
        let title = Table::Subscribers.title();
        let _guard = self.store.lock_table(title).await;
        match self.existing(update.user.id).await? {
            Some((row_ref, _)) => {
                self.store
                    .update_cell(title, row_ref, "status", SubscriberStatus::Inactive.as_str())
                    .await?;
                self.store
                    .update_cell(title, row_ref, "last_online", &encode_time(update.date))
                    .await?;
                info!(user_id = update.user.id, channel_id = update.channel_id, "Subscriber left");
                Ok(EventOutcome::Updated)
            }
            None => {
                let subscriber = Subscriber::new(&update.user, SubscriberStatus::Inactive, update.date);
                self.store.append_row(&subscriber).await?;
                info!(
                    user_id = update.user.id,
                    channel_id = update.channel_id,
                    "Unknown subscriber left, recorded as inactive"
                );
                Ok(EventOutcome::Appended)
            }
        }
    }

    /// Records a pending join request unless one is already pending for
    /// the same user and channel. Requests are never auto-approved.
    ///
    /// # Errors
    ///
    /// Returns the store error; the event is not retried.
    pub async fn process_join_request(&self, notice: &JoinRequestNotice) -> Result<EventOutcome, StoreError> {
        let _guard = self.store.lock_table(Table::JoinRequests.title()).await;
        let pending = self.store.pending_requests(notice.channel_id).await?;
        if pending.iter().any(|r| r.subscriber.id == notice.user.id) {
            debug!(user_id = notice.user.id, channel_id = notice.channel_id, "Join request already pending");
            return Ok(EventOutcome::Duplicate);
        }

        let mut subscriber = Subscriber::new(&notice.user, SubscriberStatus::Pending, notice.date);
        if let Some(link) = &notice.invite_link {
            subscriber = subscriber.with_invite_link(link);
        }
        subscriber.join_method = JoinMethod::JoinRequest;
        subscriber.via_join_request = Some(true);
        subscriber.join_request_date = Some(notice.date);

        let request = JoinRequest {
            subscriber,
            channel_id: notice.channel_id,
            channel_name: notice
                .channel_title
                .clone()
                .unwrap_or_else(|| notice.channel_id.to_string()),
        };
        self.store.append_row(&request).await?;
        info!(user_id = notice.user.id, channel_id = notice.channel_id, "Recorded join request");
        Ok(EventOutcome::Appended)
    }
}
