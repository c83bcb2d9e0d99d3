//! Conversion of Telegram updates into domain events.

use gatekeeper_core::events::{JoinRequestNotice, MemberStatus, MembershipUpdate};
use gatekeeper_core::records::{InviteLinkInfo, UserProfile};
use teloxide::types::{
    ChatInviteLink, ChatJoinRequest, ChatMemberKind, ChatMemberStatus, ChatMemberUpdated, User,
};

/// Profile fields of a Telegram user
#[must_use]
pub fn user_profile(user: &User) -> UserProfile {
    UserProfile {
        id: user.id.0.cast_signed(),
        full_name: user.full_name(),
        username: user.username.clone(),
        language_code: user.language_code.clone(),
        is_premium: user.is_premium,
        is_bot: user.is_bot,
    }
}

/// Invite link details as stored with subscribers
#[must_use]
pub fn invite_link_info(link: &ChatInviteLink) -> InviteLinkInfo {
    InviteLinkInfo {
        link: link.invite_link.clone(),
        name: link.name.clone(),
        creator_id: Some(link.creator.id.0.cast_signed()),
        is_primary: link.is_primary,
        is_revoked: link.is_revoked,
        expire_date: link.expire_date,
        member_limit: link.member_limit,
        pending_join_request_count: link.pending_join_request_count,
    }
}

/// Domain status of a chat member kind
#[must_use]
pub fn member_status(kind: &ChatMemberKind) -> MemberStatus {
    match kind.status() {
        ChatMemberStatus::Owner => MemberStatus::Owner,
        ChatMemberStatus::Administrator => MemberStatus::Administrator,
        ChatMemberStatus::Member => MemberStatus::Member,
        ChatMemberStatus::Restricted => MemberStatus::Restricted,
        ChatMemberStatus::Left => MemberStatus::Left,
        ChatMemberStatus::Banned => MemberStatus::Kicked,
    }
}

/// Membership update of a `chat_member` update
#[must_use]
pub fn membership_update(update: &ChatMemberUpdated) -> MembershipUpdate {
    MembershipUpdate {
        channel_id: update.chat.id.0,
        user: user_profile(&update.new_chat_member.user),
        old_status: member_status(&update.old_chat_member.kind),
        new_status: member_status(&update.new_chat_member.kind),
        invite_link: update.invite_link.as_ref().map(invite_link_info),
        via_join_request: update.via_join_request,
        date: update.date,
    }
}

/// Join request notice of a `chat_join_request` update
#[must_use]
pub fn join_request_notice(request: &ChatJoinRequest) -> JoinRequestNotice {
    JoinRequestNotice {
        channel_id: request.chat.id.0,
        channel_title: request.chat.title().map(str::to_owned),
        user: user_profile(&request.from),
        invite_link: request.invite_link.as_ref().map(invite_link_info),
        date: request.date,
    }
}
