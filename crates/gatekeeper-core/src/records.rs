//! Table records and their column mappings.
//!
//! Every record declares the ordered columns of its table and converts to
//! and from a header-addressed row. Cell encoding is shared: `None` is an
//! empty cell, booleans are `✅`/`❌`, timestamps are UTC
//! `YYYY-MM-DD HH:MM:SS`, enums are snake_case names.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::sheets::store::SheetRow;

/// Timestamp format used in every table
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Columns of the subscribers table, in order
pub const SUBSCRIBER_COLUMNS: [&str; 21] = [
    "id",
    "full_name",
    "username",
    "language_code",
    "is_premium",
    "is_bot",
    "link_name",
    "link",
    "creator_id",
    "is_primary",
    "is_revoked",
    "expire_date",
    "member_limit",
    "pending_join_request_count",
    "via_join_request",
    "join_request_date",
    "join_method",
    "join_date",
    "status",
    "last_online",
    "registration_date",
];

/// Columns appended to the subscriber columns in the join requests table
pub const JOIN_REQUEST_EXTRA_COLUMNS: [&str; 2] = ["channel_id", "channel_name"];

/// Columns of the invite links table, in order
pub const INVITE_LINK_COLUMNS: [&str; 7] = [
    "name",
    "link",
    "creator_id",
    "channel_name",
    "created_at",
    "is_revoked",
    "channel_id",
];

/// The named tables of the spreadsheet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Channel subscribers, active and former
    Subscribers,
    /// Invite links created through the bot
    InviteLinks,
    /// Pending join requests
    JoinRequests,
}

impl Table {
    /// Every table, in creation order
    pub const ALL: [Self; 3] = [Self::Subscribers, Self::InviteLinks, Self::JoinRequests];

    /// Worksheet title
    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Self::Subscribers => "Subscribers",
            Self::InviteLinks => "InviteLinks",
            Self::JoinRequests => "JoinRequests",
        }
    }

    /// Authoritative header row
    #[must_use]
    pub fn headers(self) -> Vec<String> {
        let columns: Vec<&str> = match self {
            Self::Subscribers => SUBSCRIBER_COLUMNS.to_vec(),
            Self::InviteLinks => INVITE_LINK_COLUMNS.to_vec(),
            Self::JoinRequests => SUBSCRIBER_COLUMNS
                .iter()
                .chain(JOIN_REQUEST_EXTRA_COLUMNS.iter())
                .copied()
                .collect(),
        };
        columns.into_iter().map(str::to_string).collect()
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// Errors raised while decoding a row into a record
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    /// A required cell is empty or its column is absent
    #[error("missing value for column '{0}'")]
    MissingValue(&'static str),
    /// A cell could not be decoded
    #[error("invalid value '{value}' in column '{column}'")]
    InvalidValue {
        /// Column name
        column: &'static str,
        /// Raw cell content
        value: String,
    },
}

/// A typed row of one table
pub trait Record: Sized {
    /// Table the record lives in
    const TABLE: Table;

    /// Named cells of the record. Columns not listed are written empty.
    fn to_cells(&self) -> Vec<(&'static str, String)>;

    /// Decodes a record from a header-addressed row.
    ///
    /// # Errors
    ///
    /// Returns `RecordError` if a required cell is missing or malformed.
    fn from_row(row: &SheetRow) -> Result<Self, RecordError>;
}

/// Membership status stored in the `status` column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriberStatus {
    /// Currently subscribed
    #[default]
    Active,
    /// Left or was removed
    Inactive,
    /// Waiting for an administrator decision
    Pending,
}

impl SubscriberStatus {
    /// Cell representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Pending => "pending",
        }
    }
}

impl FromStr for SubscriberStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "pending" => Ok(Self::Pending),
            _ => Err(()),
        }
    }
}

/// How a subscriber got into the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinMethod {
    /// Joined through an invite link without approval
    InviteLink,
    /// Approved join request
    JoinRequest,
    /// Joined without any link
    DirectJoin,
    /// Not known, e.g. a leave for a user never seen joining
    #[default]
    Unknown,
}

impl JoinMethod {
    /// Cell representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InviteLink => "invite_link",
            Self::JoinRequest => "join_request",
            Self::DirectJoin => "direct_join",
            Self::Unknown => "unknown",
        }
    }
}

impl FromStr for JoinMethod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "invite_link" => Ok(Self::InviteLink),
            "join_request" => Ok(Self::JoinRequest),
            "direct_join" => Ok(Self::DirectJoin),
            "unknown" | "" => Ok(Self::Unknown),
            _ => Err(()),
        }
    }
}

/// Profile of a Telegram user as seen in an update
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserProfile {
    /// User id
    pub id: i64,
    /// First and last name joined by a space
    pub full_name: String,
    /// Username without the leading `@`
    pub username: Option<String>,
    /// IETF language tag of the client
    pub language_code: Option<String>,
    /// Premium subscriber flag
    pub is_premium: bool,
    /// Bot account flag
    pub is_bot: bool,
}

/// Invite link details attached to a membership update or join request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InviteLinkInfo {
    /// Link URL, possibly elided by Telegram for links of other admins
    pub link: String,
    /// Link name
    pub name: Option<String>,
    /// Id of the administrator who created the link
    pub creator_id: Option<i64>,
    /// Primary link of the chat
    pub is_primary: bool,
    /// Link was revoked
    pub is_revoked: bool,
    /// Expiration point
    pub expire_date: Option<DateTime<Utc>>,
    /// Maximum simultaneous members joined through the link
    pub member_limit: Option<u32>,
    /// Pending join requests created through the link
    pub pending_join_request_count: Option<u32>,
}

/// A row of the subscribers table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    /// User id, the identity of the row
    pub id: i64,
    /// Display name
    pub full_name: String,
    /// Username without the leading `@`
    pub username: Option<String>,
    /// Client language
    pub language_code: Option<String>,
    /// Premium flag
    pub is_premium: bool,
    /// Bot flag
    pub is_bot: bool,
    /// Name of the invite link used to join
    pub link_name: Option<String>,
    /// Invite link used to join
    pub link: Option<String>,
    /// Creator of the invite link
    pub creator_id: Option<i64>,
    /// Invite link is the primary link
    pub is_primary: Option<bool>,
    /// Invite link is revoked
    pub is_revoked: Option<bool>,
    /// Invite link expiration
    pub expire_date: Option<DateTime<Utc>>,
    /// Invite link member limit
    pub member_limit: Option<u32>,
    /// Invite link pending request count
    pub pending_join_request_count: Option<u32>,
    /// Joined through an approved join request
    pub via_join_request: Option<bool>,
    /// When the join request was sent
    pub join_request_date: Option<DateTime<Utc>>,
    /// How the user joined
    pub join_method: JoinMethod,
    /// When the row was last (re)activated
    pub join_date: DateTime<Utc>,
    /// Membership status
    pub status: SubscriberStatus,
    /// Last activity seen by the bot
    pub last_online: Option<DateTime<Utc>>,
    /// Account registration date, unknown to bots
    pub registration_date: Option<DateTime<Utc>>,
}

impl Subscriber {
    /// Creates a row for `user` with no link details.
    #[must_use]
    pub fn new(user: &UserProfile, status: SubscriberStatus, at: DateTime<Utc>) -> Self {
        Self {
            id: user.id,
            full_name: user.full_name.clone(),
            username: user.username.clone(),
            language_code: user.language_code.clone(),
            is_premium: user.is_premium,
            is_bot: user.is_bot,
            link_name: None,
            link: None,
            creator_id: None,
            is_primary: None,
            is_revoked: None,
            expire_date: None,
            member_limit: None,
            pending_join_request_count: None,
            via_join_request: None,
            join_request_date: None,
            join_method: JoinMethod::Unknown,
            join_date: at,
            status,
            last_online: Some(at),
            registration_date: None,
        }
    }

    /// Copies the invite link details into the row.
    #[must_use]
    pub fn with_invite_link(mut self, link: &InviteLinkInfo) -> Self {
        self.link_name.clone_from(&link.name);
        self.link = Some(link.link.clone());
        self.creator_id = link.creator_id;
        self.is_primary = Some(link.is_primary);
        self.is_revoked = Some(link.is_revoked);
        self.expire_date = link.expire_date;
        self.member_limit = link.member_limit;
        self.pending_join_request_count = link.pending_join_request_count;
        self
    }

    /// Human-readable handle: `@username`, else `ID: id`.
    #[must_use]
    pub fn handle(&self) -> String {
        match self.username.as_deref().filter(|u| !u.is_empty()) {
            Some(username) => format!("@{username}"),
            None => format!("ID: {}", self.id),
        }
    }
}

impl Record for Subscriber {
    const TABLE: Table = Table::Subscribers;

    fn to_cells(&self) -> Vec<(&'static str, String)> {
        vec![
            ("id", self.id.to_string()),
            ("full_name", self.full_name.clone()),
            ("username", encode_opt(self.username.as_ref())),
            ("language_code", encode_opt(self.language_code.as_ref())),
            ("is_premium", encode_bool(self.is_premium)),
            ("is_bot", encode_bool(self.is_bot)),
            ("link_name", encode_opt(self.link_name.as_ref())),
            ("link", encode_opt(self.link.as_ref())),
            ("creator_id", encode_opt(self.creator_id.as_ref())),
            ("is_primary", encode_opt_bool(self.is_primary)),
            ("is_revoked", encode_opt_bool(self.is_revoked)),
            ("expire_date", encode_opt_time(self.expire_date)),
            ("member_limit", encode_opt(self.member_limit.as_ref())),
            (
                "pending_join_request_count",
                encode_opt(self.pending_join_request_count.as_ref()),
            ),
            ("via_join_request", encode_opt_bool(self.via_join_request)),
            ("join_request_date", encode_opt_time(self.join_request_date)),
            ("join_method", self.join_method.as_str().to_string()),
            ("join_date", encode_time(self.join_date)),
            ("status", self.status.as_str().to_string()),
            ("last_online", encode_opt_time(self.last_online)),
            ("registration_date", encode_opt_time(self.registration_date)),
        ]
    }

    fn from_row(row: &SheetRow) -> Result<Self, RecordError> {
        Ok(Self {
            id: required(row, "id")?,
            full_name: row.get("full_name").unwrap_or_default().to_string(),
            username: optional_text(row, "username"),
            language_code: optional_text(row, "language_code"),
            is_premium: optional_bool(row, "is_premium")?.unwrap_or(false),
            is_bot: optional_bool(row, "is_bot")?.unwrap_or(false),
            link_name: optional_text(row, "link_name"),
            link: optional_text(row, "link"),
            creator_id: optional(row, "creator_id")?,
            is_primary: optional_bool(row, "is_primary")?,
            is_revoked: optional_bool(row, "is_revoked")?,
            expire_date: optional_time(row, "expire_date")?,
            member_limit: optional(row, "member_limit")?,
            pending_join_request_count: optional(row, "pending_join_request_count")?,
            via_join_request: optional_bool(row, "via_join_request")?,
            join_request_date: optional_time(row, "join_request_date")?,
            join_method: optional(row, "join_method")?.unwrap_or_default(),
            join_date: optional_time(row, "join_date")?.unwrap_or_default(),
            status: optional(row, "status")?.unwrap_or_default(),
            last_online: optional_time(row, "last_online")?,
            registration_date: optional_time(row, "registration_date")?,
        })
    }
}

/// A row of the join requests table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    /// Requesting user, with `status = pending`
    pub subscriber: Subscriber,
    /// Channel the request targets
    pub channel_id: i64,
    /// Channel title at request time
    pub channel_name: String,
}

impl Record for JoinRequest {
    const TABLE: Table = Table::JoinRequests;

    fn to_cells(&self) -> Vec<(&'static str, String)> {
        let mut cells = self.subscriber.to_cells();
        cells.push(("channel_id", self.channel_id.to_string()));
        cells.push(("channel_name", self.channel_name.clone()));
        cells
    }

    fn from_row(row: &SheetRow) -> Result<Self, RecordError> {
        Ok(Self {
            subscriber: Subscriber::from_row(row)?,
            channel_id: required(row, "channel_id")?,
            channel_name: row.get("channel_name").unwrap_or_default().to_string(),
        })
    }
}

/// A row of the invite links table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteLink {
    /// Administrator-chosen name
    pub name: String,
    /// Link URL
    pub link: String,
    /// Administrator who created it
    pub creator_id: Option<i64>,
    /// Channel title at creation time
    pub channel_name: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Revocation flag
    pub is_revoked: bool,
    /// Channel the link belongs to, absent on rows written by older versions
    pub channel_id: Option<i64>,
}

impl Record for InviteLink {
    const TABLE: Table = Table::InviteLinks;

    fn to_cells(&self) -> Vec<(&'static str, String)> {
        vec![
            ("name", self.name.clone()),
            ("link", self.link.clone()),
            ("creator_id", encode_opt(self.creator_id.as_ref())),
            ("channel_name", self.channel_name.clone()),
            ("created_at", encode_time(self.created_at)),
            ("is_revoked", encode_bool(self.is_revoked)),
            ("channel_id", encode_opt(self.channel_id.as_ref())),
        ]
    }

    fn from_row(row: &SheetRow) -> Result<Self, RecordError> {
        let link = optional_text(row, "link").ok_or(RecordError::MissingValue("link"))?;
        Ok(Self {
            name: row.get("name").unwrap_or_default().to_string(),
            link,
            creator_id: optional(row, "creator_id")?,
            channel_name: row.get("channel_name").unwrap_or_default().to_string(),
            created_at: optional_time(row, "created_at")?.unwrap_or_default(),
            is_revoked: optional_bool(row, "is_revoked")?.unwrap_or(false),
            channel_id: optional(row, "channel_id")?,
        })
    }
}

/// Brings an invite link into the canonical `https://t.me/+X` form.
///
/// Accepts the canonical form, `t.me/+X`, `+X` and a bare `X`.
#[must_use]
pub fn normalize_invite_link(raw: &str) -> String {
    let trimmed = raw.trim();
    let code = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let code = code.strip_prefix("t.me/").unwrap_or(code);
    let code = code.strip_prefix('+').unwrap_or(code);
    format!("https://t.me/+{code}")
}

/// Encodes a boolean cell.
#[must_use]
pub fn encode_bool(value: bool) -> String {
    let mark = if value { "✅" } else { "❌" };
    mark.to_string()
}

fn encode_opt_bool(value: Option<bool>) -> String {
    value.map(encode_bool).unwrap_or_default()
}

/// Encodes a timestamp cell.
#[must_use]
pub fn encode_time(value: DateTime<Utc>) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

fn encode_opt_time(value: Option<DateTime<Utc>>) -> String {
    value.map(encode_time).unwrap_or_default()
}

fn encode_opt<T: ToString>(value: Option<&T>) -> String {
    value.map(ToString::to_string).unwrap_or_default()
}

/// Decodes a boolean cell. Empty cells decode to `None`.
#[must_use]
pub fn parse_bool(raw: &str) -> Option<Option<bool>> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Some(None),
        "✅" | "true" | "1" => Some(Some(true)),
        "❌" | "false" | "0" => Some(Some(false)),
        _ => None,
    }
}

/// Decodes a timestamp cell, also accepting RFC 3339.
#[must_use]
pub fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}

fn cell<'a>(row: &'a SheetRow, column: &'static str) -> Option<&'a str> {
    row.get(column).map(str::trim).filter(|v| !v.is_empty())
}

fn optional_text(row: &SheetRow, column: &'static str) -> Option<String> {
    cell(row, column).map(str::to_string)
}

fn optional<T: FromStr>(row: &SheetRow, column: &'static str) -> Result<Option<T>, RecordError> {
    cell(row, column)
        .map(|raw| {
            raw.parse::<T>().map_err(|_| RecordError::InvalidValue {
                column,
                value: raw.to_string(),
            })
        })
        .transpose()
}

fn required<T: FromStr>(row: &SheetRow, column: &'static str) -> Result<T, RecordError> {
    optional(row, column)?.ok_or(RecordError::MissingValue(column))
}

fn optional_bool(row: &SheetRow, column: &'static str) -> Result<Option<bool>, RecordError> {
    let raw = row.get(column).unwrap_or_default();
    parse_bool(raw).ok_or_else(|| RecordError::InvalidValue {
        column,
        value: raw.to_string(),
    })
}

fn optional_time(
    row: &SheetRow,
    column: &'static str,
) -> Result<Option<DateTime<Utc>>, RecordError> {
    cell(row, column)
        .map(|raw| {
            parse_time(raw).ok_or_else(|| RecordError::InvalidValue {
                column,
                value: raw.to_string(),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheets::store::SheetRow;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0)
            .single()
            .unwrap_or_default()
    }

    fn user() -> UserProfile {
        UserProfile {
            id: 42,
            full_name: "Ada Lovelace".into(),
            username: Some("ada".into()),
            language_code: Some("en".into()),
            is_premium: true,
            is_bot: false,
        }
    }

    fn row_for<R: Record>(record: &R) -> SheetRow {
        let headers = R::TABLE.headers();
        SheetRow::from_record(record, headers)
    }

    #[test]
    fn join_requests_extend_subscriber_columns() {
        let headers = Table::JoinRequests.headers();
        assert_eq!(headers.len(), 23);
        assert_eq!(headers[0], "id");
        assert_eq!(headers[20], "registration_date");
        assert_eq!(&headers[21..], ["channel_id", "channel_name"]);
        assert_eq!(Table::InviteLinks.headers().last().map(String::as_str), Some("channel_id"));
    }

    #[test]
    fn subscriber_cells_use_shared_encoding() {
        let sub = Subscriber::new(&user(), SubscriberStatus::Active, at(10));
        let row = row_for(&sub);
        assert_eq!(row.get("is_premium"), Some("✅"));
        assert_eq!(row.get("is_bot"), Some("❌"));
        assert_eq!(row.get("link"), Some(""));
        assert_eq!(row.get("join_date"), Some("2024-05-01 10:00:00"));
        assert_eq!(row.get("status"), Some("active"));
        assert_eq!(row.get("join_method"), Some("unknown"));
        assert_eq!(Subscriber::from_row(&row), Ok(sub));
    }

    #[test]
    fn invite_link_details_are_copied() {
        let info = InviteLinkInfo {
            link: "https://t.me/+abc".into(),
            name: Some("spring".into()),
            creator_id: Some(7),
            expire_date: Some(at(12)),
            ..InviteLinkInfo::default()
        };
        let sub = Subscriber::new(&user(), SubscriberStatus::Active, at(10)).with_invite_link(&info);
        let row = row_for(&sub);
        assert_eq!(row.get("link_name"), Some("spring"));
        assert_eq!(row.get("is_primary"), Some("❌"));
        assert_eq!(row.get("expire_date"), Some("2024-05-01 12:00:00"));
    }

    #[test]
    fn invalid_id_is_rejected() {
        let headers = Table::Subscribers.headers();
        let mut values = vec![String::new(); headers.len()];
        values[0] = "not-a-number".into();
        let row = SheetRow::new(2, headers.into(), values);
        assert!(matches!(
            Subscriber::from_row(&row),
            Err(RecordError::InvalidValue { column: "id", .. })
        ));
    }

    #[test]
    fn bools_accept_plain_spellings() {
        assert_eq!(parse_bool("TRUE"), Some(Some(true)));
        assert_eq!(parse_bool("0"), Some(Some(false)));
        assert_eq!(parse_bool(" "), Some(None));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn handle_prefers_username() {
        let mut sub = Subscriber::new(&user(), SubscriberStatus::Active, at(1));
        assert_eq!(sub.handle(), "@ada");
        sub.username = None;
        assert_eq!(sub.handle(), "ID: 42");
    }

    #[test]
    fn invite_links_are_normalized() {
        for raw in ["https://t.me/+AbC", "t.me/+AbC", "+AbC", "AbC", " http://t.me/+AbC "] {
            assert_eq!(normalize_invite_link(raw), "https://t.me/+AbC");
        }
    }
}
