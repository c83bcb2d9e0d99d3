//! Inline callback payloads.
//!
//! Payloads have the shape `{action}` or `{action}:{argument}`; the argument
//! never contains a colon. Telegram caps payloads at 64 bytes, so links are
//! addressed by index rather than by name.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised for payloads that do not decode
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallbackError {
    /// The payload does not have the `{action}:{argument}` shape
    #[error("malformed callback payload '{0}'")]
    Malformed(String),
    /// The action is not known
    #[error("unknown callback action '{0}'")]
    UnknownAction(String),
}

/// A decoded inline button press
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    /// Link creation: channel chosen
    LinkChannel(i64),
    /// Link creation: approval mode chosen
    LinkApproval(bool),
    /// Link creation: back to channel selection
    LinkBack,
    /// Request management: channel chosen
    RequestsChannel(i64),
    /// Request management: approve every pending request
    AcceptAll,
    /// Request management: decline every pending request
    DeclineAll,
    /// Request management: back to channel selection
    RequestsBack,
    /// Statistics: channel chosen
    StatsChannel(i64),
    /// Statistics: link chosen by position in the listed links
    StatsLink(usize),
    /// Statistics: back to channel selection
    StatsBack,
    /// Statistics: close the menu
    StatsClose,
}

const LINK_CHANNEL: &str = "link_channel";
const LINK_APPROVAL: &str = "link_approval";
const LINK_BACK: &str = "link_back";
const REQ_CHANNEL: &str = "req_channel";
const REQ_ACCEPT_ALL: &str = "req_accept_all";
const REQ_DECLINE_ALL: &str = "req_decline_all";
const REQ_BACK: &str = "req_back";
const STATS_CHANNEL: &str = "stats_channel";
const STATS_LINK: &str = "stats_link";
const STATS_BACK: &str = "stats_back";
const STATS_CLOSE: &str = "stats_close";

impl fmt::Display for CallbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinkChannel(id) => write!(f, "{LINK_CHANNEL}:{id}"),
            Self::LinkApproval(true) => write!(f, "{LINK_APPROVAL}:required"),
            Self::LinkApproval(false) => write!(f, "{LINK_APPROVAL}:open"),
            Self::LinkBack => f.write_str(LINK_BACK),
            Self::RequestsChannel(id) => write!(f, "{REQ_CHANNEL}:{id}"),
            Self::AcceptAll => f.write_str(REQ_ACCEPT_ALL),
            Self::DeclineAll => f.write_str(REQ_DECLINE_ALL),
            Self::RequestsBack => f.write_str(REQ_BACK),
            Self::StatsChannel(id) => write!(f, "{STATS_CHANNEL}:{id}"),
            Self::StatsLink(idx) => write!(f, "{STATS_LINK}:{idx}"),
            Self::StatsBack => f.write_str(STATS_BACK),
            Self::StatsClose => f.write_str(STATS_CLOSE),
        }
    }
}

impl FromStr for CallbackAction {
    type Err = CallbackError;

    fn from_str(payload: &str) -> Result<Self, Self::Err> {
        let malformed = || CallbackError::Malformed(payload.to_string());
        let (action, argument) = match payload.split_once(':') {
            Some((action, argument)) => {
                if argument.is_empty() || argument.contains(':') {
                    return Err(malformed());
                }
                (action, Some(argument))
            }
            None => (payload, None),
        };

        let parse_id = |arg: Option<&str>| -> Result<i64, CallbackError> {
            arg.and_then(|a| a.parse().ok()).ok_or_else(malformed)
        };

        match (action, argument) {
            (LINK_CHANNEL, arg) => parse_id(arg).map(Self::LinkChannel),
            (LINK_APPROVAL, Some("required")) => Ok(Self::LinkApproval(true)),
            (LINK_APPROVAL, Some("open")) => Ok(Self::LinkApproval(false)),
            (LINK_APPROVAL, _) => Err(malformed()),
            (REQ_CHANNEL, arg) => parse_id(arg).map(Self::RequestsChannel),
            (STATS_CHANNEL, arg) => parse_id(arg).map(Self::StatsChannel),
            (STATS_LINK, arg) => arg
                .and_then(|a| a.parse().ok())
                .map(Self::StatsLink)
                .ok_or_else(malformed),
            (LINK_BACK, None) => Ok(Self::LinkBack),
            (REQ_ACCEPT_ALL, None) => Ok(Self::AcceptAll),
            (REQ_DECLINE_ALL, None) => Ok(Self::DeclineAll),
            (REQ_BACK, None) => Ok(Self::RequestsBack),
            (STATS_BACK, None) => Ok(Self::StatsBack),
            (STATS_CLOSE, None) => Ok(Self::StatsClose),
            (LINK_BACK | REQ_ACCEPT_ALL | REQ_DECLINE_ALL | REQ_BACK | STATS_BACK | STATS_CLOSE, Some(_)) => {
                Err(malformed())
            }
            (other, _) => Err(CallbackError::UnknownAction(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_decode_to_actions() {
        assert_eq!(
            "link_channel:-1001234567890".parse(),
            Ok(CallbackAction::LinkChannel(-1_001_234_567_890))
        );
        assert_eq!("link_approval:required".parse(), Ok(CallbackAction::LinkApproval(true)));
        assert_eq!("req_accept_all".parse(), Ok(CallbackAction::AcceptAll));
        assert_eq!("stats_link:3".parse(), Ok(CallbackAction::StatsLink(3)));
    }

    #[test]
    fn encoded_payloads_decode_back() {
        let actions = [
            CallbackAction::LinkChannel(-100),
            CallbackAction::LinkApproval(false),
            CallbackAction::RequestsBack,
            CallbackAction::StatsClose,
        ];
        for action in actions {
            assert_eq!(action.to_string().parse::<CallbackAction>(), Ok(action));
        }
    }

    #[test]
    fn payloads_fit_telegram_limit() {
        let longest = CallbackAction::StatsChannel(i64::MIN).to_string();
        assert!(longest.len() <= 64);
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        for payload in ["link_channel", "link_channel:abc", "link_channel:1:2", "req_back:1", "link_approval:maybe", "stats_link:"] {
            assert!(
                matches!(payload.parse::<CallbackAction>(), Err(CallbackError::Malformed(_))),
                "{payload}"
            );
        }
        assert_eq!(
            "select_channel:1".parse::<CallbackAction>(),
            Err(CallbackError::UnknownAction("select_channel".into()))
        );
    }
}
