//! Core domain logic for the Gatekeeper channel-management bot.
//!
//! This crate is transport-agnostic: it owns the spreadsheet persistence
//! layer, the conversational workflows and the membership event processing.
//! The Telegram adapter lives in `gatekeeper-transport-telegram`.

#![deny(missing_docs)]

/// Backup export into a portable archive
pub mod backup;
/// Inline callback payload codec
pub mod callback;
/// Configuration and settings
pub mod config;
/// Membership and join-request event processing
pub mod events;
/// Outbound channel capabilities
pub mod gateway;
/// Table records and column mappings
pub mod records;
/// Inbound event routing across workflows
pub mod router;
/// Spreadsheet persistence
pub mod sheets;
/// Shared helpers
pub mod utils;
/// Conversational workflows
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
