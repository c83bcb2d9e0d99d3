#![deny(missing_docs)]
//! Gatekeeper runtime helpers.
//!
//! Transport-agnostic orchestration: per-session conversation storage and
//! the periodic backup task.

/// Periodic backup delivery
pub mod backup;
/// Session registry
pub mod session_registry;

pub use backup::{spawn_backup_scheduler, BackupConfig, BackupScheduler, TickReport};
pub use session_registry::{SessionKey, SessionRegistry};
