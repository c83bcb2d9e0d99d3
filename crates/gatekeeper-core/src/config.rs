//! Configuration and settings management
//!
//! Settings come from optional `config/*.toml` files and the environment.
//! Everything required is validated once at start-up.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::sheets::retry::RetryPolicy;

/// Attempts for idempotent transport sends
pub const TRANSPORT_MAX_RETRIES: usize = 3;
/// Base delay for transport retries in milliseconds
pub const TRANSPORT_RETRY_BASE_MS: u64 = 500;
/// Upper bound for a single transport retry delay in milliseconds
pub const TRANSPORT_RETRY_MAX_DELAY_MS: u64 = 4_000;

/// Capacity hint for newly created tables
pub const NEW_TABLE_ROWS: u32 = 100;
/// Column capacity hint for newly created tables
pub const NEW_TABLE_COLS: u32 = 20;

/// Base URL of the spreadsheet web UI
pub const SPREADSHEET_WEB_URL: &str = "https://docs.google.com/spreadsheets/d";

/// Core settings shared by every transport
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CoreSettings {
    /// Identifier of the backing spreadsheet
    #[serde(default)]
    pub spreadsheet_id: String,

    /// Path to the service-account credentials JSON file
    #[serde(default = "default_creds_path")]
    pub google_creds_json: String,

    /// Comma-separated list of administrator user IDs
    #[serde(rename = "telegram_admin_ids", default)]
    pub admin_ids_str: Option<String>,

    /// Comma-separated list of managed channel IDs
    #[serde(rename = "telegram_channel_ids", default)]
    pub channel_ids_str: Option<String>,

    /// Default log filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Seconds between two backups
    #[serde(default = "default_backup_interval_secs")]
    pub backup_interval_secs: u64,

    /// Minimum spacing between two spreadsheet calls
    #[serde(default = "default_sheets_api_delay_ms")]
    pub sheets_api_delay_ms: u64,

    /// Total attempts for a spreadsheet call, first try included
    #[serde(default = "default_sheets_max_retries")]
    pub sheets_max_retries: usize,

    /// First retry delay for spreadsheet calls
    #[serde(default = "default_sheets_backoff_initial_ms")]
    pub sheets_backoff_initial_ms: u64,

    /// Cap for a single retry delay for spreadsheet calls
    #[serde(default = "default_sheets_backoff_max_ms")]
    pub sheets_backoff_max_ms: u64,

    /// Lifetime of generated invite links in days
    #[serde(default = "default_invite_link_ttl_days")]
    pub invite_link_ttl_days: i64,

    /// Whether link creation asks for the approval mode
    #[serde(default = "default_true")]
    pub link_approval_step: bool,
}

fn default_creds_path() -> String {
    "credentials.json".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_backup_interval_secs() -> u64 {
    8 * 60 * 60
}

const fn default_sheets_api_delay_ms() -> u64 {
    1_500
}

const fn default_sheets_max_retries() -> usize {
    5
}

const fn default_sheets_backoff_initial_ms() -> u64 {
    2_000
}

const fn default_sheets_backoff_max_ms() -> u64 {
    10_000
}

const fn default_invite_link_ttl_days() -> i64 {
    14
}

const fn default_true() -> bool {
    true
}

/// Builds the layered configuration source shared by all settings structs.
///
/// # Errors
///
/// Returns a `ConfigError` if a present source cannot be read.
pub fn build_config() -> Result<Config, ConfigError> {
    let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

    Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
        // Not checked into git
        .add_source(File::with_name("config/local").required(false))
        // `APP__SPREADSHEET_ID=...`
        .add_source(Environment::with_prefix("APP").separator("__"))
        // UPPER_SNAKE_CASE variables map onto snake_case keys
        .add_source(Environment::default().ignore_empty(true))
        .build()
}

/// Parses a list of ids separated by commas, semicolons or whitespace.
///
/// Entries that are not integers are skipped. Order is preserved and
/// duplicates are dropped.
#[must_use]
pub fn parse_id_list(raw: &str) -> Vec<i64> {
    let mut seen = HashSet::new();
    raw.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.trim().parse::<i64>().ok())
        .filter(|id| seen.insert(*id))
        .collect()
}

impl CoreSettings {
    /// Loads settings from files and the environment and validates them.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails or a required value is missing.
    pub fn new() -> Result<Self, ConfigError> {
        let settings: Self = build_config()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks that every value needed at runtime is present and sane.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Message` naming the first offending variable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.spreadsheet_id.trim().is_empty() {
            return Err(ConfigError::Message("SPREADSHEET_ID is not set".into()));
        }
        if self.google_creds_json.trim().is_empty() {
            return Err(ConfigError::Message("GOOGLE_CREDS_JSON is not set".into()));
        }
        if self.admin_ids().is_empty() {
            return Err(ConfigError::Message(
                "TELEGRAM_ADMIN_IDS contains no valid user ids".into(),
            ));
        }
        if self.channel_ids().is_empty() {
            return Err(ConfigError::Message(
                "TELEGRAM_CHANNEL_IDS contains no valid channel ids".into(),
            ));
        }
        if self.sheets_max_retries == 0 {
            return Err(ConfigError::Message(
                "SHEETS_MAX_RETRIES must be at least 1".into(),
            ));
        }
        if self.backup_interval_secs == 0 {
            return Err(ConfigError::Message(
                "BACKUP_INTERVAL_SECS must be positive".into(),
            ));
        }
        if self.invite_link_ttl_days <= 0 {
            return Err(ConfigError::Message(
                "INVITE_LINK_TTL_DAYS must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Administrator user ids
    #[must_use]
    pub fn admin_ids(&self) -> Vec<i64> {
        self.admin_ids_str
            .as_deref()
            .map(parse_id_list)
            .unwrap_or_default()
    }

    /// Managed channel ids, in configuration order
    #[must_use]
    pub fn channel_ids(&self) -> Vec<i64> {
        self.channel_ids_str
            .as_deref()
            .map(parse_id_list)
            .unwrap_or_default()
    }

    /// Minimum spacing between spreadsheet calls
    #[must_use]
    pub const fn sheets_api_delay(&self) -> Duration {
        Duration::from_millis(self.sheets_api_delay_ms)
    }

    /// Retry policy for spreadsheet calls
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.sheets_max_retries,
            initial_backoff: Duration::from_millis(self.sheets_backoff_initial_ms),
            max_backoff: Duration::from_millis(self.sheets_backoff_max_ms),
        }
    }

    /// Interval between backups
    #[must_use]
    pub const fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_secs)
    }

    /// Lifetime of generated invite links
    #[must_use]
    pub fn invite_link_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.invite_link_ttl_days)
    }

    /// Web URL of the backing spreadsheet
    #[must_use]
    pub fn spreadsheet_url(&self) -> String {
        format!("{SPREADSHEET_WEB_URL}/{}", self.spreadsheet_id)
    }
}
