//! Telegram transport settings.

use config::ConfigError;
use gatekeeper_core::config::CoreSettings;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Cooldown period (seconds) between "Access denied" messages for the same user.
/// Default: 20 minutes.
pub const DENIAL_COOLDOWN_SECS: u64 = 1200;
/// Maximum cache capacity (number of entries).
pub const DENIAL_CACHE_MAX_SIZE: u64 = 10_000;

/// Telegram transport settings loaded from environment variables.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TelegramSettings {
    /// Telegram Bot API token.
    #[serde(default)]
    pub telegram_bot_token: String,
    /// Seconds between two denial messages to the same user.
    #[serde(default = "default_denial_cooldown")]
    pub denial_cooldown_secs: u64,
    /// Upper bound of remembered denied users.
    #[serde(default = "default_denial_cache_max_size")]
    pub denial_cache_max_size: u64,
}

const fn default_denial_cooldown() -> u64 {
    DENIAL_COOLDOWN_SECS
}

const fn default_denial_cache_max_size() -> u64 {
    DENIAL_CACHE_MAX_SIZE
}

impl TelegramSettings {
    /// Create new settings by loading from environment and files.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails or the token is missing.
    pub fn new() -> Result<Self, ConfigError> {
        let settings: Self = gatekeeper_core::config::build_config()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks that the bot token is present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Message` when `TELEGRAM_BOT_TOKEN` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telegram_bot_token.trim().is_empty() {
            return Err(ConfigError::Message("TELEGRAM_BOT_TOKEN is not set".into()));
        }
        Ok(())
    }

    /// Cooldown between denial messages
    #[must_use]
    pub const fn denial_cooldown(&self) -> Duration {
        Duration::from_secs(self.denial_cooldown_secs)
    }
}

/// Combined settings used by the Telegram transport layer.
#[derive(Clone)]
pub struct BotSettings {
    /// Core settings shared across transport handlers.
    pub core: Arc<CoreSettings>,
    /// Telegram-specific settings.
    pub telegram: Arc<TelegramSettings>,
}

impl BotSettings {
    /// Create a new combined settings bundle.
    #[must_use]
    pub fn new(core: CoreSettings, telegram: TelegramSettings) -> Self {
        Self {
            core: Arc::new(core),
            telegram: Arc::new(telegram),
        }
    }
}
