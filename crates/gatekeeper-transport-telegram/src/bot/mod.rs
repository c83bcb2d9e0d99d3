/// Unauthorized access flood protection
pub mod denial_cache;
/// Conversion of chat updates into domain events
pub mod events;
/// Bot API implementation of the channel gateway
pub mod gateway;
/// Command, message and update handlers
pub mod handlers;
/// Resilient messaging with automatic retry for Telegram API operations
pub mod resilient;
/// Keyboard rendering
pub mod views;

pub use denial_cache::DenialCache;
pub use gateway::TelegramGateway;
