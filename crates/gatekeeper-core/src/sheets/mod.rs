//! Spreadsheet persistence: the backend interface, its implementations and
//! the rate-limited, retrying store on top of it.

/// Backend interface and errors
pub mod backend;
/// Google Sheets v4 backend
pub mod google;
/// Process-wide call throttling
pub mod limiter;
/// In-memory backend
pub mod memory;
/// Retry policy for transient failures
pub mod retry;
/// Header-aware table store
pub mod store;

pub use backend::{BackendError, SheetBackend};
pub use limiter::RateLimiter;
pub use retry::RetryPolicy;
pub use store::{MoveOutcome, RowRef, SheetRow, SheetStore, StoreError};
