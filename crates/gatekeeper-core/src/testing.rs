//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::time::Duration;

use crate::gateway::MockChannelGateway;
use crate::sheets::memory::MemoryBackend;
use crate::sheets::{RateLimiter, RetryPolicy, SheetStore};
use crate::workflow::{AccessPolicy, WorkflowContext};

pub const ADMIN: i64 = 1001;
pub const OUTSIDER: i64 = 666;
pub const CHANNEL: i64 = -100_123;

pub fn row(cells: &[&str]) -> Vec<String> {
    cells.iter().map(|c| (*c).to_string()).collect()
}

/// Memory-backed store without throttling.
pub fn test_store() -> (Arc<MemoryBackend>, SheetStore) {
    let backend = Arc::new(MemoryBackend::new());
    let store = SheetStore::new(
        backend.clone(),
        RateLimiter::new(Duration::ZERO),
        RetryPolicy::default(),
    );
    (backend, store)
}

/// Gateway mock that answers title lookups for any channel.
pub fn gateway_with_titles() -> MockChannelGateway {
    let mut gateway = MockChannelGateway::new();
    gateway
        .expect_channel_title()
        .returning(|id| Ok(if id == CHANNEL { "News".to_string() } else { format!("Channel {id}") }));
    gateway
}

pub fn context_shared(store: Arc<SheetStore>, gateway: MockChannelGateway) -> WorkflowContext {
    WorkflowContext::new(
        store,
        Arc::new(gateway),
        Arc::new(AccessPolicy::new([ADMIN], vec![CHANNEL])),
    )
}

pub fn context(store: SheetStore, gateway: MockChannelGateway) -> WorkflowContext {
    context_shared(Arc::new(store), gateway)
}
