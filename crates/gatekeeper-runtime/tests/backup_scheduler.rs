use async_trait::async_trait;
use gatekeeper_core::gateway::{
    ChannelGateway, CreatedInviteLink, GatewayError, InviteLinkSpec, OutboundDocument,
};
use gatekeeper_core::sheets::memory::MemoryBackend;
use gatekeeper_core::sheets::{RateLimiter, RetryPolicy, SheetStore};
use gatekeeper_runtime::backup::EXPORT_FAILED_NOTICE;
use gatekeeper_runtime::{spawn_backup_scheduler, BackupConfig, BackupScheduler};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Records delivered documents and texts; optionally cancels a token on
/// first send.
#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<(i64, OutboundDocument)>>,
    texts: Mutex<Vec<(i64, String)>>,
    cancel_on_send: Option<CancellationToken>,
}

impl Outbox {
    fn recipients(&self) -> Vec<i64> {
        self.sent
            .lock()
            .map(|sent| sent.iter().map(|(r, _)| *r).collect())
            .unwrap_or_default()
    }

    fn texts(&self) -> Vec<(i64, String)> {
        self.texts.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChannelGateway for Outbox {
    async fn channel_title(&self, channel_id: i64) -> Result<String, GatewayError> {
        Ok(channel_id.to_string())
    }

    async fn create_invite_link(&self, _spec: InviteLinkSpec) -> Result<CreatedInviteLink, GatewayError> {
        Err(GatewayError::Rejected("unused".into()))
    }

    async fn revoke_invite_link(&self, _channel_id: i64, _link: &str) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn approve_join_request(&self, _channel_id: i64, _user_id: i64) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn decline_join_request(&self, _channel_id: i64, _user_id: i64) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn send_text(&self, recipient: i64, text: &str) -> Result<(), GatewayError> {
        if let Ok(mut texts) = self.texts.lock() {
            texts.push((recipient, text.to_string()));
        }
        Ok(())
    }

    async fn send_document(&self, recipient: i64, document: OutboundDocument) -> Result<(), GatewayError> {
        if let Some(token) = &self.cancel_on_send {
            token.cancel();
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((recipient, document));
        }
        Ok(())
    }
}

fn row(cells: &[&str]) -> Vec<String> {
    cells.iter().map(|c| (*c).to_string()).collect()
}

async fn seeded_store(max_attempts: usize) -> (Arc<MemoryBackend>, Arc<SheetStore>) {
    let backend = Arc::new(MemoryBackend::new());
    backend.seed("Subscribers", vec![row(&["id", "full_name"]), row(&["1", "Ada"])]).await;
    backend.seed("InviteLinks", vec![row(&["name", "link"])]).await;
    let store = SheetStore::new(
        backend.clone(),
        RateLimiter::new(Duration::ZERO),
        RetryPolicy {
            max_attempts,
            ..RetryPolicy::default()
        },
    );
    (backend, Arc::new(store))
}

fn config(recipients: Vec<i64>) -> BackupConfig {
    BackupConfig {
        interval: Duration::from_secs(8 * 60 * 60),
        recipients,
    }
}

#[tokio::test(start_paused = true)]
async fn tick_sends_workbook_to_every_admin() {
    let (_, store) = seeded_store(5).await;
    let outbox = Arc::new(Outbox::default());
    let scheduler = BackupScheduler::new(store, outbox.clone(), config(vec![1, 2]));

    let report = scheduler.tick(&CancellationToken::new()).await;
    assert!(report.exported);
    assert_eq!(report.delivered, 2);
    assert_eq!(outbox.recipients(), vec![1, 2]);

    let sent = outbox.sent.lock().map(|s| s[0].1.clone());
    let Ok(document) = sent else {
        panic!("outbox poisoned");
    };
    assert!(document.file_name.starts_with("backup_"));
    assert!(document.file_name.ends_with(".xlsx"));
    assert!(document.bytes.starts_with(b"PK"));
    assert!(outbox.texts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_export_is_skipped_and_loop_continues() {
    let (backend, store) = seeded_store(1).await;
    backend.fail_next(1).await;
    let outbox = Arc::new(Outbox::default());
    let scheduler = BackupScheduler::new(store, outbox.clone(), config(vec![1]));
    let cancel = CancellationToken::new();
    let handle = spawn_backup_scheduler(scheduler, cancel.clone());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(outbox.recipients().is_empty());
    assert_eq!(outbox.texts(), vec![(1, EXPORT_FAILED_NOTICE.to_string())]);

    tokio::time::sleep(Duration::from_secs(8 * 60 * 60)).await;
    assert_eq!(outbox.recipients(), vec![1]);

    cancel.cancel();
    assert!(handle.await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_the_wait() {
    let (_, store) = seeded_store(5).await;
    let outbox = Arc::new(Outbox::default());
    let scheduler = BackupScheduler::new(store, outbox.clone(), config(vec![1]));
    let cancel = CancellationToken::new();
    let handle = spawn_backup_scheduler(scheduler, cancel.clone());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(outbox.recipients(), vec![1]);
    cancel.cancel();

    let joined = tokio::time::timeout(Duration::from_secs(1), handle).await;
    assert!(matches!(joined, Ok(Ok(()))));
    assert_eq!(outbox.recipients(), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn no_send_starts_after_cancellation() {
    let (_, store) = seeded_store(5).await;
    let cancel = CancellationToken::new();
    let outbox = Arc::new(Outbox {
        cancel_on_send: Some(cancel.clone()),
        ..Outbox::default()
    });
    let scheduler = BackupScheduler::new(store, outbox.clone(), config(vec![1, 2, 3]));

    let report = scheduler.tick(&cancel).await;
    assert_eq!(report.delivered, 1);
    assert_eq!(report.skipped, 2);
    assert_eq!(outbox.recipients(), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn failed_export_is_reported_to_every_admin() {
    let (backend, store) = seeded_store(1).await;
    backend.fail_next(1).await;
    let outbox = Arc::new(Outbox::default());
    let scheduler = BackupScheduler::new(store, outbox.clone(), config(vec![1, 2]));

    let report = scheduler.tick(&CancellationToken::new()).await;
    assert!(!report.exported);
    assert_eq!(report.notified, 2);
    assert_eq!(report.delivered, 0);
    assert!(outbox.recipients().is_empty());
    let notified: Vec<i64> = outbox.texts().into_iter().map(|(r, _)| r).collect();
    assert_eq!(notified, vec![1, 2]);
}
