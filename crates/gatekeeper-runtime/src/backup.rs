//! Periodic backup delivery.
//!
//! Exports every table and sends the workbook to each administrator, once at
//! start-up and then on a fixed interval. A failed export is reported to the
//! same recipients as a short notice.

use chrono::Utc;
use gatekeeper_core::backup::export_backup;
use gatekeeper_core::gateway::ChannelGateway;
use gatekeeper_core::sheets::SheetStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Sent instead of the workbook when the export fails
pub const EXPORT_FAILED_NOTICE: &str =
    "⚠️ The scheduled backup could not be created. It will be retried at the next interval.";

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Time between two ticks
    pub interval: Duration,
    /// Recipients of every backup
    pub recipients: Vec<i64>,
}

/// What a single tick achieved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Whether the export succeeded
    pub exported: bool,
    /// Recipients that received the file
    pub delivered: usize,
    /// Recipients the send failed for
    pub failed: usize,
    /// Recipients skipped because of cancellation
    pub skipped: usize,
    /// Recipients told that the export failed
    pub notified: usize,
}

/// Exports the spreadsheet and delivers it to administrators.
pub struct BackupScheduler {
    store: Arc<SheetStore>,
    gateway: Arc<dyn ChannelGateway>,
    config: BackupConfig,
}

impl BackupScheduler {
    /// Create a scheduler.
    #[must_use]
    pub fn new(store: Arc<SheetStore>, gateway: Arc<dyn ChannelGateway>, config: BackupConfig) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    /// Runs one export and delivery round.
    ///
    /// Cancellation is checked before each send; a send already started
    /// runs to completion.
    pub async fn tick(&self, cancel: &CancellationToken) -> TickReport {
        let mut report = TickReport::default();
        let document = match export_backup(&self.store, Utc::now()).await {
            Ok(document) => document,
            Err(e) => {
                error!(error = %e, "Backup export failed");
                self.notify_failure(cancel, &mut report).await;
                return report;
            }
        };
        report.exported = true;
        info!(file = %document.file_name, bytes = document.bytes.len(), "Backup exported");

        for (idx, &recipient) in self.config.recipients.iter().enumerate() {
            if cancel.is_cancelled() {
                report.skipped = self.config.recipients.len() - idx;
                warn!(skipped = report.skipped, "Backup delivery interrupted by shutdown");
                break;
            }
            match self.gateway.send_document(recipient, document.clone()).await {
                Ok(()) => {
                    report.delivered += 1;
                    info!(recipient, "Backup delivered");
                }
                Err(e) => {
                    report.failed += 1;
                    error!(recipient, error = %e, "Backup delivery failed");
                }
            }
        }
        report
    }

    async fn notify_failure(&self, cancel: &CancellationToken, report: &mut TickReport) {
        for (idx, &recipient) in self.config.recipients.iter().enumerate() {
            if cancel.is_cancelled() {
                report.skipped = self.config.recipients.len() - idx;
                break;
            }
            match self.gateway.send_text(recipient, EXPORT_FAILED_NOTICE).await {
                Ok(()) => report.notified += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(recipient, error = %e, "Failed to report backup failure");
                }
            }
        }
    }

    /// Ticks immediately, then every interval, until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            recipients = self.config.recipients.len(),
            "Backup scheduler started"
        );
        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.tick(&cancel).await;
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.interval) => {}
            }
        }
        info!("Backup scheduler stopped");
    }
}

/// Spawn the backup scheduler on the Tokio runtime.
pub fn spawn_backup_scheduler(scheduler: BackupScheduler, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(scheduler.run(cancel))
}
