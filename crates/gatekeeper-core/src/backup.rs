//! Backup export.
//!
//! All tables are written into one in-memory workbook, one worksheet per
//! table in backend order, so an administrator can open or restore it with
//! any spreadsheet tool.

use chrono::{DateTime, Utc};
use rust_xlsxwriter::{Workbook, XlsxError};
use std::collections::HashSet;
use thiserror::Error;

use crate::gateway::OutboundDocument;
use crate::sheets::store::TableSnapshot;
use crate::sheets::{SheetStore, StoreError};

/// Longest worksheet name a workbook accepts
pub const MAX_SHEET_TITLE_CHARS: usize = 31;

const FORBIDDEN_NAME_CHARS: [char; 7] = ['[', ']', ':', '*', '?', '/', '\\'];

/// Errors raised while producing a backup
#[derive(Debug, Error)]
pub enum BackupError {
    /// Reading the tables failed
    #[error("failed to read tables: {0}")]
    Store(#[from] StoreError),
    /// Writing the workbook failed
    #[error("failed to build workbook: {0}")]
    Workbook(#[from] XlsxError),
}

/// File name of a backup taken at `at`.
#[must_use]
pub fn backup_file_name(at: DateTime<Utc>) -> String {
    format!("backup_{}.xlsx", at.format("%Y-%m-%d_%H-%M-%S"))
}

/// Worksheet name for a table title, unique within `used`.
///
/// Characters a workbook rejects become `_`, the name is cut to
/// [`MAX_SHEET_TITLE_CHARS`] and clashes get a `~N` suffix. Names compare
/// case-insensitively, as they do in the workbook.
fn sheet_name(title: &str, used: &mut HashSet<String>) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| if FORBIDDEN_NAME_CHARS.contains(&c) { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim_matches('\'');
    let base: String = cleaned.chars().take(MAX_SHEET_TITLE_CHARS).collect();
    let base = if base.trim().is_empty() { "sheet".to_string() } else { base };
    let mut name = base.clone();
    let mut n = 2;
    while !used.insert(name.to_lowercase()) {
        let suffix = format!("~{n}");
        let keep = MAX_SHEET_TITLE_CHARS.saturating_sub(suffix.chars().count());
        name = base.chars().take(keep).collect::<String>() + &suffix;
        n += 1;
    }
    name
}

/// Writes the snapshots into an xlsx workbook. Empty cells are left unset.
///
/// # Errors
///
/// Returns `XlsxError` if a sheet exceeds the workbook limits or the
/// workbook cannot be serialized.
pub fn build_workbook(snapshots: &[TableSnapshot]) -> Result<Vec<u8>, XlsxError> {
    let mut workbook = Workbook::new();
    let mut used = HashSet::new();
    for snapshot in snapshots {
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(sheet_name(&snapshot.title, &mut used))?;
        for (r, row) in snapshot.rows.iter().enumerate() {
            let r = u32::try_from(r).map_err(|_| XlsxError::RowColumnLimitError)?;
            for (c, value) in row.iter().enumerate() {
                if value.is_empty() {
                    continue;
                }
                let c = u16::try_from(c).map_err(|_| XlsxError::RowColumnLimitError)?;
                worksheet.write_string(r, c, value)?;
            }
        }
    }
    if snapshots.is_empty() {
        workbook.add_worksheet();
    }
    workbook.save_to_buffer()
}

/// Exports every table into a document ready to send.
///
/// # Errors
///
/// Returns `BackupError` if reading the tables or building the workbook fails.
pub async fn export_backup(store: &SheetStore, at: DateTime<Utc>) -> Result<OutboundDocument, BackupError> {
    let snapshots = store.export_all().await?;
    let bytes = build_workbook(&snapshots)?;
    Ok(OutboundDocument {
        file_name: backup_file_name(at),
        bytes,
    })
}
