use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use super::backend::{BackendError, Row, SheetBackend};
use super::limiter::RateLimiter;
use super::retry::RetryPolicy;
use crate::config::{CoreSettings, NEW_TABLE_COLS, NEW_TABLE_ROWS};
use crate::records::{
    normalize_invite_link, InviteLink, JoinRequest, Record, RecordError, Subscriber, Table,
};

/// Errors returned by [`SheetStore`]
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend call failed, after retries for transient errors
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// The table has no header row to project rows onto
    #[error("table '{0}' has no header row")]
    MissingHeaders(String),
    /// A lookup names a column the table does not have
    #[error("table '{table}' has no column '{column}'")]
    MissingColumn {
        /// Table title
        table: String,
        /// Requested column
        column: String,
    },
    /// A row could not be decoded into a record
    #[error("row {row} of table '{table}' is invalid: {source}")]
    InvalidRow {
        /// Table title
        table: String,
        /// 1-based row index
        row: usize,
        /// Decoding failure
        source: RecordError,
    },
}

/// 1-based index of a row in its table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowRef(pub usize);

/// A data row addressed by column name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetRow {
    row_ref: RowRef,
    headers: Arc<[String]>,
    values: Vec<String>,
}

impl SheetRow {
    /// Wraps raw values read at `index` under `headers`.
    #[must_use]
    pub fn new(index: usize, headers: Arc<[String]>, values: Vec<String>) -> Self {
        Self {
            row_ref: RowRef(index),
            headers,
            values,
        }
    }

    /// Builds a detached row holding the cells of `record`.
    #[must_use]
    pub fn from_record<R: Record>(record: &R, headers: Vec<String>) -> Self {
        let values = project_cells(&record.to_cells(), &headers);
        Self::new(0, headers.into(), values)
    }

    /// Position of the row in its table
    #[must_use]
    pub const fn row_ref(&self) -> RowRef {
        self.row_ref
    }

    /// Cell under `column`, `None` if the table has no such column.
    ///
    /// Cells past the end of a short row read as empty.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&str> {
        let idx = self.headers.iter().position(|h| h == column)?;
        Some(self.values.get(idx).map_or("", String::as_str))
    }

    /// Overwrites the cell under `column`. Returns `false` if there is no
    /// such column.
    pub fn set(&mut self, column: &str, value: impl Into<String>) -> bool {
        let Some(idx) = self.headers.iter().position(|h| h == column) else {
            return false;
        };
        if self.values.len() <= idx {
            self.values.resize(idx + 1, String::new());
        }
        self.values[idx] = value.into();
        true
    }

    /// Values reordered onto `headers`; absent columns become empty cells.
    #[must_use]
    pub fn project(&self, headers: &[String]) -> Row {
        headers
            .iter()
            .map(|h| self.get(h).unwrap_or_default().to_string())
            .collect()
    }

    /// Whether every cell is blank
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.values.iter().all(|v| v.trim().is_empty())
    }

    /// Whether both rows hold the same trimmed cells, ignoring position.
    #[must_use]
    pub fn same_cells(&self, other: &Self) -> bool {
        trim_trailing_empty(&self.values) == trim_trailing_empty(&other.values)
    }

    /// Decodes the row into a record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidRow` carrying the decoding failure.
    pub fn decode<R: Record>(&self) -> Result<R, StoreError> {
        R::from_row(self).map_err(|source| StoreError::InvalidRow {
            table: R::TABLE.title().to_string(),
            row: self.row_ref.0,
            source,
        })
    }
}

/// Result of [`SheetStore::move_rows`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MoveOutcome {
    /// Rows written to the destination, appended or merged
    pub copied: usize,
    /// Destination rows rewritten in place by key
    pub merged: usize,
    /// Rows removed from the source
    pub deleted: usize,
    /// Source rows whose deletion failed; they are still in place
    pub failed_deletes: Vec<RowRef>,
    /// Matched rows that were no longer in the source when deleting
    pub vanished: usize,
}

/// Raw content of one table, used by exports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSnapshot {
    /// Table title
    pub title: String,
    /// Every row, headers included
    pub rows: Vec<Row>,
}

fn project_cells(cells: &[(&'static str, String)], headers: &[String]) -> Row {
    headers
        .iter()
        .map(|h| {
            cells
                .iter()
                .find(|(name, _)| name == h)
                .map(|(_, value)| value.clone())
                .unwrap_or_default()
        })
        .collect()
}

/// Current positions of `expected` rows within `current`.
///
/// A row is looked up at its old position first, then anywhere else; each
/// current row is claimed at most once. Returns the positions found and the
/// number of rows that are gone.
fn locate_rows(expected: &[SheetRow], current: &[SheetRow]) -> (Vec<RowRef>, usize) {
    let mut taken = HashSet::new();
    let mut vanished = 0;
    for row in expected {
        let free = |c: &&SheetRow| !taken.contains(&c.row_ref()) && c.same_cells(row);
        let found = current
            .iter()
            .filter(free)
            .find(|c| c.row_ref() == row.row_ref())
            .or_else(|| current.iter().find(free))
            .map(SheetRow::row_ref);
        match found {
            Some(row_ref) => {
                taken.insert(row_ref);
            }
            None => vanished += 1,
        }
    }
    (taken.into_iter().collect(), vanished)
}

fn trim_trailing_empty(row: &[String]) -> Vec<String> {
    let len = row
        .iter()
        .rposition(|c| !c.trim().is_empty())
        .map_or(0, |idx| idx + 1);
    row[..len].iter().map(|c| c.trim().to_string()).collect()
}

/// Header-aware access to the spreadsheet tables.
///
/// Every backend call goes through the shared [`RateLimiter`] and is retried
/// on transient failures according to the [`RetryPolicy`].
///
/// Edits that read positions and then write by position hold a per-table
/// lock, see [`SheetStore::lock_table`].
pub struct SheetStore {
    backend: Arc<dyn SheetBackend>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    table_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SheetStore {
    /// Creates a store over `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn SheetBackend>, limiter: RateLimiter, retry: RetryPolicy) -> Self {
        Self {
            backend,
            limiter,
            retry,
            table_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a store configured from settings.
    #[must_use]
    pub fn from_settings(backend: Arc<dyn SheetBackend>, settings: &CoreSettings) -> Self {
        Self::new(
            backend,
            RateLimiter::new(settings.sheets_api_delay()),
            settings.retry_policy(),
        )
    }

    async fn call<T, F, Fut>(&self, label: &str, op: F) -> Result<T, BackendError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let op = &op;
        self.retry
            .run(label, || async move {
                self.limiter.acquire().await;
                op().await
            })
            .await
    }

    /// Serializes read-then-write sequences on `table` within this process.
    ///
    /// Row positions read while the guard is held stay valid until it is
    /// dropped, provided every writer that shifts or keys rows of `table`
    /// takes the same lock. The lock is not reentrant.
    pub async fn lock_table(&self, table: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.table_locks.lock().await;
            Arc::clone(locks.entry(table.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    async fn lock_tables(&self, tables: &[&str]) -> Vec<OwnedMutexGuard<()>> {
        let mut names = tables.to_vec();
        names.sort_unstable();
        names.dedup();
        let mut guards = Vec::with_capacity(names.len());
        for name in names {
            guards.push(self.lock_table(name).await);
        }
        guards
    }

    /// Makes sure `table` exists with `headers` as its first row.
    ///
    /// A missing table is created; a first row that differs from `headers`
    /// is replaced in place so data rows below keep their positions.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if a backend call fails.
    pub async fn ensure_table(&self, table: &str, headers: &[String]) -> Result<Vec<String>, StoreError> {
        let created = self
            .call("open_table", || {
                self.backend
                    .open_table(table, headers, NEW_TABLE_ROWS, NEW_TABLE_COLS)
            })
            .await?;
        if created {
            info!(table, "Created table");
            return Ok(headers.to_vec());
        }

        let rows = self.call("read_all", || self.backend.read_all(table)).await?;
        match rows.first() {
            None => {
                info!(table, "Table is empty, writing headers");
                self.call("insert_row", || {
                    self.backend.insert_row(table, 1, headers.to_vec())
                })
                .await?;
            }
            Some(first) if trim_trailing_empty(first) != headers => {
                warn!(table, found = ?first, "Header row diverges, replacing it");
                let mut replacement = headers.to_vec();
                if replacement.len() < first.len() {
                    replacement.resize(first.len(), String::new());
                }
                self.call("update_row", || {
                    self.backend.update_row(table, 1, replacement.clone())
                })
                .await?;
            }
            Some(_) => debug!(table, "Headers up to date"),
        }
        Ok(headers.to_vec())
    }

    /// Ensures the schema of one of the known tables.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if a backend call fails.
    pub async fn ensure_schema(&self, table: Table) -> Result<Vec<String>, StoreError> {
        self.ensure_table(table.title(), &table.headers()).await
    }

    /// Ensures the schema of every known table.
    ///
    /// # Errors
    ///
    /// Returns the first failure.
    pub async fn ensure_all(&self) -> Result<(), StoreError> {
        for table in Table::ALL {
            self.ensure_schema(table).await?;
        }
        Ok(())
    }

    /// Reads the first row of `table` with trailing empty cells dropped.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the table cannot be read.
    pub async fn read_headers(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let rows = self.call("read_all", || self.backend.read_all(table)).await?;
        Ok(rows.first().map(|r| trim_trailing_empty(r)).unwrap_or_default())
    }

    /// Reads every data row of `table`. Blank rows are skipped and a missing
    /// table reads as empty.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the table cannot be read.
    pub async fn read_rows(&self, table: &str) -> Result<Vec<SheetRow>, StoreError> {
        let rows = match self.call("read_all", || self.backend.read_all(table)).await {
            Ok(rows) => rows,
            Err(BackendError::TableNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut rows = rows.into_iter();
        let Some(header_row) = rows.next() else {
            return Ok(Vec::new());
        };
        let headers: Arc<[String]> = trim_trailing_empty(&header_row).into();
        Ok(rows
            .enumerate()
            .map(|(offset, values)| SheetRow::new(offset + 2, Arc::clone(&headers), values))
            .filter(|row| !row.is_blank())
            .collect())
    }

    /// Appends `record` to its table, projected onto the current headers.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if a backend call fails.
    pub async fn append_row<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let title = R::TABLE.title();
        let headers = self.ensure_schema(R::TABLE).await?;
        let row = project_cells(&record.to_cells(), &headers);
        self.call("append_row", || self.backend.append_row(title, row.clone()))
            .await?;
        debug!(table = title, "Appended row");
        Ok(())
    }

    /// Rewrites the row at `row_ref` with `record`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if a backend call fails.
    pub async fn update_row<R: Record>(&self, row_ref: RowRef, record: &R) -> Result<(), StoreError> {
        let title = R::TABLE.title();
        let headers = self.ensure_schema(R::TABLE).await?;
        let row = project_cells(&record.to_cells(), &headers);
        self.call("update_row", || {
            self.backend.update_row(title, row_ref.0, row.clone())
        })
        .await?;
        Ok(())
    }

    /// First row whose trimmed `column` equals the trimmed `value`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::MissingColumn` if the table has headers but not
    /// `column`, or `StoreError::Backend` if the read fails.
    pub async fn find_row(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<Option<SheetRow>, StoreError> {
        let rows = self.read_rows(table).await?;
        let Some(first) = rows.first() else {
            return Ok(None);
        };
        if first.get(column).is_none() {
            return Err(StoreError::MissingColumn {
                table: table.to_string(),
                column: column.to_string(),
            });
        }
        let value = value.trim();
        Ok(rows
            .into_iter()
            .find(|row| row.get(column).is_some_and(|cell| cell.trim() == value)))
    }

    /// Overwrites a single cell.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::MissingColumn` if the headers lack `column`, or
    /// `StoreError::Backend` if a backend call fails.
    pub async fn update_cell(
        &self,
        table: &str,
        row_ref: RowRef,
        column: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let headers = self.read_headers(table).await?;
        let idx = headers
            .iter()
            .position(|h| h == column)
            .ok_or_else(|| StoreError::MissingColumn {
                table: table.to_string(),
                column: column.to_string(),
            })?;
        self.call("update_cell", || {
            self.backend
                .update_cell(table, row_ref.0, idx + 1, value.to_string())
        })
        .await?;
        Ok(())
    }

    /// Moves the rows matching `predicate` from `source` into `dest`.
    ///
    /// See [`SheetStore::move_rows_with`].
    ///
    /// # Errors
    ///
    /// Same as [`SheetStore::move_rows_with`].
    pub async fn move_rows<P>(
        &self,
        source: &str,
        dest: Option<&str>,
        predicate: P,
    ) -> Result<MoveOutcome, StoreError>
    where
        P: Fn(&SheetRow) -> bool,
    {
        self.move_rows_with(source, dest, predicate, |_| {}).await
    }

    /// Copies the rows matching `predicate` into `dest`, after `rewrite`,
    /// then deletes them from `source` highest index first. With no `dest`
    /// the rows are only deleted.
    ///
    /// Both tables stay locked for the whole sequence. Just before deleting,
    /// the source is read again and every moved row is located by its cells,
    /// so rows shifted by another writer are still removed at their new
    /// position and rows already gone are only counted as `vanished`.
    ///
    /// A failed copy aborts before anything is deleted, so a row is never
    /// lost; at worst it is duplicated. Failed deletes are reported in the
    /// outcome and do not stop the remaining deletes.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::MissingHeaders` if `dest` has no header row, or
    /// `StoreError::Backend` if reading or copying fails.
    pub async fn move_rows_with<P, W>(
        &self,
        source: &str,
        dest: Option<&str>,
        predicate: P,
        rewrite: W,
    ) -> Result<MoveOutcome, StoreError>
    where
        P: Fn(&SheetRow) -> bool,
        W: Fn(&mut SheetRow),
    {
        let dest = dest.map(|table| (table, None));
        self.transfer(source, dest, predicate, rewrite).await
    }

    /// Like [`SheetStore::move_rows_with`], but a copied row whose `key`
    /// cell matches an existing `dest` row is merged into that row instead
    /// of being appended. Non-empty cells of the copy win; empty ones keep
    /// the existing value.
    ///
    /// # Errors
    ///
    /// Same as [`SheetStore::move_rows_with`].
    pub async fn upsert_rows_with<P, W>(
        &self,
        source: &str,
        dest: &str,
        key: &str,
        predicate: P,
        rewrite: W,
    ) -> Result<MoveOutcome, StoreError>
    where
        P: Fn(&SheetRow) -> bool,
        W: Fn(&mut SheetRow),
    {
        self.transfer(source, Some((dest, Some(key))), predicate, rewrite)
            .await
    }

    async fn transfer<P, W>(
        &self,
        source: &str,
        dest: Option<(&str, Option<&str>)>,
        predicate: P,
        rewrite: W,
    ) -> Result<MoveOutcome, StoreError>
    where
        P: Fn(&SheetRow) -> bool,
        W: Fn(&mut SheetRow),
    {
        let mut tables = vec![source];
        tables.extend(dest.map(|(table, _)| table));
        let _guards = self.lock_tables(&tables).await;

        let matching: Vec<SheetRow> = self
            .read_rows(source)
            .await?
            .into_iter()
            .filter(|row| predicate(row))
            .collect();
        let mut outcome = MoveOutcome::default();
        if matching.is_empty() {
            return Ok(outcome);
        }

        if let Some((dest, key)) = dest {
            self.copy_rows(&matching, dest, key, &rewrite, &mut outcome)
                .await?;
        }

        let current = self.read_rows(source).await?;
        let (mut refs, vanished) = locate_rows(&matching, &current);
        outcome.vanished = vanished;
        if vanished > 0 {
            warn!(table = source, vanished, "Moved rows disappeared from the source");
        }
        refs.sort_unstable_by(|a, b| b.cmp(a));
        for row_ref in refs {
            match self
                .call("delete_row", || self.backend.delete_row(source, row_ref.0))
                .await
            {
                Ok(()) => outcome.deleted += 1,
                Err(e) => {
                    error!(table = source, row = row_ref.0, error = %e, "Failed to delete moved row");
                    outcome.failed_deletes.push(row_ref);
                }
            }
        }
        info!(
            source,
            dest = dest.map_or("-", |(table, _)| table),
            copied = outcome.copied,
            merged = outcome.merged,
            deleted = outcome.deleted,
            "Moved rows"
        );
        Ok(outcome)
    }

    /// Writes rewritten copies of `rows` into `dest`, merging by `key`
    /// when one is given.
    async fn copy_rows<W>(
        &self,
        rows: &[SheetRow],
        dest: &str,
        key: Option<&str>,
        rewrite: &W,
        outcome: &mut MoveOutcome,
    ) -> Result<(), StoreError>
    where
        W: Fn(&mut SheetRow),
    {
        let dest_headers = self.read_headers(dest).await?;
        if dest_headers.is_empty() {
            return Err(StoreError::MissingHeaders(dest.to_string()));
        }
        let mut existing = HashMap::new();
        if let Some(key) = key {
            for row in self.read_rows(dest).await? {
                let cell = row.get(key).unwrap_or_default().trim().to_string();
                if !cell.is_empty() {
                    existing.entry(cell).or_insert(row);
                }
            }
        }
        let mut written = HashSet::new();
        for row in rows {
            let mut row = row.clone();
            rewrite(&mut row);
            let key_cell = key.map(|key| row.get(key).unwrap_or_default().trim().to_string());
            if let Some(cell) = key_cell.filter(|cell| !cell.is_empty()) {
                if !written.insert(cell.clone()) {
                    debug!(table = dest, key = %cell, "Skipping second copy of the same key");
                    continue;
                }
                if let Some(current) = existing.get(&cell) {
                    let mut merged = current.clone();
                    for header in &dest_headers {
                        if let Some(value) = row.get(header).filter(|v| !v.trim().is_empty()) {
                            merged.set(header, value);
                        }
                    }
                    let values = merged.project(&dest_headers);
                    let index = current.row_ref().0;
                    self.call("update_row", || {
                        self.backend.update_row(dest, index, values.clone())
                    })
                    .await?;
                    outcome.copied += 1;
                    outcome.merged += 1;
                    continue;
                }
            }
            let values = row.project(&dest_headers);
            self.call("append_row", || self.backend.append_row(dest, values.clone()))
                .await?;
            outcome.copied += 1;
        }
        Ok(())
    }

    /// Decodes every row of a typed table, skipping rows that fail to decode.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the read fails.
    pub async fn records<R: Record>(&self) -> Result<Vec<(RowRef, R)>, StoreError> {
        let rows = self.read_rows(R::TABLE.title()).await?;
        Ok(rows
            .iter()
            .filter_map(|row| match row.decode::<R>() {
                Ok(record) => Some((row.row_ref(), record)),
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable row");
                    None
                }
            })
            .collect())
    }

    /// Pending join requests for `channel_id`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the read fails.
    pub async fn pending_requests(&self, channel_id: i64) -> Result<Vec<JoinRequest>, StoreError> {
        Ok(self
            .records::<JoinRequest>()
            .await?
            .into_iter()
            .map(|(_, request)| request)
            .filter(|request| request.channel_id == channel_id)
            .collect())
    }

    /// Invite links of a channel. Rows without a `channel_id` fall back to
    /// matching on the channel title.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the read fails.
    pub async fn invite_links_for_channel(
        &self,
        channel_id: i64,
        channel_name: &str,
    ) -> Result<Vec<InviteLink>, StoreError> {
        Ok(self
            .records::<InviteLink>()
            .await?
            .into_iter()
            .map(|(_, link)| link)
            .filter(|link| match link.channel_id {
                Some(id) => id == channel_id,
                None => link.channel_name == channel_name,
            })
            .collect())
    }

    /// Subscribers that joined through the link named `link_name`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the read fails.
    pub async fn subscribers_for_link(&self, link_name: &str) -> Result<Vec<Subscriber>, StoreError> {
        Ok(self
            .records::<Subscriber>()
            .await?
            .into_iter()
            .map(|(_, sub)| sub)
            .filter(|sub| sub.link_name.as_deref() == Some(link_name))
            .collect())
    }

    /// Looks up an invite link in any of its accepted spellings.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the read fails.
    pub async fn find_invite_link(&self, link: &str) -> Result<Option<(RowRef, InviteLink)>, StoreError> {
        let wanted = normalize_invite_link(link);
        Ok(self
            .records::<InviteLink>()
            .await?
            .into_iter()
            .find(|(_, row)| normalize_invite_link(&row.link) == wanted))
    }

    /// Reads every table, in backend order.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if listing or reading fails.
    pub async fn export_all(&self) -> Result<Vec<TableSnapshot>, StoreError> {
        let titles = self.call("list_tables", || self.backend.list_tables()).await?;
        let mut snapshots = Vec::with_capacity(titles.len());
        for title in titles {
            let rows = self
                .call("read_all", || self.backend.read_all(&title))
                .await?;
            snapshots.push(TableSnapshot { title, rows });
        }
        Ok(snapshots)
    }

    /// Verifies the backend is reachable.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if listing tables fails.
    pub async fn check_connection(&self) -> Result<usize, StoreError> {
        Ok(self
            .call("list_tables", || self.backend.list_tables())
            .await?
            .len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheets::backend::MockSheetBackend;
    use crate::sheets::memory::MemoryBackend;
    use crate::testing::{row, test_store};
    use std::time::Duration;

    fn headers(cells: &[&str]) -> Vec<String> {
        row(cells)
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_table_creates_and_is_idempotent() {
        let (backend, store) = test_store();
        let h = headers(&["id", "name"]);
        assert!(store.ensure_table("T", &h).await.is_ok());
        assert!(store.ensure_table("T", &h).await.is_ok());
        assert_eq!(backend.rows("T").await, Some(vec![h.clone()]));
        assert!(matches!(store.read_headers("T").await, Ok(found) if found == h));
    }

    #[tokio::test(start_paused = true)]
    async fn divergent_headers_are_replaced_and_data_kept() {
        let (backend, store) = test_store();
        backend
            .seed(
                "T",
                vec![row(&["id", "old", "extra"]), row(&["1", "a", "x"]), row(&["2", "b", "y"])],
            )
            .await;
        let h = headers(&["id", "name"]);
        assert!(store.ensure_table("T", &h).await.is_ok());
        let rows = backend.rows("T").await.unwrap_or_default();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], row(&["id", "name", ""]));
        assert_eq!(rows[1], row(&["1", "a", "x"]));
        assert!(matches!(store.read_headers("T").await, Ok(found) if found == h));
    }

    #[tokio::test(start_paused = true)]
    async fn headerless_table_gets_headers() {
        let (backend, store) = test_store();
        backend.seed("T", Vec::new()).await;
        let h = headers(&["id"]);
        assert!(store.ensure_table("T", &h).await.is_ok());
        assert_eq!(backend.rows("T").await, Some(vec![h]));
    }

    #[tokio::test(start_paused = true)]
    async fn find_row_matches_trimmed_values() {
        let (backend, store) = test_store();
        backend
            .seed("T", vec![row(&["id", "name"]), row(&["1", " alice "]), row(&["2", "bob"])])
            .await;
        let found = store.find_row("T", "name", "alice").await;
        assert!(matches!(found, Ok(Some(ref r)) if r.row_ref() == RowRef(2)));
        assert!(matches!(store.find_row("T", "name", "carol").await, Ok(None)));
        assert!(matches!(
            store.find_row("T", "missing", "x").await,
            Err(StoreError::MissingColumn { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn update_cell_addresses_column_by_name() {
        let (backend, store) = test_store();
        backend
            .seed("T", vec![row(&["id", "status"]), row(&["1", "active"])])
            .await;
        assert!(store.update_cell("T", RowRef(2), "status", "inactive").await.is_ok());
        assert_eq!(
            backend.rows("T").await.and_then(|r| r.get(1).cloned()),
            Some(row(&["1", "inactive"]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn move_rows_copies_then_deletes_descending() {
        let (backend, store) = test_store();
        backend
            .seed(
                "Src",
                vec![row(&["id", "tag"]), row(&["1", "x"]), row(&["2", "y"]), row(&["3", "x"])],
            )
            .await;
        backend.seed("Dst", vec![row(&["tag", "id", "note"])]).await;

        let outcome = store
            .move_rows("Src", Some("Dst"), |r| r.get("tag") == Some("x"))
            .await;
        assert!(matches!(outcome, Ok(ref o) if o.copied == 2 && o.deleted == 2));
        assert_eq!(
            backend.rows("Src").await,
            Some(vec![row(&["id", "tag"]), row(&["2", "y"])])
        );
        assert_eq!(
            backend.rows("Dst").await,
            Some(vec![
                row(&["tag", "id", "note"]),
                row(&["x", "1", ""]),
                row(&["x", "3", ""]),
            ])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_copy_leaves_source_untouched() {
        let (backend, store) = test_store();
        let source = vec![row(&["id"]), row(&["1"]), row(&["2"])];
        backend.seed("Src", source.clone()).await;
        backend.seed("Dst", vec![row(&["id"])]).await;
        backend.fail_appends_to("Dst").await;

        let result = store.move_rows("Src", Some("Dst"), |_| true).await;
        assert!(matches!(result, Err(StoreError::Backend(BackendError::Rejected { .. }))));
        assert_eq!(backend.rows("Src").await, Some(source));
    }

    #[tokio::test(start_paused = true)]
    async fn move_without_dest_only_deletes() {
        let (backend, store) = test_store();
        backend
            .seed("Src", vec![row(&["id"]), row(&["1"]), row(&["2"]), row(&["3"])])
            .await;
        let outcome = store
            .move_rows("Src", None, |r| r.get("id") != Some("2"))
            .await;
        assert!(matches!(outcome, Ok(ref o) if o.copied == 0 && o.deleted == 2));
        assert_eq!(backend.rows("Src").await, Some(vec![row(&["id"]), row(&["2"])]));
    }

    #[tokio::test(start_paused = true)]
    async fn rewrite_applies_to_copies_only() {
        let (backend, store) = test_store();
        backend
            .seed("Src", vec![row(&["id", "status"]), row(&["1", "pending"])])
            .await;
        backend.seed("Dst", vec![row(&["id", "status"])]).await;
        let outcome = store
            .move_rows_with("Src", Some("Dst"), |_| true, |r| {
                r.set("status", "active");
            })
            .await;
        assert!(outcome.is_ok());
        assert_eq!(
            backend.rows("Dst").await,
            Some(vec![row(&["id", "status"]), row(&["1", "active"])])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_moves_from_one_table_delete_the_right_rows() {
        let backend = Arc::new(MemoryBackend::new());
        let store = SheetStore::new(
            backend.clone(),
            RateLimiter::new(Duration::from_millis(10)),
            RetryPolicy::default(),
        );
        backend
            .seed(
                "Src",
                vec![
                    row(&["id", "tag"]),
                    row(&["1", "x"]),
                    row(&["2", "y"]),
                    row(&["3", "x"]),
                    row(&["4", "y"]),
                    row(&["5", "z"]),
                    row(&["6", "z"]),
                ],
            )
            .await;

        let (xs, ys) = tokio::join!(
            store.move_rows("Src", None, |r| r.get("tag") == Some("x")),
            store.move_rows("Src", None, |r| r.get("tag") == Some("y")),
        );
        assert!(matches!(xs, Ok(ref o) if o.deleted == 2 && o.vanished == 0));
        assert!(matches!(ys, Ok(ref o) if o.deleted == 2 && o.vanished == 0));
        assert_eq!(
            backend.rows("Src").await,
            Some(vec![row(&["id", "tag"]), row(&["5", "z"]), row(&["6", "z"])])
        );
    }

    #[tokio::test]
    async fn rows_shifted_by_another_writer_are_deleted_where_they_are_now() {
        let mut backend = MockSheetBackend::new();
        let mut reads = 0;
        backend.expect_read_all().times(2).returning(move |_| {
            reads += 1;
            if reads == 1 {
                return Ok(vec![
                    row(&["id", "tag"]),
                    row(&["1", "x"]),
                    row(&["2", "y"]),
                    row(&["3", "x"]),
                ]);
            }
            // A row was inserted on top and 3 was removed in the meantime
            Ok(vec![
                row(&["id", "tag"]),
                row(&["0", "q"]),
                row(&["1", "x"]),
                row(&["2", "y"]),
            ])
        });
        backend
            .expect_delete_row()
            .withf(|title, index| title == "Src" && *index == 3)
            .times(1)
            .returning(|_, _| Ok(()));
        let store = SheetStore::new(
            Arc::new(backend),
            RateLimiter::new(Duration::ZERO),
            RetryPolicy::default(),
        );

        let outcome = store
            .move_rows("Src", None, |r| r.get("tag") == Some("x"))
            .await;
        assert!(matches!(outcome, Ok(ref o) if o.deleted == 1 && o.vanished == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn upsert_merges_into_the_row_with_the_same_key() {
        let (backend, store) = test_store();
        backend
            .seed(
                "Src",
                vec![row(&["id", "status", "note"]), row(&["1", "pending", ""]), row(&["2", "pending", ""])],
            )
            .await;
        backend
            .seed(
                "Dst",
                vec![row(&["id", "status", "note"]), row(&["1", "inactive", "vip"])],
            )
            .await;

        let outcome = store
            .upsert_rows_with("Src", "Dst", "id", |_| true, |r| {
                r.set("status", "active");
            })
            .await;
        assert!(matches!(outcome, Ok(ref o) if o.copied == 2 && o.merged == 1 && o.deleted == 2));
        assert_eq!(
            backend.rows("Dst").await,
            Some(vec![
                row(&["id", "status", "note"]),
                row(&["1", "active", "vip"]),
                row(&["2", "active", ""]),
            ])
        );
        assert_eq!(backend.rows("Src").await, Some(vec![row(&["id", "status", "note"])]));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_absorbed() {
        let (backend, store) = test_store();
        backend.fail_next(2).await;
        assert!(matches!(store.check_connection().await, Ok(0)));
        assert_eq!(backend.call_count().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn every_call_is_rate_limited() {
        let backend = Arc::new(MemoryBackend::new());
        let store = SheetStore::new(
            backend.clone(),
            RateLimiter::new(Duration::from_millis(1500)),
            RetryPolicy::default(),
        );
        let start = tokio::time::Instant::now();
        for _ in 0..3 {
            assert!(store.check_connection().await.is_ok());
        }
        assert!(start.elapsed() >= Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn invite_lookup_accepts_short_forms() {
        let (_, store) = test_store();
        let link = InviteLink {
            name: "spring".into(),
            link: "https://t.me/+AbC".into(),
            creator_id: Some(1),
            channel_name: "News".into(),
            created_at: chrono::DateTime::default(),
            is_revoked: false,
            channel_id: Some(-100),
        };
        assert!(store.append_row(&link).await.is_ok());
        let found = store.find_invite_link("+AbC").await;
        assert!(matches!(found, Ok(Some((RowRef(2), ref l))) if l.name == "spring"));
        let by_channel = store.invite_links_for_channel(-100, "ignored").await;
        assert!(matches!(by_channel, Ok(ref links) if links.len() == 1));
    }

    #[tokio::test]
    async fn read_of_missing_table_is_empty() {
        let mut backend = MockSheetBackend::new();
        backend
            .expect_read_all()
            .times(1)
            .returning(|title| Err(BackendError::TableNotFound(title.to_string())));
        let store = SheetStore::new(
            Arc::new(backend),
            RateLimiter::new(Duration::ZERO),
            RetryPolicy::default(),
        );
        assert!(matches!(store.read_rows("Nope").await, Ok(rows) if rows.is_empty()));
    }
}
