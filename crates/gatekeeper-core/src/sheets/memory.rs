use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::Mutex;

use super::backend::{BackendError, Row, SheetBackend};

#[derive(Debug, Default)]
struct MemoryState {
    tables: Vec<(String, Vec<Row>)>,
    transient_failures: usize,
    failing_appends: HashSet<String>,
    calls: usize,
}

impl MemoryState {
    fn table_mut(&mut self, title: &str) -> Result<&mut Vec<Row>, BackendError> {
        self.tables
            .iter_mut()
            .find(|(name, _)| name == title)
            .map(|(_, rows)| rows)
            .ok_or_else(|| BackendError::TableNotFound(title.to_string()))
    }

    /// Counts the call and consumes one injected transient failure.
    fn enter(&mut self) -> Result<(), BackendError> {
        self.calls += 1;
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(BackendError::Transient("injected failure".into()));
        }
        Ok(())
    }
}

fn out_of_range(title: &str, row: usize) -> BackendError {
    BackendError::RowOutOfRange {
        table: title.to_string(),
        row,
    }
}

/// Spreadsheet kept in process memory.
///
/// Used for tests and dry runs. Faults can be injected to exercise the
/// retry and abort paths of the store.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    /// Creates an empty spreadsheet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or replaces a table with the given rows.
    pub async fn seed(&self, title: &str, rows: Vec<Row>) {
        let mut state = self.state.lock().await;
        if let Some((_, existing)) = state.tables.iter_mut().find(|(name, _)| name == title) {
            *existing = rows;
        } else {
            state.tables.push((title.to_string(), rows));
        }
    }

    /// Current rows of a table, headers included.
    pub async fn rows(&self, title: &str) -> Option<Vec<Row>> {
        let state = self.state.lock().await;
        state
            .tables
            .iter()
            .find(|(name, _)| name == title)
            .map(|(_, rows)| rows.clone())
    }

    /// Makes the next `count` calls fail with a transient error.
    pub async fn fail_next(&self, count: usize) {
        self.state.lock().await.transient_failures = count;
    }

    /// Makes every append to `title` fail with a permanent error.
    pub async fn fail_appends_to(&self, title: &str) {
        self.state
            .lock()
            .await
            .failing_appends
            .insert(title.to_string());
    }

    /// Lifts a failure set up by [`MemoryBackend::fail_appends_to`].
    pub async fn allow_appends_to(&self, title: &str) {
        self.state.lock().await.failing_appends.remove(title);
    }

    /// Number of backend calls served so far, failed ones included.
    pub async fn call_count(&self) -> usize {
        self.state.lock().await.calls
    }
}

#[async_trait]
impl SheetBackend for MemoryBackend {
    async fn list_tables(&self) -> Result<Vec<String>, BackendError> {
        let mut state = self.state.lock().await;
        state.enter()?;
        Ok(state.tables.iter().map(|(name, _)| name.clone()).collect())
    }

    async fn open_table(
        &self,
        title: &str,
        headers: &[String],
        _rows: u32,
        _cols: u32,
    ) -> Result<bool, BackendError> {
        let mut state = self.state.lock().await;
        state.enter()?;
        if state.table_mut(title).is_ok() {
            return Ok(false);
        }
        state
            .tables
            .push((title.to_string(), vec![headers.to_vec()]));
        Ok(true)
    }

    async fn read_all(&self, title: &str) -> Result<Vec<Row>, BackendError> {
        let mut state = self.state.lock().await;
        state.enter()?;
        state.table_mut(title).map(|rows| rows.clone())
    }

    async fn append_row(&self, title: &str, row: Row) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.enter()?;
        if state.failing_appends.contains(title) {
            return Err(BackendError::Rejected {
                status: 400,
                message: format!("appends to '{title}' are disabled"),
            });
        }
        state.table_mut(title)?.push(row);
        Ok(())
    }

    async fn insert_row(&self, title: &str, index: usize, row: Row) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.enter()?;
        let rows = state.table_mut(title)?;
        if index == 0 || index > rows.len() + 1 {
            return Err(out_of_range(title, index));
        }
        rows.insert(index - 1, row);
        Ok(())
    }

    async fn update_row(&self, title: &str, index: usize, row: Row) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.enter()?;
        let slot = state
            .table_mut(title)?
            .get_mut(index.wrapping_sub(1))
            .ok_or_else(|| out_of_range(title, index))?;
        *slot = row;
        Ok(())
    }

    async fn update_cell(
        &self,
        title: &str,
        index: usize,
        column: usize,
        value: String,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.enter()?;
        if column == 0 {
            return Err(out_of_range(title, index));
        }
        let row = state
            .table_mut(title)?
            .get_mut(index.wrapping_sub(1))
            .ok_or_else(|| out_of_range(title, index))?;
        if row.len() < column {
            row.resize(column, String::new());
        }
        row[column - 1] = value;
        Ok(())
    }

    async fn delete_row(&self, title: &str, index: usize) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.enter()?;
        let rows = state.table_mut(title)?;
        if index == 0 || index > rows.len() {
            return Err(out_of_range(title, index));
        }
        rows.remove(index - 1);
        Ok(())
    }
}
