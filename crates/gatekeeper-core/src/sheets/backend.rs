use async_trait::async_trait;
use thiserror::Error;

/// A raw row of cell values
pub type Row = Vec<String>;

/// Errors reported by a spreadsheet backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// Rate limiting, server errors and network failures
    #[error("transient backend failure: {0}")]
    Transient(String),
    /// The named table does not exist
    #[error("table '{0}' not found")]
    TableNotFound(String),
    /// The row index lies outside the table
    #[error("row {row} is out of range for table '{table}'")]
    RowOutOfRange {
        /// Table title
        table: String,
        /// 1-based row index
        row: usize,
    },
    /// Credentials are missing or were rejected
    #[error("backend authentication failed: {0}")]
    Auth(String),
    /// The request was rejected for a non-transient reason
    #[error("backend rejected the request ({status}): {message}")]
    Rejected {
        /// HTTP-like status code
        status: u16,
        /// Backend message
        message: String,
    },
    /// The backend answered with something unexpected
    #[error("unexpected backend response: {0}")]
    Malformed(String),
}

impl BackendError {
    /// Whether the failed call may succeed when retried
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Low-level access to a spreadsheet made of named tables.
///
/// Row indexes are 1-based; row 1 holds the headers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SheetBackend: Send + Sync {
    /// Lists table titles in spreadsheet order.
    async fn list_tables(&self) -> Result<Vec<String>, BackendError>;

    /// Opens a table, creating it with `headers` as row 1 and the given
    /// capacity when absent. Returns `true` if the table was created.
    async fn open_table(
        &self,
        title: &str,
        headers: &[String],
        rows: u32,
        cols: u32,
    ) -> Result<bool, BackendError>;

    /// Reads every row, headers included.
    async fn read_all(&self, title: &str) -> Result<Vec<Row>, BackendError>;

    /// Appends a row after the last non-empty one.
    async fn append_row(&self, title: &str, row: Row) -> Result<(), BackendError>;

    /// Inserts a row at `index`, shifting the following rows down.
    async fn insert_row(&self, title: &str, index: usize, row: Row) -> Result<(), BackendError>;

    /// Overwrites the row at `index`.
    async fn update_row(&self, title: &str, index: usize, row: Row) -> Result<(), BackendError>;

    /// Overwrites one cell; `column` is 1-based.
    async fn update_cell(
        &self,
        title: &str,
        index: usize,
        column: usize,
        value: String,
    ) -> Result<(), BackendError>;

    /// Deletes the row at `index`, shifting the following rows up.
    async fn delete_row(&self, title: &str, index: usize) -> Result<(), BackendError>;
}
