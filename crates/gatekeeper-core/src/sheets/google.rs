//! Google Sheets v4 backend.
//!
//! Authenticates as a service account: a signed RS256 assertion is traded
//! for an access token, which is cached until shortly before it expires.

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use moka::future::Cache;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::backend::{BackendError, Row, SheetBackend};

const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const JWT_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Tokens live an hour; refresh well before that
const TOKEN_CACHE_TTL: Duration = Duration::from_secs(50 * 60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const TOKEN_KEY: &str = "access_token";

/// Relevant fields of a service-account key file
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    /// Service account identity
    pub client_email: String,
    /// PEM-encoded RSA private key
    pub private_key: String,
    /// OAuth token endpoint
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    /// Reads a key file.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::Auth` if the file is unreadable or malformed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BackendError::Auth(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    /// Parses key file content.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::Auth` if the JSON lacks the required fields.
    pub fn from_json(raw: &str) -> Result<Self, BackendError> {
        serde_json::from_str(raw).map_err(|e| BackendError::Auth(format!("invalid service account key: {e}")))
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct Spreadsheet {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: i64,
    title: String,
}

#[derive(Deserialize)]
struct BatchUpdateResponse {
    #[serde(default)]
    replies: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

fn cell_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// A1 reference to a whole table, quoting the title.
fn table_range(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}

/// Spreadsheet column letters for a 1-based column index.
fn column_letters(mut column: usize) -> String {
    let mut letters = Vec::new();
    while column > 0 {
        let rem = (column - 1) % 26;
        letters.push(char::from(b'A' + u8::try_from(rem).unwrap_or(0)));
        column = (column - 1) / 26;
    }
    letters.iter().rev().collect()
}

fn map_reqwest(e: &reqwest::Error) -> BackendError {
    if e.is_decode() {
        BackendError::Malformed(e.to_string())
    } else {
        BackendError::Transient(e.to_string())
    }
}

fn classify_status(status: StatusCode, body: String) -> BackendError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        BackendError::Transient(format!("{status}: {body}"))
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        BackendError::Auth(format!("{status}: {body}"))
    } else {
        BackendError::Rejected {
            status: status.as_u16(),
            message: body,
        }
    }
}

/// Backend over the Google Sheets REST API
pub struct GoogleSheetsBackend {
    http: Client,
    spreadsheet_id: String,
    key: ServiceAccountKey,
    tokens: Cache<&'static str, Arc<str>>,
    sheet_ids: RwLock<HashMap<String, i64>>,
}

impl GoogleSheetsBackend {
    /// Creates a backend for one spreadsheet.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::Transient` if the HTTP client cannot be built.
    pub fn new(spreadsheet_id: impl Into<String>, key: ServiceAccountKey) -> Result<Self, BackendError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| map_reqwest(&e))?;
        Ok(Self {
            http,
            spreadsheet_id: spreadsheet_id.into(),
            key,
            tokens: Cache::builder()
                .max_capacity(1)
                .time_to_live(TOKEN_CACHE_TTL)
                .build(),
            sheet_ids: RwLock::new(HashMap::new()),
        })
    }

    async fn access_token(&self) -> Result<Arc<str>, BackendError> {
        if let Some(token) = self.tokens.get(TOKEN_KEY).await {
            return Ok(token);
        }

        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: &self.key.client_email,
            scope: SCOPE,
            aud: &self.key.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        let signing_key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|e| BackendError::Auth(format!("invalid private key: {e}")))?;
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
            .map_err(|e| BackendError::Auth(format!("cannot sign assertion: {e}")))?;

        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_GRANT_TYPE), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| map_reqwest(&e))?;
        let response = Self::check(response).await?;
        let token: TokenResponse = response.json().await.map_err(|e| map_reqwest(&e))?;

        let token: Arc<str> = Arc::from(token.access_token);
        self.tokens.insert(TOKEN_KEY, Arc::clone(&token)).await;
        info!(account = %self.key.client_email, "Obtained spreadsheet access token");
        Ok(token)
    }

    async fn check(response: Response) -> Result<Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BackendError> {
        let token = self.access_token().await?;
        let response = request
            .bearer_auth(token.as_ref())
            .send()
            .await
            .map_err(|e| map_reqwest(&e))?;
        match Self::check(response).await {
            // An expired token is worth one more attempt with a fresh one
            Err(BackendError::Auth(msg)) if msg.starts_with("401") => {
                self.tokens.invalidate(TOKEN_KEY).await;
                Err(BackendError::Transient(msg))
            }
            other => other,
        }
    }

    fn url(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = Url::parse(SHEETS_API).map_err(|e| BackendError::Malformed(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| BackendError::Malformed("base URL cannot have segments".into()))?
            .extend(segments);
        Ok(url)
    }

    fn values_url(&self, range: &str) -> Result<Url, BackendError> {
        self.url(&[&self.spreadsheet_id, "values", range])
    }

    async fn refresh_sheet_ids(&self) -> Result<Vec<String>, BackendError> {
        let mut url = self.url(&[&self.spreadsheet_id])?;
        url.query_pairs_mut()
            .append_pair("fields", "sheets.properties(sheetId,title)");
        let response = self.send(self.http.get(url)).await?;
        let spreadsheet: Spreadsheet = response.json().await.map_err(|e| map_reqwest(&e))?;

        let titles: Vec<String> = spreadsheet
            .sheets
            .iter()
            .map(|s| s.properties.title.clone())
            .collect();
        let mut ids = self.sheet_ids.write().await;
        ids.clear();
        ids.extend(
            spreadsheet
                .sheets
                .into_iter()
                .map(|s| (s.properties.title, s.properties.sheet_id)),
        );
        Ok(titles)
    }

    async fn sheet_id(&self, title: &str) -> Result<i64, BackendError> {
        if let Some(id) = self.sheet_ids.read().await.get(title) {
            return Ok(*id);
        }
        self.refresh_sheet_ids().await?;
        self.sheet_ids
            .read()
            .await
            .get(title)
            .copied()
            .ok_or_else(|| BackendError::TableNotFound(title.to_string()))
    }

    async fn batch_update(&self, requests: serde_json::Value) -> Result<BatchUpdateResponse, BackendError> {
        let url = self.url(&[&format!("{}:batchUpdate", self.spreadsheet_id)])?;
        let response = self
            .send(self.http.post(url).json(&json!({ "requests": requests })))
            .await?;
        response.json().await.map_err(|e| map_reqwest(&e))
    }

    async fn write_range(&self, range: &str, rows: Vec<Row>) -> Result<(), BackendError> {
        let mut url = self.values_url(range)?;
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");
        self.send(self.http.put(url).json(&json!({ "range": range, "values": rows })))
            .await?;
        Ok(())
    }

    fn dimension_range(sheet_id: i64, index: usize) -> serde_json::Value {
        json!({
            "sheetId": sheet_id,
            "dimension": "ROWS",
            "startIndex": index - 1,
            "endIndex": index,
        })
    }

    /// One batch that opens an empty row at `index` and fills it, so a
    /// retry never finds the row opened but still blank.
    fn insert_row_requests(sheet_id: i64, index: usize, row: &[String]) -> serde_json::Value {
        let values: Vec<serde_json::Value> = row
            .iter()
            .map(|cell| json!({ "userEnteredValue": { "stringValue": cell } }))
            .collect();
        json!([
            {
                "insertDimension": {
                    "range": Self::dimension_range(sheet_id, index),
                    "inheritFromBefore": false,
                }
            },
            {
                "updateCells": {
                    "start": { "sheetId": sheet_id, "rowIndex": index - 1, "columnIndex": 0 },
                    "rows": [{ "values": values }],
                    "fields": "userEnteredValue",
                }
            }
        ])
    }
}

#[async_trait]
impl SheetBackend for GoogleSheetsBackend {
    async fn list_tables(&self) -> Result<Vec<String>, BackendError> {
        self.refresh_sheet_ids().await
    }

    async fn open_table(
        &self,
        title: &str,
        headers: &[String],
        rows: u32,
        cols: u32,
    ) -> Result<bool, BackendError> {
        let titles = self.refresh_sheet_ids().await?;
        if titles.iter().any(|t| t == title) {
            return Ok(false);
        }

        let reply = self
            .batch_update(json!([{
                "addSheet": {
                    "properties": {
                        "title": title,
                        "gridProperties": { "rowCount": rows, "columnCount": cols },
                    }
                }
            }]))
            .await?;
        let sheet_id = reply
            .replies
            .first()
            .and_then(|r| r.pointer("/addSheet/properties/sheetId"))
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| BackendError::Malformed("addSheet reply without sheetId".into()))?;
        self.sheet_ids.write().await.insert(title.to_string(), sheet_id);

        self.write_range(&format!("{}!A1", table_range(title)), vec![headers.to_vec()])
            .await?;
        info!(table = title, "Created worksheet");
        Ok(true)
    }

    async fn read_all(&self, title: &str) -> Result<Vec<Row>, BackendError> {
        let mut url = self.values_url(&table_range(title))?;
        url.query_pairs_mut().append_pair("majorDimension", "ROWS");
        let response = match self.send(self.http.get(url)).await {
            Ok(response) => response,
            Err(BackendError::Rejected { status: 400, message }) if message.contains("Unable to parse range") => {
                return Err(BackendError::TableNotFound(title.to_string()));
            }
            Err(e) => return Err(e),
        };
        let range: ValueRange = response.json().await.map_err(|e| map_reqwest(&e))?;
        Ok(range
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_to_string).collect())
            .collect())
    }

    async fn append_row(&self, title: &str, row: Row) -> Result<(), BackendError> {
        let range = format!("{}!A1", table_range(title));
        let mut url = self.url(&[&self.spreadsheet_id, "values", &format!("{range}:append")])?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");
        self.send(self.http.post(url).json(&json!({ "values": [row] })))
            .await?;
        debug!(table = title, "Appended row");
        Ok(())
    }

    async fn insert_row(&self, title: &str, index: usize, row: Row) -> Result<(), BackendError> {
        if index == 0 {
            return Err(BackendError::RowOutOfRange {
                table: title.to_string(),
                row: index,
            });
        }
        let sheet_id = self.sheet_id(title).await?;
        self.batch_update(Self::insert_row_requests(sheet_id, index, &row))
            .await?;
        debug!(table = title, row = index, "Inserted row");
        Ok(())
    }

    async fn update_row(&self, title: &str, index: usize, row: Row) -> Result<(), BackendError> {
        self.write_range(&format!("{}!A{index}", table_range(title)), vec![row])
            .await
    }

    async fn update_cell(
        &self,
        title: &str,
        index: usize,
        column: usize,
        value: String,
    ) -> Result<(), BackendError> {
        let range = format!("{}!{}{index}", table_range(title), column_letters(column));
        self.write_range(&range, vec![vec![value]]).await
    }

    async fn delete_row(&self, title: &str, index: usize) -> Result<(), BackendError> {
        if index == 0 {
            return Err(BackendError::RowOutOfRange {
                table: title.to_string(),
                row: index,
            });
        }
        let sheet_id = self.sheet_id(title).await?;
        self.batch_update(json!([{
            "deleteDimension": { "range": Self::dimension_range(sheet_id, index) }
        }]))
        .await?;
        Ok(())
    }
}
