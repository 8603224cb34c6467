//! Opportunity lifecycle store, raw page archive and HTTP fetch utilities.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oppbot_core::{Category, Opportunity, StoredOpportunity};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "oppbot-storage";

pub const DEFAULT_UNPROCESSED_LIMIT: usize = 15;

// ----------------- LIFECYCLE STORE -----------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid table name `{0}` (expected [A-Za-z_][A-Za-z0-9_]*)")]
    InvalidTableName(String),
    #[error("row {id} has unrecognised category `{value}`")]
    UnknownCategory { id: i64, value: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub inserted: usize,
    pub skipped: usize,
}

#[async_trait]
pub trait OpportunityStore: Send + Sync {
    async fn create_schema(&self) -> Result<(), StoreError>;

    async fn ingest(&self, records: &[Opportunity]) -> Result<IngestSummary, StoreError>;

    async fn list_unprocessed(
        &self,
        category: Option<Category>,
        limit: usize,
    ) -> Result<Vec<StoredOpportunity>, StoreError>;

    async fn list_all(&self) -> Result<Vec<StoredOpportunity>, StoreError>;

    /// Matches by surrogate id, so two categories sharing employer/title/location
    /// are never flipped together.
    async fn mark_processed(&self, records: &[StoredOpportunity]) -> Result<u64, StoreError>;

    async fn reset_processed(&self, limit: Option<usize>) -> Result<u64, StoreError>;

    async fn delete_category(&self, category: Category) -> Result<u64, StoreError>;
}

pub fn validate_table_name(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_head && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(StoreError::InvalidTableName(name.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct PgOpportunityStore {
    pool: PgPool,
    table: String,
}

impl PgOpportunityStore {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self, StoreError> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self { pool, table })
    }

    pub async fn connect(database_url: &str, table: impl Into<String>) -> Result<Self, StoreError> {
        let table = table.into();
        validate_table_name(&table)?;
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Ok(Self { pool, table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn select_columns(&self) -> String {
        format!(
            "SELECT id, employer, title, location, url, processed, category, created_at FROM {}",
            self.table
        )
    }
}

fn row_to_stored(row: &PgRow) -> Result<StoredOpportunity, StoreError> {
    let id: i64 = row.try_get("id")?;
    let category_text: String = row.try_get("category")?;
    let category = category_text
        .parse::<Category>()
        .map_err(|_| StoreError::UnknownCategory {
            id,
            value: category_text.clone(),
        })?;
    Ok(StoredOpportunity {
        id,
        created_at: row.try_get("created_at")?,
        opportunity: Opportunity {
            employer: row.try_get("employer")?,
            title: row.try_get("title")?,
            location: row.try_get("location")?,
            url: row.try_get("url")?,
            processed: row.try_get("processed")?,
            category,
        },
    })
}

#[async_trait]
impl OpportunityStore for PgOpportunityStore {
    async fn create_schema(&self) -> Result<(), StoreError> {
        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id BIGSERIAL PRIMARY KEY,
                employer TEXT NOT NULL,
                title TEXT NOT NULL,
                location TEXT NOT NULL,
                url TEXT NOT NULL,
                processed BOOLEAN NOT NULL DEFAULT FALSE,
                category TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            table = self.table
        );
        let create_index = format!(
            "CREATE INDEX IF NOT EXISTS {table}_identity_idx ON {table} (employer, title, location, category)",
            table = self.table
        );
        sqlx::query(&create_table).execute(&self.pool).await?;
        sqlx::query(&create_index).execute(&self.pool).await?;
        info!(table = %self.table, "opportunity schema ready");
        Ok(())
    }

    async fn ingest(&self, records: &[Opportunity]) -> Result<IngestSummary, StoreError> {
        let exists_sql = format!(
            "SELECT 1 FROM {} WHERE employer = $1 AND title = $2 AND location = $3 AND category = $4 LIMIT 1",
            self.table
        );
        let insert_sql = format!(
            "INSERT INTO {} (employer, title, location, url, processed, category) VALUES ($1, $2, $3, $4, FALSE, $5)",
            self.table
        );

        let mut summary = IngestSummary::default();
        let mut tx = self.pool.begin().await?;
        for record in records {
            let existing = sqlx::query(&exists_sql)
                .bind(&record.employer)
                .bind(&record.title)
                .bind(&record.location)
                .bind(record.category.as_str())
                .fetch_optional(&mut *tx)
                .await?;
            if existing.is_some() {
                summary.skipped += 1;
                continue;
            }
            sqlx::query(&insert_sql)
                .bind(&record.employer)
                .bind(&record.title)
                .bind(&record.location)
                .bind(&record.url)
                .bind(record.category.as_str())
                .execute(&mut *tx)
                .await?;
            summary.inserted += 1;
        }
        tx.commit().await?;

        debug!(
            table = %self.table,
            inserted = summary.inserted,
            skipped = summary.skipped,
            "ingested opportunities"
        );
        Ok(summary)
    }

    async fn list_unprocessed(
        &self,
        category: Option<Category>,
        limit: usize,
    ) -> Result<Vec<StoredOpportunity>, StoreError> {
        let sql = format!(
            "{} WHERE processed = FALSE AND ($1::text IS NULL OR category = $1) ORDER BY id LIMIT $2",
            self.select_columns()
        );
        let rows = sqlx::query(&sql)
            .bind(category.map(Category::as_str))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_stored).collect()
    }

    async fn list_all(&self) -> Result<Vec<StoredOpportunity>, StoreError> {
        let sql = format!("{} ORDER BY id", self.select_columns());
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_stored).collect()
    }

    async fn mark_processed(&self, records: &[StoredOpportunity]) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let ids = records.iter().map(|r| r.id).collect::<Vec<_>>();
        let sql = format!(
            "UPDATE {} SET processed = TRUE WHERE id = ANY($1)",
            self.table
        );
        let result = sqlx::query(&sql).bind(ids).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn reset_processed(&self, limit: Option<usize>) -> Result<u64, StoreError> {
        // LIMIT NULL means no limit in Postgres.
        let sql = format!(
            "UPDATE {table} SET processed = FALSE WHERE id IN \
             (SELECT id FROM {table} WHERE processed = TRUE ORDER BY id LIMIT $1)",
            table = self.table
        );
        let result = sqlx::query(&sql)
            .bind(limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX)))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_category(&self, category: Category) -> Result<u64, StoreError> {
        let sql = format!("DELETE FROM {} WHERE category = $1", self.table);
        let result = sqlx::query(&sql)
            .bind(category.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    rows: Vec<StoredOpportunity>,
}

#[derive(Debug, Default)]
pub struct MemoryOpportunityStore {
    state: Mutex<MemoryState>,
}

impl MemoryOpportunityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OpportunityStore for MemoryOpportunityStore {
    async fn create_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn ingest(&self, records: &[Opportunity]) -> Result<IngestSummary, StoreError> {
        let mut state = self.state.lock().await;
        let mut summary = IngestSummary::default();
        for record in records {
            if state
                .rows
                .iter()
                .any(|row| row.opportunity.same_identity(record))
            {
                summary.skipped += 1;
                continue;
            }
            state.next_id += 1;
            let id = state.next_id;
            state.rows.push(StoredOpportunity {
                id,
                created_at: Utc::now(),
                opportunity: Opportunity {
                    processed: false,
                    ..record.clone()
                },
            });
            summary.inserted += 1;
        }
        Ok(summary)
    }

    async fn list_unprocessed(
        &self,
        category: Option<Category>,
        limit: usize,
    ) -> Result<Vec<StoredOpportunity>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .iter()
            .filter(|row| !row.opportunity.processed)
            .filter(|row| category.map_or(true, |c| row.opportunity.category == c))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<StoredOpportunity>, StoreError> {
        Ok(self.state.lock().await.rows.clone())
    }

    async fn mark_processed(&self, records: &[StoredOpportunity]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut updated = 0;
        for row in state.rows.iter_mut() {
            if records.iter().any(|r| r.id == row.id) {
                row.opportunity.processed = true;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn reset_processed(&self, limit: Option<usize>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let limit = limit.unwrap_or(usize::MAX);
        let mut updated = 0;
        for row in state
            .rows
            .iter_mut()
            .filter(|row| row.opportunity.processed)
            .take(limit)
        {
            row.opportunity.processed = false;
            updated += 1;
        }
        Ok(updated)
    }

    async fn delete_category(&self, category: Category) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.rows.len();
        state.rows.retain(|row| row.opportunity.category != category);
        Ok((before - state.rows.len()) as u64)
    }
}

// ----------------- RAW PAGE ARCHIVE -----------------

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn extension_for(content_type: &str) -> &'static str {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "text/html" => "html",
            "application/json" => "json",
            "text/plain" => "txt",
            _ => "bin",
        }
    }

    pub fn page_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
        content_type: &str,
    ) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(source_id)
            .join(format!("{content_hash}.{}", Self::extension_for(content_type)))
    }

    /// Write `bytes` under its hash; an existing file with the same hash is reused.
    pub async fn archive_page(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.page_relative_path(fetched_at, source_id, &content_hash, content_type);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let archived = |deduplicated| ArchivedPage {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    return Ok(archived(true));
                }
                Err(err).with_context(|| {
                    format!(
                        "renaming temp archive file {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

// ----------------- RETRY POLICY -----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else if let Some(status) = err.status() {
        classify_status(status)
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure<E> {
    pub last_error: E,
    pub attempts: usize,
    pub exhausted: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Run `operation` (given the 1-based attempt number) until it succeeds,
    /// fails with an error `is_retryable` rejects, or attempts run out.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        mut operation: F,
        is_retryable: P,
    ) -> Result<Attempted<T>, RetryFailure<E>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    })
                }
                Err(err) if !is_retryable(&err) => {
                    warn!(attempt, error = %err, "non-retryable failure");
                    return Err(RetryFailure {
                        last_error: err,
                        attempts: attempt,
                        exhausted: false,
                    });
                }
                Err(err) if attempt >= max_attempts => {
                    warn!(attempt, max_attempts, error = %err, "retry budget exhausted");
                    return Err(RetryFailure {
                        last_error: err,
                        attempts: attempt,
                        exhausted: true,
                    });
                }
                Err(err) => {
                    warn!(attempt, max_attempts, error = %err, "retryable failure");
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

// ----------------- HTTP FETCH -----------------

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        async {
            let mut request = self.client.get(url);
            for (name, value) in headers {
                request = request.header(*name, *value);
            }
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/octet-stream")
                .to_string();
            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), %status, "fetched");
            Ok::<_, FetchError>(FetchedResponse {
                status,
                final_url,
                content_type,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
