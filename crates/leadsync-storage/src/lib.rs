//! Store clients for lead expiry sync: a retrying REST reader and the Postgres lead store.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use leadsync_core::{MatchStrategy, PauseTransition};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use thiserror::Error;
use tracing::{debug, warn};

pub use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
pub use reqwest::Url;

pub const CRATE_NAME: &str = "leadsync-storage";

const ERROR_BODY_PREVIEW_CHARS: usize = 300;

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
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Doubles per attempt, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub default_headers: HeaderMap,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(format!("leadsync/{}", env!("CARGO_PKG_VERSION"))),
            default_headers: HeaderMap::new(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("decoding response body from {url}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Read-only JSON-over-HTTP client. Idempotent GETs are retried on transient failures.
#[derive(Debug, Clone)]
pub struct RestClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl RestClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(config.default_headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &Url,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.get(url.clone()).query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.bytes().await?;
                        debug!(%url, bytes = body.len(), "rest page received");
                        return serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                            url: url.to_string(),
                            source,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        warn!(%url, status = status.as_u16(), attempt, "retrying rest request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                        body: body.chars().take(ERROR_BODY_PREVIEW_CHARS).collect(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        warn!(%url, error = %err, attempt, "retrying rest request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

/// Letters, digits and underscores, not starting with a digit.
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0:?} is not a plain SQL identifier")]
    InvalidIdentifier(String),
    #[error("connecting to lead store")]
    Connect(#[source] sqlx::Error),
    #[error("{operation} by {strategy} failed")]
    Statement {
        operation: &'static str,
        strategy: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("lead store transaction {stage} failed")]
    Transaction {
        stage: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

/// Destination writes the reconciler needs. Each call reports the number of rows it touched.
#[async_trait]
pub trait LeadStore: Send {
    async fn set_expiration(
        &mut self,
        by: &MatchStrategy,
        expiration_date: NaiveDate,
    ) -> Result<u64, StoreError>;

    /// Moves matching rows whose status is in `transition.from_statuses` to `transition.to_status`.
    async fn pause(
        &mut self,
        by: &MatchStrategy,
        transition: &PauseTransition,
    ) -> Result<u64, StoreError>;
}

/// A [`LeadStore`] whose writes become visible only on commit.
#[async_trait]
pub trait TransactionalLeadStore: LeadStore + Sized {
    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// Table and column names of the leads table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadTable {
    pub table: String,
    pub primary_column: String,
    pub email_column: String,
    pub end_date_column: String,
    pub status_column: String,
}

impl Default for LeadTable {
    fn default() -> Self {
        Self {
            table: "karmafy_lead".to_string(),
            primary_column: "apwId".to_string(),
            email_column: "email".to_string(),
            end_date_column: "endDate".to_string(),
            status_column: "status".to_string(),
        }
    }
}

impl LeadTable {
    pub fn validate(&self) -> Result<(), StoreError> {
        for name in [
            &self.table,
            &self.primary_column,
            &self.email_column,
            &self.end_date_column,
            &self.status_column,
        ] {
            if !is_plain_identifier(name) {
                return Err(StoreError::InvalidIdentifier(name.clone()));
            }
        }
        Ok(())
    }

    pub fn statements(&self, primary_kind: PrimaryColumnKind) -> Result<LeadStatements, StoreError> {
        self.validate()?;
        let table = quote_ident(&self.table);
        let primary = quote_ident(&self.primary_column);
        let email = quote_ident(&self.email_column);
        let end_date = quote_ident(&self.end_date_column);
        let status = quote_ident(&self.status_column);

        let by_primary = match primary_kind {
            PrimaryColumnKind::Text => format!("{primary} = $2"),
            PrimaryColumnKind::Other => format!("CAST({primary} AS text) = $2"),
        };
        let by_email = format!("lower({email}) = lower($2)");
        let status_guard = format!("CAST({status} AS text) = ANY($3)");

        Ok(LeadStatements {
            set_expiration_by_primary: format!(
                "UPDATE {table} SET {end_date} = $1 WHERE {by_primary}"
            ),
            set_expiration_by_email: format!("UPDATE {table} SET {end_date} = $1 WHERE {by_email}"),
            pause_by_primary: format!(
                "UPDATE {table} SET {status} = $1 WHERE {by_primary} AND {status_guard}"
            ),
            pause_by_email: format!(
                "UPDATE {table} SET {status} = $1 WHERE {by_email} AND {status_guard}"
            ),
        })
    }
}

/// How the lead primary column is compared with the text identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryColumnKind {
    /// Compared directly, so an index on the column applies.
    Text,
    /// Cast to text before comparing; numeric ids stay matchable but the column is scanned.
    Other,
}

impl PrimaryColumnKind {
    /// Classifies a `format_type` rendering such as `text` or `character varying(64)`.
    pub fn from_sql_type(sql_type: &str) -> Self {
        let sql_type = sql_type.trim().to_ascii_lowercase();
        if sql_type == "text" || sql_type == "citext" || sql_type.starts_with("character varying")
        {
            Self::Text
        } else {
            Self::Other
        }
    }
}

/// Parameterized update statements rendered for one [`LeadTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadStatements {
    pub set_expiration_by_primary: String,
    pub set_expiration_by_email: String,
    pub pause_by_primary: String,
    pub pause_by_email: String,
}

/// The reconciler drives one connection sequentially, so the pool holds a single connection.
pub async fn connect_lead_pool(database_url: &str) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(15))
        .connect(database_url)
        .await
        .map_err(StoreError::Connect)
}

/// Postgres lead store scoped to one transaction. Nothing is visible to other sessions
/// until it is committed.
pub struct PgLeadStore {
    tx: Transaction<'static, Postgres>,
    statements: LeadStatements,
}

impl PgLeadStore {
    pub async fn begin(pool: &PgPool, table: &LeadTable) -> Result<Self, StoreError> {
        table.validate()?;
        let mut tx = pool.begin().await.map_err(|source| StoreError::Transaction {
            stage: "begin",
            source,
        })?;
        let primary_kind = primary_column_kind(&mut tx, table).await?;
        debug!(column = %table.primary_column, ?primary_kind, "lead primary column");
        let statements = table.statements(primary_kind)?;
        Ok(Self { tx, statements })
    }
}

/// Unknown tables or columns fall back to [`PrimaryColumnKind::Other`]; the update statements
/// then report the real error.
async fn primary_column_kind(
    tx: &mut Transaction<'static, Postgres>,
    table: &LeadTable,
) -> Result<PrimaryColumnKind, StoreError> {
    let sql_type: Option<String> = sqlx::query_scalar(
        "SELECT format_type(a.atttypid, a.atttypmod) FROM pg_attribute a \
         WHERE a.attrelid = to_regclass($1) AND a.attname = $2 AND NOT a.attisdropped",
    )
    .bind(quote_ident(&table.table))
    .bind(&table.primary_column)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|source| StoreError::Transaction {
        stage: "inspect primary column",
        source,
    })?;
    Ok(sql_type
        .as_deref()
        .map_or(PrimaryColumnKind::Other, PrimaryColumnKind::from_sql_type))
}

#[async_trait]
impl LeadStore for PgLeadStore {
    async fn set_expiration(
        &mut self,
        by: &MatchStrategy,
        expiration_date: NaiveDate,
    ) -> Result<u64, StoreError> {
        let (sql, key) = match by {
            MatchStrategy::ByPrimary(id) => (&self.statements.set_expiration_by_primary, id),
            MatchStrategy::ByEmail(email) => (&self.statements.set_expiration_by_email, email),
        };
        let result = sqlx::query(sql)
            .bind(expiration_date)
            .bind(key)
            .execute(&mut *self.tx)
            .await
            .map_err(|source| StoreError::Statement {
                operation: "set expiration",
                strategy: by.to_string(),
                source,
            })?;
        Ok(result.rows_affected())
    }

    async fn pause(
        &mut self,
        by: &MatchStrategy,
        transition: &PauseTransition,
    ) -> Result<u64, StoreError> {
        let (sql, key) = match by {
            MatchStrategy::ByPrimary(id) => (&self.statements.pause_by_primary, id),
            MatchStrategy::ByEmail(email) => (&self.statements.pause_by_email, email),
        };
        let result = sqlx::query(sql)
            .bind(&transition.to_status)
            .bind(key)
            .bind(&transition.from_statuses)
            .execute(&mut *self.tx)
            .await
            .map_err(|source| StoreError::Statement {
                operation: "pause",
                strategy: by.to_string(),
                source,
            })?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TransactionalLeadStore for PgLeadStore {
    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(|source| StoreError::Transaction {
            stage: "commit",
            source,
        })
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(|source| StoreError::Transaction {
            stage: "rollback",
            source,
        })
    }
}
