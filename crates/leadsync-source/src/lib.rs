//! Transaction source contract + the Supabase (PostgREST) implementation.

use std::future::Future;

use async_trait::async_trait;
use leadsync_core::TransactionRecord;
use leadsync_storage::{
    is_plain_identifier, FetchError, HeaderMap, HeaderName, HeaderValue, HttpClientConfig,
    RestClient, Url,
};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "leadsync-source";

pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid source configuration: {0}")]
    Config(String),
    #[error("reading {table} at offset {offset}")]
    Fetch {
        table: String,
        offset: usize,
        #[source]
        source: FetchError,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Read side of the reconciliation: every transaction row, unreduced.
#[async_trait]
pub trait TransactionSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_all(&self) -> Result<Vec<TransactionRecord>, SourceError>;
}

/// Table and column names of the transactions table.
///
/// Without a `primary_column` rows are keyed by email alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionTable {
    pub table: String,
    pub primary_column: Option<String>,
    pub email_column: String,
    pub expiration_column: String,
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self {
            table: "jobboard_transactions".to_string(),
            primary_column: None,
            email_column: "email".to_string(),
            expiration_column: "plan_ended".to_string(),
        }
    }
}

impl TransactionTable {
    pub fn validate(&self) -> Result<(), SourceError> {
        let names = [&self.table, &self.email_column, &self.expiration_column]
            .into_iter()
            .chain(self.primary_column.as_ref());
        for name in names {
            if !is_plain_identifier(name) {
                return Err(SourceError::Config(format!(
                    "{name:?} is not a plain table or column name"
                )));
            }
        }
        Ok(())
    }

    fn columns(&self) -> Vec<&str> {
        let mut columns = vec![self.expiration_column.as_str()];
        columns.extend(self.primary_column.as_deref());
        columns.push(self.email_column.as_str());
        columns
    }

    fn select(&self) -> String {
        self.columns().join(",")
    }

    /// Orders by every selected column so offset paging walks a stable sequence.
    fn order(&self) -> String {
        self.columns()
            .iter()
            .map(|column| format!("{column}.asc.nullslast"))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn record_from_row(&self, row: &Map<String, JsonValue>) -> TransactionRecord {
        TransactionRecord {
            identity_primary: self
                .primary_column
                .as_ref()
                .and_then(|column| scalar_as_string(row.get(column))),
            identity_secondary: scalar_as_string(row.get(&self.email_column)),
            expiration_date: scalar_as_string(row.get(&self.expiration_column)),
        }
    }
}

/// Numeric identifiers are stringified; null, missing and structured values map to `None`.
fn scalar_as_string(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct SupabaseSourceConfig {
    pub url: String,
    pub service_key: String,
    pub table: TransactionTable,
    pub page_size: usize,
    pub http: HttpClientConfig,
}

pub struct SupabaseTransactionSource {
    client: RestClient,
    endpoint: Url,
    table: TransactionTable,
    page_size: usize,
}

impl SupabaseTransactionSource {
    pub fn new(config: SupabaseSourceConfig) -> Result<Self, SourceError> {
        config.table.validate()?;
        if config.page_size == 0 {
            return Err(SourceError::Config("page size must be positive".to_string()));
        }
        let endpoint = rest_endpoint(&config.url, &config.table.table)?;

        let mut http = config.http;
        http.default_headers.extend(auth_headers(&config.service_key)?);
        let client = RestClient::new(http)?;

        Ok(Self {
            client,
            endpoint,
            table: config.table,
            page_size: config.page_size,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn page_query(&self, offset: usize) -> Vec<(&'static str, String)> {
        vec![
            ("select", self.table.select()),
            ("order", self.table.order()),
            ("limit", self.page_size.to_string()),
            ("offset", offset.to_string()),
        ]
    }

    async fn fetch_page(&self, offset: usize) -> Result<Vec<TransactionRecord>, SourceError> {
        let rows: Vec<Map<String, JsonValue>> = self
            .client
            .get_json(&self.endpoint, &self.page_query(offset))
            .await
            .map_err(|source| SourceError::Fetch {
                table: self.table.table.clone(),
                offset,
                source,
            })?;
        debug!(table = %self.table.table, offset, rows = rows.len(), "fetched transaction page");
        Ok(rows.iter().map(|row| self.table.record_from_row(row)).collect())
    }
}

#[async_trait]
impl TransactionSource for SupabaseTransactionSource {
    fn source_id(&self) -> &str {
        &self.table.table
    }

    async fn fetch_all(&self) -> Result<Vec<TransactionRecord>, SourceError> {
        let records = drain_pages(|offset| self.fetch_page(offset)).await?;
        info!(table = %self.table.table, rows = records.len(), "fetched transactions");
        Ok(records)
    }
}

/// Requests pages until one comes back empty.
///
/// The server may cap a page below the requested limit (PostgREST `max-rows`), so a short page
/// does not mean the table is exhausted.
pub async fn drain_pages<F, Fut>(
    mut fetch_page: F,
) -> Result<Vec<TransactionRecord>, SourceError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<Vec<TransactionRecord>, SourceError>>,
{
    let mut records = Vec::new();
    let mut offset = 0usize;
    loop {
        let page = fetch_page(offset).await?;
        if page.is_empty() {
            return Ok(records);
        }
        offset += page.len();
        records.extend(page);
    }
}

pub fn rest_endpoint(base_url: &str, table: &str) -> Result<Url, SourceError> {
    let mut base = Url::parse(base_url.trim())
        .map_err(|err| SourceError::Config(format!("invalid source url {base_url:?}: {err}")))?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(&format!("rest/v1/{table}"))
        .map_err(|err| SourceError::Config(format!("building endpoint for {table}: {err}")))
}

fn auth_headers(service_key: &str) -> Result<HeaderMap, SourceError> {
    let mut api_key = HeaderValue::from_str(service_key).map_err(|_| invalid_key())?;
    api_key.set_sensitive(true);
    let mut bearer =
        HeaderValue::from_str(&format!("Bearer {service_key}")).map_err(|_| invalid_key())?;
    bearer.set_sensitive(true);

    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("apikey"), api_key);
    headers.insert(HeaderName::from_static("authorization"), bearer);
    Ok(headers)
}

fn invalid_key() -> SourceError {
    SourceError::Config("service key contains invalid header characters".to_string())
}

/// Fixed, in-memory transaction rows.
#[derive(Debug, Clone, Default)]
pub struct StaticTransactionSource {
    records: Vec<TransactionRecord>,
}

impl StaticTransactionSource {
    pub fn new(records: Vec<TransactionRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl TransactionSource for StaticTransactionSource {
    fn source_id(&self) -> &str {
        "static"
    }

    async fn fetch_all(&self) -> Result<Vec<TransactionRecord>, SourceError> {
        Ok(self.records.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(n: usize) -> TransactionRecord {
        TransactionRecord {
            identity_primary: Some(format!("A{n}")),
            identity_secondary: None,
            expiration_date: Some("2024-01-01".into()),
        }
    }

    #[test]
    fn endpoint_joins_rest_path_with_or_without_trailing_slash() {
        let a = rest_endpoint("https://abc.supabase.co", "jobboard_transactions").unwrap();
        let b = rest_endpoint("https://abc.supabase.co/", "jobboard_transactions").unwrap();
        assert_eq!(a.as_str(), "https://abc.supabase.co/rest/v1/jobboard_transactions");
        assert_eq!(a, b);
        assert!(matches!(
            rest_endpoint("not a url", "t"),
            Err(SourceError::Config(_))
        ));
    }

    #[test]
    fn rows_map_configured_columns_and_stringify_numeric_ids() {
        let table = TransactionTable {
            primary_column: Some("apw_id".into()),
            ..TransactionTable::default()
        };
        let row = json!({"apw_id": 4411, "email": "A@B.com", "plan_ended": "2024-01-10T00:00:00+00:00"});
        let record = table.record_from_row(row.as_object().unwrap());
        assert_eq!(record.identity_primary.as_deref(), Some("4411"));
        assert_eq!(record.identity_secondary.as_deref(), Some("A@B.com"));
        assert_eq!(
            record.expiration_date.as_deref(),
            Some("2024-01-10T00:00:00+00:00")
        );

        let sparse = json!({"apw_id": null, "email": "x@y.io"});
        let record = table.record_from_row(sparse.as_object().unwrap());
        assert_eq!(record.identity_primary, None);
        assert_eq!(record.expiration_date, None);
    }

    #[test]
    fn email_only_table_ignores_primary_values() {
        let table = TransactionTable::default();
        assert_eq!(table.primary_column, None);
        let row = json!({"apw_id": 4411, "email": "a@b.com", "plan_ended": "2024-01-10"});
        let record = table.record_from_row(row.as_object().unwrap());
        assert_eq!(record.identity_primary, None);
        assert_eq!(record.identity_secondary.as_deref(), Some("a@b.com"));
    }

    fn source_for(table: TransactionTable) -> SupabaseTransactionSource {
        SupabaseTransactionSource::new(SupabaseSourceConfig {
            url: "https://abc.supabase.co".into(),
            service_key: "service-key".into(),
            table,
            page_size: 500,
            http: HttpClientConfig::default(),
        })
        .expect("source")
    }

    #[test]
    fn page_query_selects_and_orders_by_configured_columns() {
        let source = source_for(TransactionTable {
            primary_column: Some("apw_id".into()),
            ..TransactionTable::default()
        });
        let query = source.page_query(1500);
        assert_eq!(query[0], ("select", "plan_ended,apw_id,email".to_string()));
        assert_eq!(
            query[1],
            (
                "order",
                "plan_ended.asc.nullslast,apw_id.asc.nullslast,email.asc.nullslast".to_string()
            )
        );
        assert_eq!(query[2], ("limit", "500".to_string()));
        assert_eq!(query[3], ("offset", "1500".to_string()));
    }

    #[test]
    fn email_only_page_query_never_names_a_primary_column() {
        let query = source_for(TransactionTable::default()).page_query(0);
        assert_eq!(query[0], ("select", "plan_ended,email".to_string()));
        assert_eq!(
            query[1],
            (
                "order",
                "plan_ended.asc.nullslast,email.asc.nullslast".to_string()
            )
        );
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let base = SupabaseSourceConfig {
            url: "https://abc.supabase.co".into(),
            service_key: "k".into(),
            table: TransactionTable::default(),
            page_size: 10,
            http: HttpClientConfig::default(),
        };
        let zero_page = SupabaseSourceConfig {
            page_size: 0,
            ..base.clone()
        };
        assert!(matches!(
            SupabaseTransactionSource::new(zero_page),
            Err(SourceError::Config(_))
        ));

        let bad_column = SupabaseSourceConfig {
            table: TransactionTable {
                email_column: "email,secret".into(),
                ..TransactionTable::default()
            },
            ..base.clone()
        };
        assert!(matches!(
            SupabaseTransactionSource::new(bad_column),
            Err(SourceError::Config(_))
        ));

        let bad_primary = SupabaseSourceConfig {
            table: TransactionTable {
                primary_column: Some("id;--".into()),
                ..TransactionTable::default()
            },
            ..base.clone()
        };
        assert!(matches!(
            SupabaseTransactionSource::new(bad_primary),
            Err(SourceError::Config(_))
        ));

        let bad_key = SupabaseSourceConfig {
            service_key: "line\nbreak".into(),
            ..base
        };
        assert!(matches!(
            SupabaseTransactionSource::new(bad_key),
            Err(SourceError::Config(_))
        ));
    }

    #[tokio::test]
    async fn pages_are_drained_until_an_empty_page() {
        let total = 7usize;
        let mut offsets = Vec::new();
        let records = drain_pages(|offset| {
            offsets.push(offset);
            let page: Vec<_> = (offset..total.min(offset + 3)).map(record).collect();
            async move { Ok::<_, SourceError>(page) }
        })
        .await
        .unwrap();
        assert_eq!(records.len(), 7);
        assert_eq!(offsets, vec![0, 3, 6, 7]);
    }

    #[tokio::test]
    async fn server_row_cap_below_page_size_still_reads_every_row() {
        // Pages of 2000 are requested; the server answers with at most 1000 rows.
        let total = 2500usize;
        let server_cap = 1000usize;
        let requested = 2000usize;
        let records = drain_pages(|offset| {
            let end = total.min(offset + requested.min(server_cap));
            let page: Vec<_> = (offset..end).map(record).collect();
            async move { Ok::<_, SourceError>(page) }
        })
        .await
        .unwrap();
        assert_eq!(records.len(), total);
        assert_eq!(records[total - 1], record(total - 1));
    }

    #[tokio::test]
    async fn static_source_returns_its_rows() {
        let source = StaticTransactionSource::new(vec![record(1), record(2)]);
        assert_eq!(source.fetch_all().await.unwrap().len(), 2);
        assert_eq!(source.source_id(), "static");
    }
}
