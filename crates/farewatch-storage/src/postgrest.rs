//! Table-scoped client for a PostgREST endpoint (the REST face of a hosted
//! Supabase project).

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info_span, warn, Instrument};

use crate::store::StoreError;
use crate::HttpClientConfig;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Gte,
}

impl FilterOp {
    fn as_str(self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Gte => "gte",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

impl Filter {
    pub fn eq(column: &str, value: impl ToString) -> Self {
        Self {
            column: column.to_string(),
            op: FilterOp::Eq,
            value: value.to_string(),
        }
    }

    pub fn gte(column: &str, value: impl ToString) -> Self {
        Self {
            column: column.to_string(),
            op: FilterOp::Gte,
            value: value.to_string(),
        }
    }

    pub fn query_pair(&self) -> (String, String) {
        (self.column.clone(), format!("{}.{}", self.op.as_str(), self.value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub table: String,
    pub columns: String,
    pub filters: Vec<Filter>,
    pub order_desc: Option<String>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            columns: "*".to_string(),
            filters: Vec::new(),
            order_desc: None,
            limit: None,
        }
    }

    pub fn columns(mut self, columns: &str) -> Self {
        self.columns = columns.to_string();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_desc(mut self, column: &str) -> Self {
        self.order_desc = Some(column.to_string());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("select".to_string(), self.columns.clone())];
        pairs.extend(self.filters.iter().map(Filter::query_pair));
        if let Some(column) = &self.order_desc {
            pairs.push(("order".to_string(), format!("{column}.desc")));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        pairs
    }
}

fn filter_pairs(filters: &[Filter]) -> Vec<(String, String)> {
    filters.iter().map(Filter::query_pair).collect()
}

/// `select` / `insert` / `upsert` / `update` / `delete` against named tables.
/// Every mutating call asks for the affected rows back.
#[derive(Debug, Clone)]
pub struct TableClient {
    client: reqwest::Client,
    base_url: String,
}

impl TableClient {
    pub fn new(config: &StoreConfig, http: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert("apikey", HeaderValue::from_str(&config.api_key)?);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", config.api_key))?,
        );

        let client = http
            .client_builder()
            .default_headers(headers)
            .build()
            .context("building store client")?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.client.request(method, self.endpoint(table))
    }

    pub async fn select<T: DeserializeOwned>(&self, query: &Query) -> Result<Vec<T>, StoreError> {
        let request = self
            .request(Method::GET, &query.table)
            .query(&query.query_pairs());
        self.execute(&query.table, "select", request).await
    }

    /// Like [`TableClient::select`], but a row that does not decode is
    /// logged and counted instead of failing the whole read.
    pub async fn select_each<T: DeserializeOwned>(
        &self,
        query: &Query,
    ) -> Result<RowBatch<T>, StoreError> {
        let raw: Vec<Value> = self.select(query).await?;
        Ok(decode_each_row(&query.table, raw))
    }

    pub async fn insert<B, T>(&self, table: &str, record: &B) -> Result<Vec<T>, StoreError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self
            .request(Method::POST, table)
            .header("Prefer", "return=representation")
            .json(record);
        self.execute(table, "insert", request).await
    }

    pub async fn upsert<B, T>(
        &self,
        table: &str,
        record: &B,
        conflict_key: &str,
    ) -> Result<Vec<T>, StoreError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self
            .request(Method::POST, table)
            .query(&[("on_conflict", conflict_key)])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(record);
        self.execute(table, "upsert", request).await
    }

    pub async fn update<B, T>(
        &self,
        table: &str,
        patch: &B,
        filters: &[Filter],
    ) -> Result<Vec<T>, StoreError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self
            .request(Method::PATCH, table)
            .query(&filter_pairs(filters))
            .header("Prefer", "return=representation")
            .json(patch);
        self.execute(table, "update", request).await
    }

    pub async fn delete<T: DeserializeOwned>(
        &self,
        table: &str,
        filters: &[Filter],
    ) -> Result<Vec<T>, StoreError> {
        let request = self
            .request(Method::DELETE, table)
            .query(&filter_pairs(filters))
            .header("Prefer", "return=representation");
        self.execute(table, "delete", request).await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        table: &str,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<Vec<T>, StoreError> {
        let span = info_span!("store_request", table, operation);
        async move {
            let response = request.send().await?;
            let rows = read_rows(table, response).await?;
            debug!(rows = rows.len(), "store request complete");
            Ok::<_, StoreError>(rows)
        }
        .instrument(span)
        .await
    }
}

async fn read_rows<T: DeserializeOwned>(
    table: &str,
    response: Response,
) -> Result<Vec<T>, StoreError> {
    let status = response.status();
    let body = response.bytes().await?;
    if !status.is_success() {
        return Err(StoreError::HttpStatus {
            status: status.as_u16(),
            table: table.to_string(),
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }
    decode_rows(table, &body)
}

pub(crate) fn decode_rows<T: DeserializeOwned>(
    table: &str,
    body: &[u8],
) -> Result<Vec<T>, StoreError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(body).map_err(|source| StoreError::Decode {
        table: table.to_string(),
        source,
    })
}

/// Rows read from a table, minus those that did not match the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowBatch<T> {
    pub rows: Vec<T>,
    pub undecodable: usize,
}

impl<T> RowBatch<T> {
    pub fn new(rows: Vec<T>) -> Self {
        Self {
            rows,
            undecodable: 0,
        }
    }
}

pub fn decode_each_row<T: DeserializeOwned>(table: &str, raw: Vec<Value>) -> RowBatch<T> {
    let mut batch = RowBatch::new(Vec::with_capacity(raw.len()));
    for value in raw {
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        match serde_json::from_value(value) {
            Ok(row) => batch.rows.push(row),
            Err(err) => {
                warn!(table, row_id = %id, error = %err, "skipping undecodable row");
                batch.undecodable += 1;
            }
        }
    }
    batch
}
