use std::fs;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::BigQueryConfig;
use crate::table::Table;

/// Abstraction over the data warehouse so tests and alternate backends can be
/// swapped in without touching the pipeline stages.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Execute a SQL query and return the full result set as a table.
    async fn query(&self, sql: &str) -> Result<Table>;
}

/// Warehouse implementation over the BigQuery REST `jobs.query` endpoint.
///
/// Authentication is a pass-through bearer token read from the configured
/// credentials file; obtaining that token is out of scope here.
#[derive(Debug, Clone)]
pub struct BigQueryClient {
    http: Client,
    base_url: String,
    project: String,
    token: String,
}

impl BigQueryClient {
    pub fn new(cfg: &BigQueryConfig) -> Result<Self> {
        let project = cfg
            .project
            .clone()
            .filter(|p| !p.trim().is_empty())
            .context("bigquery.project must be set (or BQ_PROJECT exported)")?;
        let credentials = cfg.credentials.as_deref().context(
            "bigquery.credentials must point at a bearer token file \
             (or GOOGLE_APPLICATION_CREDENTIALS exported)",
        )?;
        let token = fs::read_to_string(credentials)
            .with_context(|| format!("failed to read token file at {}", credentials.display()))?
            .trim()
            .to_string();
        if token.is_empty() {
            bail!("token file at {} is empty", credentials.display());
        }
        let http = Client::builder()
            .user_agent("studypair/0.3")
            .build()
            .context("failed to build warehouse HTTP client")?;
        Ok(Self {
            http,
            base_url: "https://bigquery.googleapis.com".to_string(),
            project,
            token,
        })
    }

    /// Point the client at a different API host (used by tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn fetch_page(&self, job_id: &str, page_token: &str) -> Result<QueryResponse> {
        let url = format!(
            "{}/bigquery/v2/projects/{}/queries/{}",
            self.base_url, self.project, job_id
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("pageToken", page_token)])
            .send()
            .await
            .context("failed to fetch warehouse result page")?;
        decode_response(response).await
    }
}

#[async_trait]
impl Warehouse for BigQueryClient {
    async fn query(&self, sql: &str) -> Result<Table> {
        let url = format!(
            "{}/bigquery/v2/projects/{}/queries",
            self.base_url, self.project
        );
        let request = QueryRequest {
            query: sql.to_string(),
            use_legacy_sql: false,
        };
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .context("failed to submit warehouse query")?;
        let mut page = decode_response(response).await?;

        let columns: Vec<String> = page
            .schema
            .as_ref()
            .context("warehouse response missing result schema")?
            .fields
            .iter()
            .map(|f| f.name.clone())
            .collect();
        let mut table = Table::new(columns);

        loop {
            for row in page.rows.take().unwrap_or_default() {
                table.push_row(row.f.into_iter().map(|c| cell_text(c.v)).collect())?;
            }
            let Some(token) = page.page_token.take().filter(|t| !t.is_empty()) else {
                break;
            };
            let job_id = page
                .job_reference
                .as_ref()
                .map(|j| j.job_id.clone())
                .context("warehouse response paginated without a job reference")?;
            page = self.fetch_page(&job_id, &token).await?;
        }
        debug!(rows = table.len(), "warehouse query complete");
        Ok(table)
    }
}

async fn decode_response(response: reqwest::Response) -> Result<QueryResponse> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        bail!("warehouse API error ({status}): {body}");
    }
    let page: QueryResponse = response
        .json()
        .await
        .context("failed to parse warehouse response")?;
    if !page.job_complete.unwrap_or(true) {
        bail!("warehouse query did not complete within the API deadline");
    }
    Ok(page)
}

fn cell_text(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest {
    query: String,
    use_legacy_sql: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    job_complete: Option<bool>,
    schema: Option<TableSchema>,
    rows: Option<Vec<TableRow>>,
    page_token: Option<String>,
    job_reference: Option<JobReference>,
}

#[derive(Deserialize)]
struct TableSchema {
    fields: Vec<FieldSchema>,
}

#[derive(Deserialize)]
struct FieldSchema {
    name: String,
}

#[derive(Deserialize)]
struct TableRow {
    f: Vec<Cell>,
}

#[derive(Deserialize)]
struct Cell {
    #[serde(default)]
    v: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
}
