use super::{RetentionPolicy, StoreError, TimeSeriesStore};
use crate::config::InfluxSettings;
use crate::line_protocol::WriteRecord;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;

/// InfluxDB 1.x HTTP API client (`/write` and `/query`).
#[derive(Clone)]
pub struct InfluxClient {
    client: Client,
    base_url: String,
    database: String,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<Series>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

impl InfluxClient {
    pub fn new(settings: &InfluxSettings) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(settings.request_timeout())
            .build()?;
        let scheme = if settings.ssl { "https" } else { "http" };
        Ok(Self {
            client,
            base_url: format!("{scheme}://{}:{}", settings.host, settings.port),
            database: settings.database.clone(),
            username: settings.username.clone(),
            password: settings.password.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.username.as_deref() {
            Some(username) => request.basic_auth(username, self.password.as_deref()),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        self.authorize(request).send().await.map_err(|err| {
            if err.is_connect() || err.is_timeout() {
                StoreError::Unavailable(err.to_string())
            } else {
                StoreError::Http(err)
            }
        })
    }

    async fn run_query(&self, request: RequestBuilder) -> Result<Vec<StatementResult>, StoreError> {
        let response = check_status(self.send(request).await?).await?;
        let body = response.text().await?;
        decode_query(&body)
    }
}

impl TimeSeriesStore for InfluxClient {
    async fn write_batch(&self, records: &[WriteRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let body = records
            .iter()
            .map(WriteRecord::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        let request = self
            .client
            .post(format!("{}/write", self.base_url))
            .query(&[("db", self.database.as_str()), ("precision", "ns")])
            .body(body);
        check_status(self.send(request).await?).await?;
        Ok(())
    }

    async fn list_retention_policies(&self) -> Result<Vec<RetentionPolicy>, StoreError> {
        let statement = format!(
            "SHOW RETENTION POLICIES ON {}",
            quote_ident(&self.database)
        );
        let request = self
            .client
            .get(format!("{}/query", self.base_url))
            .query(&[("db", self.database.as_str()), ("q", statement.as_str())]);
        let results = self.run_query(request).await?;
        policies_from_results(results)
    }

    async fn alter_retention_policy(
        &self,
        name: &str,
        duration: &str,
        shard_group_duration: &str,
    ) -> Result<(), StoreError> {
        let statement = alter_statement(name, &self.database, duration, shard_group_duration)?;
        let request = self
            .client
            .post(format!("{}/query", self.base_url))
            .form(&[("db", self.database.as_str()), ("q", statement.as_str())]);
        self.run_query(request).await?;
        Ok(())
    }

    fn database(&self) -> &str {
        &self.database
    }
}

async fn check_status(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::Status { status, body })
}

fn decode_query(body: &str) -> Result<Vec<StatementResult>, StoreError> {
    let response: QueryResponse = serde_json::from_str(body)?;
    if let Some(error) = response.error {
        return Err(StoreError::Query(error));
    }
    if let Some(error) = response.results.iter().find_map(|r| r.error.clone()) {
        return Err(StoreError::Query(error));
    }
    Ok(response.results)
}

fn policies_from_results(results: Vec<StatementResult>) -> Result<Vec<RetentionPolicy>, StoreError> {
    let Some(series) = results.into_iter().flat_map(|r| r.series).next() else {
        return Ok(Vec::new());
    };
    let column = |name: &str| series.columns.iter().position(|c| c == name);
    let name_idx = column("name")
        .ok_or_else(|| StoreError::Query("retention policy listing has no name column".into()))?;
    let duration_idx = column("duration");
    let shard_idx = column("shardGroupDuration");
    let replica_idx = column("replicaN");
    let default_idx = column("default");

    let text = |row: &[Value], idx: Option<usize>| {
        idx.and_then(|i| row.get(i))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    Ok(series
        .values
        .iter()
        .map(|row| RetentionPolicy {
            name: text(row, Some(name_idx)),
            duration: text(row, duration_idx),
            shard_group_duration: text(row, shard_idx),
            replica_n: replica_idx.and_then(|i| row.get(i)).and_then(Value::as_u64),
            default: default_idx
                .and_then(|i| row.get(i))
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
        .collect())
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Duration literals are interpolated unquoted, so only digits and unit
/// letters are accepted (plus `INF`).
fn validate_duration(raw: &str) -> Result<&str, StoreError> {
    let trimmed = raw.trim();
    let valid = trimmed.eq_ignore_ascii_case("inf")
        || (trimmed.starts_with(|c: char| c.is_ascii_digit())
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == 'µ'));
    if valid {
        Ok(trimmed)
    } else {
        Err(StoreError::InvalidDuration(raw.to_string()))
    }
}

fn alter_statement(
    name: &str,
    database: &str,
    duration: &str,
    shard_group_duration: &str,
) -> Result<String, StoreError> {
    let duration = validate_duration(duration)?;
    let shard_group_duration = validate_duration(shard_group_duration)?;
    Ok(format!(
        "ALTER RETENTION POLICY {} ON {} DURATION {} SHARD DURATION {}",
        quote_ident(name),
        quote_ident(database),
        duration,
        shard_group_duration
    ))
}
