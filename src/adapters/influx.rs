use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{info, instrument};

use crate::config::InfluxConfig;
use crate::domain::{FieldValue, PointValue, QueryPoint, SeriesQuery, TimeSeriesRecord};
use crate::error::GatewayError;
use crate::ports::TimeSeriesSink;

/// InfluxDB 1.x over its HTTP API: line protocol writes, InfluxQL queries.
pub struct InfluxRepository {
    client: Client,
    base_url: String,
    database: String,
    credentials: Option<(String, String)>,
}

impl InfluxRepository {
    pub fn new(config: &InfluxConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        let credentials = match (&config.username, &config.password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        };
        Ok(Self {
            client,
            base_url: format!("http://{}:{}", config.host, config.port),
            database: config.database.clone(),
            credentials,
        })
    }

    /// Build the repository, check the server answers and make sure the database exists.
    pub async fn connect(config: &InfluxConfig) -> anyhow::Result<Self> {
        let repo = Self::new(config)?;
        check(repo.request(reqwest::Method::GET, "/ping").send().await?).await?;

        let create = format!("CREATE DATABASE {}", quote_ident(&repo.database));
        let resp = repo.request(reqwest::Method::POST, "/query").query(&[("q", create)]).send().await?;
        let body = check(resp).await?.text().await?;
        parse_query_response(&body)?;

        info!(database = %repo.database, url = %repo.base_url, "InfluxDB ready");
        Ok(repo)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base_url, path));
        match &self.credentials {
            Some((user, pass)) => builder.basic_auth(user, Some(pass)),
            None => builder,
        }
    }
}

#[async_trait]
impl TimeSeriesSink for InfluxRepository {
    #[instrument(skip(self, record), fields(measurement = %record.measurement))]
    async fn write(&self, record: &TimeSeriesRecord) -> anyhow::Result<()> {
        let line = to_line_protocol(record);
        let resp = self
            .request(reqwest::Method::POST, "/write")
            .query(&[("db", self.database.as_str()), ("precision", "ns")])
            .body(line)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    #[instrument(skip(self, query), fields(measurement = %query.measurement, field = %query.field))]
    async fn query(&self, query: &SeriesQuery) -> anyhow::Result<Option<QueryPoint>> {
        let q = build_select(query);
        let resp = self
            .request(reqwest::Method::GET, "/query")
            .query(&[("db", self.database.as_str()), ("epoch", "ns"), ("q", q.as_str())])
            .send()
            .await?;
        let body = check(resp).await?.text().await?;
        Ok(parse_query_response(&body)?)
    }
}

async fn check(resp: Response) -> Result<Response, GatewayError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(GatewayError::Influx(format!("HTTP {}: {}", status, body.trim())))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
}

/// InfluxQL for one aggregate lookup.
pub fn build_select(query: &SeriesQuery) -> String {
    let mut q = format!(
        "SELECT {}({}) FROM {}",
        query.aggregator.function(),
        quote_ident(&query.field),
        quote_ident(&query.measurement)
    );

    let mut conditions = Vec::new();
    if let Some(range) = &query.range {
        conditions.push(format!("time > now() - {range}"));
    }
    if let Some(filter) = &query.filter {
        conditions.push(format!("({filter})"));
    }
    if !conditions.is_empty() {
        q.push_str(" WHERE ");
        q.push_str(&conditions.join(" AND "));
    }
    q
}

fn escape_key(raw: &str, specials: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if specials.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Line protocol encoding with nanosecond timestamp. Tags with empty values are skipped.
pub fn to_line_protocol(record: &TimeSeriesRecord) -> String {
    let mut line = escape_key(&record.measurement, &[',', ' ']);

    for (key, value) in &record.tags {
        if value.is_empty() {
            continue;
        }
        line.push(',');
        line.push_str(&escape_key(key, &[',', '=', ' ']));
        line.push('=');
        line.push_str(&escape_key(value, &[',', '=', ' ']));
    }

    let fields: Vec<String> = record
        .fields
        .iter()
        .map(|(key, value)| {
            let value = match value {
                FieldValue::Float(v) => v.to_string(),
                FieldValue::Integer(v) => format!("{v}i"),
                FieldValue::Text(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
            };
            format!("{}={}", escape_key(key, &[',', '=', ' ']), value)
        })
        .collect();

    line.push(' ');
    line.push_str(&fields.join(","));
    line.push(' ');
    line.push_str(&record.timestamp.unix_timestamp_nanos().to_string());
    line
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<Series>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

/// Extract the most recent `[time, value]` row of an `epoch=ns` response.
fn parse_query_response(body: &str) -> Result<Option<QueryPoint>, GatewayError> {
    let response: QueryResponse =
        serde_json::from_str(body).map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;
    if let Some(error) = response.error {
        return Err(GatewayError::Influx(error));
    }

    let Some(result) = response.results.into_iter().next() else {
        return Ok(None);
    };
    if let Some(error) = result.error {
        return Err(GatewayError::Influx(error));
    }

    let Some(row) = result.series.into_iter().next().and_then(|s| s.values.into_iter().last()) else {
        return Ok(None);
    };

    let [time, value, ..] = row.as_slice() else {
        return Err(GatewayError::MalformedResponse(format!("short row: {row:?}")));
    };

    let nanos = time
        .as_i64()
        .ok_or_else(|| GatewayError::MalformedResponse(format!("non-integer time: {time}")))?;
    let timestamp = OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))
        .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;

    let value = match value {
        Value::Null => return Ok(None),
        Value::Number(n) => PointValue::Number(
            n.as_f64()
                .ok_or_else(|| GatewayError::MalformedResponse(format!("bad number: {n}")))?,
        ),
        Value::String(s) => PointValue::Text(s.clone()),
        other => PointValue::Text(other.to_string()),
    };

    Ok(Some(QueryPoint { value, timestamp }))
}
