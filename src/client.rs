//! Remote search API client.
//!
//! Defines the [`SearchApi`] trait, the only seam through which the engine
//! talks to the network, and [`HttpSearchApi`], its HTTP implementation.
//!
//! # Endpoints
//!
//! | Call | Path |
//! |------|------|
//! | search | `GET /api/v1/search/all` |
//! | stats | `GET /api/v1/search/stats` |
//! | account | `GET /api/v1/info/my` |
//!
//! Queries travel base64-encoded in `qbase64`.
//!
//! # Retry Strategy
//!
//! - HTTP 429 and 5xx → retry with exponential backoff (rate limits wait 3× longer)
//! - Network errors (timeout, connect) → retry
//! - Any other HTTP status → fail immediately
//! - Backoff: `retry_base_ms · 2^n`, capped at 2^5
//!
//! A call that is still failing after the last retry becomes an
//! [`ApiError`] of kind [`Transient`](crate::error::ErrorKind::Transient).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::models::{AccountInfo, Row, SearchPage, SearchRequest, StatsBreakdown, StatsBucket};
use crate::proxy::ProxyRoute;

const SEARCH_PATH: &str = "/api/v1/search/all";
const STATS_PATH: &str = "/api/v1/search/stats";
const ACCOUNT_PATH: &str = "/api/v1/info/my";

/// Rate-limited responses back off this many times longer than other transient errors.
const RATE_LIMIT_BACKOFF_MULTIPLIER: u32 = 3;

/// Remote search API operations.
///
/// Every method takes the credential and the route explicitly; implementations
/// hold no per-operation state.
#[async_trait]
pub trait SearchApi: Send + Sync {
    /// Fetch one page of results.
    async fn search(
        &self,
        key: &str,
        request: &SearchRequest,
        proxy: Option<&ProxyRoute>,
    ) -> Result<SearchPage, ApiError>;

    /// Aggregate breakdown of `query` by `fields`.
    async fn stats(
        &self,
        key: &str,
        query: &str,
        fields: &[String],
        proxy: Option<&ProxyRoute>,
    ) -> Result<StatsBreakdown, ApiError>;

    /// Account details for `key`, used to classify its privilege level.
    async fn account_info(
        &self,
        key: &str,
        proxy: Option<&ProxyRoute>,
    ) -> Result<AccountInfo, ApiError>;
}

/// [`SearchApi`] over HTTPS.
pub struct HttpSearchApi {
    base_url: String,
    timeout: Duration,
    max_retries: u32,
    retry_base: Duration,
    full: bool,
    clients: Mutex<HashMap<Option<ProxyRoute>, reqwest::Client>>,
}

impl HttpSearchApi {
    pub fn new(config: &ApiConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
            retry_base: Duration::from_millis(config.retry_base_ms),
            full: config.full_mode,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// One client per route; `reqwest::Client` is cheap to clone.
    fn client_for(&self, proxy: Option<&ProxyRoute>) -> Result<reqwest::Client, ApiError> {
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| ApiError::hard("HTTP client cache poisoned"))?;
        let slot = proxy.cloned();
        if let Some(client) = clients.get(&slot) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        if let Some(route) = proxy {
            let proxy = reqwest::Proxy::all(route.as_str())
                .map_err(|e| ApiError::hard(format!("invalid proxy {}: {}", route, e)))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| ApiError::hard(format!("failed to build HTTP client: {}", e)))?;
        clients.insert(slot, client.clone());
        Ok(client)
    }

    async fn get_json(
        &self,
        path: &str,
        params: &[(&str, String)],
        proxy: Option<&ProxyRoute>,
    ) -> Result<Value, ApiError> {
        let client = self.client_for(proxy)?;
        let url = format!("{}{}", self.base_url, path);

        let mut last_err = None;
        let mut rate_limited = false;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let mut delay = self.retry_base * (1u32 << (attempt - 1).min(5));
                if rate_limited {
                    delay *= RATE_LIMIT_BACKOFF_MULTIPLIER;
                }
                tracing::debug!(path, attempt, ?delay, "retrying remote call");
                tokio::time::sleep(delay).await;
            }

            match client.get(&url).query(params).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: Value = response.json().await.map_err(|e| {
                            ApiError::hard(format!("invalid JSON from {}: {}", path, e))
                        })?;
                        return check_remote_error(json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        rate_limited = status.as_u16() == 429;
                        let body = response.text().await.unwrap_or_default();
                        last_err = Some(ApiError::transient(format!(
                            "HTTP {}: {}",
                            status,
                            truncate(&body, 200)
                        )));
                        continue;
                    }

                    let body = response.text().await.unwrap_or_default();
                    let message = serde_json::from_str::<Value>(&body)
                        .ok()
                        .and_then(|v| error_message(&v))
                        .unwrap_or_else(|| format!("HTTP {}: {}", status, truncate(&body, 200)));
                    return Err(ApiError::from_remote(message));
                }
                Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                    rate_limited = false;
                    last_err = Some(ApiError::transient(e.to_string()));
                    continue;
                }
                Err(e) => return Err(ApiError::hard(e.to_string())),
            }
        }

        Err(last_err.unwrap_or_else(|| ApiError::transient("request failed after retries")))
    }
}

#[async_trait]
impl SearchApi for HttpSearchApi {
    async fn search(
        &self,
        key: &str,
        request: &SearchRequest,
        proxy: Option<&ProxyRoute>,
    ) -> Result<SearchPage, ApiError> {
        let params = [
            ("key", key.to_string()),
            ("qbase64", BASE64.encode(request.query.as_bytes())),
            ("page", request.page.to_string()),
            ("size", request.page_size.to_string()),
            ("fields", request.fields.join(",")),
            ("full", self.full.to_string()),
        ];
        let json = self.get_json(SEARCH_PATH, &params, proxy).await?;
        parse_search_page(&json)
    }

    async fn stats(
        &self,
        key: &str,
        query: &str,
        fields: &[String],
        proxy: Option<&ProxyRoute>,
    ) -> Result<StatsBreakdown, ApiError> {
        let params = [
            ("key", key.to_string()),
            ("qbase64", BASE64.encode(query.as_bytes())),
            ("fields", fields.join(",")),
        ];
        let json = self.get_json(STATS_PATH, &params, proxy).await?;
        Ok(parse_stats(&json))
    }

    async fn account_info(
        &self,
        key: &str,
        proxy: Option<&ProxyRoute>,
    ) -> Result<AccountInfo, ApiError> {
        let params = [("key", key.to_string())];
        let json = self.get_json(ACCOUNT_PATH, &params, proxy).await?;
        Ok(parse_account_info(&json))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn error_message(json: &Value) -> Option<String> {
    if json.get("error").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    Some(
        json.get("errmsg")
            .and_then(Value::as_str)
            .unwrap_or("unknown remote error")
            .to_string(),
    )
}

/// Turn a `{"error": true, "errmsg": ...}` body into an [`ApiError`].
fn check_remote_error(json: Value) -> Result<Value, ApiError> {
    match error_message(&json) {
        Some(message) => Err(ApiError::from_remote(message)),
        None => Ok(json),
    }
}

fn cell(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Normalize a search response. Single-field queries return bare strings,
/// multi-field queries return arrays; both become [`Row`]s.
pub fn parse_search_page(json: &Value) -> Result<SearchPage, ApiError> {
    let size = json.get("size").and_then(Value::as_u64).unwrap_or(0);
    let results = match json.get("results") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Array(values) => values.iter().map(cell).collect::<Row>(),
                other => vec![cell(other)],
            })
            .collect(),
        Some(_) => return Err(ApiError::hard("invalid search response: results is not an array")),
    };
    Ok(SearchPage { size, results })
}

/// Normalize a stats response, with or without the `aggs` wrapper.
pub fn parse_stats(json: &Value) -> StatsBreakdown {
    let aggs = json
        .get("aggs")
        .filter(|v| v.is_object())
        .unwrap_or(json);

    let mut breakdown = StatsBreakdown::default();
    let Some(map) = aggs.as_object() else {
        return breakdown;
    };

    for (name, value) in map {
        let Some(items) = value.as_array() else {
            continue;
        };
        let buckets: Vec<StatsBucket> = items
            .iter()
            .filter_map(|item| {
                let bucket_name = item.get("name")?;
                Some(StatsBucket {
                    name: cell(bucket_name),
                    count: item.get("count").and_then(Value::as_u64).unwrap_or(0),
                })
            })
            .collect();
        if !buckets.is_empty() {
            breakdown.dimensions.insert(name.clone(), buckets);
        }
    }
    breakdown
}

pub fn parse_account_info(json: &Value) -> AccountInfo {
    AccountInfo {
        username: json
            .get("username")
            .and_then(Value::as_str)
            .map(str::to_string),
        is_vip: json.get("isvip").and_then(Value::as_bool).unwrap_or(false),
        vip_level: json.get("vip_level").and_then(Value::as_i64).unwrap_or(0),
    }
}
