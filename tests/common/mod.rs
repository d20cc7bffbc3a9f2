//! In-memory stand-in for the remote search API.
//!
//! Records carry a host, a country and a day. Queries are understood as far
//! as the engine rewrites them: `country="X"`, `country!="X"`,
//! `before="D"` (inclusive) and `after="D"`. Results come newest first and
//! no page may reach past the record window.
//!
//! The stats endpoint can be switched to return no buckets or a fixed
//! bucket, and to start failing after a number of calls. Timestamps can be
//! blanked to model records without a parseable date.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};

use fofa_harvest::client::SearchApi;
use fofa_harvest::config::Config;
use fofa_harvest::credentials::CredentialPool;
use fofa_harvest::engine::Engine;
use fofa_harvest::error::ApiError;
use fofa_harvest::models::{
    AccountInfo, PrivilegeLevel, SearchPage, SearchRequest, StatsBreakdown, StatsBucket,
};
use fofa_harvest::proxy::ProxyRoute;

pub const WINDOW: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct Record {
    pub host: String,
    pub country: String,
    pub day: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub key: String,
    pub query: String,
    pub page: u32,
    pub size: u32,
}

/// What the fake stats endpoint reports.
#[derive(Debug, Clone, Default)]
pub enum StatsMode {
    /// Real per-country counts of the matching records.
    #[default]
    Countries,
    /// A breakdown with no buckets at all.
    Empty,
    /// Always the same bucket, whatever the query.
    Fixed { name: String, count: u64 },
}

#[derive(Default)]
pub struct FakeSearchApi {
    records: Mutex<Vec<Record>>,
    /// Error message returned for every call made with a key.
    failures: Mutex<HashMap<String, String>>,
    /// vip level reported by `account_info`, per key.
    accounts: Mutex<HashMap<String, i64>>,
    calls: Mutex<Vec<Call>>,
    stats_mode: Mutex<StatsMode>,
    /// Stats calls that succeed before every later one fails with the message.
    stats_failure: Mutex<Option<(usize, String)>>,
    stats_calls: Mutex<usize>,
    undated: Mutex<bool>,
}

pub fn day(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

/// `count` records for `country`, `per_day` of them per day going back from `newest`.
pub fn spread(country: &str, count: usize, per_day: usize, newest: NaiveDate) -> Vec<Record> {
    (0..count)
        .map(|i| Record {
            host: format!("{}-{}.example:443", country.to_lowercase(), i),
            country: country.to_string(),
            day: newest - Duration::days((i / per_day) as i64),
        })
        .collect()
}

impl FakeSearchApi {
    pub fn new(records: Vec<Record>) -> Arc<Self> {
        let api = Self::default();
        *api.records.lock().unwrap() = records;
        Arc::new(api)
    }

    pub fn push(&self, records: Vec<Record>) {
        self.records.lock().unwrap().extend(records);
    }

    pub fn fail_key(&self, key: &str, message: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(key.to_string(), message.to_string());
    }

    pub fn heal_key(&self, key: &str) {
        self.failures.lock().unwrap().remove(key);
    }

    pub fn set_account(&self, key: &str, vip_level: i64) {
        self.accounts
            .lock()
            .unwrap()
            .insert(key.to_string(), vip_level);
    }

    pub fn set_stats_mode(&self, mode: StatsMode) {
        *self.stats_mode.lock().unwrap() = mode;
    }

    pub fn fail_stats_after(&self, successes: usize, message: &str) {
        *self.stats_failure.lock().unwrap() = Some((successes, message.to_string()));
    }

    /// Report an empty `lastupdatetime` for every record.
    pub fn set_undated(&self, undated: bool) {
        *self.undated.lock().unwrap() = undated;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn keys_used(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.key).collect()
    }

    fn log(&self, key: &str, query: &str, page: u32, size: u32) -> Result<(), ApiError> {
        self.calls.lock().unwrap().push(Call {
            key: key.to_string(),
            query: query.to_string(),
            page,
            size,
        });
        match self.failures.lock().unwrap().get(key) {
            Some(message) => Err(ApiError::from_remote(message.clone())),
            None => Ok(()),
        }
    }

    /// Matching records, newest first, ties broken by host.
    fn matching(&self, query: &str) -> Vec<Record> {
        let filter = Filter::parse(query);
        let mut hits: Vec<Record> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| filter.accepts(r))
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.day.cmp(&a.day).then_with(|| a.host.cmp(&b.host)));
        hits
    }
}

#[derive(Default)]
struct Filter {
    country: Option<String>,
    excluded: Vec<String>,
    before: Option<NaiveDate>,
    after: Option<NaiveDate>,
}

impl Filter {
    fn parse(query: &str) -> Self {
        let mut filter = Filter::default();
        for part in query.split(" && ") {
            let part = part.trim();
            if let Some(v) = quoted(part, "country!=") {
                filter.excluded.push(v);
            } else if let Some(v) = quoted(part, "country=") {
                filter.country = Some(v);
            } else if let Some(v) = quoted(part, "before=") {
                filter.before = Some(day(&v));
            } else if let Some(v) = quoted(part, "after=") {
                filter.after = Some(day(&v));
            }
        }
        filter
    }

    fn accepts(&self, r: &Record) -> bool {
        self.country.as_ref().map_or(true, |c| &r.country == c)
            && !self.excluded.contains(&r.country)
            && self.before.map_or(true, |d| r.day <= d)
            && self.after.map_or(true, |d| r.day >= d)
    }
}

fn quoted(part: &str, prefix: &str) -> Option<String> {
    let rest = part.strip_prefix(prefix)?;
    Some(rest.trim_matches('"').to_string())
}

fn value(record: &Record, field: &str, undated: bool) -> String {
    match field {
        "host" => record.host.clone(),
        "country" => record.country.clone(),
        "lastupdatetime" if undated => String::new(),
        "lastupdatetime" => format!("{} 08:00:00", record.day.format("%Y-%m-%d")),
        "ip" => format!("10.0.0.{}", record.host.len()),
        _ => String::new(),
    }
}

#[async_trait]
impl SearchApi for FakeSearchApi {
    async fn search(
        &self,
        key: &str,
        request: &SearchRequest,
        _proxy: Option<&ProxyRoute>,
    ) -> Result<SearchPage, ApiError> {
        self.log(key, &request.query, request.page, request.page_size)?;
        let end = u64::from(request.page) * u64::from(request.page_size);
        if end > WINDOW && u64::from(request.page) > 1 {
            return Err(ApiError::hard(format!(
                "[820000] page {} of size {} is past the result window",
                request.page, request.page_size
            )));
        }
        let hits = self.matching(&request.query);
        let undated = *self.undated.lock().unwrap();
        let start = (request.page as usize - 1) * request.page_size as usize;
        let results = hits
            .iter()
            .skip(start)
            .take(request.page_size.min(WINDOW as u32) as usize)
            .map(|r| request.fields.iter().map(|f| value(r, f, undated)).collect())
            .collect();
        Ok(SearchPage {
            size: hits.len() as u64,
            results,
        })
    }

    async fn stats(
        &self,
        key: &str,
        query: &str,
        _fields: &[String],
        _proxy: Option<&ProxyRoute>,
    ) -> Result<StatsBreakdown, ApiError> {
        self.log(key, query, 0, 0)?;
        let made = {
            let mut calls = self.stats_calls.lock().unwrap();
            *calls += 1;
            *calls
        };
        if let Some((successes, message)) = self.stats_failure.lock().unwrap().as_ref() {
            if made > *successes {
                return Err(ApiError::hard(message.clone()));
            }
        }

        let mut breakdown = StatsBreakdown::default();
        match self.stats_mode.lock().unwrap().clone() {
            StatsMode::Countries => {}
            StatsMode::Empty => return Ok(breakdown),
            StatsMode::Fixed { name, count } => {
                breakdown
                    .dimensions
                    .insert("countries".to_string(), vec![StatsBucket { name, count }]);
                return Ok(breakdown);
            }
        }

        let mut counts: HashMap<String, u64> = HashMap::new();
        for r in self.matching(query) {
            *counts.entry(r.country).or_default() += 1;
        }
        let mut buckets: Vec<StatsBucket> = counts
            .into_iter()
            .map(|(name, count)| StatsBucket { name, count })
            .collect();
        buckets.sort_by(|a, b| b.count.cmp(&a.count));
        breakdown
            .dimensions
            .insert("countries".to_string(), buckets);
        Ok(breakdown)
    }

    async fn account_info(
        &self,
        key: &str,
        _proxy: Option<&ProxyRoute>,
    ) -> Result<AccountInfo, ApiError> {
        self.log(key, "", 0, 0)?;
        let vip_level = self.accounts.lock().unwrap().get(key).copied().unwrap_or(0);
        Ok(AccountInfo {
            username: Some(format!("user-{}", key)),
            is_vip: vip_level > 0,
            vip_level,
        })
    }
}

/// Test configuration: small pages, monitor files under `dir`.
pub fn config(dir: &std::path::Path) -> Config {
    let mut config = Config::minimal();
    config.extract.page_size = 1000;
    config.extract.output_dir = dir.join("results");
    config.monitor.data_dir = dir.join("monitor");
    config.monitor.tasks_file = dir.join("monitor").join("tasks.json");
    config.monitor.page_size = 1000;
    config.monitor.jitter = 0.0;
    config.db.path = dir.join("harvest.sqlite");
    config
}

pub fn engine(config: Config, api: Arc<FakeSearchApi>, keys: &[(&str, i8)]) -> Engine {
    let pool = CredentialPool::with_levels(
        keys.iter()
            .map(|(k, l)| (k.to_string(), PrivilegeLevel(*l))),
    );
    Engine::new(config, api, Arc::new(pool))
}
