//! Shared extraction context.
//!
//! An [`Engine`] bundles the remote API, the failover executor, the loaded
//! configuration and the stop-flag table. The paginators, the peeler and
//! the monitor borrow it; none of them talk to the network any other way.

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::client::{HttpSearchApi, SearchApi};
use crate::config::Config;
use crate::credentials::CredentialPool;
use crate::error::ExecError;
use crate::executor::{ExecOptions, Executed, QueryExecutor};
use crate::keys;
use crate::models::{SearchPage, SearchRequest, StatsBreakdown};
use crate::proxy::ProxySelector;
use crate::stop::StopFlags;

pub struct Engine {
    api: Arc<dyn SearchApi>,
    executor: QueryExecutor,
    config: Config,
    stops: StopFlags,
}

impl Engine {
    pub fn new(config: Config, api: Arc<dyn SearchApi>, pool: Arc<CredentialPool>) -> Self {
        let proxies = ProxySelector::new(&config.proxy.pool, config.proxy.fallback.as_deref());
        Self {
            api,
            executor: QueryExecutor::new(pool, proxies),
            config,
            stops: StopFlags::new(),
        }
    }

    /// An engine over HTTP, with key levels from the cache in `db`.
    pub async fn open(config: &Config, db: &SqlitePool) -> Result<Self> {
        let api = Arc::new(HttpSearchApi::new(&config.api));
        let credentials = keys::open_pool(config, db, api.as_ref()).await?;
        Ok(Self::new(config.clone(), api, credentials))
    }

    pub fn api(&self) -> &dyn SearchApi {
        self.api.as_ref()
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stops(&self) -> &StopFlags {
        &self.stops
    }

    pub fn page_cap(&self) -> u64 {
        u64::from(self.config.api.page_cap)
    }

    /// Fetch one page through the executor.
    pub async fn page(
        &self,
        request: &SearchRequest,
        options: ExecOptions,
    ) -> Result<Executed<SearchPage>, ExecError> {
        let api = self.api.as_ref();
        self.executor
            .execute(options, |attempt| {
                let request = request.clone();
                async move {
                    api.search(&attempt.key, &request, attempt.proxy.as_ref())
                        .await
                }
            })
            .await
    }

    /// Total records the remote reports for `query` (a size-1 fetch).
    pub async fn count(
        &self,
        query: &str,
        fields: &[String],
        options: ExecOptions,
    ) -> Result<Executed<u64>, ExecError> {
        let request = SearchRequest::new(query, fields);
        let executed = self.page(&request, options).await?;
        Ok(Executed {
            value: executed.value.size,
            index: executed.index,
            key: executed.key,
            level: executed.level,
            proxy: executed.proxy,
        })
    }

    /// Aggregate breakdown of `query` by `dimension`.
    pub async fn stats(
        &self,
        query: &str,
        dimension: &str,
        options: ExecOptions,
    ) -> Result<Executed<StatsBreakdown>, ExecError> {
        let api = self.api.as_ref();
        let fields = vec![dimension.to_string()];
        self.executor
            .execute(options, |attempt| {
                let fields = fields.clone();
                let query = query.to_string();
                async move {
                    api.stats(&attempt.key, &query, &fields, attempt.proxy.as_ref())
                        .await
                }
            })
            .await
    }
}
