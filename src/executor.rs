//! Credential and route failover.
//!
//! [`QueryExecutor::execute`] is the single choke point every algorithm
//! calls through. It filters the pool by privilege, fixes one route for the
//! whole call, and walks the eligible keys once each, starting from the
//! preferred key. Quota and balance errors move on to the next key; any
//! other error stops the walk and is reported with the key that caused it.

use std::future::Future;
use std::sync::Arc;

use crate::credentials::{mask_key, CredentialPool};
use crate::error::{ApiError, ErrorKind, ExecError};
use crate::models::PrivilegeLevel;
use crate::proxy::{ProxyRoute, ProxySelector};

/// What a fetch function is handed for one try.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// 1-based position of the key in the configuration.
    pub index: usize,
    pub key: String,
    pub level: PrivilegeLevel,
    pub proxy: Option<ProxyRoute>,
}

/// A successful call and the key/route that produced it.
#[derive(Debug, Clone)]
pub struct Executed<T> {
    pub value: T,
    pub index: usize,
    pub key: String,
    pub level: PrivilegeLevel,
    pub proxy: Option<ProxyRoute>,
}

/// Call options: where to start and what to require.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// 1-based key index to try first, if still eligible.
    pub preferred: Option<usize>,
    /// Route to use instead of picking one.
    pub locked_proxy: Option<ProxyRoute>,
    pub min_level: PrivilegeLevel,
}

impl ExecOptions {
    pub fn min_level(level: PrivilegeLevel) -> Self {
        Self {
            min_level: level,
            ..Self::default()
        }
    }

    /// Continue a multi-step operation on the same key and route.
    pub fn resume<T>(previous: &Executed<T>, min_level: PrivilegeLevel) -> Self {
        Self {
            preferred: Some(previous.index),
            locked_proxy: previous.proxy.clone(),
            min_level,
        }
    }
}

pub struct QueryExecutor {
    pool: Arc<CredentialPool>,
    proxies: ProxySelector,
}

impl QueryExecutor {
    pub fn new(pool: Arc<CredentialPool>, proxies: ProxySelector) -> Self {
        Self { pool, proxies }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn proxies(&self) -> &ProxySelector {
        &self.proxies
    }

    /// Run `fetch` against eligible keys until one succeeds.
    ///
    /// Each eligible key is tried at most once. Keys below
    /// `options.min_level` are never contacted.
    pub async fn execute<T, F, Fut>(&self, options: ExecOptions, mut fetch: F) -> Result<Executed<T>, ExecError>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let credentials = self.pool.snapshot();
        if credentials.is_empty() {
            return Err(ExecError::NoCredentials);
        }

        let eligible: Vec<(usize, _)> = credentials
            .into_iter()
            .enumerate()
            .map(|(i, c)| (i + 1, c))
            .filter(|(_, c)| c.level >= options.min_level && c.level > PrivilegeLevel::INVALID)
            .collect();
        if eligible.is_empty() {
            return Err(ExecError::BelowPrivilegeFloor {
                floor: options.min_level.0,
            });
        }

        let start = options
            .preferred
            .and_then(|p| eligible.iter().position(|(index, _)| *index == p))
            .unwrap_or(0);

        let proxy = options.locked_proxy.or_else(|| self.proxies.choose());

        for offset in 0..eligible.len() {
            let (index, credential) = &eligible[(start + offset) % eligible.len()];
            let attempt = Attempt {
                index: *index,
                key: credential.key.clone(),
                level: credential.level,
                proxy: proxy.clone(),
            };

            match fetch(attempt).await {
                Ok(value) => {
                    return Ok(Executed {
                        value,
                        index: *index,
                        key: credential.key.clone(),
                        level: credential.level,
                        proxy,
                    });
                }
                Err(e) if e.is_soft() => {
                    let reason = match e.kind {
                        ErrorKind::SoftBalance => "balance exhausted",
                        _ => "daily quota exceeded",
                    };
                    tracing::warn!(key = %mask_key(&credential.key), index, reason, "skipping key");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(key = %mask_key(&credential.key), index, error = %e, "key failed");
                    return Err(ExecError::Hard {
                        index: *index,
                        key: mask_key(&credential.key),
                        source: e,
                    });
                }
            }
        }

        Err(ExecError::Exhausted {
            attempted: eligible.len(),
        })
    }
}
