//! Credential pool and privilege classification.
//!
//! The pool is an explicit value shared through `Arc`. Levels are written
//! only by [`CredentialPool::classify`] (or loaded from the cache) and read
//! by everything else. A level that is stale for one in-flight iteration is
//! acceptable.

use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::client::SearchApi;
use crate::models::{AccountInfo, PrivilegeLevel};
use crate::proxy::ProxySelector;

const FREE_FIELDS: &[&str] = &[
    "ip", "port", "protocol", "country", "country_name", "region", "city", "longitude",
    "latitude", "as_number", "as_organization", "host", "domain", "os", "server", "icp",
    "title", "jarm", "header", "banner", "cert", "base_protocol", "link",
];
const PERSONAL_FIELDS: &[&str] = &[
    "product", "product_category", "version", "lastupdatetime", "cname",
];
const BUSINESS_FIELDS: &[&str] = &["icon_hash", "certs_valid", "cname_domain", "body"];
const ENTERPRISE_FIELDS: &[&str] = &["icon", "fid", "structinfo"];

/// One configured API key and its cached classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub key: String,
    pub level: PrivilegeLevel,
    pub verified_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn masked(&self) -> String {
        mask_key(&self.key)
    }
}

/// Result of verifying one key during a classification sweep.
#[derive(Debug, Clone)]
pub struct Classification {
    /// 1-based position in the configuration.
    pub index: usize,
    pub key: String,
    pub level: PrivilegeLevel,
    pub username: Option<String>,
    pub error: Option<String>,
}

/// All configured credentials, in configuration order.
#[derive(Debug, Default)]
pub struct CredentialPool {
    entries: RwLock<Vec<Credential>>,
}

impl CredentialPool {
    /// A pool of unverified keys (level [`PrivilegeLevel::INVALID`] until classified).
    pub fn new(keys: &[String]) -> Self {
        Self::with_levels(keys.iter().map(|k| (k.clone(), PrivilegeLevel::INVALID)))
    }

    /// A pool with known levels, e.g. loaded from the level cache.
    pub fn with_levels(levels: impl IntoIterator<Item = (String, PrivilegeLevel)>) -> Self {
        let mut entries: Vec<Credential> = Vec::new();
        for (key, level) in levels {
            let key = key.trim().to_string();
            if key.is_empty() || entries.iter().any(|c| c.key == key) {
                continue;
            }
            entries.push(Credential {
                key,
                level,
                verified_at: None,
            });
        }
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Copy of the current entries.
    pub fn snapshot(&self) -> Vec<Credential> {
        match self.entries.read() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a level for `key`. Unknown keys are ignored.
    pub fn set_level(&self, key: &str, level: PrivilegeLevel, verified_at: Option<DateTime<Utc>>) {
        let mut entries = match self.entries.write() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(entry) = entries.iter_mut().find(|c| c.key == key) {
            entry.level = level;
            entry.verified_at = verified_at;
        }
    }

    /// Whether any key has been classified above [`PrivilegeLevel::INVALID`].
    pub fn has_usable(&self) -> bool {
        self.snapshot()
            .iter()
            .any(|c| c.level > PrivilegeLevel::INVALID)
    }

    /// Verify every key and store its level.
    ///
    /// Keys are checked one at a time; a failed verification marks the
    /// key invalid but never removes it.
    pub async fn classify(&self, api: &dyn SearchApi, proxies: &ProxySelector) -> Vec<Classification> {
        tracing::info!(keys = self.len(), "classifying API keys");
        let mut results = Vec::new();

        for (i, credential) in self.snapshot().into_iter().enumerate() {
            let proxy = proxies.choose();
            let now = Utc::now();
            let (level, username, error) = match api.account_info(&credential.key, proxy.as_ref()).await {
                Ok(info) => (level_from_account(&info), info.username, None),
                Err(e) => {
                    tracing::warn!(key = %credential.masked(), error = %e, "key verification failed");
                    (PrivilegeLevel::INVALID, None, Some(e.to_string()))
                }
            };
            self.set_level(&credential.key, level, Some(now));
            tracing::info!(key = %credential.masked(), level = %level, "key classified");
            results.push(Classification {
                index: i + 1,
                key: credential.key,
                level,
                username,
                error,
            });
        }

        results
    }
}

/// Map account details onto a privilege tier.
pub fn level_from_account(info: &AccountInfo) -> PrivilegeLevel {
    if !info.is_vip {
        return PrivilegeLevel::FREE;
    }
    match info.vip_level {
        2 => PrivilegeLevel::PERSONAL,
        3 => PrivilegeLevel::BUSINESS,
        l if l >= 4 => PrivilegeLevel::ENTERPRISE,
        _ => PrivilegeLevel::PERSONAL,
    }
}

/// Fields a key of `level` may request.
pub fn fields_for_level(level: PrivilegeLevel) -> Vec<&'static str> {
    let mut fields = FREE_FIELDS.to_vec();
    if level >= PrivilegeLevel::PERSONAL {
        fields.extend_from_slice(PERSONAL_FIELDS);
    }
    if level >= PrivilegeLevel::BUSINESS {
        fields.extend_from_slice(BUSINESS_FIELDS);
    }
    if level >= PrivilegeLevel::ENTERPRISE {
        fields.extend_from_slice(ENTERPRISE_FIELDS);
    }
    fields
}

/// The lowest level that may request every field in `fields`, or `None`
/// if some field is unknown.
pub fn required_level(fields: &[String]) -> Option<PrivilegeLevel> {
    let mut needed = PrivilegeLevel::FREE;
    for field in fields {
        let f = field.as_str();
        let level = if FREE_FIELDS.contains(&f) {
            PrivilegeLevel::FREE
        } else if PERSONAL_FIELDS.contains(&f) {
            PrivilegeLevel::PERSONAL
        } else if BUSINESS_FIELDS.contains(&f) {
            PrivilegeLevel::BUSINESS
        } else if ENTERPRISE_FIELDS.contains(&f) {
            PrivilegeLevel::ENTERPRISE
        } else {
            return None;
        };
        needed = needed.max(level);
    }
    Some(needed)
}

/// `...abcd` form of a key for logs and reports.
pub fn mask_key(key: &str) -> String {
    let tail: String = key
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("...{}", tail)
}
