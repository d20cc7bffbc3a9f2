//! Deduplicating, capped result accumulator.
//!
//! Every batch produced by pagination, traceback or peeling flows into one
//! [`ExtractionAccumulator`]. Records are keyed by their identity; once the
//! cap is reached further records are refused, so the kept set is the first
//! N distinct identities encountered.

use std::collections::BTreeMap;

use crate::models::Row;

/// How a record's identity is derived from its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPolicy {
    /// Identity is the first column; only endpoints (`host:port`) are kept.
    Host,
    /// Identity is the whole tuple joined with `,`.
    Tuple,
}

impl KeyPolicy {
    pub fn identity(self, row: &Row) -> Option<String> {
        match self {
            KeyPolicy::Host => {
                let host = row.first()?.trim();
                if host.contains(':') {
                    Some(host.to_string())
                } else {
                    None
                }
            }
            KeyPolicy::Tuple => {
                if row.iter().all(|v| v.trim().is_empty()) {
                    None
                } else {
                    Some(row.join(","))
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionAccumulator {
    policy: KeyPolicy,
    cap: Option<usize>,
    records: BTreeMap<String, Row>,
}

impl ExtractionAccumulator {
    pub fn new(policy: KeyPolicy, cap: Option<usize>) -> Self {
        Self {
            policy,
            cap,
            records: BTreeMap::new(),
        }
    }

    pub fn policy(&self) -> KeyPolicy {
        self.policy
    }

    pub fn cap(&self) -> Option<usize> {
        self.cap
    }

    /// Add one record. Returns `true` if it was new and accepted.
    pub fn insert(&mut self, row: Row) -> bool {
        if self.is_full() {
            return false;
        }
        let Some(key) = self.policy.identity(&row) else {
            return false;
        };
        if self.records.contains_key(&key) {
            return false;
        }
        self.records.insert(key, row);
        true
    }

    /// Add a batch, stopping at the cap. Returns how many records were new.
    pub fn absorb(&mut self, batch: impl IntoIterator<Item = Row>) -> usize {
        let mut added = 0;
        for row in batch {
            if self.is_full() {
                break;
            }
            if self.insert(row) {
                added += 1;
            }
        }
        added
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        matches!(self.cap, Some(cap) if self.records.len() >= cap)
    }

    /// Identities in sorted order.
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    /// Records sorted by identity.
    pub fn finish(self) -> Vec<Row> {
        self.records.into_values().collect()
    }
}
