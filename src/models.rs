//! Core data models used throughout the extraction engine.
//!
//! These types describe what crosses the remote API boundary (requests,
//! pages, aggregate breakdowns, account info) and the vocabulary the
//! algorithms use to report why they stopped.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One result record as returned by the remote API: one value per requested field.
pub type Row = Vec<String>;

/// The identity field requested by host-only extraction.
pub const HOST_FIELD: &str = "host";

/// The timestamp field required for time traceback (privilege ≥ 1).
pub const TIMESTAMP_FIELD: &str = "lastupdatetime";

/// Parameters of one remote search call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub page: u32,
    pub page_size: u32,
    pub fields: Vec<String>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, fields: &[String]) -> Self {
        Self {
            query: query.into(),
            page: 1,
            page_size: 1,
            fields: fields.to_vec(),
        }
    }

    pub fn page(mut self, page: u32, page_size: u32) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }
}

/// One page of search results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPage {
    /// Total number of records the remote reports for the query.
    pub size: u64,
    pub results: Vec<Row>,
}

/// One category value in an aggregate breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsBucket {
    pub name: String,
    pub count: u64,
}

/// Field name to the aggregate name the stats endpoint reports it under.
const STATS_ALIASES: &[(&str, &str)] = &[
    ("country", "countries"),
    ("as_organization", "org"),
    ("as_number", "asn"),
];

/// Aggregate breakdown of a query by one or more categorical dimensions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsBreakdown {
    pub dimensions: HashMap<String, Vec<StatsBucket>>,
}

impl StatsBreakdown {
    /// Buckets for `dimension`, looking under the aggregate name the
    /// remote reports it as (`country` comes back as `countries`).
    pub fn buckets_for(&self, dimension: &str) -> &[StatsBucket] {
        let alias = STATS_ALIASES
            .iter()
            .find(|(field, _)| *field == dimension)
            .map(|(_, aggregate)| *aggregate);
        self.dimensions
            .get(dimension)
            .or_else(|| alias.and_then(|a| self.dimensions.get(a)))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The single largest category of `dimension`, if any.
    pub fn top(&self, dimension: &str) -> Option<&StatsBucket> {
        self.buckets_for(dimension)
            .iter()
            .filter(|b| !b.name.is_empty())
            .max_by(|a, b| a.count.cmp(&b.count).then_with(|| b.name.cmp(&a.name)))
    }
}

/// Account information used to classify a credential.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountInfo {
    pub username: Option<String>,
    pub is_vip: bool,
    pub vip_level: i64,
}

/// Ordinal privilege tier of a credential. Defaults to [`PrivilegeLevel::FREE`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PrivilegeLevel(pub i8);

impl PrivilegeLevel {
    pub const INVALID: Self = Self(-1);
    pub const FREE: Self = Self(0);
    pub const PERSONAL: Self = Self(1);
    pub const BUSINESS: Self = Self(2);
    pub const ENTERPRISE: Self = Self(3);

    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "free",
            1 => "personal",
            2 => "business",
            3 => "enterprise",
            _ => "invalid",
        }
    }

    /// Whether keys at this level may request [`TIMESTAMP_FIELD`].
    pub fn can_traceback(self) -> bool {
        self >= Self::PERSONAL
    }
}

impl fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}

/// Why an extraction loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The remote returned an empty page.
    Exhausted,
    /// The key cannot request the timestamp field, so only one page was fetched.
    SinglePageFallback,
    /// No parseable date was found to anchor the next page.
    BoundaryReached,
    /// The caller's record cap was reached.
    CapReached,
    /// The session's stop flag was observed.
    Stopped,
    /// The peel loop hit its round ceiling.
    IterationCeiling,
    /// The traceback loop hit its round ceiling.
    RoundLimit,
    /// The remaining scope fit under the page cap and was paged out completely.
    Drained,
    /// Direct paging read up to the page cap but the scope holds more.
    WindowLimit,
    /// No aggregate breakdown was available; the whole scope was traced once.
    Unsplittable,
    /// An error from the executor, count call or stats call.
    Failed(String),
}

impl Termination {
    pub fn is_failure(&self) -> bool {
        matches!(self, Termination::Failed(_))
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exhausted => write!(f, "exhausted: all query results fetched"),
            Termination::SinglePageFallback => write!(
                f,
                "single-page fallback: key level does not allow time traceback"
            ),
            Termination::BoundaryReached => {
                write!(f, "boundary reached: no valid time anchor to continue")
            }
            Termination::CapReached => write!(f, "cap reached"),
            Termination::Stopped => write!(f, "manually stopped"),
            Termination::IterationCeiling => {
                write!(f, "iteration ceiling: too many peel rounds, aborted")
            }
            Termination::RoundLimit => write!(f, "round limit: traceback aborted"),
            Termination::Drained => write!(f, "drained: remaining scope fetched directly"),
            Termination::WindowLimit => write!(
                f,
                "window limit: records past the page cap were not fetched, use peel or auto mode"
            ),
            Termination::Unsplittable => {
                write!(f, "unsplittable: no breakdown available, traced whole scope")
            }
            Termination::Failed(msg) => write!(f, "error: {}", msg),
        }
    }
}
