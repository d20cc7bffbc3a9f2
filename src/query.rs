//! Structured query rewriting.
//!
//! A [`QueryScope`] is an immutable base query plus a list of AND-clauses.
//! It renders as `(base) && clause && clause ...`, so the caller's scope is
//! always kept intact as one parenthesized conjunct. Time boundaries are
//! replaced rather than appended: a scope carries at most one `before` and
//! one `after` clause.

use std::fmt;

use chrono::NaiveDate;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// One predicate AND-ed onto a base query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clause {
    Before(NaiveDate),
    After(NaiveDate),
    Equals { field: String, value: String },
    NotEquals { field: String, value: String },
}

impl Clause {
    fn is_before(&self) -> bool {
        matches!(self, Clause::Before(_))
    }

    fn is_after(&self) -> bool {
        matches!(self, Clause::After(_))
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Clause::Before(date) => write!(f, "before=\"{}\"", date.format(DATE_FORMAT)),
            Clause::After(date) => write!(f, "after=\"{}\"", date.format(DATE_FORMAT)),
            Clause::Equals { field, value } => write!(f, "{}=\"{}\"", field, escape(value)),
            Clause::NotEquals { field, value } => {
                write!(f, "{}!=\"{}\"", field, escape(value))
            }
        }
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// A base query and the clauses narrowing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryScope {
    base: String,
    clauses: Vec<Clause>,
}

impl QueryScope {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim().to_string(),
            clauses: Vec::new(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// A narrower scope with `clause` added. Duplicate clauses are not repeated.
    pub fn with(&self, clause: Clause) -> Self {
        let mut next = self.clone();
        if clause.is_before() {
            next.clauses.retain(|c| !c.is_before());
        } else if clause.is_after() {
            next.clauses.retain(|c| !c.is_after());
        } else if next.clauses.contains(&clause) {
            return next;
        }
        next.clauses.push(clause);
        next
    }

    pub fn before(&self, date: NaiveDate) -> Self {
        self.with(Clause::Before(date))
    }

    pub fn after(&self, date: NaiveDate) -> Self {
        self.with(Clause::After(date))
    }

    /// The slice of this scope where `field` equals `value`.
    pub fn only(&self, field: &str, value: &str) -> Self {
        self.with(Clause::Equals {
            field: field.to_string(),
            value: value.to_string(),
        })
    }

    /// The remainder of this scope once `field == value` has been taken out.
    pub fn without(&self, field: &str, value: &str) -> Self {
        self.with(Clause::NotEquals {
            field: field.to_string(),
            value: value.to_string(),
        })
    }

    /// Render to the remote query syntax.
    pub fn render(&self) -> String {
        if self.clauses.is_empty() {
            return self.base.clone();
        }
        let mut out = format!("({})", self.base);
        for clause in &self.clauses {
            out.push_str(" && ");
            out.push_str(&clause.to_string());
        }
        out
    }
}

impl fmt::Display for QueryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Parse the date part of a remote timestamp (`"2024-03-01 12:00:00"` or `"2024-03-01"`).
pub fn parse_day(timestamp: &str) -> Option<NaiveDate> {
    let day = timestamp.trim().split([' ', 'T']).next()?;
    NaiveDate::parse_from_str(day, DATE_FORMAT).ok()
}
