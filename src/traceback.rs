//! Time-anchored pagination past the per-query record ceiling.
//!
//! The remote returns newest records first and never more than one page
//! per query. [`TracebackPaginator`] fetches a page, finds the oldest date
//! on it and rewrites the query with `before="<date>"` so the next page
//! continues from there. Anchors strictly decrease: when the oldest date
//! on a page is not earlier than the previous anchor (one day holds more
//! than a page of records) the anchor is forced back one more day.
//!
//! The timestamp field needs a privilege-1 key. With only free keys the
//! first page is the whole result ([`Termination::SinglePageFallback`]).

use chrono::{Duration, NaiveDate};

use crate::engine::Engine;
use crate::error::ExecError;
use crate::executor::{ExecOptions, Executed};
use crate::models::{PrivilegeLevel, Row, SearchRequest, Termination, TIMESTAMP_FIELD};
use crate::query::{parse_day, QueryScope};
use crate::stop::StopSignal;

/// One fetched page plus where its timestamp column is, if it has one.
#[derive(Debug, Clone)]
struct FetchedPage {
    rows: Vec<Row>,
    timestamp_column: Option<usize>,
}

/// Next anchor given the oldest date on the latest page.
pub fn next_anchor(oldest: NaiveDate, previous: Option<NaiveDate>) -> NaiveDate {
    match previous {
        Some(prev) if oldest >= prev => prev - Duration::days(1),
        _ => oldest,
    }
}

/// Oldest parseable date on a page, scanning from the end.
pub fn oldest_date(rows: &[Row], column: usize) -> Option<NaiveDate> {
    rows.iter()
        .rev()
        .find_map(|row| row.get(column).and_then(|ts| parse_day(ts)))
}

pub struct TracebackPaginator<'a> {
    engine: &'a Engine,
    scope: QueryScope,
    fields: Vec<String>,
    page_size: u32,
    base_level: PrivilegeLevel,
    options: ExecOptions,
    locked: bool,
    stop: StopSignal,
    cap: Option<usize>,
    max_rounds: u32,
    rounds: u32,
    yielded: usize,
    last_anchor: Option<NaiveDate>,
    anchors: Vec<NaiveDate>,
    termination: Option<Termination>,
}

impl<'a> TracebackPaginator<'a> {
    /// `fields` are the caller's columns; the timestamp column is added
    /// and stripped again when the key allows it.
    pub fn new(engine: &'a Engine, scope: QueryScope, fields: &[String], stop: StopSignal) -> Self {
        let config = engine.config();
        Self {
            engine,
            scope,
            fields: fields.to_vec(),
            page_size: config.extract.page_size,
            base_level: PrivilegeLevel::FREE,
            options: ExecOptions::default(),
            locked: false,
            stop,
            cap: None,
            max_rounds: config.extract.max_trace_rounds,
            rounds: 0,
            yielded: 0,
            last_anchor: None,
            anchors: Vec::new(),
            termination: None,
        }
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Stop once this many raw records have been yielded.
    pub fn cap(mut self, cap: Option<usize>) -> Self {
        self.cap = cap;
        self
    }

    /// Lowest level the caller's own fields need.
    pub fn min_level(mut self, level: PrivilegeLevel) -> Self {
        self.base_level = level;
        self
    }

    /// Start on this key and route.
    pub fn options(mut self, options: ExecOptions) -> Self {
        self.options = options;
        self
    }

    pub fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }

    /// Anchors used so far, in order.
    pub fn anchors(&self) -> &[NaiveDate] {
        &self.anchors
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Key and route the paginator settled on, for follow-up calls.
    pub fn exec_options(&self) -> &ExecOptions {
        &self.options
    }

    /// End the sequence early, e.g. when the consumer's accumulator is full.
    pub fn halt(&mut self, reason: Termination) {
        if self.termination.is_none() {
            self.termination = Some(reason);
        }
    }

    fn finish(&mut self, reason: Termination) {
        tracing::debug!(scope = %self.scope, rounds = self.rounds, reason = %reason, "traceback finished");
        self.termination = Some(reason);
    }

    /// Next batch of rows, or `None` once terminated.
    pub async fn next_batch(&mut self) -> Option<Vec<Row>> {
        if self.termination.is_some() {
            return None;
        }
        if self.stop.is_stopped() {
            self.finish(Termination::Stopped);
            return None;
        }
        if matches!(self.cap, Some(cap) if self.yielded >= cap) {
            self.finish(Termination::CapReached);
            return None;
        }
        if self.rounds >= self.max_rounds {
            tracing::warn!(scope = %self.scope, rounds = self.rounds, "traceback round limit reached");
            self.finish(Termination::RoundLimit);
            return None;
        }
        self.rounds += 1;

        let scope = match self.last_anchor {
            Some(anchor) => self.scope.before(anchor),
            None => self.scope.clone(),
        };
        let query = scope.render();

        let fetched = match self.fetch(&query).await {
            Ok(page) => page,
            Err(e) => {
                self.finish(Termination::Failed(e.to_string()));
                return None;
            }
        };

        if fetched.rows.is_empty() {
            self.finish(Termination::Exhausted);
            return None;
        }

        let Some(column) = fetched.timestamp_column else {
            self.yielded += fetched.rows.len();
            self.finish(Termination::SinglePageFallback);
            return Some(fetched.rows);
        };

        match oldest_date(&fetched.rows, column) {
            Some(oldest) => {
                let anchor = next_anchor(oldest, self.last_anchor);
                tracing::debug!(query = %query, rows = fetched.rows.len(), anchor = %anchor, "traceback page");
                self.anchors.push(anchor);
                self.last_anchor = Some(anchor);
            }
            None => self.finish(Termination::BoundaryReached),
        }

        let rows = self.strip_timestamp(fetched.rows, column);
        self.yielded += rows.len();
        Some(rows)
    }

    /// Drop the timestamp column again unless the caller asked for it.
    fn strip_timestamp(&self, rows: Vec<Row>, column: usize) -> Vec<Row> {
        if self.fields.iter().any(|f| f == TIMESTAMP_FIELD) {
            return rows;
        }
        rows.into_iter()
            .map(|mut row| {
                if column < row.len() {
                    row.remove(column);
                }
                row
            })
            .collect()
    }

    async fn fetch(&mut self, query: &str) -> Result<FetchedPage, ExecError> {
        let traceback_level = self.base_level.max(PrivilegeLevel::PERSONAL);
        let mut options = self.options.clone();
        options.min_level = traceback_level;

        let result = match self.fetch_with(query, options.clone(), true).await {
            Err(ExecError::BelowPrivilegeFloor { .. }) if !self.locked => {
                tracing::warn!(scope = %self.scope, "no key can request the timestamp field, fetching a single page");
                options.min_level = self.base_level;
                self.fetch_with(query, options, false).await
            }
            other => other,
        };

        let executed = result?;
        if !self.locked {
            self.options = ExecOptions::resume(&executed, self.base_level);
            self.locked = true;
        }
        Ok(executed.value)
    }

    async fn fetch_with(
        &self,
        query: &str,
        options: ExecOptions,
        want_timestamp: bool,
    ) -> Result<Executed<FetchedPage>, ExecError> {
        let mut fields = self.fields.clone();
        let timestamp_column = if want_timestamp {
            match fields.iter().position(|f| f == TIMESTAMP_FIELD) {
                Some(i) => Some(i),
                None => {
                    fields.push(TIMESTAMP_FIELD.to_string());
                    Some(fields.len() - 1)
                }
            }
        } else {
            None
        };

        let request = SearchRequest::new(query, &fields).page(1, self.page_size);
        let executed = self.engine.page(&request, options).await?;
        Ok(Executed {
            value: FetchedPage {
                rows: executed.value.results,
                timestamp_column,
            },
            index: executed.index,
            key: executed.key,
            level: executed.level,
            proxy: executed.proxy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn anchor_follows_oldest_date() {
        assert_eq!(next_anchor(day("2024-03-01"), None), day("2024-03-01"));
        assert_eq!(
            next_anchor(day("2024-02-20"), Some(day("2024-03-01"))),
            day("2024-02-20")
        );
    }

    #[test]
    fn anchor_is_forced_back_on_tie() {
        let prev = day("2024-03-01");
        assert_eq!(next_anchor(prev, Some(prev)), day("2024-02-29"));
        assert_eq!(next_anchor(day("2024-03-05"), Some(prev)), day("2024-02-29"));
    }

    #[test]
    fn oldest_date_scans_from_the_end() {
        let rows: Vec<Row> = vec![
            vec!["a:1".into(), "2024-03-03 10:00:00".into()],
            vec!["b:1".into(), "2024-03-02 10:00:00".into()],
            vec!["c:1".into(), "garbage".into()],
            vec!["d:1".into()],
        ];
        assert_eq!(oldest_date(&rows, 1), Some(day("2024-03-02")));
        let undated: Vec<Row> = vec![vec!["x:1".into(), "".into()]];
        assert_eq!(oldest_date(&undated, 1), None);
    }
}
