//! Plain sequential pagination for scopes that fit under the page cap.

use crate::accumulator::ExtractionAccumulator;
use crate::engine::Engine;
use crate::executor::ExecOptions;
use crate::models::{PrivilegeLevel, SearchRequest, Termination};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::query::QueryScope;
use crate::stop::StopSignal;

/// Number of pages needed for `total` records, never reading past `page_cap`.
pub fn page_count(total: u64, page_cap: u64, page_size: u32) -> u32 {
    let size = u64::from(page_size.max(1));
    let wanted = total.min(page_cap);
    u32::try_from(wanted.div_ceil(size)).unwrap_or(u32::MAX)
}

pub struct DirectPager<'a> {
    engine: &'a Engine,
    scope: QueryScope,
    fields: Vec<String>,
    page_size: u32,
    base_level: PrivilegeLevel,
    options: ExecOptions,
    stop: StopSignal,
}

impl<'a> DirectPager<'a> {
    pub fn new(engine: &'a Engine, scope: QueryScope, fields: &[String], stop: StopSignal) -> Self {
        Self {
            engine,
            scope,
            fields: fields.to_vec(),
            page_size: engine.config().extract.page_size,
            base_level: PrivilegeLevel::FREE,
            options: ExecOptions::default(),
            stop,
        }
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn min_level(mut self, level: PrivilegeLevel) -> Self {
        self.base_level = level;
        self.options.min_level = level;
        self
    }

    pub fn options(mut self, options: ExecOptions) -> Self {
        self.options = options;
        self.options.min_level = self.base_level;
        self
    }

    pub fn exec_options(&self) -> &ExecOptions {
        &self.options
    }

    /// Fetch pages `1..=N` for a scope of `total` records into `acc`.
    ///
    /// Returns [`Termination::Exhausted`] once every page was read or the
    /// remote ran out early, and [`Termination::WindowLimit`] when `total`
    /// is larger than the page cap lets it read.
    pub async fn drain(
        &mut self,
        total: u64,
        acc: &mut ExtractionAccumulator,
        progress: &dyn ProgressReporter,
    ) -> Termination {
        let pages = page_count(total, self.engine.page_cap(), self.page_size);
        let query = self.scope.render();
        tracing::info!(query = %query, total, pages, "paging scope directly");

        let mut ran_out = false;
        for page in 1..=pages {
            if self.stop.is_stopped() {
                return Termination::Stopped;
            }
            if acc.is_full() {
                return Termination::CapReached;
            }

            let request = SearchRequest::new(query.as_str(), &self.fields).page(page, self.page_size);
            let executed = match self.engine.page(&request, self.options.clone()).await {
                Ok(executed) => executed,
                Err(e) => return Termination::Failed(e.to_string()),
            };
            self.options = ExecOptions::resume(&executed, self.base_level);

            let rows = executed.value.results;
            if rows.is_empty() {
                tracing::debug!(page, "empty page, stopping early");
                ran_out = true;
                break;
            }
            acc.absorb(rows);
            progress.report(ProgressEvent::Page {
                page,
                pages,
                collected: acc.len(),
            });
        }

        if acc.is_full() {
            Termination::CapReached
        } else if !ran_out && total > self.engine.page_cap() {
            tracing::warn!(
                total,
                page_cap = self.engine.page_cap(),
                "scope is larger than the page cap, the rest was not fetched"
            );
            Termination::WindowLimit
        } else {
            Termination::Exhausted
        }
    }
}
