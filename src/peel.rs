//! Dimensional peeling of oversized scopes.
//!
//! Each round counts the working scope. A scope that fits under the page
//! cap is paged out directly and the loop ends. Otherwise the largest value
//! of the split dimension (e.g. the top country) is cut off as a slice and
//! traced back in time, and the rest (`dimension!="top"`) becomes the new
//! working scope.
//!
//! Without a breakdown the whole scope is traced once and the loop ends
//! there. A round ceiling guards against a breakdown that never shrinks the
//! scope.

use crate::accumulator::ExtractionAccumulator;
use crate::engine::Engine;
use crate::executor::ExecOptions;
use crate::models::{PrivilegeLevel, Termination};
use crate::paging::DirectPager;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::query::QueryScope;
use crate::stop::StopSignal;
use crate::traceback::TracebackPaginator;

/// Outcome of one slice (or of the final directly-paged remainder).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceReport {
    pub round: u32,
    pub label: String,
    pub added: usize,
    pub termination: Termination,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeelReport {
    pub rounds: u32,
    pub termination: Termination,
    pub slices: Vec<SliceReport>,
}

/// Whether a slice outcome ends the whole peel.
fn ends_peel(termination: &Termination) -> bool {
    matches!(
        termination,
        Termination::Stopped | Termination::CapReached | Termination::Failed(_)
    )
}

pub struct DimensionalPeeler<'a> {
    engine: &'a Engine,
    fields: Vec<String>,
    dimension: String,
    base_level: PrivilegeLevel,
    max_rounds: u32,
    stop: StopSignal,
    progress: &'a dyn ProgressReporter,
}

impl<'a> DimensionalPeeler<'a> {
    pub fn new(
        engine: &'a Engine,
        fields: &[String],
        stop: StopSignal,
        progress: &'a dyn ProgressReporter,
    ) -> Self {
        let extract = &engine.config().extract;
        Self {
            engine,
            fields: fields.to_vec(),
            dimension: extract.dimension.clone(),
            base_level: PrivilegeLevel::FREE,
            max_rounds: extract.max_peel_rounds,
            stop,
            progress,
        }
    }

    pub fn dimension(mut self, dimension: impl Into<String>) -> Self {
        self.dimension = dimension.into();
        self
    }

    pub fn min_level(mut self, level: PrivilegeLevel) -> Self {
        self.base_level = level;
        self
    }

    pub fn max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds;
        self
    }

    pub async fn run(&self, scope: QueryScope, acc: &mut ExtractionAccumulator) -> PeelReport {
        let mut working = scope;
        let mut options = ExecOptions::min_level(self.base_level);
        let mut slices = Vec::new();
        let mut rounds = 0u32;

        let termination = loop {
            if self.stop.is_stopped() {
                break Termination::Stopped;
            }
            if acc.is_full() {
                break Termination::CapReached;
            }
            if rounds >= self.max_rounds {
                tracing::warn!(
                    rounds,
                    scope = %working,
                    "peel round ceiling reached, remaining scope left unfetched"
                );
                break Termination::IterationCeiling;
            }
            rounds += 1;

            let query = working.render();
            self.progress.report(ProgressEvent::Counting {
                scope: query.clone(),
            });
            let total = match self.engine.count(&query, &self.fields, options.clone()).await {
                Ok(executed) => {
                    options = ExecOptions::resume(&executed, self.base_level);
                    executed.value
                }
                Err(e) => break Termination::Failed(e.to_string()),
            };
            tracing::info!(round = rounds, total, scope = %working, "peel round");

            if total <= self.engine.page_cap() {
                let before = acc.len();
                let mut pager = DirectPager::new(self.engine, working.clone(), &self.fields, self.stop.clone())
                    .min_level(self.base_level)
                    .options(options.clone());
                let outcome = pager.drain(total, acc, self.progress).await;
                slices.push(SliceReport {
                    round: rounds,
                    label: "remainder".to_string(),
                    added: acc.len() - before,
                    termination: outcome.clone(),
                });
                break match outcome {
                    Termination::Exhausted => Termination::Drained,
                    other => other,
                };
            }

            let breakdown = match self.engine.stats(&query, &self.dimension, options.clone()).await {
                Ok(executed) => executed.value,
                Err(e) => break Termination::Failed(e.to_string()),
            };

            let Some(top) = breakdown.top(&self.dimension).cloned() else {
                tracing::warn!(
                    dimension = %self.dimension,
                    scope = %working,
                    "no breakdown available, tracing the whole scope once"
                );
                let (added, outcome) = self.trace(working.clone(), &options, acc).await;
                slices.push(SliceReport {
                    round: rounds,
                    label: "*".to_string(),
                    added,
                    termination: outcome.clone(),
                });
                break if ends_peel(&outcome) {
                    outcome
                } else {
                    Termination::Unsplittable
                };
            };

            let label = format!("{}={}", self.dimension, top.name);
            self.progress.report(ProgressEvent::Slice {
                round: rounds,
                label: label.clone(),
                total: top.count,
            });

            let slice = working.only(&self.dimension, &top.name);
            let (added, outcome) = self.trace(slice, &options, acc).await;
            tracing::info!(slice = %label, added, reason = %outcome, "slice finished");
            slices.push(SliceReport {
                round: rounds,
                label,
                added,
                termination: outcome.clone(),
            });
            if ends_peel(&outcome) {
                break outcome;
            }

            working = working.without(&self.dimension, &top.name);
        };

        PeelReport {
            rounds,
            termination,
            slices,
        }
    }

    async fn trace(
        &self,
        scope: QueryScope,
        options: &ExecOptions,
        acc: &mut ExtractionAccumulator,
    ) -> (usize, Termination) {
        let mut pager = TracebackPaginator::new(self.engine, scope, &self.fields, self.stop.clone())
            .min_level(self.base_level)
            .options(options.clone());
        let mut added = 0;

        while let Some(batch) = pager.next_batch().await {
            let new = acc.absorb(batch);
            added += new;
            self.progress.report(ProgressEvent::Batch {
                collected: acc.len(),
                added: new,
            });
            if acc.is_full() {
                pager.halt(Termination::CapReached);
            }
        }

        let outcome = pager
            .termination()
            .cloned()
            .unwrap_or(Termination::Exhausted);
        (added, outcome)
    }
}
