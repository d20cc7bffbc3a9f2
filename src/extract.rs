//! Extraction jobs.
//!
//! An extraction turns one logical query into a deduplicated record set
//! using one of four strategies:
//!
//! | Mode | Strategy |
//! |------|----------|
//! | `direct` | count, then pages `1..=N` (at most the page cap) |
//! | `traceback` | time-anchored pagination of the whole scope |
//! | `peel` | dimensional peeling, tracing each slice |
//! | `auto` | `direct` when the scope fits the page cap, else `peel` |
//!
//! Without `--fields` a job extracts endpoints (`host` values containing
//! `:`) and writes them one per line. With `--fields` it extracts raw field
//! tuples and writes CSV.
//!
//! Every job runs under a session id. Ctrl-C raises that session's stop
//! flag; loops end at the next page boundary and whatever was collected is
//! still written.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::accumulator::{ExtractionAccumulator, KeyPolicy};
use crate::config::Config;
use crate::credentials::required_level;
use crate::db;
use crate::engine::Engine;
use crate::executor::ExecOptions;
use crate::export::{self, OutputFormat};
use crate::history;
use crate::migrate;
use crate::models::{Row, SearchRequest, Termination, HOST_FIELD, TIMESTAMP_FIELD};
use crate::paging::DirectPager;
use crate::peel::{DimensionalPeeler, SliceReport};
use crate::progress::{ProgressEvent, ProgressMode, ProgressReporter};
use crate::query::{parse_day, QueryScope};
use crate::traceback::TracebackPaginator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMode {
    Direct,
    Traceback,
    Peel,
    Auto,
}

impl FromStr for ExtractMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "direct" => Ok(ExtractMode::Direct),
            "traceback" => Ok(ExtractMode::Traceback),
            "peel" => Ok(ExtractMode::Peel),
            "auto" => Ok(ExtractMode::Auto),
            other => bail!(
                "Unknown extract mode: '{}'. Must be direct, traceback, peel, or auto.",
                other
            ),
        }
    }
}

impl fmt::Display for ExtractMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExtractMode::Direct => "direct",
            ExtractMode::Traceback => "traceback",
            ExtractMode::Peel => "peel",
            ExtractMode::Auto => "auto",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub query: String,
    pub mode: ExtractMode,
    /// Empty means endpoint-only extraction.
    pub fields: Vec<String>,
    pub limit: Option<usize>,
    pub session: String,
}

impl ExtractRequest {
    pub fn new(query: impl Into<String>, mode: ExtractMode) -> Self {
        Self {
            query: query.into(),
            mode,
            fields: Vec::new(),
            limit: None,
            session: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn host_only(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionReport {
    pub query: String,
    /// The strategy that actually ran (`auto` is resolved).
    pub mode: ExtractMode,
    pub fields: Vec<String>,
    pub termination: Termination,
    pub slices: Vec<SliceReport>,
    /// Sorted by identity.
    pub rows: Vec<Row>,
}

impl ExtractionReport {
    pub fn collected(&self) -> usize {
        self.rows.len()
    }

    /// Overall reason followed by each slice's reason.
    pub fn summary(&self) -> String {
        let mut out = format!("{} records, {}", self.rows.len(), self.termination);
        for s in &self.slices {
            out.push_str(&format!(
                "\n  round {} {}: +{} ({})",
                s.round, s.label, s.added, s.termination
            ));
        }
        out
    }
}

/// Run one extraction against `engine`.
pub async fn extract(
    engine: &Engine,
    request: &ExtractRequest,
    progress: &dyn ProgressReporter,
) -> Result<ExtractionReport> {
    let (fields, policy) = if request.host_only() {
        (vec![HOST_FIELD.to_string()], KeyPolicy::Host)
    } else {
        (request.fields.clone(), KeyPolicy::Tuple)
    };
    let min_level = required_level(&fields)
        .with_context(|| format!("Unknown field in: {}", fields.join(",")))?;

    let scope = QueryScope::new(request.query.as_str());
    if scope.base().is_empty() {
        bail!("Query must not be empty");
    }
    let stop = engine.stops().signal(request.session.as_str());
    let mut acc = ExtractionAccumulator::new(policy, request.limit);
    let mut slices = Vec::new();
    let mut mode = request.mode;

    tracing::info!(query = %request.query, mode = %mode, limit = ?request.limit, "extraction started");

    let mut counted = None;
    if matches!(mode, ExtractMode::Direct | ExtractMode::Auto) {
        progress.report(ProgressEvent::Counting {
            scope: scope.render(),
        });
        match engine
            .count(&scope.render(), &fields, ExecOptions::min_level(min_level))
            .await
        {
            Ok(executed) => counted = Some(executed),
            Err(e) => {
                return Ok(finish(request, mode, fields, Termination::Failed(e.to_string()), slices, acc, progress));
            }
        }
    }

    if mode == ExtractMode::Auto {
        let total = counted.as_ref().map(|c| c.value).unwrap_or(0);
        mode = if total <= engine.page_cap() {
            ExtractMode::Direct
        } else {
            ExtractMode::Peel
        };
        tracing::info!(total, chosen = %mode, "auto mode resolved");
    }

    let termination = match mode {
        ExtractMode::Direct | ExtractMode::Auto => {
            let (total, options) = match &counted {
                Some(c) => (c.value, ExecOptions::resume(c, min_level)),
                None => (0, ExecOptions::min_level(min_level)),
            };
            let mut pager = DirectPager::new(engine, scope, &fields, stop)
                .min_level(min_level)
                .options(options);
            pager.drain(total, &mut acc, progress).await
        }
        ExtractMode::Traceback => {
            let mut pager = TracebackPaginator::new(engine, scope, &fields, stop)
                .min_level(min_level)
                .options(ExecOptions::min_level(min_level));
            while let Some(batch) = pager.next_batch().await {
                let added = acc.absorb(batch);
                progress.report(ProgressEvent::Batch {
                    collected: acc.len(),
                    added,
                });
                if acc.is_full() {
                    pager.halt(Termination::CapReached);
                }
            }
            pager.termination().cloned().unwrap_or(Termination::Exhausted)
        }
        ExtractMode::Peel => {
            let report = DimensionalPeeler::new(engine, &fields, stop, progress)
                .min_level(min_level)
                .run(scope, &mut acc)
                .await;
            slices = report.slices;
            report.termination
        }
    };

    Ok(finish(request, mode, fields, termination, slices, acc, progress))
}

fn finish(
    request: &ExtractRequest,
    mode: ExtractMode,
    fields: Vec<String>,
    termination: Termination,
    slices: Vec<SliceReport>,
    acc: ExtractionAccumulator,
    progress: &dyn ProgressReporter,
) -> ExtractionReport {
    progress.report(ProgressEvent::Finished {
        collected: acc.len(),
        reason: termination.to_string(),
    });
    if termination.is_failure() {
        tracing::warn!(query = %request.query, collected = acc.len(), reason = %termination, "extraction ended with an error");
    } else {
        tracing::info!(query = %request.query, collected = acc.len(), reason = %termination, "extraction finished");
    }
    ExtractionReport {
        query: request.query.clone(),
        mode,
        fields,
        termination,
        slices,
        rows: acc.finish(),
    }
}

#[derive(Debug, Clone)]
pub struct UpdateReport {
    pub cutoff: NaiveDate,
    /// Endpoints not present in the earlier result.
    pub new_records: usize,
    pub termination: Termination,
    /// Earlier and new endpoints, sorted and unique.
    pub merged: Vec<String>,
}

/// Fetch endpoints that appeared since the newest record's day and merge
/// them into `existing`.
pub async fn update(
    engine: &Engine,
    query: &str,
    existing: Vec<String>,
    session: &str,
    progress: &dyn ProgressReporter,
) -> Result<UpdateReport> {
    let scope = QueryScope::new(query);
    let stamp_fields = vec![TIMESTAMP_FIELD.to_string()];
    let stamp_level = required_level(&stamp_fields).unwrap_or_default();

    let request = SearchRequest::new(scope.render(), &stamp_fields);
    let newest = engine
        .page(&request, ExecOptions::min_level(stamp_level))
        .await
        .context("Failed to read the newest record timestamp")?;
    let cutoff = newest
        .value
        .results
        .first()
        .and_then(|row| row.first())
        .and_then(|ts| parse_day(ts))
        .context("No timestamp available to start the update from")?;

    let fields = vec![HOST_FIELD.to_string()];
    let incremental = scope.after(cutoff);
    let options = ExecOptions::resume(&newest, Default::default());
    let counted = engine
        .count(&incremental.render(), &fields, options)
        .await
        .context("Failed to count new records")?;
    tracing::info!(cutoff = %cutoff, total = counted.value, "incremental update");

    let mut acc = ExtractionAccumulator::new(KeyPolicy::Host, None);
    let termination = if counted.value == 0 {
        Termination::Exhausted
    } else {
        let mut pager = DirectPager::new(engine, incremental, &fields, engine.stops().signal(session))
            .options(ExecOptions::resume(&counted, Default::default()));
        pager.drain(counted.value, &mut acc, progress).await
    };

    let mut merged: std::collections::BTreeSet<String> = existing.into_iter().collect();
    let mut new_records = 0;
    for id in acc.identities() {
        if merged.insert(id.to_string()) {
            new_records += 1;
        }
    }

    Ok(UpdateReport {
        cutoff,
        new_records,
        termination,
        merged: merged.into_iter().collect(),
    })
}

/// Raise the session's stop flag on Ctrl-C.
fn stop_on_ctrl_c(engine: &Engine, session: &str) {
    let flags = engine.stops().clone();
    let session = session.to_string();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current page");
            flags.request(&session);
        }
    });
}

/// `harvest extract`: run a job and write its result file.
pub async fn run_extract(
    config: &Config,
    request: ExtractRequest,
    output: Option<PathBuf>,
    progress: ProgressMode,
) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool).await?;
    let engine = Engine::open(config, &pool).await?;
    stop_on_ctrl_c(&engine, &request.session);

    let reporter = progress.reporter();
    let report = extract(&engine, &request, reporter.as_ref()).await?;
    engine.stops().clear(&request.session);

    if report.rows.is_empty() {
        println!("No records collected: {}", report.termination);
        pool.close().await;
        return Ok(());
    }

    let format = if request.host_only() {
        OutputFormat::Lines
    } else {
        OutputFormat::Csv
    };
    let path = output.unwrap_or_else(|| {
        export::output_path(
            &config.extract.output_dir,
            &report.mode.to_string(),
            &report.query,
            format,
        )
    });
    export::write_result(&path, format, &report.fields, &report.rows)?;
    history::record(&pool, &report.query, &path, report.collected()).await?;

    println!("{}", report.summary());
    println!("Wrote {}", path.display());

    pool.close().await;
    Ok(())
}

/// `harvest update`: merge records newer than the cached result into its file.
pub async fn run_update(config: &Config, query: &str, progress: ProgressMode) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool).await?;
    let Some(entry) = history::lookup(&pool, query).await? else {
        pool.close().await;
        bail!("No earlier extraction recorded for query: {}", query);
    };
    let existing = export::read_endpoints(&entry.file_path)?;

    let engine = Engine::open(config, &pool).await?;
    let session = uuid::Uuid::new_v4().to_string();
    stop_on_ctrl_c(&engine, &session);

    let reporter = progress.reporter();
    let report = update(&engine, query, existing, &session, reporter.as_ref()).await?;
    engine.stops().clear(&session);

    if report.new_records == 0 {
        println!("No new records since {} ({}).", report.cutoff, report.termination);
        pool.close().await;
        return Ok(());
    }

    let rows: Vec<Row> = report.merged.iter().map(|id| vec![id.clone()]).collect();
    export::write_result(&entry.file_path, OutputFormat::Lines, &[], &rows)?;
    history::record(&pool, query, &entry.file_path, rows.len()).await?;

    println!(
        "{} new records since {}, {} total ({})",
        report.new_records,
        report.cutoff,
        rows.len(),
        report.termination
    );
    println!("Wrote {}", entry.file_path.display());

    pool.close().await;
    Ok(())
}
