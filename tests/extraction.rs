//! Traceback, peeling and whole extraction jobs against the fake remote.

mod common;

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{Duration, NaiveDate};
use common::{config, day, engine, spread, FakeSearchApi, Record, StatsMode};
use fofa_harvest::accumulator::{ExtractionAccumulator, KeyPolicy};
use fofa_harvest::export::{self, OutputFormat};
use fofa_harvest::extract::{extract, update, ExtractMode, ExtractRequest};
use fofa_harvest::models::Termination;
use fofa_harvest::peel::DimensionalPeeler;
use fofa_harvest::progress::{NoProgress, ProgressEvent, ProgressReporter};
use fofa_harvest::query::QueryScope;
use fofa_harvest::stop::{StopFlags, StopSignal};
use fofa_harvest::traceback::TracebackPaginator;
use tempfile::TempDir;

const QUERY: &str = "app=\"redis\"";
const KEYS: &[(&str, i8)] = &[("free", 0), ("pro", 1)];

fn newest() -> NaiveDate {
    day("2024-06-30")
}

fn host_fields() -> Vec<String> {
    vec!["host".to_string()]
}

/// Raises the session's stop flag once the first batch has been merged.
struct StopAfterFirstBatch {
    flags: StopFlags,
    session: String,
    batches: Mutex<usize>,
}

impl ProgressReporter for StopAfterFirstBatch {
    fn report(&self, event: ProgressEvent) {
        if let ProgressEvent::Batch { .. } = event {
            *self.batches.lock().unwrap() += 1;
            self.flags.request(&self.session);
        }
    }
}

#[tokio::test]
async fn traceback_anchors_strictly_decrease_and_cover_all_days() {
    let tmp = TempDir::new().unwrap();
    let api = FakeSearchApi::new(spread("US", 3000, 100, newest()));
    let engine = engine(config(tmp.path()), api.clone(), KEYS);

    let mut pager = TracebackPaginator::new(
        &engine,
        QueryScope::new(QUERY),
        &host_fields(),
        StopSignal::never(),
    );
    let mut acc = ExtractionAccumulator::new(KeyPolicy::Host, None);
    while let Some(batch) = pager.next_batch().await {
        assert!(batch.iter().all(|row| row.len() == 1), "timestamp column must be stripped");
        acc.absorb(batch);
    }

    assert_eq!(pager.termination(), Some(&Termination::Exhausted));
    assert_eq!(acc.len(), 3000);
    let anchors = pager.anchors();
    assert!(anchors.len() >= 4);
    assert!(anchors.windows(2).all(|w| w[1] < w[0]), "anchors: {:?}", anchors);

    // Only the privileged key can ask for timestamps.
    assert!(api.keys_used().iter().all(|k| k == "pro"));
    // Every query after the first carries the previous anchor.
    let calls = api.calls();
    for (call, anchor) in calls.iter().skip(1).zip(anchors) {
        assert!(call.query.contains(&format!("before=\"{}\"", anchor)));
    }
}

#[tokio::test]
async fn dense_day_forces_the_anchor_back() {
    let tmp = TempDir::new().unwrap();
    let api = FakeSearchApi::new(spread("US", 2500, 2500, newest()));
    let engine = engine(config(tmp.path()), api.clone(), KEYS);

    let mut pager = TracebackPaginator::new(
        &engine,
        QueryScope::new(QUERY),
        &host_fields(),
        StopSignal::never(),
    );
    while pager.next_batch().await.is_some() {}

    assert_eq!(
        pager.anchors(),
        &[newest(), newest() - Duration::days(1)]
    );
    assert_eq!(pager.termination(), Some(&Termination::Exhausted));
}

#[tokio::test]
async fn free_keys_get_a_single_page() {
    let tmp = TempDir::new().unwrap();
    let api = FakeSearchApi::new(spread("US", 3000, 100, newest()));
    let engine = engine(config(tmp.path()), api.clone(), &[("free", 0)]);

    let mut pager = TracebackPaginator::new(
        &engine,
        QueryScope::new(QUERY),
        &host_fields(),
        StopSignal::never(),
    );
    let first = pager.next_batch().await.unwrap();
    assert_eq!(first.len(), 1000);
    assert!(pager.next_batch().await.is_none());
    assert_eq!(pager.termination(), Some(&Termination::SinglePageFallback));
    assert_eq!(api.calls().len(), 1);
}

#[tokio::test]
async fn peel_collects_everything_in_few_rounds() {
    let tmp = TempDir::new().unwrap();
    let mut records = spread("US", 15_000, 100, newest());
    records.extend(spread("CN", 7_000, 100, newest()));
    records.extend(spread("DE", 3_000, 100, newest()));
    let api = FakeSearchApi::new(records);
    let engine = engine(config(tmp.path()), api.clone(), KEYS);

    let mut acc = ExtractionAccumulator::new(KeyPolicy::Host, None);
    let report = DimensionalPeeler::new(&engine, &host_fields(), StopSignal::never(), &NoProgress)
        .run(QueryScope::new(QUERY), &mut acc)
        .await;

    assert_eq!(acc.len(), 25_000);
    assert!(report.rounds <= 3, "rounds: {}", report.rounds);
    assert_eq!(report.termination, Termination::Drained);
    assert_eq!(report.slices[0].label, "country=US");
    assert_eq!(report.slices[0].added, 15_000);
    assert_eq!(report.slices.last().unwrap().label, "remainder");

    // The remainder is paged within the window and excludes the peeled slice.
    let remainder: Vec<_> = api
        .calls()
        .into_iter()
        .filter(|c| c.query.contains("country!=\"US\"") && c.page > 0)
        .collect();
    assert!(remainder.iter().all(|c| c.page * c.size <= 10_000));
}

#[tokio::test]
async fn auto_mode_peels_oversized_scopes() {
    let tmp = TempDir::new().unwrap();
    let mut records = spread("US", 14_000, 100, newest());
    records.extend(spread("CN", 6_000, 100, newest()));
    records.extend(spread("DE", 3_500, 100, newest()));
    let api = FakeSearchApi::new(records);
    let engine = engine(config(tmp.path()), api.clone(), KEYS);

    let request = ExtractRequest::new(QUERY, ExtractMode::Auto);
    let report = extract(&engine, &request, &NoProgress).await.unwrap();

    assert_eq!(report.mode, ExtractMode::Peel);
    assert_eq!(report.collected(), 23_500);
    assert_eq!(report.termination, Termination::Drained);
    assert_eq!(report.slices.len(), 2);
    assert_eq!(report.slices[0].termination, Termination::Exhausted);
    assert!(report.summary().starts_with("23500 records"));

    let unique: HashSet<&String> = report.rows.iter().map(|r| &r[0]).collect();
    assert_eq!(unique.len(), 23_500);
}

#[tokio::test]
async fn auto_mode_pages_small_scopes_directly() {
    let tmp = TempDir::new().unwrap();
    let api = FakeSearchApi::new(spread("US", 2_500, 100, newest()));
    let engine = engine(config(tmp.path()), api.clone(), KEYS);

    let request = ExtractRequest::new(QUERY, ExtractMode::Auto);
    let report = extract(&engine, &request, &NoProgress).await.unwrap();

    assert_eq!(report.mode, ExtractMode::Direct);
    assert_eq!(report.collected(), 2_500);
    assert_eq!(report.termination, Termination::Exhausted);
    // One count plus three pages.
    assert_eq!(api.calls().len(), 4);
}

#[tokio::test]
async fn limit_caps_the_result() {
    let tmp = TempDir::new().unwrap();
    let mut records = spread("US", 15_000, 100, newest());
    records.extend(spread("CN", 10_000, 100, newest()));
    let api = FakeSearchApi::new(records);
    let engine = engine(config(tmp.path()), api.clone(), KEYS);

    let mut request = ExtractRequest::new(QUERY, ExtractMode::Peel);
    request.limit = Some(2_500);
    let report = extract(&engine, &request, &NoProgress).await.unwrap();

    assert_eq!(report.collected(), 2_500);
    assert_eq!(report.termination, Termination::CapReached);
}

#[tokio::test]
async fn stop_flag_ends_the_job_at_a_page_boundary() {
    let tmp = TempDir::new().unwrap();
    let api = FakeSearchApi::new(spread("US", 15_000, 100, newest()));
    let engine = engine(config(tmp.path()), api.clone(), KEYS);

    let request = ExtractRequest::new(QUERY, ExtractMode::Traceback);
    let reporter = StopAfterFirstBatch {
        flags: engine.stops().clone(),
        session: request.session.clone(),
        batches: Mutex::new(0),
    };
    let report = extract(&engine, &request, &reporter).await.unwrap();

    assert_eq!(report.termination, Termination::Stopped);
    assert_eq!(report.collected(), 1_000);
    assert_eq!(*reporter.batches.lock().unwrap(), 1);
    assert_eq!(api.calls().len(), 1);
}

#[tokio::test]
async fn custom_fields_are_exported_as_csv() {
    let tmp = TempDir::new().unwrap();
    let api = FakeSearchApi::new(spread("US", 30, 10, newest()));
    let engine = engine(config(tmp.path()), api.clone(), KEYS);

    let mut request = ExtractRequest::new(QUERY, ExtractMode::Direct);
    request.fields = vec!["host".to_string(), "country".to_string()];
    let report = extract(&engine, &request, &NoProgress).await.unwrap();
    assert_eq!(report.collected(), 30);

    let path = tmp.path().join("out.csv");
    export::write_result(&path, OutputFormat::Csv, &report.fields, &report.rows).unwrap();
    let content = std::fs::read_to_string(&path).unwrap();
    let mut lines = content.lines();
    assert_eq!(lines.next(), Some("host,country"));
    assert_eq!(lines.count(), 30);
}

#[tokio::test]
async fn unknown_fields_are_rejected() {
    let tmp = TempDir::new().unwrap();
    let api = FakeSearchApi::new(Vec::new());
    let engine = engine(config(tmp.path()), api.clone(), KEYS);

    let mut request = ExtractRequest::new(QUERY, ExtractMode::Direct);
    request.fields = vec!["no_such_field".to_string()];
    assert!(extract(&engine, &request, &NoProgress).await.is_err());
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn update_merges_records_since_the_newest_day() {
    let tmp = TempDir::new().unwrap();
    let api = FakeSearchApi::new(spread("US", 500, 100, newest()));
    let engine = engine(config(tmp.path()), api.clone(), KEYS);

    let first = extract(&engine, &ExtractRequest::new(QUERY, ExtractMode::Direct), &NoProgress)
        .await
        .unwrap();
    let path = tmp.path().join("result.txt");
    export::write_result(&path, OutputFormat::Lines, &[], &first.rows).unwrap();
    let existing = export::read_endpoints(&path).unwrap();
    assert_eq!(existing.len(), 500);

    let fresh: Vec<Record> = (0..40)
        .map(|i| Record {
            host: format!("fresh-{}.example:8080", i),
            country: "US".to_string(),
            day: newest() + Duration::days(1),
        })
        .collect();
    api.push(fresh);

    let report = update(&engine, QUERY, existing, "update-session", &NoProgress)
        .await
        .unwrap();
    assert_eq!(report.cutoff, newest() + Duration::days(1));
    assert_eq!(report.new_records, 40);
    assert_eq!(report.merged.len(), 540);
    assert!(report.merged.windows(2).all(|w| w[0] < w[1]));

    let incremental = api
        .calls()
        .into_iter()
        .any(|c| c.query.contains("after=\"2024-07-01\""));
    assert!(incremental);
}

#[tokio::test]
async fn dominant_slice_then_small_remainder() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(tmp.path());
    config.extract.page_size = 10_000;
    let mut records = spread("US", 14_000, 7_000, newest());
    records.extend(spread("CN", 5_500, 500, newest()));
    records.extend(spread("BR", 4_000, 500, newest()));
    let api = FakeSearchApi::new(records);
    let engine = engine(config, api.clone(), KEYS);

    let request = ExtractRequest::new(QUERY, ExtractMode::Peel);
    let report = extract(&engine, &request, &NoProgress).await.unwrap();

    assert_eq!(report.collected(), 23_500);
    assert_eq!(report.termination, Termination::Drained);
    assert!(!report.termination.is_failure());
    let reasons: Vec<_> = report.slices.iter().map(|s| s.termination.clone()).collect();
    assert_eq!(reasons, vec![Termination::Exhausted, Termination::Exhausted]);
    assert_eq!(report.slices[0].label, "country=US");
    assert_eq!(report.slices[0].added, 14_000);
    assert_eq!(report.slices[1].added, 9_500);
}

#[tokio::test]
async fn direct_mode_over_the_cap_reports_the_window_limit() {
    let tmp = TempDir::new().unwrap();
    let mut records = spread("US", 14_000, 100, newest());
    records.extend(spread("CN", 9_500, 100, newest()));
    let api = FakeSearchApi::new(records);
    let engine = engine(config(tmp.path()), api.clone(), KEYS);

    let request = ExtractRequest::new(QUERY, ExtractMode::Direct);
    let report = extract(&engine, &request, &NoProgress).await.unwrap();

    assert_eq!(report.collected(), 10_000);
    assert_eq!(report.termination, Termination::WindowLimit);
    assert!(!report.termination.is_failure());
    assert!(report.termination.to_string().contains("peel"));
    assert!(api.calls().iter().all(|c| c.page * c.size <= 10_000));
}

#[tokio::test]
async fn undated_page_ends_the_traceback_at_the_boundary() {
    let tmp = TempDir::new().unwrap();
    let api = FakeSearchApi::new(spread("US", 3000, 100, newest()));
    api.set_undated(true);
    let engine = engine(config(tmp.path()), api.clone(), KEYS);

    let mut pager = TracebackPaginator::new(
        &engine,
        QueryScope::new(QUERY),
        &host_fields(),
        StopSignal::never(),
    );
    let first = pager.next_batch().await.unwrap();
    assert_eq!(first.len(), 1000);
    assert!(first.iter().all(|row| row.len() == 1));
    assert!(pager.next_batch().await.is_none());
    assert_eq!(pager.termination(), Some(&Termination::BoundaryReached));
    assert_eq!(api.calls().len(), 1);
}

#[tokio::test]
async fn breakdown_that_never_shrinks_hits_the_round_ceiling() {
    let tmp = TempDir::new().unwrap();
    let api = FakeSearchApi::new(spread("US", 11_000, 100, newest()));
    api.set_stats_mode(StatsMode::Fixed {
        name: "ZZ".to_string(),
        count: 11_000,
    });
    let engine = engine(config(tmp.path()), api.clone(), KEYS);

    let mut acc = ExtractionAccumulator::new(KeyPolicy::Host, None);
    let report = DimensionalPeeler::new(&engine, &host_fields(), StopSignal::never(), &NoProgress)
        .max_rounds(3)
        .run(QueryScope::new(QUERY), &mut acc)
        .await;

    assert_eq!(report.termination, Termination::IterationCeiling);
    assert_eq!(report.rounds, 3);
    assert_eq!(report.slices.len(), 3);
    assert!(report.slices.iter().all(|s| s.label == "country=ZZ" && s.added == 0));
    assert!(acc.is_empty());
}

#[tokio::test]
async fn missing_breakdown_traces_the_whole_scope_once() {
    let tmp = TempDir::new().unwrap();
    let api = FakeSearchApi::new(spread("US", 12_000, 100, newest()));
    api.set_stats_mode(StatsMode::Empty);
    let engine = engine(config(tmp.path()), api.clone(), KEYS);

    let mut acc = ExtractionAccumulator::new(KeyPolicy::Host, None);
    let report = DimensionalPeeler::new(&engine, &host_fields(), StopSignal::never(), &NoProgress)
        .run(QueryScope::new(QUERY), &mut acc)
        .await;

    assert_eq!(report.termination, Termination::Unsplittable);
    assert_eq!(report.rounds, 1);
    assert_eq!(report.slices.len(), 1);
    assert_eq!(report.slices[0].label, "*");
    assert_eq!(report.slices[0].termination, Termination::Exhausted);
    assert_eq!(acc.len(), 12_000);
}

#[tokio::test]
async fn stats_error_mid_peel_keeps_collected_records() {
    let tmp = TempDir::new().unwrap();
    let mut records = spread("US", 15_000, 100, newest());
    records.extend(spread("CN", 7_000, 100, newest()));
    records.extend(spread("DE", 4_000, 100, newest()));
    let api = FakeSearchApi::new(records);
    api.fail_stats_after(1, "[-700] account invalid");
    let engine = engine(config(tmp.path()), api.clone(), KEYS);

    let request = ExtractRequest::new(QUERY, ExtractMode::Peel);
    let report = extract(&engine, &request, &NoProgress).await.unwrap();

    assert!(report.termination.is_failure());
    assert!(report.termination.to_string().contains("account invalid"));
    assert_eq!(report.slices.len(), 1);
    assert_eq!(report.slices[0].label, "country=US");
    assert_eq!(report.collected(), 15_000);
    assert!(report.rows.iter().all(|r| r[0].starts_with("us-")));
}
