//! Adaptive monitoring of saved queries.
//!
//! A monitor re-polls one query on its own schedule, keeps the identities
//! it has already seen in a per-task fingerprint file, and reports only
//! records it has not seen before. After each poll the interval is
//! recomputed: new records shrink it, a quiet poll grows it, both bounded
//! by the configured floor and ceiling. The next run is scheduled at the
//! interval plus or minus a random jitter so that many monitors do not
//! wake up on the same tick.
//!
//! # Storage
//!
//! | File | Content |
//! |------|---------|
//! | `tasks_file` | JSON map of task id to [`MonitorTask`], rewritten on every change |
//!
//! The CLI and a running daemon share `tasks_file`. Every write re-reads the
//! file first and changes only its own fields, so a `del` or `add` made from
//! another process survives the daemon's next cycle.
//! | `<data_dir>/<id>.txt` | one seen identity per line, append-only |

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::accumulator::KeyPolicy;
use crate::config::{Config, MonitorConfig};
use crate::db;
use crate::engine::Engine;
use crate::executor::ExecOptions;
use crate::migrate;
use crate::models::{SearchRequest, HOST_FIELD};

/// First 8 hex chars of the SHA-256 of the trimmed query.
pub fn task_id(query: &str) -> String {
    let digest = Sha256::digest(query.trim().as_bytes());
    hex::encode(digest)[..8].to_string()
}

/// SHA-256 hex of a trimmed canonical record string.
pub fn fingerprint(line: &str) -> String {
    hex::encode(Sha256::digest(line.trim().as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorTask {
    pub id: String,
    pub query: String,
    /// Where notifications go; opaque to the engine.
    #[serde(default)]
    pub chat_target: Option<String>,
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    /// Seconds until the next run.
    pub interval: u64,
    #[serde(default)]
    pub unnotified_count: u64,
    pub notification_threshold: u64,
    pub status: TaskStatus,
}

impl MonitorTask {
    pub fn is_active(&self) -> bool {
        self.status == TaskStatus::Active
    }
}

/// Interval bounds and steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalPolicy {
    pub min_secs: u64,
    pub max_secs: u64,
    pub shrink_factor: f64,
    pub grow_factor: f64,
    pub jitter: f64,
}

impl IntervalPolicy {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            min_secs: config.min_interval_secs,
            max_secs: config.max_interval_secs,
            shrink_factor: config.shrink_factor,
            grow_factor: config.grow_factor,
            jitter: config.jitter,
        }
    }

    /// Shrink after a poll with new records, grow after a quiet one.
    pub fn next_interval(&self, current: u64, found_new: bool) -> u64 {
        let next = if found_new {
            (current as f64 * self.shrink_factor).round()
        } else {
            (current as f64 * self.grow_factor).round()
        };
        (next as u64).clamp(self.min_secs, self.max_secs)
    }

    /// `interval`, held to the bounds, scaled by a random factor in
    /// `[1 - jitter, 1 + jitter]`.
    pub fn jittered(&self, interval: u64) -> Duration {
        let interval = interval.clamp(self.min_secs, self.max_secs);
        let factor = if self.jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((interval as f64 * factor).max(1.0))
    }
}

fn read_tasks(path: &Path) -> Result<BTreeMap<String, MonitorTask>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read monitor tasks: {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse monitor tasks: {}", path.display()))
}

/// The task table, loaded and rewritten as a whole.
#[derive(Debug)]
pub struct MonitorStore {
    path: PathBuf,
    tasks: BTreeMap<String, MonitorTask>,
}

impl MonitorStore {
    /// Load `path`; a missing file is an empty store.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            tasks: read_tasks(path)?,
        })
    }

    /// Replace the in-memory table with what is on disk now.
    pub fn reload(&mut self) -> Result<()> {
        self.tasks = read_tasks(&self.path)?;
        Ok(())
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&self.tasks)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    /// Add a monitor for `query`. An inactive monitor for the same query is
    /// reactivated; an active one is a duplicate.
    pub fn add(&mut self, query: &str, chat_target: Option<String>, config: &MonitorConfig) -> Result<MonitorTask> {
        let query = query.trim();
        if query.is_empty() {
            bail!("Query must not be empty");
        }
        self.reload()?;
        let id = task_id(query);
        if let Some(existing) = self.tasks.get_mut(&id) {
            if existing.is_active() {
                bail!("Query is already monitored as task {}", id);
            }
            existing.status = TaskStatus::Active;
            existing.chat_target = chat_target;
            let task = existing.clone();
            self.save()?;
            return Ok(task);
        }

        let task = MonitorTask {
            id: id.clone(),
            query: query.to_string(),
            chat_target,
            added_at: Utc::now(),
            last_run: None,
            interval: config
                .initial_interval_secs
                .clamp(config.min_interval_secs, config.max_interval_secs),
            unnotified_count: 0,
            notification_threshold: config.notification_threshold,
            status: TaskStatus::Active,
        };
        self.tasks.insert(id, task.clone());
        self.save()?;
        Ok(task)
    }

    pub fn get(&self, id: &str) -> Option<&MonitorTask> {
        self.tasks.get(id)
    }

    pub fn list(&self) -> Vec<MonitorTask> {
        self.tasks.values().cloned().collect()
    }

    pub fn active(&self) -> Vec<MonitorTask> {
        self.tasks.values().filter(|t| t.is_active()).cloned().collect()
    }

    /// Store the fields a cycle changes. Status and threshold edits made
    /// while the cycle ran, from this process or another, are kept.
    pub fn record_run(&mut self, task: &MonitorTask) -> Result<()> {
        self.reload()?;
        let Some(stored) = self.tasks.get_mut(&task.id) else {
            bail!("No monitor task with id {}", task.id);
        };
        stored.last_run = task.last_run;
        stored.interval = task.interval;
        stored.unnotified_count = task.unnotified_count;
        self.save()
    }

    /// Mark a task inactive. Its fingerprint file is kept.
    pub fn deactivate(&mut self, id: &str) -> Result<MonitorTask> {
        self.reload()?;
        let Some(task) = self.tasks.get_mut(id) else {
            bail!("No monitor task with id {}", id);
        };
        task.status = TaskStatus::Inactive;
        let task = task.clone();
        self.save()?;
        Ok(task)
    }

    pub fn set_threshold(&mut self, id: &str, threshold: u64) -> Result<MonitorTask> {
        if threshold == 0 {
            bail!("Notification threshold must be >= 1");
        }
        self.reload()?;
        let Some(task) = self.tasks.get_mut(id) else {
            bail!("No monitor task with id {}", id);
        };
        task.notification_threshold = threshold;
        let task = task.clone();
        self.save()?;
        Ok(task)
    }
}

/// Per-task append-only files of seen identities.
#[derive(Debug, Clone)]
pub struct FingerprintStore {
    dir: PathBuf,
}

impl FingerprintStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.txt", id))
    }

    /// Fingerprints of every line seen so far.
    pub fn load(&self, id: &str) -> Result<HashSet<String>> {
        let path = self.path(id);
        if !path.exists() {
            return Ok(HashSet::new());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(fingerprint)
            .collect())
    }

    pub fn append(&self, id: &str, lines: &[String]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.path(id);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        for line in lines {
            writeln!(file, "{}", line.trim())?;
        }
        Ok(())
    }
}

/// Receives a notification when a task's pending count reaches its threshold.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, task: &MonitorTask, pending: u64, sample: &[String]) -> Result<()>;
}

/// Writes notifications to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, task: &MonitorTask, pending: u64, sample: &[String]) -> Result<()> {
        tracing::info!(
            task = %task.id,
            query = %task.query,
            target = task.chat_target.as_deref().unwrap_or("-"),
            pending,
            sample = ?sample,
            "new records for monitored query"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleOutcome {
    pub task_id: String,
    pub fetched: usize,
    pub new_records: usize,
    pub notified: bool,
    pub unnotified_count: u64,
    pub interval: u64,
}

const NOTIFY_SAMPLE: usize = 10;

pub struct AdaptiveMonitor {
    engine: Arc<Engine>,
    store: Arc<Mutex<MonitorStore>>,
    fingerprints: FingerprintStore,
    notifier: Arc<dyn Notifier>,
    policy: IntervalPolicy,
    page_size: u32,
}

impl AdaptiveMonitor {
    pub fn new(engine: Arc<Engine>, store: MonitorStore, notifier: Arc<dyn Notifier>) -> Self {
        let config = &engine.config().monitor;
        let fingerprints = FingerprintStore::new(config.data_dir.clone());
        let policy = IntervalPolicy::from_config(config);
        let page_size = config.page_size;
        Self {
            engine,
            store: Arc::new(Mutex::new(store)),
            fingerprints,
            notifier,
            policy,
            page_size,
        }
    }

    pub fn policy(&self) -> &IntervalPolicy {
        &self.policy
    }

    pub fn fingerprints(&self) -> &FingerprintStore {
        &self.fingerprints
    }

    /// The task as it is on disk now.
    pub fn task(&self, id: &str) -> Option<MonitorTask> {
        self.refreshed(|s| s.get(id).cloned())
    }

    pub fn active_tasks(&self) -> Vec<MonitorTask> {
        self.refreshed(|s| s.active())
    }

    /// Run `f` on the store after re-reading the task file. A file that
    /// cannot be read leaves the last good copy in place.
    fn refreshed<T>(&self, f: impl FnOnce(&mut MonitorStore) -> T) -> T {
        self.with_store(|s| {
            if let Err(e) = s.reload() {
                tracing::warn!(error = %e, "could not re-read monitor tasks, using the last copy");
            }
            f(s)
        })
    }

    fn with_store<T>(&self, f: impl FnOnce(&mut MonitorStore) -> T) -> T {
        let mut guard = match self.store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Poll one task once and persist the result.
    pub async fn run_cycle(&self, id: &str) -> Result<CycleOutcome> {
        let current = self.with_store(|s| s.reload().map(|_| s.get(id).cloned()))?;
        let Some(mut task) = current else {
            bail!("No monitor task with id {}", id);
        };
        if !task.is_active() {
            bail!("Monitor task {} is inactive", id);
        }

        let mut seen = self.fingerprints.load(id)?;
        let fields = vec![HOST_FIELD.to_string()];
        let request = SearchRequest::new(task.query.as_str(), &fields).page(1, self.page_size);
        let polled = self.engine.page(&request, ExecOptions::default()).await;

        let results = match polled {
            Ok(executed) => executed.value.results,
            Err(e) => {
                task.last_run = Some(Utc::now());
                self.with_store(|s| s.record_run(&task))?;
                return Err(e).with_context(|| format!("Monitor task {} poll failed", id));
            }
        };

        let mut fresh = Vec::new();
        for row in &results {
            let Some(line) = KeyPolicy::Tuple.identity(row) else {
                continue;
            };
            if seen.insert(fingerprint(&line)) {
                fresh.push(line);
            }
        }
        self.fingerprints.append(id, &fresh)?;

        let mut notified = false;
        if !fresh.is_empty() {
            task.unnotified_count += fresh.len() as u64;
            if task.unnotified_count >= task.notification_threshold {
                let sample: Vec<String> = fresh.iter().take(NOTIFY_SAMPLE).cloned().collect();
                match self
                    .notifier
                    .notify(&task, task.unnotified_count, &sample)
                    .await
                {
                    Ok(()) => {
                        task.unnotified_count = 0;
                        notified = true;
                    }
                    Err(e) => {
                        tracing::warn!(task = %id, error = %e, "notification failed, keeping pending count");
                    }
                }
            }
        }

        task.interval = self.policy.next_interval(task.interval, !fresh.is_empty());
        task.last_run = Some(Utc::now());
        let outcome = CycleOutcome {
            task_id: id.to_string(),
            fetched: results.len(),
            new_records: fresh.len(),
            notified,
            unnotified_count: task.unnotified_count,
            interval: task.interval,
        };
        self.with_store(|s| s.record_run(&task))?;

        tracing::info!(
            task = %id,
            fetched = outcome.fetched,
            new = outcome.new_records,
            interval = outcome.interval,
            "monitor cycle finished"
        );
        Ok(outcome)
    }
}

/// Delay before a task's first run: what is left of its interval.
pub fn initial_delay(task: &MonitorTask, now: DateTime<Utc>) -> Duration {
    match task.last_run {
        None => Duration::ZERO,
        Some(last) => {
            let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
            Duration::from_secs(task.interval).saturating_sub(elapsed)
        }
    }
}

/// Runs every active task in its own loop until shutdown.
pub struct MonitorScheduler {
    monitor: Arc<AdaptiveMonitor>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl MonitorScheduler {
    pub fn new(monitor: Arc<AdaptiveMonitor>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            monitor,
            shutdown_tx,
            shutdown_rx,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Arm every active task. Returns how many were armed.
    pub fn start_all(&self) -> usize {
        self.monitor
            .active_tasks()
            .iter()
            .filter(|t| self.arm(t))
            .count()
    }

    /// Start the loop for `task` unless it is already running or the
    /// scheduler is shutting down.
    pub fn arm(&self, task: &MonitorTask) -> bool {
        if *self.shutdown_rx.borrow() {
            tracing::warn!(task = %task.id, "scheduler is shutting down, not arming task");
            return false;
        }
        let mut handles = match self.handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if handles.get(&task.id).is_some_and(|h| !h.is_finished()) {
            return false;
        }

        let monitor = self.monitor.clone();
        let mut shutdown = self.shutdown_rx.clone();
        let id = task.id.clone();
        let first = initial_delay(task, Utc::now());
        let handle = tokio::spawn(async move {
            let mut delay = first;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }

                if !monitor.task(&id).is_some_and(|t| t.is_active()) {
                    tracing::info!(task = %id, "task removed or deactivated, stopping its loop");
                    break;
                }

                let interval = match monitor.run_cycle(&id).await {
                    Ok(outcome) => outcome.interval,
                    Err(e) => {
                        tracing::warn!(task = %id, error = %e, "monitor cycle failed");
                        match monitor.task(&id) {
                            Some(t) if t.is_active() => t.interval,
                            _ => break,
                        }
                    }
                };

                if *shutdown.borrow() {
                    tracing::info!(task = %id, "shutdown in progress, not re-arming");
                    break;
                }
                delay = monitor.policy().jittered(interval);
                tracing::debug!(task = %id, ?delay, "next run scheduled");
            }
        });
        handles.insert(task.id.clone(), handle);
        true
    }

    /// Stop every loop and wait for them to end.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = match self.handles.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "monitor loop ended abnormally");
            }
        }
    }
}

// CLI runners

pub fn run_monitor_add(config: &Config, query: &str, chat_target: Option<String>) -> Result<()> {
    let mut store = MonitorStore::open(&config.monitor.tasks_file)?;
    let task = store.add(query, chat_target, &config.monitor)?;
    println!("Monitoring task {} (every {}s): {}", task.id, task.interval, task.query);
    Ok(())
}

pub fn run_monitor_list(config: &Config) -> Result<()> {
    let store = MonitorStore::open(&config.monitor.tasks_file)?;
    let tasks = store.list();
    if tasks.is_empty() {
        println!("No monitor tasks.");
        return Ok(());
    }
    println!(
        "{:<10} {:<9} {:>8} {:>10} {:<20} QUERY",
        "ID", "STATUS", "INTERVAL", "PENDING", "LAST RUN"
    );
    for t in &tasks {
        let status = match t.status {
            TaskStatus::Active => "active",
            TaskStatus::Inactive => "inactive",
        };
        let last = t
            .last_run
            .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<10} {:<9} {:>8} {:>10} {:<20} {}",
            t.id,
            status,
            t.interval,
            format!("{}/{}", t.unnotified_count, t.notification_threshold),
            last,
            t.query
        );
    }
    Ok(())
}

pub fn run_monitor_del(config: &Config, id: &str) -> Result<()> {
    let mut store = MonitorStore::open(&config.monitor.tasks_file)?;
    let task = store.deactivate(id)?;
    println!("Task {} deactivated: {}", task.id, task.query);
    Ok(())
}

/// Print the identities a task has collected.
pub fn run_monitor_get(config: &Config, id: &str) -> Result<()> {
    let store = MonitorStore::open(&config.monitor.tasks_file)?;
    if store.get(id).is_none() {
        bail!("No monitor task with id {}", id);
    }
    let path = FingerprintStore::new(config.monitor.data_dir.clone()).path(id);
    if !path.exists() {
        eprintln!("Task {} has not collected anything yet.", id);
        return Ok(());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    print!("{}", content);
    Ok(())
}

pub fn run_monitor_threshold(config: &Config, id: &str, threshold: u64) -> Result<()> {
    let mut store = MonitorStore::open(&config.monitor.tasks_file)?;
    let task = store.set_threshold(id, threshold)?;
    println!("Task {} now notifies every {} new records.", task.id, task.notification_threshold);
    Ok(())
}

async fn open_monitor(config: &Config) -> Result<Arc<AdaptiveMonitor>> {
    let pool = db::connect(config).await?;
    migrate::ensure_schema(&pool).await?;
    let engine = Engine::open(config, &pool).await?;
    pool.close().await;
    let store = MonitorStore::open(&config.monitor.tasks_file)?;
    Ok(Arc::new(AdaptiveMonitor::new(
        Arc::new(engine),
        store,
        Arc::new(LogNotifier),
    )))
}

pub async fn run_monitor_once(config: &Config, id: &str) -> Result<()> {
    let monitor = open_monitor(config).await?;
    let outcome = monitor.run_cycle(id).await?;
    println!(
        "Task {}: {} fetched, {} new, {} pending{}, next run in {}s",
        outcome.task_id,
        outcome.fetched,
        outcome.new_records,
        outcome.unnotified_count,
        if outcome.notified { " (notified)" } else { "" },
        outcome.interval
    );
    Ok(())
}

/// How often the daemon looks for tasks added or reactivated from the CLI.
const RESCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Run every active task until Ctrl-C.
pub async fn run_monitor_daemon(config: &Config) -> Result<()> {
    let monitor = open_monitor(config).await?;
    let scheduler = MonitorScheduler::new(monitor);
    let armed = scheduler.start_all();
    tracing::info!(tasks = armed, "monitor daemon started");

    let mut rescan = tokio::time::interval(RESCAN_INTERVAL);
    rescan.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
            _ = rescan.tick() => {
                let armed = scheduler.start_all();
                if armed > 0 {
                    tracing::info!(tasks = armed, "armed newly active tasks");
                }
            }
        }
    }
    tracing::info!("shutting down monitor daemon");
    scheduler.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> IntervalPolicy {
        IntervalPolicy::from_config(&MonitorConfig::default())
    }

    #[test]
    fn ids_are_stable_and_short() {
        let id = task_id("app=\"nginx\"");
        assert_eq!(id.len(), 8);
        assert_eq!(id, task_id("  app=\"nginx\" "));
        assert_ne!(id, task_id("app=\"apache\""));
        assert_eq!(fingerprint("a:1\n"), fingerprint("a:1"));
    }

    #[test]
    fn interval_grows_when_quiet_and_is_capped() {
        let p = policy();
        let mut interval = 3600;
        for _ in 0..20 {
            let next = p.next_interval(interval, false);
            assert!(next >= interval);
            assert!(next <= p.max_secs);
            interval = next;
        }
        assert_eq!(interval, p.max_secs);
    }

    #[test]
    fn interval_shrinks_on_news_and_is_floored() {
        let p = policy();
        assert_eq!(p.next_interval(3600, true), 2520);
        assert_eq!(p.next_interval(700, true), p.min_secs);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let p = policy();
        for _ in 0..100 {
            let d = p.jittered(1000).as_secs_f64();
            assert!((899.9..=1100.1).contains(&d));
        }
    }

    #[test]
    fn store_round_trips_and_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        let config = MonitorConfig::default();

        let mut store = MonitorStore::open(&path).unwrap();
        let task = store.add("port=\"6379\"", None, &config).unwrap();
        assert!(store.add("port=\"6379\"", None, &config).is_err());

        let reopened = MonitorStore::open(&path).unwrap();
        assert_eq!(reopened.get(&task.id), Some(&task));

        let mut store = reopened;
        store.deactivate(&task.id).unwrap();
        assert!(store.active().is_empty());
        let again = store.add("port=\"6379\"", Some("chat-1".into()), &config).unwrap();
        assert!(again.is_active());
        assert_eq!(again.chat_target.as_deref(), Some("chat-1"));
    }

    #[test]
    fn fingerprints_append_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = FingerprintStore::new(dir.path());
        assert!(store.load("abcd1234").unwrap().is_empty());
        store
            .append("abcd1234", &["a:1".to_string(), "b:2".to_string()])
            .unwrap();
        let seen = store.load("abcd1234").unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&fingerprint("a:1")));
    }

    #[test]
    fn first_run_waits_for_remaining_interval() {
        let now = Utc::now();
        let mut task = MonitorTask {
            id: "x".into(),
            query: "q".into(),
            chat_target: None,
            added_at: now,
            last_run: None,
            interval: 600,
            unnotified_count: 0,
            notification_threshold: 10,
            status: TaskStatus::Active,
        };
        assert_eq!(initial_delay(&task, now), Duration::ZERO);
        task.last_run = Some(now - chrono::Duration::seconds(100));
        let delay = initial_delay(&task, now).as_secs();
        assert!((499..=500).contains(&delay));
    }

    #[test]
    fn hand_edited_huge_interval_does_not_panic() {
        let now = Utc::now();
        let task = MonitorTask {
            id: "x".into(),
            query: "q".into(),
            chat_target: None,
            added_at: now,
            last_run: Some(now - chrono::Duration::seconds(100)),
            interval: u64::MAX,
            unnotified_count: 0,
            notification_threshold: 10,
            status: TaskStatus::Active,
        };
        let delay = initial_delay(&task, now);
        assert!(delay > Duration::from_secs(u64::MAX / 2));

        let p = policy();
        let next = p.jittered(u64::MAX);
        assert!(next <= Duration::from_secs_f64(p.max_secs as f64 * (1.0 + p.jitter)));
        assert_eq!(p.next_interval(u64::MAX, false), p.max_secs);
    }
}
