//! Scan lifecycle: one run at a time, from candidate discovery to the stored result set

use crate::config::{GeoBackend, RunConfig, ScanConfig, ScanOverrides};
use crate::error::ScanError;
use crate::proxy::checker::{HttpProber, Prober, ProxyChecker};
use crate::proxy::crawler::{CrawlReport, ProxyCrawler};
use crate::proxy::geo::{GeoLookup, GeoVerifier, IpApiLookup, MmdbLookup};
use crate::proxy::models::{Candidate, GeoVerdict, ProbeResult, Target, WorkingProxy};
use crate::scan::logs::LogFeed;
use crate::scan::store::ResultStore;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Lifecycle state of the current (or last) scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    #[default]
    Idle,
    Running,
    Finished,
    Failed,
}

/// Status of the current (or last) scan
#[derive(Debug, Clone, Serialize, Default)]
pub struct ScanRun {
    pub id: Option<Uuid>,
    pub state: ScanState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub config: Option<RunConfig>,
    /// Unique candidates handed to the validation engine
    pub candidates: usize,
    pub probes_planned: usize,
    pub probes_done: usize,
    pub working: usize,
    /// A stop was requested and in-flight probes are draining
    pub stopping: bool,
    pub error: Option<String>,
}

impl ScanRun {
    fn started(config: RunConfig) -> Self {
        Self {
            id: Some(Uuid::new_v4()),
            state: ScanState::Running,
            started_at: Some(Utc::now()),
            config: Some(config),
            ..Default::default()
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == ScanState::Running
    }
}

#[derive(Default)]
struct RunSlot {
    run: ScanRun,
    cancel: Option<CancellationToken>,
}

struct Inner {
    defaults: ScanConfig,
    crawler: ProxyCrawler,
    prober: Arc<dyn Prober>,
    geo_lookup: Option<Arc<dyn GeoLookup>>,
    slot: Mutex<RunSlot>,
    logs: LogFeed,
    store: ResultStore,
    latest: RwLock<Option<Vec<WorkingProxy>>>,
    live: Mutex<Vec<WorkingProxy>>,
}

/// Owns the scan lifecycle. Cheap to clone; clones share the same run.
#[derive(Clone)]
pub struct ScanController {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScanController {
    /// Controller backed by the built-in sources, real HTTP probes and the
    /// configured geolocation backend
    pub fn with_config(defaults: ScanConfig) -> Result<Self> {
        Self::with_crawler(defaults, ProxyCrawler::new()?)
    }

    /// Like [`ScanController::with_config`] with a custom set of sources
    pub fn with_crawler(defaults: ScanConfig, crawler: ProxyCrawler) -> Result<Self> {
        let prober: Arc<dyn Prober> = Arc::new(HttpProber::new(defaults.probe_timeout));

        let geo_lookup: Option<Arc<dyn GeoLookup>> = match (&defaults.geo.country(), &defaults.geo_backend) {
            (None, _) => None,
            (Some(_), GeoBackend::IpApi) => Some(Arc::new(IpApiLookup::new()?)),
            (Some(_), GeoBackend::Mmdb(path)) => Some(Arc::new(MmdbLookup::from_path(path)?)),
        };

        Ok(Self::with_parts(defaults, crawler, prober, geo_lookup))
    }

    /// Controller with explicit collaborators
    pub fn with_parts(
        defaults: ScanConfig,
        crawler: ProxyCrawler,
        prober: Arc<dyn Prober>,
        geo_lookup: Option<Arc<dyn GeoLookup>>,
    ) -> Self {
        let store = ResultStore::new(defaults.output_file.clone());
        Self {
            inner: Arc::new(Inner {
                defaults,
                crawler,
                prober,
                geo_lookup,
                slot: Mutex::new(RunSlot::default()),
                logs: LogFeed::default(),
                store,
                latest: RwLock::new(None),
                live: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start a scan in the background.
    ///
    /// Fails with [`ScanError::AlreadyRunning`] while another scan runs; the
    /// running scan is not touched.
    pub fn start(&self, overrides: ScanOverrides) -> std::result::Result<JoinHandle<ScanRun>, ScanError> {
        let (config, cancel) = self.begin(&overrides)?;
        let controller = self.clone();
        Ok(tokio::spawn(async move { controller.execute(config, cancel).await }))
    }

    /// Run one scan to completion on the current task
    pub async fn run_once(&self, overrides: ScanOverrides) -> std::result::Result<ScanRun, ScanError> {
        let (config, cancel) = self.begin(&overrides)?;
        Ok(self.execute(config, cancel).await)
    }

    /// Ask the running scan to stop submitting probes
    pub fn stop(&self) -> std::result::Result<(), ScanError> {
        {
            let mut slot = lock(&self.inner.slot);
            if !slot.run.is_running() {
                return Err(ScanError::NotRunning);
            }
            if let Some(cancel) = &slot.cancel {
                cancel.cancel();
            }
            slot.run.stopping = true;
        }
        self.inner.logs.push("Stop requested, waiting for in-flight probes");
        Ok(())
    }

    pub fn status(&self) -> ScanRun {
        lock(&self.inner.slot).run.clone()
    }

    pub fn logs(&self) -> Vec<String> {
        self.inner.logs.snapshot()
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<String> {
        self.inner.logs.subscribe()
    }

    /// Working proxies found so far by the current run
    pub fn live_results(&self) -> Vec<WorkingProxy> {
        lock(&self.inner.live).clone()
    }

    /// Result set of the last completed run, falling back to the result file
    pub async fn results(&self) -> Vec<WorkingProxy> {
        let latest = self
            .inner
            .latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(latest) = latest {
            return latest;
        }

        match self.inner.store.load().await {
            Ok(results) => results,
            Err(e) => {
                warn!(path = %self.inner.store.path().display(), error = %e, "could not read stored results");
                Vec::new()
            }
        }
    }

    fn begin(
        &self,
        overrides: &ScanOverrides,
    ) -> std::result::Result<(ScanConfig, CancellationToken), ScanError> {
        let config = self.inner.defaults.with_overrides(overrides);
        let cancel = CancellationToken::new();
        {
            let mut slot = lock(&self.inner.slot);
            if slot.run.is_running() {
                return Err(ScanError::AlreadyRunning);
            }
            slot.run = ScanRun::started(config.summary());
            slot.cancel = Some(cancel.clone());
        }

        self.inner.logs.clear();
        lock(&self.inner.live).clear();
        Ok((config, cancel))
    }

    fn update_run(&self, f: impl FnOnce(&mut ScanRun)) {
        f(&mut lock(&self.inner.slot).run);
    }

    fn complete(&self, state: ScanState, error: Option<String>) -> ScanRun {
        let mut slot = lock(&self.inner.slot);
        slot.run.state = state;
        slot.run.finished_at = Some(Utc::now());
        slot.run.stopping = false;
        slot.run.error = error;
        slot.cancel = None;
        info!(id = ?slot.run.id, state = ?state, working = slot.run.working, "scan ended");
        slot.run.clone()
    }

    async fn execute(&self, config: ScanConfig, cancel: CancellationToken) -> ScanRun {
        match self.prepare_and_scan(&config, cancel).await {
            Ok(()) => self.complete(ScanState::Finished, None),
            Err(e) => {
                let prefix = if e.is_configuration() {
                    "Configuration error"
                } else {
                    "Scan failed"
                };
                self.inner.logs.push(format!("{prefix}: {e}"));
                self.complete(ScanState::Failed, Some(e.to_string()))
            }
        }
    }

    async fn prepare_and_scan(
        &self,
        config: &ScanConfig,
        cancel: CancellationToken,
    ) -> std::result::Result<(), ScanError> {
        let targets = config.validate()?;
        let checker = self.checker_for(config)?;
        self.scan(config, checker, targets, cancel).await
    }

    fn checker_for(&self, config: &ScanConfig) -> std::result::Result<ProxyChecker, ScanError> {
        let checker = ProxyChecker::with_config(config.checker_config(), Arc::clone(&self.inner.prober));
        let Some(country) = config.geo.country() else {
            return Ok(checker);
        };

        let lookup = self.inner.geo_lookup.as_ref().ok_or(ScanError::NoGeoBackend)?;
        let verifier = GeoVerifier::new(Arc::clone(lookup), country);
        self.inner
            .logs
            .push(format!("Verifying exit country: {}", verifier.country()));
        Ok(checker.with_geo(Arc::new(verifier)))
    }

    fn log_crawl(&self, report: &CrawlReport) {
        let logs = &self.inner.logs;
        for source in &report.sources {
            match &source.error {
                None => logs.push(format!(
                    "Source {}: {} proxies",
                    source.source,
                    source.candidates.len()
                )),
                Some(e) => logs.push(format!("Failed to fetch from {}: {}", source.source, e)),
            }
        }

        let found = report.candidates.len() + report.truncated;
        logs.push(format!("Total proxies found: {found}"));
        if report.truncated > 0 {
            logs.push(format!(
                "Testing first {} proxies due to MAX_PROXIES",
                report.candidates.len()
            ));
        }
        if report.all_failed() {
            logs.push("Warning: every proxy source failed, nothing to test");
        } else if report.candidates.is_empty() {
            logs.push("Warning: no proxies found");
        }
    }

    async fn scan(
        &self,
        config: &ScanConfig,
        checker: ProxyChecker,
        targets: Vec<Target>,
        cancel: CancellationToken,
    ) -> std::result::Result<(), ScanError> {
        let logs = &self.inner.logs;
        logs.push("Scraping proxies...");
        let report = self.inner.crawler.fetch_candidates(config.max_candidates).await;
        self.log_crawl(&report);

        let candidates = report.candidates;
        let planned = checker.planned(candidates.len(), targets.len());
        self.update_run(|run| {
            run.candidates = candidates.len();
            run.probes_planned = planned;
        });
        for target in &targets {
            logs.push(format!("Testing target: {target}"));
        }

        let mut collector = Collector::new(&candidates, &targets, config.geo.country().is_some());
        let mut stream = checker.validate(candidates, targets, cancel.clone());
        while let Some(result) = stream.recv().await {
            let (line, recorded) = collector.record(&result);
            if let Some(entry) = recorded {
                lock(&self.inner.live).push(entry);
            }
            let working = collector.len();
            self.update_run(|run| {
                run.probes_done += 1;
                run.working = working;
            });
            logs.push(line);
        }

        let skipped = stream.skipped();
        if skipped > 0 {
            logs.push(format!("{skipped} probes not submitted (scan budget reached or stop requested)"));
        }

        let working = collector.into_sorted();
        *self
            .inner
            .latest
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(working.clone());

        if let Err(e) = self.inner.store.save(&working).await {
            logs.push(format!("Error saving results: {e}"));
            if let Ok(json) = serde_json::to_string(&working) {
                logs.push(format!("Working proxies: {json}"));
            }
            return Err(e);
        }

        if cancel.is_cancelled() {
            logs.push("Stopped");
        }
        logs.push("Summary:");
        logs.push(format!("Working proxies: {}", working.len()));
        logs.push(format!("Results saved to {}", self.inner.store.path().display()));
        Ok(())
    }
}

/// Single writer of a run's working-proxy set: first success per
/// (candidate, target) wins.
struct Collector {
    candidate_order: HashMap<String, usize>,
    target_order: HashMap<String, usize>,
    require_geo: bool,
    recorded: HashSet<(String, String)>,
    working: Vec<WorkingProxy>,
}

impl Collector {
    fn new(candidates: &[Candidate], targets: &[Target], require_geo: bool) -> Self {
        Self {
            candidate_order: candidates
                .iter()
                .enumerate()
                .map(|(i, c)| (c.address(), i))
                .collect(),
            target_order: targets
                .iter()
                .enumerate()
                .map(|(i, t)| (t.url.clone(), i))
                .collect(),
            require_geo,
            recorded: HashSet::new(),
            working: Vec::new(),
        }
    }

    fn accepts(&self, result: &ProbeResult) -> bool {
        result.is_success() && (!self.require_geo || result.geo == Some(GeoVerdict::Confirmed))
    }

    /// Log line for the result, plus the new entry if it was recorded
    fn record(&mut self, result: &ProbeResult) -> (String, Option<WorkingProxy>) {
        let mut line = result.log_line();
        if !self.accepts(result) {
            return (line, None);
        }

        let key = (result.candidate.address(), result.target.url.clone());
        if !self.recorded.insert(key) {
            line.push_str(" (already recorded)");
            return (line, None);
        }

        let entry = WorkingProxy::from_probe(result);
        self.working.push(entry.clone());
        (line, Some(entry))
    }

    fn len(&self) -> usize {
        self.working.len()
    }

    /// Working set in candidate discovery order, then target order
    fn into_sorted(mut self) -> Vec<WorkingProxy> {
        let candidate_order = &self.candidate_order;
        let target_order = &self.target_order;
        self.working.sort_by_key(|w| {
            (
                candidate_order.get(&w.proxy).copied().unwrap_or(usize::MAX),
                target_order.get(&w.target).copied().unwrap_or(usize::MAX),
            )
        });
        self.working
    }
}
