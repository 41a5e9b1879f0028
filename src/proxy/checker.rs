//! Proxy checker module: probes candidates against targets through each relay scheme

use crate::error::GeoError;
use crate::proxy::geo::GeoVerifier;
use crate::proxy::models::{Candidate, ProbeResult, Scheme, Target};
use async_trait::async_trait;
use reqwest::redirect::Policy;
use reqwest::{Client, Proxy as ReqwestProxy};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default timeout for a single probe in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Default number of in-flight probes per target
pub const DEFAULT_MAX_PER_TARGET: usize = 10;

/// Default number of in-flight probes across all targets
pub const DEFAULT_MAX_WORKERS: usize = 64;

/// Default endpoint that echoes the caller's IP as plain text
pub const DEFAULT_EXIT_IP_URL: &str = "https://api.ipify.org";

/// Capacity of the channel between probe tasks and the consumer
const RESULT_CHANNEL_CAPACITY: usize = 256;

const PROBE_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0 Safari/537.36";

/// Which relay schemes are probed for each (candidate, target) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SchemeMode {
    #[default]
    Both,
    HttpOnly,
    HttpsOnly,
}

impl SchemeMode {
    pub fn schemes(&self) -> &'static [Scheme] {
        match self {
            SchemeMode::Both => &Scheme::ALL,
            SchemeMode::HttpOnly => &[Scheme::Http],
            SchemeMode::HttpsOnly => &[Scheme::Https],
        }
    }
}

/// Configuration for proxy checker
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Max in-flight probes for a single target
    pub max_per_target: usize,
    /// Max in-flight probes overall
    pub max_workers: usize,
    /// Schemes to probe
    pub schemes: SchemeMode,
    /// No new probes are submitted once this much time has passed
    pub budget: Option<Duration>,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            max_per_target: DEFAULT_MAX_PER_TARGET,
            max_workers: DEFAULT_MAX_WORKERS,
            schemes: SchemeMode::Both,
            budget: None,
        }
    }
}

impl CheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_per_target(mut self, max_per_target: usize) -> Self {
        self.max_per_target = max_per_target;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_schemes(mut self, schemes: SchemeMode) -> Self {
        self.schemes = schemes;
        self
    }

    pub fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.budget = budget;
        self
    }
}

/// Issues a single request through a candidate
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe `target` through `candidate` using `scheme`. Never fails: every
    /// problem is folded into the result's outcome.
    async fn probe(&self, candidate: &Candidate, target: &Target, scheme: Scheme) -> ProbeResult;

    /// The public IP the candidate exits from
    async fn exit_ip(&self, candidate: &Candidate, scheme: Scheme) -> Result<IpAddr, GeoError>;
}

/// Prober that relays real HTTP requests with reqwest
#[derive(Debug, Clone)]
pub struct HttpProber {
    timeout: Duration,
    exit_ip_url: String,
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            exit_ip_url: DEFAULT_EXIT_IP_URL.to_string(),
        }
    }

    pub fn with_exit_ip_url(mut self, url: String) -> Self {
        self.exit_ip_url = url;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Create a reqwest client that routes everything through the candidate.
    /// Redirects are not followed and certificates are not verified.
    fn create_client(&self, candidate: &Candidate, scheme: Scheme) -> reqwest::Result<Client> {
        let proxy = ReqwestProxy::all(candidate.proxy_url(scheme))?;

        Client::builder()
            .proxy(proxy)
            .redirect(Policy::none())
            .danger_accept_invalid_certs(true)
            .user_agent(PROBE_USER_AGENT)
            .build()
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, candidate: &Candidate, target: &Target, scheme: Scheme) -> ProbeResult {
        let client = match self.create_client(candidate, scheme) {
            Ok(client) => client,
            Err(e) => {
                return ProbeResult::error(candidate.clone(), target.clone(), scheme, e.to_string())
            }
        };

        let start = Instant::now();
        let response = tokio::time::timeout(self.timeout, client.get(&target.url).send()).await;
        let latency = start.elapsed();

        match response {
            Ok(Ok(response)) => {
                let status = response.status().as_u16();
                if target.accepts(status) {
                    ProbeResult::success(candidate.clone(), target.clone(), scheme, status, latency)
                } else {
                    ProbeResult::bad_status(candidate.clone(), target.clone(), scheme, status, latency)
                }
            }
            Ok(Err(e)) if e.is_timeout() && latency >= self.timeout => {
                ProbeResult::timeout(candidate.clone(), target.clone(), scheme, latency)
            }
            Ok(Err(e)) => {
                ProbeResult::failed(candidate.clone(), target.clone(), scheme, e.to_string(), latency)
            }
            Err(_) => ProbeResult::timeout(candidate.clone(), target.clone(), scheme, latency),
        }
    }

    async fn exit_ip(&self, candidate: &Candidate, scheme: Scheme) -> Result<IpAddr, GeoError> {
        let client = self
            .create_client(candidate, scheme)
            .map_err(|e| GeoError::ExitIp(e.to_string()))?;

        let request = async {
            let response = client.get(&self.exit_ip_url).send().await?;
            let body = response.error_for_status()?.text().await?;
            Ok::<_, reqwest::Error>(body)
        };
        let body = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| GeoError::ExitIp("timed out".to_string()))?
            .map_err(|e| GeoError::ExitIp(e.to_string()))?;

        body.trim()
            .parse()
            .map_err(|_| GeoError::ExitIp(format!("unexpected response {:?}", body.trim())))
    }
}

/// Stream of probe results, in completion order
pub struct ProbeStream {
    rx: mpsc::Receiver<ProbeResult>,
    skipped: Arc<AtomicUsize>,
}

impl ProbeStream {
    /// Next completed probe; `None` once every submitted probe has reported
    pub async fn recv(&mut self) -> Option<ProbeResult> {
        self.rx.recv().await
    }

    /// Probes never submitted because of the budget or a stop request
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// Proxy checker for validating candidates against targets
#[derive(Clone)]
pub struct ProxyChecker {
    config: CheckerConfig,
    prober: Arc<dyn Prober>,
    geo: Option<Arc<GeoVerifier>>,
}

impl ProxyChecker {
    /// Create a checker that probes over real HTTP with default configuration
    pub fn new() -> Self {
        Self::with_config(CheckerConfig::default(), Arc::new(HttpProber::default()))
    }

    pub fn with_config(config: CheckerConfig, prober: Arc<dyn Prober>) -> Self {
        Self {
            config,
            prober,
            geo: None,
        }
    }

    /// Require successful probes to pass the country check
    pub fn with_geo(mut self, verifier: Arc<GeoVerifier>) -> Self {
        self.geo = Some(verifier);
        self
    }

    /// Number of probes `validate` would submit
    pub fn planned(&self, candidates: usize, targets: usize) -> usize {
        candidates * targets * self.config.schemes.schemes().len()
    }

    /// Check a single (candidate, target, scheme) triple, including the
    /// country check when one is configured
    pub async fn check(&self, candidate: &Candidate, target: &Target, scheme: Scheme) -> ProbeResult {
        let result = self.prober.probe(candidate, target, scheme).await;
        match &self.geo {
            Some(geo) if result.is_success() => geo.confirm(self.prober.as_ref(), result).await,
            _ => result,
        }
    }

    /// Probe every candidate against every target through every enabled scheme.
    ///
    /// Each target gets its own dispatcher bounded by `max_per_target`; all
    /// dispatchers share the `max_workers` pool. Results arrive in completion
    /// order. Cancelling `cancel` or exceeding the budget stops submission;
    /// probes already running finish on their own timeout.
    pub fn validate(
        &self,
        candidates: Vec<Candidate>,
        targets: Vec<Target>,
        cancel: CancellationToken,
    ) -> ProbeStream {
        let (tx, rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        let skipped = Arc::new(AtomicUsize::new(0));
        let workers = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let candidates = Arc::new(candidates);
        // a budget past the end of the clock never expires
        let deadline = self
            .config
            .budget
            .and_then(|budget| Instant::now().checked_add(budget));

        for target in targets {
            let dispatcher = Dispatcher {
                checker: self.clone(),
                target,
                candidates: Arc::clone(&candidates),
                per_target: Arc::new(Semaphore::new(self.config.max_per_target.max(1))),
                workers: Arc::clone(&workers),
                tx: tx.clone(),
                skipped: Arc::clone(&skipped),
                cancel: cancel.clone(),
                deadline,
            };
            tokio::spawn(dispatcher.run());
        }

        ProbeStream { rx, skipped }
    }
}

impl Default for ProxyChecker {
    fn default() -> Self {
        Self::new()
    }
}

/// Submits the probes of one target
struct Dispatcher {
    checker: ProxyChecker,
    target: Target,
    candidates: Arc<Vec<Candidate>>,
    per_target: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    tx: mpsc::Sender<ProbeResult>,
    skipped: Arc<AtomicUsize>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Dispatcher {
    fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    async fn run(self) {
        let schemes = self.checker.config.schemes.schemes();
        let total = self.candidates.len() * schemes.len();
        // owned so nothing borrowed lives across the permit awaits
        let jobs: Vec<(Candidate, Scheme)> = self
            .candidates
            .iter()
            .flat_map(|candidate| schemes.iter().map(move |scheme| (candidate.clone(), *scheme)))
            .collect();

        for (submitted, (candidate, scheme)) in jobs.into_iter().enumerate() {
            if self.should_stop() {
                self.skip(total - submitted);
                return;
            }

            let Ok(target_permit) = Arc::clone(&self.per_target).acquire_owned().await else {
                return;
            };
            let Ok(worker_permit) = Arc::clone(&self.workers).acquire_owned().await else {
                return;
            };

            // waiting for permits can take a while
            if self.should_stop() {
                self.skip(total - submitted);
                return;
            }

            let checker = self.checker.clone();
            let target = self.target.clone();
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let _permits = (target_permit, worker_permit);
                let result = checker.check(&candidate, &target, scheme).await;
                if tx.send(result).await.is_err() {
                    debug!(candidate = %candidate, "result dropped, consumer gone");
                }
            });
        }
    }

    fn skip(&self, count: usize) {
        if count > 0 {
            warn!(target_url = %self.target, count, "stopped submitting probes");
            self.skipped.fetch_add(count, Ordering::Relaxed);
        }
    }
}
