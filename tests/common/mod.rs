//! Test doubles shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use proxy_finder::config::ScanConfig;
use proxy_finder::error::{GeoError, SourceError};
use proxy_finder::proxy::{
    Candidate, CandidateSource, CrawlerConfig, GeoLocation, GeoLookup, ProbeResult, Prober,
    ProxyCrawler, Scheme, Target,
};
use proxy_finder::scan::ScanController;
use reqwest::Client;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Source returning a fixed list
pub struct StaticSource {
    pub name: String,
    pub candidates: Vec<Candidate>,
}

impl StaticSource {
    pub fn new(name: &str, addresses: &[(&str, u16)]) -> Arc<dyn CandidateSource> {
        Arc::new(Self {
            name: name.to_string(),
            candidates: addresses
                .iter()
                .map(|(host, port)| Candidate::new(*host, *port))
                .collect(),
        })
    }
}

#[async_trait]
impl CandidateSource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, _client: &Client) -> Result<Vec<Candidate>, SourceError> {
        Ok(self.candidates.clone())
    }
}

/// Source that always fails
pub struct BrokenSource;

#[async_trait]
impl CandidateSource for BrokenSource {
    fn name(&self) -> &str {
        "broken"
    }

    async fn fetch(&self, _client: &Client) -> Result<Vec<Candidate>, SourceError> {
        Err(SourceError::Status(503))
    }
}

/// What a candidate does for a given scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Ok,
    Fail,
    Timeout,
}

/// Deterministic prober with per-target and overall in-flight instrumentation.
///
/// Unknown candidates fail on every scheme.
pub struct MockProber {
    behaviors: HashMap<(String, Scheme), Behavior>,
    delay: Duration,
    pub calls: AtomicUsize,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight: Mutex<HashMap<String, usize>>,
    overall: AtomicUsize,
    max_overall: AtomicUsize,
}

impl MockProber {
    pub fn new(delay: Duration) -> Self {
        Self {
            behaviors: HashMap::new(),
            delay,
            calls: AtomicUsize::new(0),
            in_flight: Mutex::new(HashMap::new()),
            max_in_flight: Mutex::new(HashMap::new()),
            overall: AtomicUsize::new(0),
            max_overall: AtomicUsize::new(0),
        }
    }

    pub fn with(mut self, address: &str, scheme: Scheme, behavior: Behavior) -> Self {
        self.behaviors.insert((address.to_string(), scheme), behavior);
        self
    }

    /// Succeed over plain HTTP for every address
    pub fn all_http_ok(mut self, addresses: &[&str]) -> Self {
        for address in addresses {
            self.behaviors
                .insert((address.to_string(), Scheme::Http), Behavior::Ok);
        }
        self
    }

    pub fn max_in_flight(&self, target: &str) -> usize {
        self.max_in_flight
            .lock()
            .unwrap()
            .get(target)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of calls running at once, across every target
    pub fn max_in_flight_overall(&self) -> usize {
        self.max_overall.load(Ordering::SeqCst)
    }

    fn enter(&self, target: &str) {
        let now = self.overall.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_overall.fetch_max(now, Ordering::SeqCst);
        let mut in_flight = self.in_flight.lock().unwrap();
        let current = in_flight.entry(target.to_string()).or_insert(0);
        *current += 1;
        let mut max = self.max_in_flight.lock().unwrap();
        let peak = max.entry(target.to_string()).or_insert(0);
        *peak = (*peak).max(*current);
    }

    fn leave(&self, target: &str) {
        self.overall.fetch_sub(1, Ordering::SeqCst);
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(current) = in_flight.get_mut(target) {
            *current -= 1;
        }
    }
}

#[async_trait]
impl Prober for MockProber {
    async fn probe(&self, candidate: &Candidate, target: &Target, scheme: Scheme) -> ProbeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.enter(&target.url);
        tokio::time::sleep(self.delay).await;
        self.leave(&target.url);

        let behavior = self
            .behaviors
            .get(&(candidate.address(), scheme))
            .copied()
            .unwrap_or(Behavior::Fail);
        match behavior {
            Behavior::Ok => {
                ProbeResult::success(candidate.clone(), target.clone(), scheme, 200, self.delay)
            }
            Behavior::Fail => ProbeResult::failed(
                candidate.clone(),
                target.clone(),
                scheme,
                "connection refused".to_string(),
                self.delay,
            ),
            Behavior::Timeout => {
                ProbeResult::timeout(candidate.clone(), target.clone(), scheme, self.delay)
            }
        }
    }

    async fn exit_ip(&self, candidate: &Candidate, _scheme: Scheme) -> Result<IpAddr, GeoError> {
        candidate
            .host
            .parse()
            .map_err(|_| GeoError::ExitIp(format!("no exit IP for {}", candidate)))
    }
}

/// Lookup placing every IP in one country
pub struct CountryLookup(pub &'static str);

#[async_trait]
impl GeoLookup for CountryLookup {
    async fn lookup(&self, _ip: IpAddr) -> Result<GeoLocation, GeoError> {
        Ok(GeoLocation::with_country(Some(self.0.to_string()), None))
    }
}

/// Fresh result file path in its own scratch directory
pub fn scratch_output(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("proxy-finder-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

pub fn crawler(sources: Vec<Arc<dyn CandidateSource>>) -> ProxyCrawler {
    ProxyCrawler::with_config(CrawlerConfig::default(), sources).unwrap()
}

/// Scan defaults pointing at a scratch result file
pub fn test_config(targets: &[&str]) -> ScanConfig {
    ScanConfig::new()
        .with_targets(targets.iter().copied())
        .with_output_file(scratch_output("working_proxies.json"))
}

pub fn controller(
    config: ScanConfig,
    sources: Vec<Arc<dyn CandidateSource>>,
    prober: Arc<MockProber>,
    geo: Option<Arc<dyn GeoLookup>>,
) -> ScanController {
    ScanController::with_parts(config, crawler(sources), prober, geo)
}
