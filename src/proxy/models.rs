//! Proxy data models

use crate::error::ScanError;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::time::Duration;

/// Statuses a target may answer with for a probe to count as a success.
/// Redirects are accepted on purpose.
pub const EXPECTED_STATUS: RangeInclusive<u16> = 200..=399;

/// Relay scheme used to talk to a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub const ALL: [Scheme; 2] = [Scheme::Http, Scheme::Https];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unvalidated proxy address found by a source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub host: String,
    pub port: u16,
}

impl Candidate {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The `host:port` form used for deduplication and output
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Proxy URL for routing a request through this candidate
    pub fn proxy_url(&self, scheme: Scheme) -> String {
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// URL a proxy has to reach to count as working
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub url: String,
}

impl Target {
    /// Parse and check a target URL. Only absolute http/https URLs are accepted.
    pub fn parse(url: &str) -> Result<Self, ScanError> {
        let trimmed = url.trim();
        let parsed =
            Url::parse(trimmed).map_err(|e| ScanError::invalid_target(trimmed, e.to_string()))?;

        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ScanError::invalid_target(
                    trimmed,
                    format!("unsupported scheme {other}"),
                ))
            }
        }
        if parsed.host_str().is_none() {
            return Err(ScanError::invalid_target(trimmed, "missing host"));
        }

        Ok(Self {
            url: trimmed.to_string(),
        })
    }

    pub fn accepts(&self, status: u16) -> bool {
        EXPECTED_STATUS.contains(&status)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Classification of a single probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeOutcome {
    Success,
    /// Bad status or transport error
    Failure(String),
    Timeout,
    /// The probe could not be issued at all
    Error(String),
}

/// Result of the exit-IP country check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeoVerdict {
    Confirmed,
    Rejected(String),
}

/// Result of one (candidate, target, scheme) probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub candidate: Candidate,
    pub target: Target,
    pub scheme: Scheme,
    pub outcome: ProbeOutcome,
    pub status: Option<u16>,
    pub latency: Duration,
    pub exit_ip: Option<IpAddr>,
    pub geo: Option<GeoVerdict>,
}

impl ProbeResult {
    fn new(
        candidate: Candidate,
        target: Target,
        scheme: Scheme,
        outcome: ProbeOutcome,
        latency: Duration,
    ) -> Self {
        Self {
            candidate,
            target,
            scheme,
            outcome,
            status: None,
            latency,
            exit_ip: None,
            geo: None,
        }
    }

    pub fn success(
        candidate: Candidate,
        target: Target,
        scheme: Scheme,
        status: u16,
        latency: Duration,
    ) -> Self {
        let mut result = Self::new(candidate, target, scheme, ProbeOutcome::Success, latency);
        result.status = Some(status);
        result
    }

    pub fn failed(
        candidate: Candidate,
        target: Target,
        scheme: Scheme,
        reason: String,
        latency: Duration,
    ) -> Self {
        Self::new(candidate, target, scheme, ProbeOutcome::Failure(reason), latency)
    }

    /// Failure caused by a status outside the expected range
    pub fn bad_status(
        candidate: Candidate,
        target: Target,
        scheme: Scheme,
        status: u16,
        latency: Duration,
    ) -> Self {
        let reason = format!("HTTP status: {status}");
        let mut result = Self::failed(candidate, target, scheme, reason, latency);
        result.status = Some(status);
        result
    }

    pub fn timeout(candidate: Candidate, target: Target, scheme: Scheme, latency: Duration) -> Self {
        Self::new(candidate, target, scheme, ProbeOutcome::Timeout, latency)
    }

    pub fn error(candidate: Candidate, target: Target, scheme: Scheme, reason: String) -> Self {
        Self::new(
            candidate,
            target,
            scheme,
            ProbeOutcome::Error(reason),
            Duration::ZERO,
        )
    }

    pub fn with_geo(mut self, exit_ip: Option<IpAddr>, verdict: GeoVerdict) -> Self {
        self.exit_ip = exit_ip;
        self.geo = Some(verdict);
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::Success)
    }

    pub fn latency_secs(&self) -> f64 {
        self.latency.as_secs_f64()
    }

    /// One log line describing this probe
    pub fn log_line(&self) -> String {
        let via = format!("{} via {} -> {}", self.candidate, self.scheme, self.target);
        match (&self.outcome, &self.geo) {
            (ProbeOutcome::Success, Some(GeoVerdict::Rejected(reason))) => {
                format!("[GEO] {via} rejected: {reason}")
            }
            (ProbeOutcome::Success, _) => {
                format!("[OK] {via} - {:.3}s", self.latency_secs())
            }
            (ProbeOutcome::Failure(reason), _) => format!("[FAIL] {via}: {reason}"),
            (ProbeOutcome::Timeout, _) => {
                format!("[TIMEOUT] {via} after {:.3}s", self.latency_secs())
            }
            (ProbeOutcome::Error(reason), _) => format!("[ERROR] {via}: {reason}"),
        }
    }
}

/// Entry of the persisted result set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingProxy {
    /// `host:port`
    pub proxy: String,
    /// Seconds, rounded to milliseconds
    pub latency: f64,
    pub scheme: Scheme,
    pub target: String,
}

impl WorkingProxy {
    pub fn from_probe(result: &ProbeResult) -> Self {
        Self {
            proxy: result.candidate.address(),
            latency: (result.latency_secs() * 1000.0).round() / 1000.0,
            scheme: result.scheme,
            target: result.target.url.clone(),
        }
    }
}
