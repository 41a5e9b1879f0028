//! Scan configuration: process defaults, environment parsing and call-time overrides

use crate::error::ScanError;
use crate::proxy::checker::{
    CheckerConfig, SchemeMode, DEFAULT_MAX_PER_TARGET, DEFAULT_MAX_WORKERS, DEFAULT_TIMEOUT_SECS,
};
use crate::proxy::models::Target;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Targets used when none are configured
pub const DEFAULT_TARGETS: [&str; 3] = [
    "https://api.ipify.org?format=json",
    "https://httpbin.org/get",
    "https://icanhazip.com",
];

pub const DEFAULT_OUTPUT_FILE: &str = "working_proxies.json";

/// Country enforced by `VERIFY_IR`
pub const DEFAULT_COUNTRY: &str = "IR";

/// Whether working proxies must exit in a given country
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum GeoPolicy {
    #[default]
    Disabled,
    Enforce { country: String },
}

impl GeoPolicy {
    pub fn enforce(country: &str) -> Self {
        GeoPolicy::Enforce {
            country: country.trim().to_ascii_uppercase(),
        }
    }

    pub fn country(&self) -> Option<&str> {
        match self {
            GeoPolicy::Disabled => None,
            GeoPolicy::Enforce { country } => Some(country),
        }
    }
}

/// Where country lookups are answered from
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GeoBackend {
    /// ipapi.co
    #[default]
    IpApi,
    /// Local MaxMind database
    Mmdb(PathBuf),
}

/// Process-wide scan defaults
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub targets: Vec<String>,
    /// Cap on unique candidates; `None` keeps all of them
    pub max_candidates: Option<usize>,
    pub max_per_target: usize,
    pub max_workers: usize,
    pub probe_timeout: Duration,
    /// Soft deadline after which no new probes are submitted
    pub scan_budget: Option<Duration>,
    pub schemes: SchemeMode,
    pub geo: GeoPolicy,
    pub geo_backend: GeoBackend,
    pub output_file: PathBuf,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            targets: DEFAULT_TARGETS.iter().map(|t| t.to_string()).collect(),
            max_candidates: None,
            max_per_target: DEFAULT_MAX_PER_TARGET,
            max_workers: DEFAULT_MAX_WORKERS,
            probe_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            scan_budget: None,
            schemes: SchemeMode::Both,
            geo: GeoPolicy::Disabled,
            geo_backend: GeoBackend::IpApi,
            output_file: PathBuf::from(DEFAULT_OUTPUT_FILE),
        }
    }
}

/// Overrides supplied when a scan is started.
///
/// An empty `targets` list means "use the defaults".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOverrides {
    pub targets: Option<Vec<String>>,
    pub max_candidates: Option<usize>,
    pub max_per_target: Option<usize>,
}

/// Serializable view of the effective configuration of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunConfig {
    pub targets: Vec<String>,
    pub max_candidates: Option<usize>,
    pub max_per_target: usize,
    pub max_workers: usize,
    pub probe_timeout_secs: f64,
    pub scan_budget_secs: Option<f64>,
    pub schemes: SchemeMode,
    pub geo: GeoPolicy,
}

impl ScanConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_candidates(mut self, max: Option<usize>) -> Self {
        self.max_candidates = max;
        self
    }

    pub fn with_max_per_target(mut self, max: usize) -> Self {
        self.max_per_target = max;
        self
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_scan_budget(mut self, budget: Option<Duration>) -> Self {
        self.scan_budget = budget;
        self
    }

    pub fn with_schemes(mut self, schemes: SchemeMode) -> Self {
        self.schemes = schemes;
        self
    }

    pub fn with_geo(mut self, geo: GeoPolicy) -> Self {
        self.geo = geo;
        self
    }

    pub fn with_geo_backend(mut self, backend: GeoBackend) -> Self {
        self.geo_backend = backend;
        self
    }

    pub fn with_output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = path.into();
        self
    }

    /// Read defaults from the process environment
    pub fn from_env() -> Result<Self, ScanError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read defaults from any key/value lookup.
    ///
    /// Recognized keys: `TARGET_URLS`, `TARGET_URL`, `MAX_PROXIES`,
    /// `MAX_PER_TARGET`, `MAX_WORKERS`, `PROBE_TIMEOUT_SECS`,
    /// `SCAN_BUDGET_SECS`, `VERIFY_IR`, `VERIFY_COUNTRY`, `GEOIP_MMDB`,
    /// `OUTPUT_FILE`. Blank values are ignored.
    pub fn from_lookup<F>(get: F) -> Result<Self, ScanError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(list) = get("TARGET_URLS") {
            config.targets = split_list(&list);
        } else if let Some(single) = get("TARGET_URL") {
            config.targets = vec![single.trim().to_string()];
        }

        if let Some(value) = get("MAX_PROXIES") {
            config.max_candidates = Some(parse_count("MAX_PROXIES", &value)?);
        }
        if let Some(value) = get("MAX_PER_TARGET") {
            config.max_per_target = parse_count("MAX_PER_TARGET", &value)?;
        }
        if let Some(value) = get("MAX_WORKERS") {
            config.max_workers = parse_count("MAX_WORKERS", &value)?;
        }
        if let Some(value) = get("PROBE_TIMEOUT_SECS") {
            config.probe_timeout = parse_secs("PROBE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = get("SCAN_BUDGET_SECS") {
            config.scan_budget = Some(parse_secs("SCAN_BUDGET_SECS", &value)?);
        }

        if get("VERIFY_IR").is_some_and(|v| is_truthy(&v)) {
            config.geo = GeoPolicy::enforce(DEFAULT_COUNTRY);
        }
        if let Some(country) = get("VERIFY_COUNTRY") {
            config.geo = GeoPolicy::enforce(&country);
        }
        if let Some(path) = get("GEOIP_MMDB") {
            config.geo_backend = GeoBackend::Mmdb(PathBuf::from(path.trim()));
        }
        if let Some(path) = get("OUTPUT_FILE") {
            config.output_file = PathBuf::from(path.trim());
        }

        Ok(config)
    }

    /// Apply call-time overrides on top of these defaults
    pub fn with_overrides(&self, overrides: &ScanOverrides) -> Self {
        let mut config = self.clone();
        if let Some(targets) = overrides.targets.as_ref().filter(|t| !t.is_empty()) {
            config.targets = targets.clone();
        }
        if let Some(max) = overrides.max_candidates {
            config.max_candidates = Some(max);
        }
        if let Some(max) = overrides.max_per_target {
            config.max_per_target = max;
        }
        config
    }

    /// Check limits and parse targets, dropping duplicate targets
    pub fn validate(&self) -> Result<Vec<Target>, ScanError> {
        if self.max_per_target == 0 {
            return Err(ScanError::NonPositive("max_per_target"));
        }
        if self.max_workers == 0 {
            return Err(ScanError::NonPositive("max_workers"));
        }
        if self.max_candidates == Some(0) {
            return Err(ScanError::NonPositive("max_candidates"));
        }
        if self.probe_timeout.is_zero() {
            return Err(ScanError::NonPositive("probe_timeout"));
        }

        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for raw in &self.targets {
            let target = Target::parse(raw)?;
            if seen.insert(target.url.clone()) {
                targets.push(target);
            }
        }

        if targets.is_empty() {
            return Err(ScanError::NoTargets);
        }
        Ok(targets)
    }

    pub fn checker_config(&self) -> CheckerConfig {
        CheckerConfig::new()
            .with_max_per_target(self.max_per_target)
            .with_max_workers(self.max_workers)
            .with_schemes(self.schemes)
            .with_budget(self.scan_budget)
    }

    pub fn summary(&self) -> RunConfig {
        RunConfig {
            targets: self.targets.clone(),
            max_candidates: self.max_candidates,
            max_per_target: self.max_per_target,
            max_workers: self.max_workers,
            probe_timeout_secs: self.probe_timeout.as_secs_f64(),
            scan_budget_secs: self.scan_budget.map(|b| b.as_secs_f64()),
            schemes: self.schemes,
            geo: self.geo.clone(),
        }
    }
}

/// `1`, `true`, `yes` and `on` (any case) enable a flag
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Split a comma-separated list, dropping blank entries
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_count(name: &'static str, value: &str) -> Result<usize, ScanError> {
    value
        .trim()
        .parse()
        .map_err(|_| ScanError::InvalidSetting {
            name,
            value: value.to_string(),
        })
}

/// Parse a non-negative number of seconds. Values too large for a
/// `Duration` are rejected like any other bad input.
pub fn parse_secs(name: &'static str, value: &str) -> Result<Duration, ScanError> {
    let invalid = || ScanError::InvalidSetting {
        name,
        value: value.to_string(),
    };
    let secs: f64 = value.trim().parse().map_err(|_| invalid())?;
    Duration::try_from_secs_f64(secs).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<ScanConfig, ScanError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ScanConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.targets.len(), DEFAULT_TARGETS.len());
        assert_eq!(config.max_candidates, None);
        assert_eq!(config.max_per_target, DEFAULT_MAX_PER_TARGET);
        assert_eq!(config.geo, GeoPolicy::Disabled);
        assert_eq!(config.output_file, PathBuf::from(DEFAULT_OUTPUT_FILE));
    }

    #[test]
    fn test_target_urls_take_precedence() {
        let config = from_pairs(&[
            ("TARGET_URLS", "https://a.example, https://b.example ,,"),
            ("TARGET_URL", "https://ignored.example"),
        ])
        .unwrap();
        assert_eq!(config.targets, vec!["https://a.example", "https://b.example"]);

        let config = from_pairs(&[("TARGET_URL", "https://single.example")]).unwrap();
        assert_eq!(config.targets, vec!["https://single.example"]);
    }

    #[test]
    fn test_numeric_settings() {
        let config = from_pairs(&[
            ("MAX_PROXIES", "50"),
            ("MAX_PER_TARGET", "4"),
            ("MAX_WORKERS", "32"),
            ("PROBE_TIMEOUT_SECS", "2.5"),
            ("SCAN_BUDGET_SECS", "120"),
        ])
        .unwrap();
        assert_eq!(config.max_candidates, Some(50));
        assert_eq!(config.max_per_target, 4);
        assert_eq!(config.max_workers, 32);
        assert_eq!(config.probe_timeout, Duration::from_millis(2500));
        assert_eq!(config.scan_budget, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_invalid_numeric_setting() {
        let err = from_pairs(&[("MAX_PER_TARGET", "lots")]).unwrap_err();
        assert!(matches!(
            err,
            ScanError::InvalidSetting {
                name: "MAX_PER_TARGET",
                ..
            }
        ));
        assert!(from_pairs(&[("PROBE_TIMEOUT_SECS", "-1")]).is_err());
    }

    #[test]
    fn test_oversized_duration_is_invalid_setting() {
        for (key, value) in [
            ("PROBE_TIMEOUT_SECS", "1e30"),
            ("SCAN_BUDGET_SECS", "1e30"),
            ("PROBE_TIMEOUT_SECS", "inf"),
            ("SCAN_BUDGET_SECS", "NaN"),
        ] {
            let err = from_pairs(&[(key, value)]).unwrap_err();
            assert!(
                matches!(err, ScanError::InvalidSetting { name, .. } if name == key),
                "{key}={value} gave {err:?}"
            );
        }

        assert_eq!(
            parse_secs("--timeout", "2.5").unwrap(),
            Duration::from_millis(2500)
        );
        assert!(parse_secs("--timeout", "1e30").is_err());
    }

    #[test]
    fn test_geo_settings() {
        let config = from_pairs(&[("VERIFY_IR", "1")]).unwrap();
        assert_eq!(config.geo, GeoPolicy::enforce("IR"));

        let config = from_pairs(&[("VERIFY_IR", "0")]).unwrap();
        assert_eq!(config.geo, GeoPolicy::Disabled);

        let config = from_pairs(&[("VERIFY_COUNTRY", "de"), ("GEOIP_MMDB", "/data/city.mmdb")]).unwrap();
        assert_eq!(config.geo.country(), Some("DE"));
        assert_eq!(config.geo_backend, GeoBackend::Mmdb(PathBuf::from("/data/city.mmdb")));
    }

    #[test]
    fn test_overrides() {
        let defaults = ScanConfig::new().with_targets(["https://default.example"]);
        let overrides = ScanOverrides {
            targets: Some(vec!["https://override.example".to_string()]),
            max_candidates: Some(10),
            max_per_target: Some(2),
        };

        let config = defaults.with_overrides(&overrides);
        assert_eq!(config.targets, vec!["https://override.example"]);
        assert_eq!(config.max_candidates, Some(10));
        assert_eq!(config.max_per_target, 2);

        let empty = ScanOverrides {
            targets: Some(Vec::new()),
            ..Default::default()
        };
        assert_eq!(defaults.with_overrides(&empty).targets, vec!["https://default.example"]);
    }

    #[test]
    fn test_overrides_deserialize() {
        let overrides: ScanOverrides =
            serde_json::from_str(r#"{"targets": ["https://x.example"], "max_per_target": 3}"#).unwrap();
        assert_eq!(overrides.max_per_target, Some(3));
        assert_eq!(overrides.max_candidates, None);

        let empty: ScanOverrides = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, ScanOverrides::default());
    }

    #[test]
    fn test_validate_dedupes_targets() {
        let config = ScanConfig::new().with_targets([
            "https://a.example/",
            "https://b.example/",
            "https://a.example/",
        ]);
        let targets = config.validate().unwrap();
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn test_validate_rejects_bad_configuration() {
        let none: [&str; 0] = [];
        assert!(matches!(
            ScanConfig::new().with_targets(none).validate(),
            Err(ScanError::NoTargets)
        ));
        assert!(matches!(
            ScanConfig::new().with_max_per_target(0).validate(),
            Err(ScanError::NonPositive("max_per_target"))
        ));
        assert!(matches!(
            ScanConfig::new().with_max_candidates(Some(0)).validate(),
            Err(ScanError::NonPositive("max_candidates"))
        ));
        assert!(matches!(
            ScanConfig::new().with_targets(["gopher://old.example"]).validate(),
            Err(ScanError::InvalidTarget { .. })
        ));
    }

    #[test]
    fn test_truthy_values() {
        for value in ["1", "true", "YES", " on "] {
            assert!(is_truthy(value), "{value}");
        }
        for value in ["0", "false", "no", ""] {
            assert!(!is_truthy(value), "{value}");
        }
    }
}
