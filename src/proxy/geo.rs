//! Geolocation module for confirming a proxy's exit country
//!
//! Lookups go through the [`GeoLookup`] capability, backed either by an
//! online service (ipapi.co) or by a local MMDB file. Every failure is
//! treated as "not verified".

use crate::error::GeoError;
use crate::proxy::checker::Prober;
use crate::proxy::models::{GeoVerdict, ProbeResult};
use async_trait::async_trait;
use maxminddb::{geoip2, Reader};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Default base URL of the online lookup service
pub const DEFAULT_IPAPI_URL: &str = "https://ipapi.co";

const DEFAULT_LOOKUP_TIMEOUT_SECS: u64 = 6;

/// Geographic location information for an IP address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GeoLocation {
    /// ISO 3166-1 alpha-2 country code (e.g., "US", "IR")
    pub country_code: Option<String>,
    /// Country name in English
    pub country_name: Option<String>,
    /// City name in English
    pub city_name: Option<String>,
}

impl GeoLocation {
    /// Create a new GeoLocation with country information
    pub fn with_country(country_code: Option<String>, country_name: Option<String>) -> Self {
        Self {
            country_code,
            country_name,
            ..Default::default()
        }
    }

    /// Whether the location is in the given country (case-insensitive ISO code)
    pub fn is_in(&self, country_code: &str) -> bool {
        self.country_code
            .as_deref()
            .is_some_and(|cc| cc.eq_ignore_ascii_case(country_code))
    }

    /// Get a short display string for the location
    pub fn short_display(&self) -> String {
        match (&self.country_code, &self.city_name) {
            (Some(cc), Some(city)) => format!("{}, {}", city, cc),
            (Some(cc), None) => cc.clone(),
            (None, Some(city)) => city.clone(),
            (None, None) => String::from("Unknown"),
        }
    }
}

/// Capability to geolocate an IP address
#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoLocation, GeoError>;
}

/// Lookup against a local MaxMind database
pub struct MmdbLookup {
    reader: Arc<Reader<Vec<u8>>>,
}

impl MmdbLookup {
    /// Open an MMDB file
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, GeoError> {
        let reader = Reader::open_readfile(path).map_err(|e| GeoError::Lookup(e.to_string()))?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }

    /// Look up the geolocation for an IpAddr
    pub fn lookup_ip(&self, ip: IpAddr) -> Result<GeoLocation, GeoError> {
        let lookup_result = self
            .reader
            .lookup(ip)
            .map_err(|e| GeoError::Lookup(e.to_string()))?;

        let city: Option<geoip2::City> = lookup_result
            .decode()
            .map_err(|e| GeoError::Lookup(e.to_string()))?;

        let Some(city) = city else {
            return Err(GeoError::UnknownIp(ip));
        };

        Ok(GeoLocation {
            country_code: city.country.iso_code.map(String::from),
            country_name: city.country.names.english.map(String::from),
            city_name: city.city.names.english.map(String::from),
        })
    }
}

impl Clone for MmdbLookup {
    fn clone(&self) -> Self {
        Self {
            reader: Arc::clone(&self.reader),
        }
    }
}

#[async_trait]
impl GeoLookup for MmdbLookup {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoLocation, GeoError> {
        self.lookup_ip(ip)
    }
}

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    #[serde(default)]
    error: bool,
    reason: Option<String>,
    country_code: Option<String>,
    country_name: Option<String>,
    city: Option<String>,
}

/// Lookup against the ipapi.co JSON API
pub struct IpApiLookup {
    client: Client,
    base_url: String,
}

impl IpApiLookup {
    pub fn new() -> Result<Self, GeoError> {
        Self::with_base_url(DEFAULT_IPAPI_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, GeoError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_LOOKUP_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GeoLookup for IpApiLookup {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoLocation, GeoError> {
        let url = format!("{}/{}/json/", self.base_url, ip);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(GeoError::Lookup(format!("HTTP status: {}", response.status())));
        }

        let body: IpApiResponse = response.json().await?;
        if body.error {
            return Err(GeoError::Lookup(
                body.reason.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        if body.country_code.is_none() {
            return Err(GeoError::UnknownIp(ip));
        }

        Ok(GeoLocation {
            country_code: body.country_code,
            country_name: body.country_name,
            city_name: body.city,
        })
    }
}

type CachedVerdict = (Option<IpAddr>, GeoVerdict);

/// Confirms that successful proxies exit in the expected country.
///
/// Verdicts are cached per candidate address once its exit IP is known, so a
/// proxy that works for several targets is only looked up once per scan. A
/// failed exit-IP request is not cached; the next scheme gets its own try.
pub struct GeoVerifier {
    lookup: Arc<dyn GeoLookup>,
    country: String,
    cache: Mutex<HashMap<String, CachedVerdict>>,
}

impl GeoVerifier {
    pub fn new(lookup: Arc<dyn GeoLookup>, country: impl Into<String>) -> Self {
        Self {
            lookup,
            country: country.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn country(&self) -> &str {
        &self.country
    }

    /// True only if the lookup succeeds and places `exit_ip` in `expected_country`
    pub async fn verify_country(&self, exit_ip: IpAddr, expected_country: &str) -> bool {
        self.check_country(exit_ip, expected_country).await.is_ok()
    }

    async fn check_country(&self, exit_ip: IpAddr, expected_country: &str) -> Result<(), String> {
        match self.lookup.lookup(exit_ip).await {
            Ok(location) if location.is_in(expected_country) => Ok(()),
            Ok(location) => Err(format!(
                "exit IP {} is in {}, expected {}",
                exit_ip,
                location.short_display(),
                expected_country
            )),
            Err(e) => Err(format!("exit IP {}: {}", exit_ip, e)),
        }
    }

    /// Attach a geolocation verdict to a successful probe.
    ///
    /// Results that are not successes pass through untouched.
    pub async fn confirm(&self, prober: &dyn Prober, result: ProbeResult) -> ProbeResult {
        if !result.is_success() {
            return result;
        }

        let key = result.candidate.address();
        let cached = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();
        if let Some((exit_ip, verdict)) = cached {
            return result.with_geo(exit_ip, verdict);
        }

        let ip = match prober.exit_ip(&result.candidate, result.scheme).await {
            Ok(ip) => ip,
            Err(e) => {
                debug!(candidate = %key, scheme = %result.scheme, error = %e, "exit IP unavailable");
                return result.with_geo(None, GeoVerdict::Rejected(e.to_string()));
            }
        };
        let verdict = match self.check_country(ip, &self.country).await {
            Ok(()) => GeoVerdict::Confirmed,
            Err(reason) => GeoVerdict::Rejected(reason),
        };
        debug!(candidate = %key, ?verdict, "geolocation verdict");

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, (Some(ip), verdict.clone()));

        result.with_geo(Some(ip), verdict)
    }
}
