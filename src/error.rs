//! Error types for scans, sources and geolocation.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that stop a scan from starting or completing.
#[derive(Error, Debug)]
pub enum ScanError {
    /// No target URL left after resolving configuration
    #[error("no target URLs configured")]
    NoTargets,

    /// Target URL could not be parsed or uses an unsupported scheme
    #[error("invalid target URL {url:?}: {reason}")]
    InvalidTarget { url: String, reason: String },

    /// A limit that must be at least 1 was zero
    #[error("{0} must be a positive integer")]
    NonPositive(&'static str),

    /// An environment or command-line setting could not be parsed
    #[error("invalid value {value:?} for {name}")]
    InvalidSetting { name: &'static str, value: String },

    /// Country enforcement was requested but no lookup backend is available
    #[error("geolocation enforcement enabled without a lookup backend")]
    NoGeoBackend,

    /// `start` was requested while a scan is running
    #[error("a scan is already running")]
    AlreadyRunning,

    /// `stop` was requested while no scan is running
    #[error("no scan is running")]
    NotRunning,

    /// Result file could not be written
    #[error("failed to write results to {path}: {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ScanError {
    pub fn invalid_target(url: impl Into<String>, reason: impl Into<String>) -> Self {
        ScanError::InvalidTarget {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error comes from configuration rather than run-time state
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ScanError::NoTargets
                | ScanError::InvalidTarget { .. }
                | ScanError::NonPositive(_)
                | ScanError::InvalidSetting { .. }
                | ScanError::NoGeoBackend
        )
    }
}

/// Failure of a single candidate source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("source returned HTTP status {0}")]
    Status(u16),

    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to resolve or geolocate a proxy's exit IP.
#[derive(Error, Debug)]
pub enum GeoError {
    #[error("exit IP lookup failed: {0}")]
    ExitIp(String),

    #[error("geolocation lookup failed: {0}")]
    Lookup(String),

    #[error("no country known for {0}")]
    UnknownIp(std::net::IpAddr),

    #[error("geolocation request failed: {0}")]
    Http(#[from] reqwest::Error),
}
