//! Proxy Finder - proxy discovery and validation
//!
//! Aggregates candidate proxies from public sources, probes each one against
//! a set of target URLs through both relay schemes, optionally confirms the
//! exit country, and keeps the working subset in a JSON result file.

pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod scan;
pub mod server;
pub mod tui;

pub use config::{ScanConfig, ScanOverrides};
pub use error::{GeoError, ScanError, SourceError};
pub use proxy::*;
pub use scan::{ScanController, ScanRun, ScanState};

/// Application result type
pub type Result<T> = anyhow::Result<T>;
