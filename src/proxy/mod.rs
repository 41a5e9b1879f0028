//! Proxy module for discovering and validating proxies
//!
//! This module provides functionality for:
//! - Aggregating candidate proxies from several independent providers
//! - Normalizing candidate addresses to `host:port`
//! - Probing candidates against target URLs through both relay schemes
//! - Confirming the exit country of working proxies

pub mod checker;
pub mod crawler;
pub mod geo;
pub mod models;
pub mod parser;

pub use checker::{CheckerConfig, HttpProber, ProbeStream, Prober, ProxyChecker, SchemeMode};
pub use crawler::{
    CandidateSource, CrawlReport, CrawlResult, CrawlerConfig, FileSource, ProxyCrawler,
    ProxySource, SourceFormat,
};
pub use geo::{GeoLocation, GeoLookup, GeoVerifier, IpApiLookup, MmdbLookup};
pub use models::{
    Candidate, GeoVerdict, ProbeOutcome, ProbeResult, Scheme, Target, WorkingProxy,
};
pub use parser::ProxyParser;
