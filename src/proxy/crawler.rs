//! Proxy crawler module for aggregating candidates from several providers
//!
//! This module provides functionality for:
//! - Fetching raw proxy lists and HTML pages from independent providers
//! - Parsing each provider with its own rule (plain list, page text, table rows)
//! - Merging the results in provider order without duplicates

use crate::error::SourceError;
use crate::proxy::models::Candidate;
use crate::proxy::parser::ProxyParser;
use async_trait::async_trait;
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE};
use reqwest::Client;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for HTTP requests in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Default user agent for HTTP requests
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0 Safari/537.36";

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const ACCEPT_LANGUAGE_EN: &str = "en-US,en;q=0.9";

static SCRIPT_STYLE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script[^>]*>.*?</script>|<style[^>]*>.*?</style>")
        .expect("Invalid script/style regex")
});

static TAG_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("Invalid tag regex"));

static ROW_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<tr[^>]*>(.*?)</tr>").expect("Invalid row regex"));

static CELL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<td[^>]*>(.*?)</td>").expect("Invalid cell regex"));

static IPV4_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("Invalid IPv4 regex")
});

static PORT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{2,5}\b").expect("Invalid port regex"));

/// Result of crawling a single source
#[derive(Debug, Clone)]
pub struct CrawlResult {
    /// The source that was crawled
    pub source: String,
    /// Candidates extracted from the source, before cross-source deduplication
    pub candidates: Vec<Candidate>,
    /// Error message if crawling failed
    pub error: Option<String>,
}

impl CrawlResult {
    /// Create a successful crawl result
    pub fn success(source: String, candidates: Vec<Candidate>) -> Self {
        Self {
            source,
            candidates,
            error: None,
        }
    }

    /// Create a failed crawl result
    pub fn failure(source: String, error: String) -> Self {
        Self {
            source,
            candidates: Vec::new(),
            error: Some(error),
        }
    }

    /// Check if the crawl was successful
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of one aggregation pass over every source
#[derive(Debug, Clone, Default)]
pub struct CrawlReport {
    /// Unique candidates in provider order
    pub candidates: Vec<Candidate>,
    /// Per-source results, in source order
    pub sources: Vec<CrawlResult>,
    /// Unique candidates dropped by the `max_candidates` cap
    pub truncated: usize,
}

impl CrawlReport {
    /// True when there were sources and every one of them failed
    pub fn all_failed(&self) -> bool {
        !self.sources.is_empty() && self.sources.iter().all(|r| !r.is_success())
    }
}

/// Configuration for proxy crawler
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Timeout for HTTP requests
    pub timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: String,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl CrawlerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// A provider of raw candidates
#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Fetch and parse this provider's candidates
    async fn fetch(&self, client: &Client) -> Result<Vec<Candidate>, SourceError>;
}

/// How a provider's response body is parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// One `host:port` per line
    PlainList,
    /// IPv4:PORT pairs anywhere in the page text, falling back to table cells
    HtmlText,
    /// Table rows with the IP in one cell and the port in the next
    HtmlTable,
}

impl SourceFormat {
    pub fn parse(&self, body: &str) -> Vec<Candidate> {
        match self {
            SourceFormat::PlainList => ProxyParser::parse_string(body),
            SourceFormat::HtmlText => parse_html_text(body),
            SourceFormat::HtmlTable => parse_html_table(body),
        }
    }
}

/// Proxy source representing a website that provides proxy lists
#[derive(Debug, Clone)]
pub struct ProxySource {
    /// Name of the proxy source
    pub name: String,
    /// URL to fetch proxies from
    pub url: String,
    /// Parsing rule for this source
    pub format: SourceFormat,
}

impl ProxySource {
    pub fn new(name: &str, url: &str, format: SourceFormat) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            format,
        }
    }
}

#[async_trait]
impl CandidateSource for ProxySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, client: &Client) -> Result<Vec<Candidate>, SourceError> {
        let response = client
            .get(&self.url)
            .header(ACCEPT, ACCEPT_HTML)
            .header(ACCEPT_LANGUAGE, ACCEPT_LANGUAGE_EN)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        Ok(self.format.parse(&body))
    }
}

/// Local file in plain list format
#[derive(Debug, Clone)]
pub struct FileSource {
    name: String,
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: format!("file:{}", path.display()),
            path,
        }
    }
}

#[async_trait]
impl CandidateSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, _client: &Client) -> Result<Vec<Candidate>, SourceError> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(ProxyParser::parse_string(&content))
    }
}

/// Proxy crawler for fetching candidates from every configured source
pub struct ProxyCrawler {
    client: Client,
    sources: Vec<Arc<dyn CandidateSource>>,
}

impl ProxyCrawler {
    /// Create a crawler over the common sources with default configuration
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_config(CrawlerConfig::default(), Self::common_sources())
    }

    /// Create a crawler with custom configuration and sources
    pub fn with_config(
        config: CrawlerConfig,
        sources: Vec<Arc<dyn CandidateSource>>,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self { client, sources })
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    /// Fetch every source concurrently and merge the results in source order.
    ///
    /// A failing source is recorded in the report and skipped. Duplicates are
    /// dropped on first sight; anything beyond `max_candidates` is truncated.
    pub async fn fetch_candidates(&self, max_candidates: Option<usize>) -> CrawlReport {
        let fetches = self.sources.iter().map(|source| async move {
            let name = source.name().to_string();
            match source.fetch(&self.client).await {
                Ok(candidates) => {
                    info!(source = %name, count = candidates.len(), "fetched candidates");
                    CrawlResult::success(name, candidates)
                }
                Err(e) => {
                    warn!(source = %name, error = %e, "source failed");
                    CrawlResult::failure(name, e.to_string())
                }
            }
        });
        let sources = join_all(fetches).await;

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for result in &sources {
            for candidate in &result.candidates {
                if seen.insert(candidate.address()) {
                    candidates.push(candidate.clone());
                }
            }
        }

        let mut truncated = 0;
        if let Some(max) = max_candidates {
            if candidates.len() > max {
                truncated = candidates.len() - max;
                candidates.truncate(max);
                debug!(max, truncated, "candidate list truncated");
            }
        }

        CrawlReport {
            candidates,
            sources,
            truncated,
        }
    }

    /// Get the list of built-in free proxy sources
    pub fn common_sources() -> Vec<Arc<dyn CandidateSource>> {
        let sources = [
            ProxySource::new(
                "proxyscrape-http",
                "https://api.proxyscrape.com/v2/?request=displayproxies&protocol=http&country=IR&timeout=10000&simplified=true",
                SourceFormat::PlainList,
            ),
            ProxySource::new(
                "proxyscrape-https",
                "https://api.proxyscrape.com/v2/?request=displayproxies&protocol=https&country=IR&timeout=10000&simplified=true",
                SourceFormat::PlainList,
            ),
            ProxySource::new(
                "proxy-list.download-http",
                "https://www.proxy-list.download/api/v1/get?type=http&country=IR",
                SourceFormat::PlainList,
            ),
            ProxySource::new(
                "proxy-list.download-https",
                "https://www.proxy-list.download/api/v1/get?type=https&country=IR",
                SourceFormat::PlainList,
            ),
            ProxySource::new(
                "spys.one",
                "https://spys.one/free-proxy-list/IR/",
                SourceFormat::HtmlText,
            ),
            ProxySource::new(
                "freeproxy.world",
                "https://www.freeproxy.world/?country=IR",
                SourceFormat::HtmlTable,
            ),
            ProxySource::new(
                "thespeedx-http",
                "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/http.txt",
                SourceFormat::PlainList,
            ),
        ];

        sources
            .into_iter()
            .map(|s| Arc::new(s) as Arc<dyn CandidateSource>)
            .collect()
    }
}

/// Visible text of an HTML fragment: scripts and styles dropped, tags replaced by spaces
fn html_text(html: &str) -> String {
    let without_scripts = SCRIPT_STYLE_REGEX.replace_all(html, " ");
    let text = TAG_REGEX.replace_all(&without_scripts, " ");
    text.replace("&nbsp;", " ").replace("&amp;", "&")
}

fn dedup_in_order(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|c| seen.insert(c.address()))
        .collect()
}

fn parse_html_text(html: &str) -> Vec<Candidate> {
    let found = ProxyParser::extract_from_text(&html_text(html));
    if !found.is_empty() {
        return dedup_in_order(found);
    }

    let from_cells = CELL_REGEX
        .captures_iter(html)
        .filter_map(|cap| {
            let cell = html_text(cap.get(1)?.as_str());
            ProxyParser::extract_from_text(&cell).into_iter().next()
        })
        .collect();
    dedup_in_order(from_cells)
}

fn parse_html_table(html: &str) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    for row in ROW_REGEX.captures_iter(html) {
        let Some(row) = row.get(1) else { continue };
        let cells: Vec<String> = CELL_REGEX
            .captures_iter(row.as_str())
            .filter_map(|cap| cap.get(1).map(|m| html_text(m.as_str())))
            .collect();

        let ip_cell = cells.iter().enumerate().find_map(|(i, text)| {
            let ip = IPV4_REGEX.find(text)?.as_str();
            ip.parse::<Ipv4Addr>().ok().map(|_| (i, ip.to_string()))
        });
        let Some((index, ip)) = ip_cell else { continue };

        let port = cells
            .get(index + 1)
            .and_then(|text| PORT_REGEX.find(text))
            .and_then(|m| ProxyParser::parse_port(m.as_str()));
        if let Some(port) = port {
            candidates.push(Candidate::new(ip, port));
        }
    }

    candidates
}
