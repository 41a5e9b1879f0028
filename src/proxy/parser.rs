//! Proxy parser module for normalizing candidate addresses

use crate::proxy::models::Candidate;
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::Ipv4Addr;

/// `host:port` with an optional scheme prefix and trailing slash
static LINE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(?:https?|socks4a?|socks5h?)://)?([A-Za-z0-9.\-]+):(\d{1,5})/?$")
        .expect("Invalid proxy line regex")
});

/// Regex pattern to match IPv4:PORT patterns in text
static IP_PORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d{1,5})\b")
        .expect("Invalid IP:PORT regex")
});

/// Proxy parser for turning raw provider output into candidates
pub struct ProxyParser;

impl ProxyParser {
    /// Parse a single proxy line
    ///
    /// Supports formats:
    /// - HOST:PORT
    /// - scheme://HOST:PORT
    ///
    /// Dotted-numeric hosts must be valid IPv4 addresses and the port must be
    /// in 1..=65535.
    pub fn parse_line(line: &str) -> Option<Candidate> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let caps = LINE_REGEX.captures(line)?;
        let host = caps.get(1)?.as_str();
        let port = Self::parse_port(caps.get(2)?.as_str())?;

        if !Self::is_valid_host(host) {
            return None;
        }

        Some(Candidate::new(host, port))
    }

    /// Parse candidates from a string (one per line), in order
    pub fn parse_string(content: &str) -> Vec<Candidate> {
        content.lines().filter_map(Self::parse_line).collect()
    }

    /// Extract every IPv4:PORT pair embedded in free text, in order of appearance
    pub fn extract_from_text(content: &str) -> Vec<Candidate> {
        IP_PORT_REGEX
            .captures_iter(content)
            .filter_map(|cap| {
                let host = cap.get(1)?.as_str();
                host.parse::<Ipv4Addr>().ok()?;
                let port = Self::parse_port(cap.get(2)?.as_str())?;
                Some(Candidate::new(host, port))
            })
            .collect()
    }

    /// Parse a port number, rejecting zero
    pub fn parse_port(text: &str) -> Option<u16> {
        match text.trim().parse::<u16>() {
            Ok(0) | Err(_) => None,
            Ok(port) => Some(port),
        }
    }

    fn is_valid_host(host: &str) -> bool {
        if host.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return host.parse::<Ipv4Addr>().is_ok();
        }
        !host.starts_with('-') && !host.starts_with('.') && !host.ends_with('.')
    }
}
