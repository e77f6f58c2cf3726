//! Country-IP candidate feed
//!
//! Fetches per-country CIDR blocks (one per line, `#` comments) and turns
//! each into a single probe candidate: the first host of the block on port
//! 53. A country feed can be millions of lines, so parsing is streaming and
//! stops as soon as `max_candidates` is reached.

use crate::{Error, Result};
use futures::StreamExt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tracing::debug;

const FEED_URL: &str = "https://www.ipdeny.com/ipblocks/data/countries";
const FEED_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetch CIDR blocks for `country_code` and extract up to `max_candidates`
/// probe addresses, line by line as the body arrives.
pub async fn fetch_country_candidates(
    country_code: &str,
    max_candidates: usize,
) -> Result<Vec<String>> {
    let url = format!("{}/{}.zone", FEED_URL, country_code.to_lowercase());
    debug!("fetching country IP feed: {}", url);

    let client = reqwest::Client::builder()
        .timeout(FEED_TIMEOUT)
        .user_agent(concat!("dnstt-keeper/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let resp = client.get(&url).send().await?;
    if !resp.status().is_success() {
        return Err(Error::http(format!(
            "country feed returned status {}",
            resp.status().as_u16()
        )));
    }

    let mut candidates = Vec::new();
    let mut pending = Vec::new();
    let mut stream = resp.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        pending.extend_from_slice(&chunk);
        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            consume_line(&String::from_utf8_lossy(&line), &mut candidates);
            if candidates.len() >= max_candidates {
                return Ok(candidates);
            }
        }
    }
    if !pending.is_empty() {
        consume_line(&String::from_utf8_lossy(&pending), &mut candidates);
        candidates.truncate(max_candidates);
    }

    Ok(candidates)
}

/// Fetch a plain-text candidate list: one `host[:port]` per line, `#`
/// comments, port 53 assumed when absent.
pub async fn fetch_candidate_list(url: &str) -> Result<Vec<String>> {
    let client = reqwest::Client::builder()
        .timeout(FEED_TIMEOUT)
        .user_agent(concat!("dnstt-keeper/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let resp = client.get(url).send().await?;
    if !resp.status().is_success() {
        return Err(Error::http(format!(
            "candidate list {} returned status {}",
            url,
            resp.status().as_u16()
        )));
    }

    let body = resp.text().await?;
    Ok(candidate_list_from_text(&body))
}

fn candidate_list_from_text(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            if line.contains(':') {
                line.to_string()
            } else {
                format!("{}:53", line)
            }
        })
        .collect()
}

fn consume_line(line: &str, out: &mut Vec<String>) {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return;
    }
    if let Some(ip) = first_host(line) {
        out.push(format!("{}:53", ip));
    }
}

/// First usable host of a CIDR block: network address + 1. Plain IPv4
/// addresses pass through as-is; IPv6 is dropped.
pub fn first_host(entry: &str) -> Option<Ipv4Addr> {
    if let Ok(net) = entry.parse::<ipnet::IpNet>() {
        return match net {
            ipnet::IpNet::V4(v4) => {
                let first = u32::from(v4.network()).checked_add(1)?;
                Some(Ipv4Addr::from(first))
            }
            ipnet::IpNet::V6(_) => None,
        };
    }
    match entry.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => Some(ip),
        _ => None,
    }
}

/// Parse an in-memory zone body. Shares its line handling with the
/// streaming fetch path.
pub fn parse_zone_text(body: &str, max_candidates: usize) -> Vec<String> {
    let mut candidates = Vec::new();
    for line in body.lines() {
        consume_line(line, &mut candidates);
        if candidates.len() >= max_candidates {
            break;
        }
    }
    candidates
}
