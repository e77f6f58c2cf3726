//! Resolver discovery
//!
//! The scanner fans a probe out over candidate addresses with bounded
//! concurrency and registers every working resolver in the pool. Failures
//! are counted, never propagated: a candidate that does not answer is
//! simply not added.

pub mod feed;
pub mod probe;

pub use probe::ProbeError;

use crate::config::ScannerConfig;
use crate::resolver::{Pool, ResolverKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Well-known public resolvers probed when no other source yields
/// candidates.
pub const BUILTIN_RESOLVERS: &[&str] = &[
    "8.8.8.8:53",
    "8.8.4.4:53",
    "1.1.1.1:53",
    "1.0.0.1:53",
    "9.9.9.9:53",
    "208.67.222.222:53",
    "208.67.220.220:53",
];

/// Discovers working resolvers and feeds the pool.
pub struct Scanner {
    config: ScannerConfig,
    pool: Arc<Pool>,
}

impl Scanner {
    pub fn new(config: ScannerConfig, pool: Arc<Pool>) -> Self {
        Scanner { config, pool }
    }

    /// Probe every candidate once with at most `concurrent_scans` probes in
    /// flight, stopping at `deadline`. Working resolvers are added to the
    /// pool and marked healthy with their measured latency. When the
    /// deadline fires, in-flight probes are abandoned; pool updates from
    /// probes that completed first are kept. Returns the number of
    /// successes.
    pub async fn scan(
        &self,
        candidates: Vec<String>,
        kind: ResolverKind,
        deadline: Instant,
    ) -> usize {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrent_scans));
        let probe_timeout = self.config.probe_timeout();
        let mut tasks = JoinSet::new();

        // each candidate is probed exactly once, whatever the sources fed us
        let mut seen = std::collections::HashSet::new();
        let candidates: Vec<String> = candidates
            .into_iter()
            .filter(|addr| seen.insert(addr.clone()))
            .collect();

        for address in candidates {
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                // closed only if the JoinSet is dropped mid-scan
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (address, Err(ProbeError::Timeout)),
                };
                let outcome = probe::probe(&address, kind, probe_timeout).await;
                (address, outcome)
            });
        }

        let mut found = 0;
        loop {
            match timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(joined)) => {
                    let Ok((address, outcome)) = joined else {
                        continue;
                    };
                    match outcome {
                        Ok(latency) => {
                            self.pool.add(&address, kind);
                            self.pool.mark_healthy(&address, latency);
                            found += 1;
                            info!(
                                "found working resolver: {} (latency: {:?})",
                                address, latency
                            );
                        }
                        Err(e) => debug!("resolver {} failed probe: {}", address, e),
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "scan deadline reached, abandoning {} in-flight probes",
                        tasks.len()
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }
        found
    }

    /// Worst-case bound for a full pass: every batch of `W` probes runs its
    /// whole per-probe timeout, plus one timeout of slack. Keeps a wedged
    /// probe from stalling the pass forever.
    fn scan_deadline(&self, candidate_count: usize) -> Instant {
        let workers = self.config.concurrent_scans.max(1);
        let batches = candidate_count.div_ceil(workers) as u32;
        Instant::now() + self.config.probe_timeout() * (batches + 1)
    }

    /// Collect candidates from every configured source and scan them.
    pub async fn scan_sources(&self, kind: ResolverKind) -> usize {
        let mut candidates: Vec<String> =
            BUILTIN_RESOLVERS.iter().map(|s| s.to_string()).collect();

        for source in &self.config.resolver_sources {
            if source == "builtin" {
                continue; // always included above
            }
            match feed::fetch_candidate_list(source).await {
                Ok(mut extra) => {
                    info!("source {} yielded {} candidates", source, extra.len());
                    candidates.append(&mut extra);
                }
                Err(e) => warn!("resolver source {} unavailable: {}", source, e),
            }
        }

        if let Some(ref country) = self.config.country_code {
            match feed::fetch_country_candidates(country, self.config.max_candidates).await {
                Ok(mut extra) => {
                    info!(
                        "country feed {} yielded {} candidates",
                        country,
                        extra.len()
                    );
                    candidates.append(&mut extra);
                }
                Err(e) => warn!("country feed {} unavailable: {}", country, e),
            }
        }

        let deadline = self.scan_deadline(candidates.len());
        self.scan(candidates, kind, deadline).await
    }

    /// Run an initial scan immediately, then one on every tick until
    /// shutdown is signalled.
    pub async fn run_background(
        &self,
        period: Duration,
        kind: ResolverKind,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("background scanner started (interval: {:?})", period);

        let found = self.scan_sources(kind).await;
        info!("initial background scan complete: {} working resolvers", found);

        let mut ticker = interval(period);
        ticker.tick().await; // first tick fires immediately; already scanned
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let found = self.scan_sources(kind).await;
                    info!("background scan complete: {} working resolvers", found);
                }
                _ = shutdown.changed() => {
                    info!("background scanner stopped");
                    return;
                }
            }
        }
    }
}
