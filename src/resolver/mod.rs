//! Resolver records and the rotation pool
//!
//! A [`Resolver`] is a recursive DNS endpoint the tunnel client can direct
//! its encoded queries through. The [`Pool`] keeps them in insertion order
//! behind a single coarse lock and hands them out round-robin, skipping
//! entries the orchestrator has blocked.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Transport a resolver speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverKind {
    Udp,
    Dot,
    Doh,
}

impl fmt::Display for ResolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolverKind::Udp => write!(f, "udp"),
            ResolverKind::Dot => write!(f, "dot"),
            ResolverKind::Doh => write!(f, "doh"),
        }
    }
}

/// Health status of a resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverStatus {
    /// Never probed.
    Unknown,
    /// Last probe succeeded.
    Healthy,
    /// Three or more consecutive probe failures.
    Degraded,
    /// Taken out of rotation by the orchestrator.
    Blocked,
}

impl fmt::Display for ResolverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolverStatus::Unknown => write!(f, "unknown"),
            ResolverStatus::Healthy => write!(f, "healthy"),
            ResolverStatus::Degraded => write!(f, "degraded"),
            ResolverStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// Consecutive probe failures before a resolver is considered degraded.
/// Independent of the health monitor's fail threshold, which drives
/// reconnects rather than pool status.
const DEGRADED_FAIL_COUNT: u32 = 3;

/// A recursive DNS endpoint with its tracked health.
///
/// Identity is `address` (host:port, or a URL for DoH); everything else is
/// mutable health state owned by the pool.
#[derive(Debug, Clone)]
pub struct Resolver {
    pub address: String,
    pub kind: ResolverKind,
    pub status: ResolverStatus,
    /// Consecutive probe failures, cleared on success.
    pub fail_count: u32,
    /// Round-trip time of the last successful probe.
    pub latency: Option<Duration>,
    pub last_check: Option<Instant>,
    pub blocked_at: Option<Instant>,
}

impl Resolver {
    pub fn new(address: impl Into<String>, kind: ResolverKind) -> Self {
        Resolver {
            address: address.into(),
            kind,
            status: ResolverStatus::Unknown,
            fail_count: 0,
            latency: None,
            last_check: None,
            blocked_at: None,
        }
    }
}

/// Ordered set of resolvers plus a rotation cursor.
///
/// All mutation happens under one reader/writer lock; no `&mut Resolver`
/// ever escapes it. Readers that need to iterate take a [`Pool::snapshot`].
pub struct Pool {
    inner: RwLock<PoolInner>,
}

struct PoolInner {
    resolvers: Vec<Resolver>,
    cursor: usize,
}

impl Pool {
    pub fn new() -> Self {
        Pool {
            inner: RwLock::new(PoolInner {
                resolvers: Vec::new(),
                cursor: 0,
            }),
        }
    }

    /// Add a resolver with status `unknown`. Idempotent on address.
    pub fn add(&self, address: &str, kind: ResolverKind) {
        let mut inner = self.inner.write();
        if inner.resolvers.iter().any(|r| r.address == address) {
            return;
        }
        inner.resolvers.push(Resolver::new(address, kind));
    }

    /// Add several addresses of the same kind.
    pub fn add_multiple(&self, addresses: &[String], kind: ResolverKind) {
        for addr in addresses {
            self.add(addr, kind);
        }
    }

    /// The resolver at the cursor, or the first non-blocked entry when the
    /// cursor points at a blocked one. `None` when the pool is exhausted.
    pub fn current(&self) -> Option<Resolver> {
        let inner = self.inner.read();
        if inner.resolvers.is_empty() {
            return None;
        }
        let at_cursor = &inner.resolvers[inner.cursor];
        if at_cursor.status != ResolverStatus::Blocked {
            return Some(at_cursor.clone());
        }
        inner
            .resolvers
            .iter()
            .find(|r| r.status != ResolverStatus::Blocked)
            .cloned()
    }

    /// Move the cursor to the next non-blocked resolver after the current
    /// one, wrapping around. Returns `None` when every entry is blocked.
    pub fn advance(&self) -> Option<Resolver> {
        let mut inner = self.inner.write();
        let len = inner.resolvers.len();
        if len == 0 {
            return None;
        }
        let start = inner.cursor;
        let mut idx = start;
        loop {
            idx = (idx + 1) % len;
            if inner.resolvers[idx].status != ResolverStatus::Blocked {
                inner.cursor = idx;
                return Some(inner.resolvers[idx].clone());
            }
            if idx == start {
                return None;
            }
        }
    }

    /// Take a resolver out of rotation. Orchestrator-only decision.
    pub fn mark_blocked(&self, address: &str) {
        let mut inner = self.inner.write();
        if let Some(r) = inner.resolvers.iter_mut().find(|r| r.address == address) {
            r.status = ResolverStatus::Blocked;
            r.blocked_at = Some(Instant::now());
        }
    }

    /// Record a successful probe.
    pub fn mark_healthy(&self, address: &str, latency: Duration) {
        let mut inner = self.inner.write();
        if let Some(r) = inner.resolvers.iter_mut().find(|r| r.address == address) {
            r.status = ResolverStatus::Healthy;
            r.fail_count = 0;
            r.latency = Some(latency);
            r.last_check = Some(Instant::now());
        }
    }

    /// Record a failed probe. Degrades the entry after
    /// [`DEGRADED_FAIL_COUNT`] consecutive failures but never blocks it.
    pub fn mark_failed(&self, address: &str) {
        let mut inner = self.inner.write();
        if let Some(r) = inner.resolvers.iter_mut().find(|r| r.address == address) {
            r.fail_count += 1;
            r.last_check = Some(Instant::now());
            if r.fail_count >= DEGRADED_FAIL_COUNT && r.status != ResolverStatus::Blocked {
                r.status = ResolverStatus::Degraded;
            }
        }
    }

    /// True when every resolver is blocked (or the pool is empty of
    /// non-blocked entries while holding at least one resolver).
    pub fn exhausted(&self) -> bool {
        let inner = self.inner.read();
        !inner.resolvers.is_empty()
            && inner
                .resolvers
                .iter()
                .all(|r| r.status == ResolverStatus::Blocked)
    }

    pub fn count(&self) -> usize {
        self.inner.read().resolvers.len()
    }

    pub fn healthy_count(&self) -> usize {
        self.inner
            .read()
            .resolvers
            .iter()
            .filter(|r| r.status == ResolverStatus::Healthy)
            .count()
    }

    /// Copy of all resolvers for read-only consumers (API, logging).
    pub fn snapshot(&self) -> Vec<Resolver> {
        self.inner.read().resolvers.clone()
    }

    /// Drop every resolver and reset the cursor.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.resolvers.clear();
        inner.cursor = 0;
    }
}

impl Default for Pool {
    fn default() -> Self {
        Pool::new()
    }
}
