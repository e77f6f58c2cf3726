//! dnstt-keeper - resilient supervisor for a DNS-tunnel client
//!
//! Keeps a dnstt tunnel usable behind networks that only pass DNS traffic:
//! - discovers recursive resolvers that carry the tunnel's encoded queries
//! - launches and supervises the external dnstt-client process
//! - continuously validates the local SOCKS5 endpoint the tunnel exposes
//! - rotates to another resolver whenever the current path degrades,
//!   rescanning when the pool runs dry
//!
//! # Architecture
//!
//! ```text
//!                  +--------------+
//!                  |  App (loop)  |
//!                  +------+-------+
//!                         |
//!        +----------------+----------------+
//!        |                |                |
//! +------v------+  +------v-------+  +-----v------+
//! |  resolver/  |  |   tunnel/    |  |  health/   |
//! |   (pool)    |  | (supervisor) |  | (monitor)  |
//! +------^------+  +--------------+  +-----+------+
//!        |                                 |
//! +------+------+                    local SOCKS5
//! |  scanner/   |
//! | (discovery) |
//! +-------------+
//! ```
//!
//! The scanner populates the pool; the app binds the tunnel to the pool's
//! current resolver; the monitor watches the proxy and the app reacts to
//! unhealthy/disconnect edges by blocking the resolver and rotating.

pub mod api;
pub mod cloudflare;
pub mod common;
pub mod config;
pub mod health;
pub mod resolver;
pub mod scanner;
pub mod tunnel;

pub use common::error::{Error, Result};
pub use config::Config;

use health::Monitor;
use resolver::{Pool, ResolverKind};
use scanner::Scanner;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tunnel::Supervisor;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Top-level application: wires the pool, scanner, supervisor and monitor
/// together and runs the event loop.
pub struct App {
    config: Config,
    pool: Arc<Pool>,
    scanner: Arc<Scanner>,
    supervisor: Arc<Supervisor>,
    monitor: Arc<Monitor>,
    cloudflare: Option<Arc<cloudflare::Client>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    unhealthy_rx: mpsc::Receiver<()>,
    healthy_rx: mpsc::Receiver<()>,
    disconnect_rx: mpsc::Receiver<()>,
}

impl App {
    /// Create an application from configuration.
    pub fn new(config: Config) -> Result<Self> {
        let pool = Arc::new(Pool::new());
        let scanner = Arc::new(Scanner::new(config.scanner.clone(), pool.clone()));

        let (disconnect_tx, disconnect_rx) = mpsc::channel(1);
        let supervisor = Supervisor::new(config.tunnel.clone(), disconnect_tx)?;

        let (unhealthy_tx, unhealthy_rx) = mpsc::channel(1);
        let (healthy_tx, healthy_rx) = mpsc::channel(1);
        let monitor = Monitor::new(
            config.health.clone(),
            supervisor.clone(),
            pool.clone(),
            unhealthy_tx,
            healthy_tx,
        );

        let cloudflare = if config.cloudflare.enabled {
            Some(Arc::new(cloudflare::Client::new(config.cloudflare.clone())?))
        } else {
            None
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(App {
            config,
            pool,
            scanner,
            supervisor,
            monitor,
            cloudflare,
            shutdown_tx,
            shutdown_rx,
            unhealthy_rx,
            healthy_rx,
            disconnect_rx,
        })
    }

    /// Run until a termination signal arrives. Errors only on bootstrap
    /// failures; everything after the first successful connect is handled
    /// by rotation and rediscovery.
    pub async fn run(self) -> Result<()> {
        let App {
            config,
            pool,
            scanner,
            supervisor,
            monitor,
            cloudflare,
            shutdown_tx,
            shutdown_rx,
            mut unhealthy_rx,
            mut healthy_rx,
            mut disconnect_rx,
        } = self;

        info!("domain: {}", config.tunnel.domain);
        info!("local address: {}", config.tunnel.local_addr);
        let kind = config.tunnel.resolver_type;
        let mut tasks = Vec::new();

        if config.api.enabled {
            let state = api::AppState {
                pool: pool.clone(),
                monitor: monitor.clone(),
            };
            let port = config.api.port;
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = api::start_server(state, port, rx).await {
                    error!("API server stopped: {}", e);
                }
            }));
        }

        // Pre-known resolvers from the TXT record, when configured
        if let Some(ref cf) = cloudflare {
            if cf.is_enabled() {
                match cf.fetch_resolvers().await {
                    Ok(resolvers) => {
                        pool.add_multiple(&resolvers, kind);
                        info!("loaded {} resolvers from TXT record", resolvers.len());
                    }
                    Err(e) => warn!("TXT record fetch failed: {}", e),
                }
            }
        }

        // Initial discovery when the pool is thin
        if config.scanner.enabled && pool.count() < config.scanner.min_resolvers {
            info!("running initial resolver scan");
            let found = scanner.scan_sources(kind).await;
            info!("initial scan found {} working resolvers", found);
        }

        if pool.count() == 0 {
            return Err(Error::internal(
                "no resolvers available, cannot start tunnel",
            ));
        }

        connect_first(&pool, &supervisor).await?;

        {
            let monitor = monitor.clone();
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move { monitor.run(rx).await }));
        }

        if config.scanner.enabled {
            if let Some(period) = config.scanner.background_interval() {
                let scanner = scanner.clone();
                let rx = shutdown_rx.clone();
                tasks.push(tokio::spawn(async move {
                    scanner.run_background(period, kind, rx).await
                }));
            }
        }

        if let Some(ref cf) = cloudflare {
            if cf.is_enabled() {
                let cf = cf.clone();
                let pool = pool.clone();
                let rx = shutdown_rx.clone();
                tasks.push(tokio::spawn(async move {
                    cf.run_refresh(pool, kind, rx).await
                }));
            }
        }

        // Dedicated serial reconnect worker: the one-slot request channel
        // coalesces triggers that arrive while a reconnect is in flight,
        // and the event loop below stays responsive to shutdown.
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        {
            let worker = Reconnector {
                pool: pool.clone(),
                scanner: scanner.clone(),
                supervisor: supervisor.clone(),
                monitor: monitor.clone(),
                kind,
                scanner_enabled: config.scanner.enabled,
                shutdown: shutdown_rx.clone(),
            };
            tasks.push(tokio::spawn(async move { worker.run(reconnect_rx).await }));
        }

        info!("dnstt-keeper is up");
        let signal = shutdown_signal();
        tokio::pin!(signal);
        loop {
            tokio::select! {
                result = &mut signal => {
                    result?;
                    info!("termination signal received, shutting down");
                    break;
                }
                Some(_) = unhealthy_rx.recv() => {
                    warn!("health monitor reports unhealthy connection");
                    let _ = reconnect_tx.try_send(());
                }
                Some(_) = disconnect_rx.recv() => {
                    warn!("tunnel process disconnected");
                    let _ = reconnect_tx.try_send(());
                }
                Some(_) = healthy_rx.recv() => {
                    info!("health monitor reports recovery");
                }
            }
        }

        let _ = shutdown_tx.send(true);
        if let Err(e) = supervisor.disconnect().await {
            warn!("error stopping tunnel: {}", e);
        }
        for task in tasks {
            let _ = task.await;
        }
        info!("shutdown complete");
        Ok(())
    }
}

/// Connect to the pool's current resolver, blocking and advancing past
/// failures until a session is up or the pool is exhausted.
async fn connect_first(pool: &Arc<Pool>, supervisor: &Arc<Supervisor>) -> Result<()> {
    loop {
        let Some(candidate) = pool.current() else {
            return Err(Error::internal(
                "every resolver failed to carry the tunnel",
            ));
        };
        match supervisor.connect(&candidate).await {
            Ok(()) => {
                info!("tunnel established via {}", candidate.address);
                return Ok(());
            }
            Err(e) => {
                warn!("connect via {} failed: {}", candidate.address, e);
                pool.mark_blocked(&candidate.address);
            }
        }
    }
}

/// Serial reconnect worker. Requests arrive through a one-slot channel;
/// anything that fires while a reconnect is running is absorbed into it.
struct Reconnector {
    pool: Arc<Pool>,
    scanner: Arc<Scanner>,
    supervisor: Arc<Supervisor>,
    monitor: Arc<Monitor>,
    kind: ResolverKind,
    scanner_enabled: bool,
    shutdown: watch::Receiver<bool>,
}

impl Reconnector {
    async fn run(mut self, mut requests: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return,
                request = requests.recv() => match request {
                    Some(_) => self.reconnect().await,
                    None => return,
                },
            }
        }
    }

    /// One rotation: block the failed resolver, advance, rescan on
    /// exhaustion, and keep trying until a session is up or nothing
    /// viable remains. Bounded by pool exhaustion, not a retry count.
    async fn reconnect(&self) {
        if let Some(current) = self.supervisor.current_resolver() {
            self.pool.mark_blocked(&current.address);
            info!("marked resolver {} as blocked", current.address);
        }

        loop {
            if *self.shutdown.borrow() {
                return;
            }
            let next = match self.pool.advance() {
                Some(resolver) => resolver,
                None => {
                    warn!("resolver pool exhausted, triggering new scan");
                    if self.scanner_enabled {
                        let found = self.scanner.scan_sources(self.kind).await;
                        info!("rescue scan found {} working resolvers", found);
                    }
                    match self.pool.current() {
                        Some(resolver) => resolver,
                        None => {
                            warn!("no resolvers available for reconnection, idling");
                            return;
                        }
                    }
                }
            };

            info!("attempting reconnection via {}", next.address);
            match self.supervisor.connect(&next).await {
                Ok(()) => {
                    self.monitor.reset();
                    info!("reconnected via {}", next.address);
                    return;
                }
                Err(e) => {
                    warn!("reconnection via {} failed: {}", next.address, e);
                    self.pool.mark_blocked(&next.address);
                }
            }
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
