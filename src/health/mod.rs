//! Tunnel health monitoring
//!
//! Detects degradation the supervisor cannot see: the child is alive but
//! the tunnel path is unusable. Every interval one lightweight probe runs
//! against the local SOCKS5 endpoint; a signed counter with two thresholds
//! keeps the healthy/unhealthy edge from flapping.
//!
//! The probe stops after the SOCKS5 greeting on purpose. A full CONNECT
//! would traverse the slow DNS path and flag a healthy but busy tunnel.

use crate::config::HealthConfig;
use crate::resolver::Pool;
use crate::tunnel::Supervisor;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

/// Health of the tunnel path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

struct MonitorState {
    status: HealthStatus,
    /// Signed hysteresis counter: failures push it up, successes while
    /// recovering pull it down.
    counter: i32,
}

/// Periodic prober of the local SOCKS5 endpoint.
pub struct Monitor {
    config: HealthConfig,
    supervisor: Arc<Supervisor>,
    pool: Arc<Pool>,
    state: Mutex<MonitorState>,
    unhealthy_tx: mpsc::Sender<()>,
    healthy_tx: mpsc::Sender<()>,
}

impl Monitor {
    pub fn new(
        config: HealthConfig,
        supervisor: Arc<Supervisor>,
        pool: Arc<Pool>,
        unhealthy_tx: mpsc::Sender<()>,
        healthy_tx: mpsc::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Monitor {
            config,
            supervisor,
            pool,
            state: Mutex::new(MonitorState {
                status: HealthStatus::Healthy,
                counter: 0,
            }),
            unhealthy_tx,
            healthy_tx,
        })
    }

    /// Run checks every `check_interval` until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "health monitor started (interval: {:?})",
            self.config.check_interval()
        );
        let mut ticker = interval(self.config.check_interval());
        ticker.tick().await; // the immediate first tick
        loop {
            tokio::select! {
                _ = ticker.tick() => self.check().await,
                _ = shutdown.changed() => {
                    info!("health monitor stopped");
                    return;
                }
            }
        }
    }

    /// One health check: supervisor liveness, then the SOCKS5 greeting.
    /// Feeds the pool's per-resolver accounting either way.
    pub async fn check(&self) {
        if !self.supervisor.is_connected().await {
            self.record_failure("tunnel process not running");
            return;
        }
        let Some(resolver) = self.supervisor.current_resolver() else {
            self.record_failure("no resolver bound");
            return;
        };
        let Some(session) = self.supervisor.session() else {
            self.record_failure("no active session");
            return;
        };

        let start = Instant::now();
        match self.probe_socks(&session.local_addr).await {
            Ok(()) => {
                self.record_success(start.elapsed());
                self.pool.mark_healthy(&resolver.address, start.elapsed());
            }
            Err(reason) => {
                self.record_failure(&reason);
                self.pool.mark_failed(&resolver.address);
            }
        }
    }

    /// SOCKS5 greeting probe: send `05 01 00`, require a version-5 reply.
    /// Deliberately no CONNECT.
    async fn probe_socks(&self, addr: &str) -> std::result::Result<(), String> {
        let deadline = self.config.probe_timeout();
        let mut stream = timeout(deadline, TcpStream::connect(addr))
            .await
            .map_err(|_| "proxy dial timed out".to_string())?
            .map_err(|e| format!("proxy unreachable: {}", e))?;

        timeout(deadline, stream.write_all(&[0x05, 0x01, 0x00]))
            .await
            .map_err(|_| "greeting write timed out".to_string())?
            .map_err(|e| format!("greeting write failed: {}", e))?;

        let mut reply = [0u8; 2];
        timeout(deadline, stream.read_exact(&mut reply))
            .await
            .map_err(|_| "greeting read timed out".to_string())?
            .map_err(|e| format!("greeting read failed: {}", e))?;

        if reply[0] != 0x05 {
            return Err(format!("invalid SOCKS5 version: {}", reply[0]));
        }
        debug!("SOCKS5 greeting ok");
        Ok(())
    }

    fn record_failure(&self, reason: &str) {
        let mut state = self.state.lock();
        state.counter += 1;
        warn!(
            "health check failed ({}/{}): {}",
            state.counter, self.config.fail_threshold, reason
        );

        if state.counter >= self.config.fail_threshold {
            if state.status != HealthStatus::Unhealthy {
                state.status = HealthStatus::Unhealthy;
                warn!("tunnel marked unhealthy, requesting reconnect");
                let _ = self.unhealthy_tx.try_send(());
            }
        } else if state.status == HealthStatus::Healthy {
            state.status = HealthStatus::Degraded;
        }
    }

    fn record_success(&self, latency: Duration) {
        let mut state = self.state.lock();
        match state.status {
            HealthStatus::Healthy => state.counter = 0,
            HealthStatus::Degraded | HealthStatus::Unhealthy => {
                state.counter -= 1;
                if state.counter <= -self.config.recovery_threshold {
                    state.status = HealthStatus::Healthy;
                    state.counter = 0;
                    info!("tunnel recovered (latency: {:?})", latency);
                    let _ = self.healthy_tx.try_send(());
                }
            }
        }
    }

    /// Force the monitor back to healthy. Called after a successful
    /// reconnect so stale failures do not immediately re-trip.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.status = HealthStatus::Healthy;
        state.counter = 0;
        debug!("health monitor reset");
    }

    pub fn status(&self) -> HealthStatus {
        self.state.lock().status
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;

    fn test_monitor(
        fail_threshold: i32,
        recovery_threshold: i32,
    ) -> (Arc<Monitor>, mpsc::Receiver<()>, mpsc::Receiver<()>) {
        let config = HealthConfig {
            fail_threshold,
            recovery_threshold,
            ..Default::default()
        };
        let tunnel_config = TunnelConfig {
            domain: "t.example.com".to_string(),
            pubkey: "deadbeef".to_string(),
            ..Default::default()
        };
        let (disconnect_tx, _) = mpsc::channel(1);
        let supervisor = Supervisor::new(tunnel_config, disconnect_tx).unwrap();
        let pool = Arc::new(Pool::new());
        let (unhealthy_tx, unhealthy_rx) = mpsc::channel(1);
        let (healthy_tx, healthy_rx) = mpsc::channel(1);
        let monitor = Monitor::new(config, supervisor, pool, unhealthy_tx, healthy_tx);
        (monitor, unhealthy_rx, healthy_rx)
    }

    #[test]
    fn test_starts_healthy() {
        let (monitor, _u, _h) = test_monitor(2, 1);
        assert!(monitor.is_healthy());
        assert_eq!(monitor.status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_degraded_below_threshold() {
        let (monitor, mut unhealthy, _h) = test_monitor(3, 1);
        monitor.record_failure("test");
        assert_eq!(monitor.status(), HealthStatus::Degraded);
        monitor.record_failure("test");
        assert_eq!(monitor.status(), HealthStatus::Degraded);
        assert!(unhealthy.try_recv().is_err());
    }

    #[test]
    fn test_exactly_one_unhealthy_emission() {
        let (monitor, mut unhealthy, _h) = test_monitor(2, 1);
        monitor.record_failure("test");
        monitor.record_failure("test");
        assert_eq!(monitor.status(), HealthStatus::Unhealthy);
        assert!(unhealthy.try_recv().is_ok());
        // further failures with the channel drained emit nothing new
        monitor.record_failure("test");
        assert!(unhealthy.try_recv().is_err());
    }

    #[test]
    fn test_emission_idempotent_under_undrained_channel() {
        let (monitor, mut unhealthy, _h) = test_monitor(2, 1);
        for _ in 0..5 {
            monitor.record_failure("test");
        }
        assert!(unhealthy.try_recv().is_ok());
        assert!(unhealthy.try_recv().is_err());
    }

    #[test]
    fn test_recovery_round_trip() {
        let (monitor, _u, mut healthy) = test_monitor(2, 2);
        monitor.record_failure("test");
        monitor.record_failure("test");
        assert_eq!(monitor.status(), HealthStatus::Unhealthy);

        // counter sits at 2; needs fail_threshold + recovery_threshold
        // successes to cross -recovery_threshold
        for _ in 0..3 {
            monitor.record_success(Duration::from_millis(5));
            assert_eq!(monitor.status(), HealthStatus::Unhealthy);
        }
        monitor.record_success(Duration::from_millis(5));
        assert_eq!(monitor.status(), HealthStatus::Healthy);
        assert!(healthy.try_recv().is_ok());

        // counter cleared: a single new failure only degrades
        monitor.record_failure("test");
        assert_eq!(monitor.status(), HealthStatus::Degraded);
    }

    #[test]
    fn test_success_while_healthy_clears_counter() {
        let (monitor, _u, _h) = test_monitor(3, 1);
        monitor.record_failure("test");
        monitor.record_success(Duration::from_millis(5));
        // Degraded requires a net-positive counter to recover from; one
        // success at counter 1 drops it to 0 without crossing the
        // recovery threshold
        monitor.record_success(Duration::from_millis(5));
        assert_eq!(monitor.status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_reset_forces_healthy() {
        let (monitor, _u, _h) = test_monitor(2, 1);
        monitor.record_failure("test");
        monitor.record_failure("test");
        assert_eq!(monitor.status(), HealthStatus::Unhealthy);
        monitor.reset();
        assert!(monitor.is_healthy());
        // and the counter is genuinely cleared
        monitor.record_failure("test");
        assert_eq!(monitor.status(), HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_check_fails_without_tunnel() {
        let (monitor, mut unhealthy, _h) = test_monitor(1, 1);
        monitor.check().await;
        assert_eq!(monitor.status(), HealthStatus::Unhealthy);
        assert!(unhealthy.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_probe_socks_against_local_server() {
        let (monitor, _u, _h) = test_monitor(2, 1);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            stream.write_all(&[0x05, 0x00]).await.unwrap();
        });
        assert!(monitor.probe_socks(&addr).await.is_ok());
    }

    #[tokio::test]
    async fn test_probe_socks_rejects_wrong_version() {
        let (monitor, _u, _h) = test_monitor(2, 1);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x04, 0x00]).await.unwrap();
        });
        let err = monitor.probe_socks(&addr).await.unwrap_err();
        assert!(err.contains("invalid SOCKS5 version"));
    }

    #[tokio::test]
    async fn test_probe_socks_unreachable() {
        let (monitor, _u, _h) = test_monitor(2, 1);
        assert!(monitor.probe_socks("127.0.0.1:1").await.is_err());
    }
}
