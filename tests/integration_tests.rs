//! Integration tests for dnstt-keeper
//!
//! Cross-component scenarios: discovery feeding the pool, rotation under
//! failures, exhaustion accounting through the REST API, and the health
//! monitor driving reconnect edges against a fake tunnel process.

use dnstt_keeper::api::{self, AppState};
use dnstt_keeper::config::{HealthConfig, ScannerConfig, TunnelConfig};
use dnstt_keeper::health::{HealthStatus, Monitor};
use dnstt_keeper::resolver::{Pool, ResolverKind, ResolverStatus};
use dnstt_keeper::scanner::{feed, Scanner};
use dnstt_keeper::tunnel::Supervisor;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// A deadline no test should ever hit.
fn far_deadline() -> Instant {
    Instant::now() + Duration::from_secs(30)
}

/// Loopback DNS responder; optionally never answers.
async fn spawn_dns_responder(answer: bool) -> String {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        loop {
            let Ok((n, peer)) = server.recv_from(&mut buf).await else {
                return;
            };
            if answer {
                buf[2] |= 0x80;
                let _ = server.send_to(&buf[..n], peer).await;
            }
        }
    });
    addr
}

fn test_scanner(pool: Arc<Pool>) -> Scanner {
    Scanner::new(
        ScannerConfig {
            concurrent_scans: 4,
            timeout: 1,
            ..Default::default()
        },
        pool,
    )
}

fn test_state(pool: Arc<Pool>) -> AppState {
    let tunnel_config = TunnelConfig {
        domain: "t.example.com".to_string(),
        pubkey: "deadbeef".to_string(),
        ..Default::default()
    };
    let (disconnect_tx, _) = mpsc::channel(1);
    let supervisor = Supervisor::new(tunnel_config, disconnect_tx).unwrap();
    let (unhealthy_tx, _) = mpsc::channel(1);
    let (healthy_tx, _) = mpsc::channel(1);
    let monitor = Monitor::new(
        HealthConfig::default(),
        supervisor,
        pool.clone(),
        unhealthy_tx,
        healthy_tx,
    );
    AppState { pool, monitor }
}

async fn get_json(state: AppState, uri: &str) -> serde_json::Value {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    let router = api::create_router(state);
    let resp = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Cold start: only reachable resolvers end up in the pool, all healthy.
#[tokio::test]
async fn cold_start_scan_registers_only_reachable_resolvers() {
    let good_a = spawn_dns_responder(true).await;
    let good_b = spawn_dns_responder(true).await;
    let dead = spawn_dns_responder(false).await;

    let pool = Arc::new(Pool::new());
    let found = test_scanner(pool.clone())
        .scan(
            vec![good_a.clone(), good_b, dead.clone()],
            ResolverKind::Udp,
            far_deadline(),
        )
        .await;

    assert_eq!(found, 2);
    assert_eq!(pool.count(), 2);
    assert_eq!(pool.healthy_count(), 2);
    assert!(!pool.snapshot().iter().any(|r| r.address == dead));

    // pool is visible through the API the way an operator would see it
    let stats = get_json(test_state(pool), "/stats").await;
    assert_eq!(stats["healthy_count"], 2);
    assert_eq!(stats["pool_exhausted"], false);
}

/// Runtime failure: blocking the active resolver rotates to the next one
/// and the API shows both statuses.
#[tokio::test]
async fn blocking_current_resolver_rotates_to_next() {
    let pool = Arc::new(Pool::new());
    pool.add("8.8.8.8:53", ResolverKind::Udp);
    pool.add("1.1.1.1:53", ResolverKind::Udp);
    pool.mark_healthy("8.8.8.8:53", Duration::from_millis(30));
    pool.mark_healthy("1.1.1.1:53", Duration::from_millis(40));

    assert_eq!(pool.current().unwrap().address, "8.8.8.8:53");
    pool.mark_blocked("8.8.8.8:53");
    let next = pool.advance().unwrap();
    assert_eq!(next.address, "1.1.1.1:53");

    let resolvers = get_json(test_state(pool), "/resolvers").await;
    let statuses: Vec<(&str, &str)> = resolvers["resolvers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| {
            (
                r["address"].as_str().unwrap(),
                r["status"].as_str().unwrap(),
            )
        })
        .collect();
    assert_eq!(
        statuses,
        vec![("8.8.8.8:53", "blocked"), ("1.1.1.1:53", "healthy")]
    );
}

/// Exhaustion: every resolver blocked, a rescan that finds nothing, and
/// the stats endpoint reporting the empty-handed state.
#[tokio::test]
async fn exhausted_pool_rescan_finds_nothing() {
    let pool = Arc::new(Pool::new());
    pool.add("a:53", ResolverKind::Udp);
    pool.add("b:53", ResolverKind::Udp);
    pool.mark_blocked("a:53");
    pool.mark_blocked("b:53");

    assert!(pool.exhausted());
    assert!(pool.advance().is_none());
    assert!(pool.current().is_none());

    // rescan over an empty candidate set yields zero; nothing to connect to
    let found = test_scanner(pool.clone())
        .scan(Vec::new(), ResolverKind::Udp, far_deadline())
        .await;
    assert_eq!(found, 0);

    let stats = get_json(test_state(pool), "/stats").await;
    assert_eq!(stats["pool_exhausted"], true);
    assert_eq!(stats["blocked_count"], 2);
}

/// The country feed drops comments, blanks and IPv6, and takes the first
/// host of each block.
#[test]
fn country_feed_extracts_first_hosts() {
    let body = "# comment\n2.144.0.0/14\n2001:db8::/32\n\n5.0.0.0/8\n";
    assert_eq!(
        feed::parse_zone_text(body, 1000),
        vec!["2.144.0.1:53".to_string(), "5.0.0.1:53".to_string()]
    );
}

/// A full config file with every section parses and validates.
#[test]
fn full_config_round_trip() {
    let yaml = r#"
tunnel:
  dnstt_path: /usr/local/bin/dnstt-client
  domain: t.example.com
  pubkey: 4b1d...cafe
  local_addr: "127.0.0.1:7000"
  resolver_type: udp
  idle_timeout: 120
  require_port_open: true
scanner:
  enabled: true
  concurrent_scans: 10
  timeout: 5
  min_resolvers: 3
  country_code: ir
  max_candidates: 1000
  background_interval: 900
health:
  check_interval: 5
  fail_threshold: 2
  recovery_threshold: 1
  timeout: 5
cloudflare:
  enabled: false
api:
  enabled: true
  port: 8053
log:
  level: info
  format: text
"#;
    let config = dnstt_keeper::Config::from_str(yaml).unwrap();
    assert_eq!(config.tunnel.resolver_type, ResolverKind::Udp);
    assert_eq!(config.scanner.country_code.as_deref(), Some("ir"));
    assert_eq!(config.api.port, 8053);
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn fake_tunnel(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("fake-dnstt");
        std::fs::write(&path, "#!/bin/sh\nsleep 60\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Serve SOCKS5 greetings until the returned sender is dropped.
    async fn spawn_socks_greeter() -> (String, tokio::sync::oneshot::Sender<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((mut stream, _)) = accepted else { return };
                        let mut greeting = [0u8; 3];
                        if stream.read_exact(&mut greeting).await.is_ok() {
                            let _ = stream.write_all(&[0x05, 0x00]).await;
                        }
                    }
                    _ = &mut stop_rx => return,
                }
            }
        });
        (addr, stop_tx)
    }

    /// The monitor sees a live tunnel as healthy, trips exactly one
    /// unhealthy edge when the SOCKS endpoint dies, and reset() clears
    /// the slate after a reconnect.
    #[tokio::test]
    async fn monitor_drives_unhealthy_edge_against_fake_tunnel() {
        let dir = tempfile::tempdir().unwrap();
        let (socks_addr, socks_stop) = spawn_socks_greeter().await;

        let tunnel_config = TunnelConfig {
            dnstt_path: fake_tunnel(dir.path()),
            local_addr: socks_addr,
            domain: "t.example.com".to_string(),
            pubkey: "deadbeef".to_string(),
            ..Default::default()
        };
        let (disconnect_tx, _disconnect_rx) = mpsc::channel(1);
        let supervisor = Supervisor::new(tunnel_config, disconnect_tx).unwrap();

        let pool = Arc::new(Pool::new());
        pool.add("8.8.8.8:53", ResolverKind::Udp);
        let resolver = pool.current().unwrap();
        supervisor.connect(&resolver).await.unwrap();

        let (unhealthy_tx, mut unhealthy_rx) = mpsc::channel(1);
        let (healthy_tx, _healthy_rx) = mpsc::channel(1);
        let monitor = Monitor::new(
            HealthConfig {
                fail_threshold: 2,
                recovery_threshold: 1,
                timeout: 1,
                ..Default::default()
            },
            supervisor.clone(),
            pool.clone(),
            unhealthy_tx,
            healthy_tx,
        );

        // live endpoint: healthy checks, resolver accounting updated
        monitor.check().await;
        assert_eq!(monitor.status(), HealthStatus::Healthy);
        assert_eq!(pool.snapshot()[0].status, ResolverStatus::Healthy);

        // SOCKS endpoint goes away while the child stays alive
        drop(socks_stop);
        tokio::time::sleep(Duration::from_millis(50)).await;

        monitor.check().await;
        assert_eq!(monitor.status(), HealthStatus::Degraded);
        assert!(unhealthy_rx.try_recv().is_err());

        monitor.check().await;
        assert_eq!(monitor.status(), HealthStatus::Unhealthy);
        assert!(unhealthy_rx.try_recv().is_ok());

        // a third failure does not emit again
        monitor.check().await;
        assert!(unhealthy_rx.try_recv().is_err());
        assert!(pool.snapshot()[0].fail_count >= 3);

        // orchestrator resets after reconnecting
        monitor.reset();
        assert!(monitor.is_healthy());

        supervisor.disconnect().await.unwrap();
        assert!(!supervisor.is_connected().await);
    }
}
