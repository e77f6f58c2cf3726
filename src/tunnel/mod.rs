//! Tunnel process supervision
//!
//! Owns the lifecycle of exactly one dnstt-client child at a time: spawn
//! bound to a resolver, wait for the local SOCKS listener to accept,
//! graceful termination with a hard-kill fallback, and an exit watcher
//! that notifies the orchestrator when the child dies underneath us.

#[cfg(unix)]
mod process_unix;
#[cfg(unix)]
use process_unix as process;

#[cfg(windows)]
mod process_windows;
#[cfg(windows)]
use process_windows as process;

use crate::config::TunnelConfig;
use crate::resolver::Resolver;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Local-port readiness poll: 20 attempts, 500 ms apart.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const READY_POLL_ATTEMPTS: u32 = 20;
const READY_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Grace window between the stop signal and a hard kill.
const GRACEFUL_STOP_WINDOW: Duration = Duration::from_secs(5);

/// Exit-watcher poll period.
const EXIT_WATCH_INTERVAL: Duration = Duration::from_millis(500);

/// State of the active tunnel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Ready,
    Running,
    Terminating,
    Exited,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Starting => write!(f, "starting"),
            SessionState::Ready => write!(f, "ready"),
            SessionState::Running => write!(f, "running"),
            SessionState::Terminating => write!(f, "terminating"),
            SessionState::Exited => write!(f, "exited"),
        }
    }
}

/// Read-only view of the active session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub resolver: Resolver,
    pub pid: u32,
    pub local_addr: String,
    pub started_at: Instant,
    pub state: SessionState,
}

/// Supervises the single external tunnel-client process.
pub struct Supervisor {
    config: TunnelConfig,
    pubkey: String,
    child: Mutex<Option<Child>>,
    session: RwLock<Option<SessionInfo>>,
    /// Bumped on every connect and deliberate stop; the exit watcher only
    /// reports deaths of its own generation, so supervisor-initiated stops
    /// never fire the disconnect event.
    generation: Arc<AtomicU64>,
    disconnect_tx: mpsc::Sender<()>,
}

impl Supervisor {
    /// Build a supervisor. Resolves the public key up front so a bad
    /// `pubkey_file` fails at startup rather than on first connect.
    pub fn new(config: TunnelConfig, disconnect_tx: mpsc::Sender<()>) -> Result<Arc<Self>> {
        let pubkey = config.resolved_pubkey()?;
        Ok(Arc::new(Supervisor {
            config,
            pubkey,
            child: Mutex::new(None),
            session: RwLock::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            disconnect_tx,
        }))
    }

    /// Command-line arguments for dnstt-client bound to `resolver`. The
    /// tunnel always dials the resolver over UDP; `resolver.kind` only
    /// describes the transport the probe validated.
    fn build_args(&self, resolver: &Resolver) -> Vec<String> {
        vec![
            "-udp".to_string(),
            with_default_port(&resolver.address, 53),
            "-pubkey".to_string(),
            self.pubkey.clone(),
            self.config.domain.clone(),
            self.config.local_addr.clone(),
        ]
    }

    /// Start a session bound to `resolver`. Any prior session is torn down
    /// first. Returns once the local listen port accepts connections, or
    /// errors if the child dies during the wait window.
    pub async fn connect(self: &Arc<Self>, resolver: &Resolver) -> Result<()> {
        self.disconnect().await?;

        let args = self.build_args(resolver);
        info!(
            "starting tunnel: {} {}",
            self.config.dnstt_path.display(),
            args.join(" ")
        );

        let mut cmd = Command::new(&self.config.dnstt_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        process::set_proc_attr(&mut cmd);

        let child = cmd
            .spawn()
            .map_err(|e| Error::spawn(format!("failed to start dnstt-client: {}", e)))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::spawn("dnstt-client exited before it was tracked"))?;
        info!("tunnel process started with pid {}", pid);

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut guard = self.child.lock().await;
            *guard = Some(child);
        }
        *self.session.write() = Some(SessionInfo {
            resolver: resolver.clone(),
            pid,
            local_addr: self.config.local_addr.clone(),
            started_at: Instant::now(),
            state: SessionState::Starting,
        });

        // Poll the local port until the listener is up. Child deaths in
        // this window surface as a connect error; the exit watcher only
        // starts once the session is established, so a startup failure
        // never also fires the disconnect event.
        let mut port_open = false;
        for attempt in 1..=READY_POLL_ATTEMPTS {
            sleep(READY_POLL_INTERVAL).await;

            if !self.child_running().await {
                self.clear_session().await;
                return Err(Error::tunnel("dnstt-client exited during startup"));
            }

            match timeout(
                READY_DIAL_TIMEOUT,
                TcpStream::connect(&self.config.local_addr),
            )
            .await
            {
                Ok(Ok(_)) => {
                    debug!(
                        "local port {} open after {} ms",
                        self.config.local_addr,
                        u64::from(attempt) * READY_POLL_INTERVAL.as_millis() as u64
                    );
                    port_open = true;
                    break;
                }
                _ => continue,
            }
        }

        if !port_open {
            if self.config.require_port_open {
                self.disconnect().await?;
                return Err(Error::tunnel(format!(
                    "local port {} never opened",
                    self.config.local_addr
                )));
            }
            warn!(
                "local port {} never opened but the process is running; \
                 leaving it to the health monitor",
                self.config.local_addr
            );
        } else {
            self.set_session_state(SessionState::Ready);
        }

        self.set_session_state(SessionState::Running);
        self.spawn_exit_watcher(generation);
        Ok(())
    }

    /// Graceful stop: termination signal, a grace window, then a hard
    /// kill. Idempotent; safe to call with no session active.
    pub async fn disconnect(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        // silence the exit watcher for the session being torn down
        self.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(mut child) = guard.take() {
            self.set_session_state(SessionState::Terminating);
            if let Some(pid) = child.id() {
                info!("stopping tunnel process {}", pid);
                process::request_stop(&mut child, pid);
                match timeout(GRACEFUL_STOP_WINDOW, child.wait()).await {
                    Ok(Ok(status)) => info!("tunnel process exited: {}", status),
                    Ok(Err(e)) => warn!("error waiting for tunnel process: {}", e),
                    Err(_) => {
                        warn!("tunnel process ignored stop signal, killing");
                        let _ = child.kill().await;
                    }
                }
            }
        }
        drop(guard);

        *self.session.write() = None;
        Ok(())
    }

    /// True iff a child exists and the OS confirms it is alive.
    pub async fn is_connected(&self) -> bool {
        let Some(pid) = self.session.read().as_ref().map(|s| s.pid) else {
            return false;
        };
        self.child_running().await && process::alive(pid)
    }

    /// The resolver the active session is bound to.
    pub fn current_resolver(&self) -> Option<Resolver> {
        self.session.read().as_ref().map(|s| s.resolver.clone())
    }

    /// Snapshot of the active session.
    pub fn session(&self) -> Option<SessionInfo> {
        self.session.read().clone()
    }

    /// Liveness via the child handle; reaps the exit status if the child
    /// has already died.
    async fn child_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(_)) | Err(_) => false,
            },
            None => false,
        }
    }

    async fn clear_session(&self) {
        let mut guard = self.child.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        *guard = None;
        drop(guard);
        *self.session.write() = None;
    }

    fn set_session_state(&self, state: SessionState) {
        if let Some(ref mut session) = *self.session.write() {
            session.state = state;
        }
    }

    /// Watch for the child of `generation` exiting on its own and fire the
    /// one-slot disconnect event. A newer generation means the supervisor
    /// replaced or stopped the session deliberately; stay silent then.
    fn spawn_exit_watcher(self: &Arc<Self>, generation: u64) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            loop {
                sleep(EXIT_WATCH_INTERVAL).await;
                if supervisor.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                let mut guard = supervisor.child.lock().await;
                if supervisor.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                let exited = match guard.as_mut() {
                    Some(child) => match child.try_wait() {
                        Ok(None) => false,
                        Ok(Some(status)) => {
                            warn!("tunnel process exited unexpectedly: {}", status);
                            true
                        }
                        Err(e) => {
                            warn!("tunnel process unreachable: {}", e);
                            true
                        }
                    },
                    None => return,
                };
                if exited {
                    *guard = None;
                    supervisor.generation.fetch_add(1, Ordering::SeqCst);
                    drop(guard);
                    if let Some(ref mut session) = *supervisor.session.write() {
                        session.state = SessionState::Exited;
                    }
                    let _ = supervisor.disconnect_tx.try_send(());
                    return;
                }
            }
        });
    }
}

/// Append `:port` when the address has none. Bracketless IPv6 is not a
/// concern here; candidates are IPv4 or host names.
fn with_default_port(address: &str, port: u16) -> String {
    if address.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
        address.to_string()
    } else {
        format!("{}:{}", address, port)
    }
}
