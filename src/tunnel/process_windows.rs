//! Windows process control for the tunnel child

use tokio::process::{Child, Command};

pub fn set_proc_attr(_cmd: &mut Command) {}

/// Liveness on Windows goes through the child handle's exit-code probe
/// (`try_wait` in the supervisor); there is no cheap pid-only check.
pub fn alive(_pid: u32) -> bool {
    true
}

/// No graceful signal to send; best-effort kill.
pub fn request_stop(child: &mut Child, _pid: u32) {
    let _ = child.start_kill();
}
