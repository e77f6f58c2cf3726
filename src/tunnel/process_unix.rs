//! Unix process control for the tunnel child

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

/// Place the child in its own process group so one signal reaches any
/// helper processes it forks.
pub fn set_proc_attr(cmd: &mut Command) {
    cmd.process_group(0);
}

/// OS-level liveness: signal 0 probes the pid without touching it.
pub fn alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Ask the child's process group to stop. SIGINT first; the caller
/// escalates to a hard kill after the grace window.
pub fn request_stop(_child: &mut Child, pid: u32) {
    let _ = kill(Pid::from_raw(-(pid as i32)), Signal::SIGINT);
}
