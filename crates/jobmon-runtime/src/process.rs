use anyhow::{Context, Result};

/// Liveness checks and termination for recorded monitor pids.
pub trait ProcessControl: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;

    /// Sends SIGTERM. Returns false when the process was already gone.
    fn terminate(&self, pid: u32) -> Result<bool>;
}

/// Signals real operating system processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcesses;

impl ProcessControl for SystemProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        is_process_alive(pid)
    }

    fn terminate(&self, pid: u32) -> Result<bool> {
        terminate_process(pid)
    }
}

#[cfg(unix)]
fn to_pid(pid: u32) -> Option<nix::unistd::Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(nix::unistd::Pid::from_raw)
}

/// Signal-0 liveness check. A process owned by another user still counts as alive.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    let Some(pid) = to_pid(pid) else {
        return false;
    };
    match kill(pid, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
pub fn terminate_process(pid: u32) -> Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};

    let Some(target) = to_pid(pid) else {
        return Ok(false);
    };
    match kill(target, Signal::SIGTERM) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(error) => Err(error).with_context(|| format!("failed to send SIGTERM to pid {pid}")),
    }
}

#[cfg(not(unix))]
pub fn terminate_process(_pid: u32) -> Result<bool> {
    Ok(false)
}
