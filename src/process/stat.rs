//! procfs inspection: liveness and kernel start time.
//!
//! The re-attach path must prove that a pid recorded before a daemon restart
//! still names the same process. Pids are recycled; the pair
//! `(pid, starttime)` is not. `starttime` is field 22 of `/proc/<pid>/stat`,
//! in clock ticks since boot.

use nix::sys::signal::kill;
use nix::unistd::Pid;

/// True when `pid` names a live process we may signal.
///
/// Uses `kill(pid, 0)`; `EPERM` still proves existence.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Kernel start time of `pid` in clock ticks since boot, or `None` when the
/// process does not exist.
pub fn proc_start_time(pid: i32) -> Option<u64> {
    let text = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm (field 2) may contain spaces and parentheses; fields resume after
    // the LAST ')'. starttime is field 22 overall, i.e. the 20th after comm.
    let rest = text.rsplit_once(')')?.1;
    rest.split_whitespace().nth(19)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive_with_start_time() {
        let me = std::process::id() as i32;
        assert!(is_alive(me));
        assert!(proc_start_time(me).is_some());
    }

    #[test]
    fn dead_pid_reports_nothing() {
        // Pid 0 is never a signalable target; absurdly large pids do not exist.
        assert!(!is_alive(0));
        assert!(!is_alive(-4));
        assert!(proc_start_time(i32::MAX - 7).is_none());
    }
}
