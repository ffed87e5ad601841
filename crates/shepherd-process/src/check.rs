//! Process existence checking.

use shepherd_common::Result;

/// Check whether a process with the given PID exists and is running.
///
/// Performs a non-destructive probe: on Unix this is `kill(pid, 0)`, which
/// delivers no signal but reports whether the target exists. A process that
/// exists but refuses the probe for permission reasons counts as alive.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> Result<bool> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => Ok(true),
        Err(nix::errno::Errno::ESRCH) => Ok(false),
        Err(nix::errno::Errno::EPERM) => Ok(true),
        Err(e) => Err(shepherd_common::Error::Io(
            std::io::Error::from_raw_os_error(e as i32),
        )),
    }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> Result<bool> {
    Err(shepherd_common::Error::unsupported(
        "pid liveness probe on this platform",
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(pid_alive(std::process::id()).unwrap());
    }

    #[test]
    fn init_is_alive() {
        assert!(pid_alive(1).unwrap());
    }
}
