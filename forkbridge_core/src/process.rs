//! Process lifecycle primitives: fork, wait, stop-self and immediate exit.
//!
//! Everything the controller needs from the operating system goes through
//! [`ProcessControl`], so the state machine can be driven by a fake in tests
//! without forking or stopping the test runner.

use std::fmt;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForkError {
    #[error("fork failed: {0}")]
    Fork(#[source] io::Error),

    #[error("waiting for child {pid} failed: {source}")]
    Wait {
        pid: libc::pid_t,
        #[source]
        source: io::Error,
    },
}

/// Which side of a fork the caller ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkRole {
    Parent { child: libc::pid_t },
    Child,
}

/// A raw wait status as returned by `waitpid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    raw: libc::c_int,
}

impl ExitReport {
    pub fn from_raw(raw: libc::c_int) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> libc::c_int {
        self.raw
    }

    pub fn exit_code(&self) -> Option<i32> {
        libc::WIFEXITED(self.raw).then(|| libc::WEXITSTATUS(self.raw))
    }

    pub fn signal(&self) -> Option<i32> {
        libc::WIFSIGNALED(self.raw).then(|| libc::WTERMSIG(self.raw))
    }

    pub fn is_clean(&self) -> bool {
        self.exit_code() == Some(0)
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.exit_code() {
            write!(f, "exited with code {code}")
        } else if let Some(signal) = self.signal() {
            write!(f, "terminated by signal {signal}")
        } else {
            write!(f, "wait status {:#x}", self.raw)
        }
    }
}

/// The OS capabilities the loop controller relies on.
pub trait ProcessControl: Send {
    fn fork_child(&mut self) -> Result<ForkRole, ForkError>;

    /// Blocks until `child` terminates. Stops are not reported.
    fn wait_child(&mut self, child: libc::pid_t) -> Result<ExitReport, ForkError>;

    /// Stops the calling process; returns once something sends `SIGCONT`.
    fn pause_self(&mut self) -> io::Result<()>;

    fn current_pid(&self) -> u32;
}

/// [`ProcessControl`] backed by the real system calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcess;

impl ProcessControl for OsProcess {
    fn fork_child(&mut self) -> Result<ForkRole, ForkError> {
        // SAFETY: the bridge is single-threaded by contract; the child only
        // continues running the caller's own code.
        match unsafe { libc::fork() } {
            -1 => Err(ForkError::Fork(io::Error::last_os_error())),
            0 => Ok(ForkRole::Child),
            child => Ok(ForkRole::Parent { child }),
        }
    }

    fn wait_child(&mut self, child: libc::pid_t) -> Result<ExitReport, ForkError> {
        let mut status: libc::c_int = 0;
        loop {
            // SAFETY: status points at a live local.
            let rc = unsafe { libc::waitpid(child, &mut status, 0) };
            if rc == child {
                return Ok(ExitReport::from_raw(status));
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(ForkError::Wait {
                    pid: child,
                    source: err,
                });
            }
        }
    }

    fn pause_self(&mut self) -> io::Result<()> {
        // SAFETY: raise has no memory-safety preconditions.
        if unsafe { libc::raise(libc::SIGSTOP) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn current_pid(&self) -> u32 {
        std::process::id()
    }
}

/// Terminates the process at once with `status`.
///
/// No destructors run, no panic unwinding happens and buffered stdio is not
/// flushed. This is the only correct way to leave a process whose loop has
/// reported exhaustion.
pub fn force_exit(status: i32) -> ! {
    // SAFETY: _exit never returns and has no preconditions.
    unsafe { libc::_exit(status) }
}

/// Turns panics into `SIGABRT` after the default hook has printed the message,
/// so a supervisor sees a crash instead of exit status 101.
pub fn install_abort_on_panic() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        std::process::abort();
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_report_decodes_codes_and_signals() {
        let clean = ExitReport::from_raw(0);
        assert!(clean.is_clean());
        assert_eq!(clean.exit_code(), Some(0));
        assert_eq!(clean.signal(), None);
        assert_eq!(clean.to_string(), "exited with code 0");

        let failed = ExitReport::from_raw(3 << 8);
        assert!(!failed.is_clean());
        assert_eq!(failed.exit_code(), Some(3));

        let segv = ExitReport::from_raw(libc::SIGSEGV);
        assert_eq!(segv.exit_code(), None);
        assert_eq!(segv.signal(), Some(libc::SIGSEGV));
        assert_eq!(segv.to_string(), format!("terminated by signal {}", libc::SIGSEGV));
    }

    #[test]
    fn fork_and_wait_report_child_exit_code() {
        let mut os = OsProcess;
        match os.fork_child().unwrap() {
            ForkRole::Child => force_exit(7),
            ForkRole::Parent { child } => {
                assert!(child > 0);
                let report = os.wait_child(child).unwrap();
                assert_eq!(report.exit_code(), Some(7));
            }
        }
    }

    #[test]
    fn pause_self_returns_after_sigcont() {
        let mut os = OsProcess;
        match os.fork_child().unwrap() {
            ForkRole::Child => {
                let status = if os.pause_self().is_ok() { 0 } else { 1 };
                force_exit(status)
            }
            ForkRole::Parent { child } => {
                let mut status = 0;
                let rc = unsafe { libc::waitpid(child, &mut status, libc::WUNTRACED) };
                assert_eq!(rc, child);
                assert!(libc::WIFSTOPPED(status), "child should stop itself");
                assert_eq!(libc::WSTOPSIG(status), libc::SIGSTOP);

                assert_eq!(unsafe { libc::kill(child, libc::SIGCONT) }, 0);
                let report = os.wait_child(child).unwrap();
                assert!(report.is_clean(), "child resumed and exited: {report}");
            }
        }
    }

    #[test]
    fn waiting_for_a_stranger_fails() {
        let mut os = OsProcess;
        match os.wait_child(1) {
            Err(ForkError::Wait { pid, .. }) => assert_eq!(pid, 1),
            other => panic!("Expected Wait error, got {other:?}"),
        }
    }
}
