//! Forked worker processes.
//!
//! `fork_with_output` creates a child process running a closure, connected
//! to the parent by a one-way pipe carrying a single typed frame. The
//! parent side, `ForkedChild`, can read that frame under a deadline,
//! signal the child and reap it.
//!
//! The child runs in a copy of a multi-threaded process. It must not take
//! locks other threads may have held at fork time, which rules out logging
//! and the default panic hook. It leaves through `_exit`, never returning
//! into the caller's stack.

use std::fmt;
use std::fs::File;
use std::os::fd::{FromRawFd, IntoRawFd, RawFd};
use std::path::Path;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{pipe2, ForkResult, Pid};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tern_core::error::{Error, Result, SetupError, WorkerError};
use tern_core::utils::deadline::{CancellationToken, Deadline};
use tracing::{debug, warn};

use crate::frame::{self, Hangup};

const PIPE_ORIGIN: &str = "<result pipe>";
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(5);
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit code of a child whose closure panicked.
pub const EXIT_PANIC: i32 = 101;

/// The child's write end of the result pipe.
#[derive(Debug)]
pub struct OutputPipe {
    file: File,
}

impl OutputPipe {
    /// Send one message to the parent. Blocks until written.
    pub fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let frame = frame::encode(message)?;
        frame::write_frame(
            &mut self.file,
            &frame,
            Path::new(PIPE_ORIGIN),
            Deadline::never(),
            &CancellationToken::new(),
        )
    }
}

/// The parent's read end of the result pipe.
#[derive(Debug)]
pub struct InputPipe {
    file: File,
}

impl InputPipe {
    /// Wait for the child's message.
    pub fn receive<T: DeserializeOwned>(
        &mut self,
        deadline: Deadline,
        cancel: &CancellationToken,
    ) -> Result<T> {
        frame::read_message(
            &mut self.file,
            Path::new(PIPE_ORIGIN),
            Hangup::Closed,
            deadline,
            cancel,
        )
    }
}

/// How a reaped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    /// Normal exit with a code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(Signal),
    /// Already reaped elsewhere.
    Unknown,
}

impl ChildExit {
    /// Whether the child exited with code 0.
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Signaled(signal) => write!(f, "killed by {}", signal),
            Self::Unknown => f.write_str("exit status unknown"),
        }
    }
}

/// A forked child process, owned by the parent.
///
/// Dropping an unreaped child kills and reaps it.
#[derive(Debug)]
pub struct ForkedChild {
    pid: Pid,
    output: Option<InputPipe>,
    exit: Option<ChildExit>,
}

impl ForkedChild {
    /// Process id of the child.
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// How the child ended, once reaped.
    pub fn exit(&self) -> Option<ChildExit> {
        self.exit
    }

    /// Read the child's message from the result pipe.
    pub fn read<T: DeserializeOwned>(
        &mut self,
        deadline: Deadline,
        cancel: &CancellationToken,
    ) -> Result<T> {
        match self.output.as_mut() {
            Some(pipe) => pipe.receive(deadline, cancel),
            None => Err(Error::Runtime(format!(
                "child {} has no result pipe",
                self.pid
            ))),
        }
    }

    /// Send a signal. A child that is already gone is not an error.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        match kill(self.pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(WorkerError::Signal {
                pid: self.pid(),
                reason: format!("{}: {}", signal, e),
            }
            .into()),
        }
    }

    /// Ask the child to terminate.
    pub fn terminate(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Kill the child.
    pub fn kill(&self) -> Result<()> {
        self.signal(Signal::SIGKILL)
    }

    /// Reap the child if it has exited, without blocking.
    pub fn try_reap(&mut self) -> Result<Option<ChildExit>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }

        let exit = match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => ChildExit::Exited(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => ChildExit::Signaled(signal),
            Ok(_) => return Ok(None),
            Err(Errno::EINTR) => return Ok(None),
            Err(Errno::ECHILD) => ChildExit::Unknown,
            Err(e) => {
                return Err(WorkerError::Signal {
                    pid: self.pid(),
                    reason: format!("waitpid: {}", e),
                }
                .into())
            }
        };

        self.exit = Some(exit);
        Ok(Some(exit))
    }

    /// Wait for the child to exit.
    pub fn reap(&mut self, deadline: Deadline, cancel: &CancellationToken) -> Result<ChildExit> {
        loop {
            if let Some(exit) = self.try_reap()? {
                return Ok(exit);
            }
            deadline.check(cancel, "waiting for child to exit")?;
            thread::sleep(deadline.slice(REAP_POLL_INTERVAL));
        }
    }

    /// Terminate the child, escalating to SIGKILL after `grace`, and reap it.
    pub fn terminate_and_reap(&mut self, grace: Duration) -> Result<ChildExit> {
        self.terminate()?;
        match self.reap(Deadline::after(grace), &CancellationToken::new()) {
            Ok(exit) => Ok(exit),
            Err(Error::Timeout(_)) => {
                debug!(pid = self.pid(), "Child ignored SIGTERM, killing");
                self.kill_and_reap()
            }
            Err(e) => Err(e),
        }
    }

    /// Kill the child and reap it.
    pub fn kill_and_reap(&mut self) -> Result<ChildExit> {
        self.kill()?;
        self.reap(Deadline::after(KILL_REAP_TIMEOUT), &CancellationToken::new())
            .map_err(|e| {
                WorkerError::Signal {
                    pid: self.pid(),
                    reason: format!("not reaped after SIGKILL: {}", e),
                }
                .into()
            })
    }
}

impl Drop for ForkedChild {
    fn drop(&mut self) {
        if self.exit.is_none() {
            if let Err(e) = self.kill_and_reap() {
                warn!(pid = self.pid(), error = %e, "Failed to reap dropped child");
            }
        }
    }
}

/// Fork a child that runs `child` and exits with its return value.
pub fn fork<F>(child: F) -> Result<ForkedChild>
where
    F: FnOnce() -> i32,
{
    // SAFETY: the child only runs `child` and then `_exit`s.
    match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Parent { child: pid }) => {
            debug!(pid = pid.as_raw(), "Forked child");
            Ok(ForkedChild {
                pid,
                output: None,
                exit: None,
            })
        }
        Ok(ForkResult::Child) => {
            close_inherited_descriptors(None);
            run_child(child)
        }
        Err(e) => Err(Error::Fork(e.to_string())),
    }
}

/// Fork a child that runs `child` with the write end of a result pipe.
///
/// # Returns
///
/// * `Err(SetupError::Pipe)` - The pipe could not be created.
/// * `Err(Error::Fork)` - The process could not be created.
pub fn fork_with_output<F>(child: F) -> Result<ForkedChild>
where
    F: FnOnce(OutputPipe) -> i32,
{
    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
        .map_err(|e| SetupError::Pipe(e.to_string()))?;

    // SAFETY: the child only runs `child` and then `_exit`s.
    match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Parent { child: pid }) => {
            drop(write_end);
            debug!(pid = pid.as_raw(), "Forked child with result pipe");
            Ok(ForkedChild {
                pid,
                output: Some(InputPipe {
                    file: File::from(read_end),
                }),
                exit: None,
            })
        }
        Ok(ForkResult::Child) => {
            drop(read_end);
            let fd = close_inherited_descriptors(Some(write_end.into_raw_fd()));
            // SAFETY: `fd` is the only remaining handle to the write end.
            let pipe = OutputPipe {
                file: unsafe { File::from_raw_fd(fd) },
            };
            run_child(move || child(pipe))
        }
        Err(e) => Err(Error::Fork(e.to_string())),
    }
}

fn run_child<F>(child: F) -> !
where
    F: FnOnce() -> i32,
{
    // The default hook takes locks another parent thread may have held at
    // fork time. A silent hook keeps panics inside the child lock-free.
    std::panic::set_hook(Box::new(|_| {}));
    let code = std::panic::catch_unwind(std::panic::AssertUnwindSafe(child)).unwrap_or(EXIT_PANIC);
    // SAFETY: `_exit` skips atexit handlers and destructors, which belong
    // to the parent.
    unsafe { libc::_exit(code) }
}

/// Close every descriptor above stderr in the child, keeping `keep`.
///
/// Descriptors opened by other parent threads for other invocations would
/// otherwise stay open for the child's lifetime. Returns the kept
/// descriptor's new number.
fn close_inherited_descriptors(keep: Option<RawFd>) -> RawFd {
    const FIRST: RawFd = 3;

    let lowest = match keep {
        Some(fd) if fd != FIRST => {
            // SAFETY: plain descriptor syscall.
            unsafe { libc::dup2(fd, FIRST) };
            FIRST + 1
        }
        Some(_) => FIRST + 1,
        None => FIRST,
    };

    // SAFETY: plain descriptor syscalls.
    let closed = unsafe { libc::syscall(libc::SYS_close_range, lowest as libc::c_uint, libc::c_uint::MAX, 0) };
    if closed != 0 {
        // SAFETY: close_range is missing; fall back to closing one by one.
        let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
        let max = if max <= 0 { 1024 } else { max.min(65536) as RawFd };
        for fd in lowest..max {
            unsafe { libc::close(fd) };
        }
    }

    FIRST
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tern_core::{HandlerContext, HandlerError, HandlerErrorKind, HandlerOutcome, HandlerRegistry};

    #[test]
    fn test_fork_with_output_roundtrip() {
        let mut child = fork_with_output(|mut pipe| {
            let value = json!({ "pid": std::process::id() });
            if pipe.send(&value).is_err() {
                return 1;
            }
            0
        })
        .unwrap();

        let value: Value = child
            .read(Deadline::after(Duration::from_secs(5)), &CancellationToken::new())
            .unwrap();
        assert_eq!(value["pid"], child.pid());

        let exit = child
            .reap(Deadline::after(Duration::from_secs(5)), &CancellationToken::new())
            .unwrap();
        assert!(exit.success());
    }

    #[test]
    fn test_exit_without_output_is_closed() {
        let mut child = fork_with_output(|_pipe| 3).unwrap();
        let err = child
            .read::<Value>(Deadline::after(Duration::from_secs(5)), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::Channel(_)));

        let exit = child
            .reap(Deadline::after(Duration::from_secs(5)), &CancellationToken::new())
            .unwrap();
        assert_eq!(exit, ChildExit::Exited(3));
    }

    #[test]
    fn test_handler_panic_in_child_is_caught() {
        // Another thread sits on stderr while the child panics.
        let holder = thread::spawn(|| {
            let _stderr = std::io::stderr().lock();
            thread::sleep(Duration::from_millis(300));
        });
        thread::sleep(Duration::from_millis(20));

        let registry = HandlerRegistry::builder()
            .register_fn(
                "explode",
                |_: &Value, _: &HandlerContext| -> std::result::Result<Value, HandlerError> {
                    panic!("boom")
                },
            )
            .build();

        let mut child = fork_with_output(move |mut pipe| {
            let outcome = registry.invoke("explode", &Value::Null, &HandlerContext::default());
            if pipe.send(&outcome).is_err() {
                return 1;
            }
            0
        })
        .unwrap();

        let outcome: HandlerOutcome = child
            .read(Deadline::after(Duration::from_secs(5)), &CancellationToken::new())
            .unwrap();
        let error = outcome.error().unwrap();
        assert_eq!(error.kind, HandlerErrorKind::Panicked);
        assert_eq!(error.message, "boom");

        let exit = child
            .reap(Deadline::after(Duration::from_secs(5)), &CancellationToken::new())
            .unwrap();
        assert!(exit.success());
        holder.join().unwrap();
    }

    #[test]
    fn test_escaped_panic_exits_with_code() {
        let mut child = fork(|| panic!("escaped")).unwrap();
        let exit = child
            .reap(Deadline::after(Duration::from_secs(5)), &CancellationToken::new())
            .unwrap();
        assert_eq!(exit, ChildExit::Exited(EXIT_PANIC));
    }

    #[test]
    fn test_terminate_lingering_child() {
        let mut child = fork(|| {
            thread::sleep(Duration::from_secs(30));
            0
        })
        .unwrap();

        let exit = child.terminate_and_reap(Duration::from_secs(5)).unwrap();
        assert_eq!(exit, ChildExit::Signaled(Signal::SIGTERM));
        assert!(!exit.success());
    }

    #[test]
    fn test_reap_times_out() {
        let mut child = fork(|| {
            thread::sleep(Duration::from_secs(30));
            0
        })
        .unwrap();

        let err = child
            .reap(Deadline::after(Duration::from_millis(30)), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        assert!(matches!(child.kill_and_reap().unwrap(), ChildExit::Signaled(Signal::SIGKILL)));
    }
}
