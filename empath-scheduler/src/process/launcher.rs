//! Starting and reaping transport agents.
//!
//! The scheduler only talks to [`Launcher`], so tests can hand it socket
//! pairs in place of real children.

use std::{
    io,
    os::{fd::OwnedFd, unix::process::CommandExt},
    process::{Command, Stdio},
};

use empath_common::tracing;
pub use nix::sys::signal::Signal;
use nix::{
    sys::{
        signal::kill,
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::Pid,
};

use super::argv::CommandLine;

pub struct LaunchSpec<'a> {
    pub command: &'a CommandLine,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Niceness; 80 and above sets `priority - 100` absolutely
    pub priority: i32,
}

/// A started worker: its pid and the parent's ends of its pipes
#[derive(Debug)]
pub struct Launched {
    pub pid: i32,
    /// Writes reach the worker's stdin
    pub to: OwnedFd,
    /// The worker's stdout
    pub from: OwnedFd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Code(i32),
    Signal(Signal),
}

impl Exit {
    pub const fn success(self) -> bool {
        matches!(self, Self::Code(0))
    }
}

pub trait Launcher {
    /// Start a worker
    ///
    /// # Errors
    ///
    /// If the pipes cannot be made or the program cannot be run.
    fn launch(&mut self, spec: &LaunchSpec<'_>) -> io::Result<Launched>;

    /// Collect the exit status of `pid` without blocking; `None` while it
    /// is still running
    ///
    /// # Errors
    ///
    /// If the process is not a child of the scheduler.
    fn try_reap(&mut self, pid: i32) -> io::Result<Option<Exit>>;

    fn signal(&mut self, pid: i32, signal: Signal);
}

/// Runs transport agents as real child processes
#[derive(Debug, Default)]
pub struct ForkLauncher;

/// nix wraps neither `setpriority` nor `nice`
fn set_priority(priority: i32) {
    // SAFETY: plain syscalls, safe between fork and exec
    unsafe {
        if priority >= 80 {
            libc::setpriority(libc::PRIO_PROCESS, 0, priority - 100);
        } else {
            libc::nice(priority);
        }
    }
}

impl Launcher for ForkLauncher {
    fn launch(&mut self, spec: &LaunchSpec<'_>) -> io::Result<Launched> {
        let mut command = Command::new(&spec.command.program);
        command
            .args(&spec.command.args)
            .env_clear()
            .envs(spec.command.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        // std drops the group before the user
        if let Some(gid) = spec.gid {
            command.gid(gid);
        }
        if let Some(uid) = spec.uid {
            command.uid(uid);
        }

        let priority = spec.priority;
        if priority != 0 {
            // SAFETY: the hook only makes async-signal-safe syscalls
            unsafe {
                command.pre_exec(move || {
                    set_priority(priority);
                    Ok(())
                });
            }
        }

        let mut child = command.spawn()?;
        let pid = i32::try_from(child.id()).map_err(io::Error::other)?;

        let to = child
            .stdin
            .take()
            .map(OwnedFd::from)
            .ok_or_else(|| io::Error::other("worker stdin was not piped"))?;
        let from = child
            .stdout
            .take()
            .map(OwnedFd::from)
            .ok_or_else(|| io::Error::other("worker stdout was not piped"))?;

        Ok(Launched { pid, to, from })
    }

    fn try_reap(&mut self, pid: i32) -> io::Result<Option<Exit>> {
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG))? {
            WaitStatus::Exited(_, code) => Ok(Some(Exit::Code(code))),
            WaitStatus::Signaled(_, signal, _) => Ok(Some(Exit::Signal(signal))),
            // Stopped or continued children are still ours to wait for
            _ => Ok(None),
        }
    }

    fn signal(&mut self, pid: i32, signal: Signal) {
        if let Err(errno) = kill(Pid::from_raw(pid), signal) {
            tracing::debug!(pid, %signal, "Failed to signal worker: {errno}");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{
        fs::File,
        io::{Read, Write},
        path::PathBuf,
        thread::sleep,
        time::Duration,
    };

    use pretty_assertions::assert_eq;

    use super::*;

    fn reap(launcher: &mut ForkLauncher, pid: i32) -> Exit {
        for _ in 0..500 {
            if let Some(exit) = launcher.try_reap(pid).unwrap() {
                return exit;
            }
            sleep(Duration::from_millis(10));
        }
        panic!("child {pid} never exited");
    }

    #[test]
    fn test_launch_echo_and_reap() {
        let command = CommandLine {
            program: PathBuf::from("/bin/cat"),
            args: vec![],
            env: vec![],
        };
        let mut launcher = ForkLauncher;
        let launched = launcher
            .launch(&LaunchSpec {
                command: &command,
                uid: None,
                gid: None,
                priority: 0,
            })
            .unwrap();

        let mut to = File::from(launched.to);
        to.write_all(b"#hungry\n").unwrap();
        drop(to);

        let mut output = String::new();
        File::from(launched.from).read_to_string(&mut output).unwrap();
        assert_eq!(output, "#hungry\n");

        assert_eq!(reap(&mut launcher, launched.pid), Exit::Code(0));
    }

    #[test]
    fn test_exit_status_and_signals() {
        let command = CommandLine {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), "exit 70".to_string()],
            env: vec![],
        };
        let mut launcher = ForkLauncher;
        let spec = LaunchSpec {
            command: &command,
            uid: None,
            gid: None,
            priority: 5,
        };

        let launched = launcher.launch(&spec).unwrap();
        assert_eq!(reap(&mut launcher, launched.pid), Exit::Code(70));

        let sleeper = CommandLine {
            program: PathBuf::from("/bin/sleep"),
            args: vec!["30".to_string()],
            env: vec![],
        };
        let launched = launcher
            .launch(&LaunchSpec {
                command: &sleeper,
                ..spec
            })
            .unwrap();
        assert_eq!(launcher.try_reap(launched.pid).unwrap(), None);

        launcher.signal(launched.pid, Signal::SIGKILL);
        assert_eq!(reap(&mut launcher, launched.pid), Exit::Signal(Signal::SIGKILL));
        assert!(!Exit::Signal(Signal::SIGKILL).success());
    }

    #[test]
    fn test_missing_program() {
        let command = CommandLine {
            program: PathBuf::from("/nonexistent/ta/smtp"),
            args: vec![],
            env: vec![],
        };
        let result = ForkLauncher.launch(&LaunchSpec {
            command: &command,
            uid: None,
            gid: None,
            priority: 0,
        });

        assert!(result.is_err());
    }
}
