//! The transport agent pool.
//!
//! Every worker is a child process fed job names over its stdin and
//! reporting back over its stdout. Both pipes are non-blocking: output the
//! pipe cannot take yet stays in the worker's command buffer, and a partial
//! input line stays in its carryover buffer.

pub mod argv;
pub mod fork_rate;
pub mod launcher;
mod protocol;

use std::{
    collections::{BTreeMap, btree_map},
    fmt,
    fs::File,
    io::{self, ErrorKind, Write},
    os::fd::{AsFd, BorrowedFd},
    path::PathBuf,
};

use empath_common::{internal, tracing};
use nix::{
    fcntl::{FcntlArg, OFlag, fcntl},
    sys::resource::{Resource, getrlimit},
};

use crate::{
    config::Settings,
    graph::{GroupId, ProcKey, ThreadId, WebId},
};

pub use fork_rate::ForkRate;
pub use launcher::{Exit, ForkLauncher, LaunchSpec, Launched, Launcher, Signal};

/// Descriptors the scheduler keeps for itself before sizing the pool
const RESERVED_FDS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Started, waiting for its first `#hungry`
    Larva,
    /// Being fed from its thread
    Stuffing,
    /// Its thread ran dry; looking for another
    Finishing,
    /// Parked on its group's idle chain
    Idle,
    /// The feed pipe failed and is closed
    Error,
}

impl fmt::Display for ProcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Larva => "LARVA",
            Self::Stuffing => "STUFF",
            Self::Finishing => "FINISH",
            Self::Idle => "IDLE",
            Self::Error => "ERROR",
        })
    }
}

#[derive(Debug)]
pub struct ProcessInfo {
    pub pid: i32,
    pub reader: File,
    /// Closed once the worker is told to go away, or after a write failure
    pub writer: Option<File>,
    pub state: ProcState,
    /// Commands written that the worker has not answered with `#hungry`
    pub overfed: usize,
    /// Output the pipe has not accepted yet
    pub outbuf: Vec<u8>,
    /// Partial input line
    pub carryover: Vec<u8>,
    pub thread: Option<ThreadId>,
    pub group: GroupId,
    pub channel: WebId,
    pub host: WebId,
    pub hungertime: u64,
    pub feedtime: u64,
    pub idle_since: u64,
    pub cmdline: String,
}

impl ProcessInfo {
    /// Write as much pending output as the pipe takes.
    ///
    /// Returns `Ok` with output still pending when the pipe is full.
    fn flush_output(&mut self) -> io::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            self.outbuf.clear();
            return Ok(());
        };

        while !self.outbuf.is_empty() {
            match writer.write(&self.outbuf) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outbuf.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    pub fn wants_write(&self) -> bool {
        self.writer.is_some() && !self.outbuf.is_empty()
    }

    pub fn writer_fd(&self) -> Option<BorrowedFd<'_>> {
        self.writer.as_ref().map(AsFd::as_fd)
    }
}

/// A worker whose pipes are gone but whose exit status was not there yet
#[derive(Debug)]
struct Zombie {
    pid: i32,
    cmdline: String,
}

/// Put a descriptor into non-blocking mode
///
/// # Errors
///
/// If `fcntl` fails.
pub fn set_nonblocking(fd: &impl AsFd) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;

    Ok(())
}

/// Worker limit from the descriptor limit: every worker takes two pipes
pub fn global_max_kids() -> usize {
    let Ok((soft, _)) = getrlimit(Resource::RLIMIT_NOFILE) else {
        return 1;
    };

    let soft = u64::try_from(soft).unwrap_or(u64::MAX).min(1 << 20);
    usize::try_from(soft.saturating_sub(RESERVED_FDS) / 2)
        .unwrap_or(1)
        .max(1)
}

pub struct Pool {
    procs: BTreeMap<ProcKey, ProcessInfo>,
    launcher: Box<dyn Launcher>,
    fork_rate: ForkRate,
    zombies: Vec<Zombie>,
    mailbin: PathBuf,
    environment: BTreeMap<String, String>,
    pub global_max: usize,
    /// No new workers are started
    pub frozen: bool,
    /// Workers are told to leave instead of being fed
    pub slow_shutdown: bool,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("procs", &self.procs.len())
            .field("zombies", &self.zombies.len())
            .field("global_max", &self.global_max)
            .field("frozen", &self.frozen)
            .field("slow_shutdown", &self.slow_shutdown)
            .finish_non_exhaustive()
    }
}

impl Pool {
    pub fn new(launcher: Box<dyn Launcher>, settings: &Settings) -> Self {
        let mut pool = Self {
            procs: BTreeMap::new(),
            launcher,
            fork_rate: ForkRate::default(),
            zombies: Vec::new(),
            mailbin: PathBuf::new(),
            environment: BTreeMap::new(),
            global_max: 1,
            frozen: false,
            slow_shutdown: false,
        };
        pool.configure(settings);
        pool
    }

    /// Apply the pool-wide settings
    pub fn configure(&mut self, settings: &Settings) {
        self.fork_rate = ForkRate::new(settings.fork_rate);
        self.mailbin.clone_from(&settings.mailbin);
        self.environment.clone_from(&settings.environment);
        self.global_max = settings.max_kids.unwrap_or_else(global_max_kids).max(1);

        internal!(
            level = DEBUG,
            global_max = self.global_max,
            fork_rate = settings.fork_rate,
            "Worker pool configured"
        );
    }

    pub fn set_fork_rate(&mut self, per_second: u32) {
        self.fork_rate = ForkRate::new(per_second);
    }

    pub fn fork_rate_exhausted(&self) -> bool {
        self.fork_rate.is_exhausted()
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn get(&self, key: ProcKey) -> Option<&ProcessInfo> {
        self.procs.get(&key)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, ProcKey, ProcessInfo> {
        self.procs.iter()
    }

    pub fn keys(&self) -> Vec<ProcKey> {
        self.procs.keys().copied().collect()
    }

    /// Carryover storage of a worker, for the read loop
    pub fn input_mut(&mut self, key: ProcKey) -> Option<(&mut File, &mut Vec<u8>)> {
        self.procs
            .get_mut(&key)
            .map(|proc| (&mut proc.reader, &mut proc.carryover))
    }

    /// Record a feed-pipe failure: the worker moves to ERROR and its
    /// write side is closed
    fn fail(&mut self, key: ProcKey, error: &dyn std::error::Error) {
        if let Some(proc) = self.procs.get_mut(&key) {
            tracing::warn!(
                pid = proc.pid,
                state = %proc.state,
                cmdline = %proc.cmdline,
                "Shutting down worker feed: {error}"
            );
            proc.state = ProcState::Error;
            proc.writer = None;
            proc.outbuf.clear();
        }
    }

    /// Write pending output of one worker
    pub fn flush(&mut self, key: ProcKey) {
        let Some(proc) = self.procs.get_mut(&key) else {
            return;
        };

        if let Err(source) = proc.flush_output() {
            let error = crate::error::WorkerError::Write {
                pid: proc.pid,
                source,
            };
            self.fail(key, &error);
        }
    }

    /// Retry collecting workers that had not exited when their pipes closed
    pub fn reap_zombies(&mut self) {
        let mut zombies = std::mem::take(&mut self.zombies);

        zombies.retain(|zombie| match self.launcher.try_reap(zombie.pid) {
            Ok(None) => true,
            Ok(Some(exit)) => {
                log_exit(zombie.pid, &zombie.cmdline, exit);
                false
            }
            Err(e) => {
                tracing::warn!(pid = zombie.pid, "Unable to reap worker: {e}");
                false
            }
        });

        self.zombies = zombies;
    }

    pub fn zombies(&self) -> usize {
        self.zombies.len()
    }
}

/// Log how a worker ended. `EX_SOFTWARE` means the agent found a bug in
/// its configuration or in itself.
fn log_exit(pid: i32, cmdline: &str, exit: Exit) {
    match exit {
        Exit::Code(0) => internal!(level = DEBUG, pid, "Worker exited"),
        Exit::Code(code @ 70) => tracing::error!(
            pid,
            code,
            cmdline,
            "Worker exited with EX_SOFTWARE, check its configuration or code"
        ),
        Exit::Code(code) => tracing::warn!(pid, code, cmdline, "Worker exited with non-zero status"),
        Exit::Signal(signal) => tracing::warn!(pid, %signal, cmdline, "Worker killed by signal"),
    }
}
