//! Transport scheduler.
//!
//! Jobs are discovered in the spool ([`dirqueue`]), parsed ([`control`]),
//! split into per-destination vertices ([`graph`]), matched against the
//! configured policies and queued on threads ([`config`], [`threads`]), and
//! fed to transport agent processes ([`process`]) from a single-threaded
//! event loop ([`scheduler`]).

pub mod arena;
pub mod config;
pub mod control;
pub mod dirqueue;
pub mod error;
pub mod glob;
pub mod graph;
pub mod ipc;
mod mux;
pub mod process;
pub mod resync;
pub mod retry;
pub mod scheduler;
pub mod spool;
pub mod threads;
pub mod update;

pub use config::Config;
pub use error::{Result, SchedulerError};
pub use scheduler::{Options, Scheduler, Stats};
