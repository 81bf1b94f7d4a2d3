//! Typed error handling for the scheduler.
//!
//! The variants follow how the scheduler reacts to a failure:
//! - [`ParseError`] - a job file that cannot be trusted; discarded, never retried
//!   (except for plain I/O failures, which are retried on a later scan)
//! - [`ConfigError`] - no usable policy for a destination; logged and dropped
//! - [`WorkerError`] - a transport agent could not be started or talked to;
//!   its work is rescheduled through the retry path

use std::{io, path::PathBuf};

use thiserror::Error;

/// Top-level scheduler error type.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A control file could not be parsed.
    #[error("Control file error: {0}")]
    Parse(#[from] ParseError),

    /// The configuration could not be loaded or applied.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A transport agent failed.
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Spool or socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Reasons a control file is rejected.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The format record carries bits this scheduler does not know.
    #[error("unknown format bits {bits:#x}")]
    UnknownFormat { bits: u32 },

    /// The format record is not a number.
    #[error("malformed format record {0:?}")]
    BadFormat(String),

    /// No message-id record.
    #[error("missing message id")]
    MissingMessageId,

    /// No log-ident record.
    #[error("missing log ident")]
    MissingLogIdent,

    /// The message body file named by the message-id is not there.
    #[error("queue file {path} is unreadable: {source}")]
    MissingQueueFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A single record is larger than any sane control file line.
    #[error("record at offset {offset} exceeds {limit} bytes")]
    Oversized { offset: usize, limit: usize },

    /// A recipient record carries a state byte outside the known set.
    #[error("unknown recipient state {state:?} at offset {offset}")]
    BadState { offset: usize, state: char },

    /// A recipient record ends inside its fixed-width slots.
    #[error("truncated recipient record at offset {offset}")]
    Truncated { offset: usize },

    /// A recipient's delay slot holds something other than a timestamp.
    #[error("malformed delay slot at offset {offset}")]
    BadSlot { offset: usize },

    /// The body offset record is not a number.
    #[error("malformed body offset {value:?} at offset {offset}")]
    BadBodyOffset { offset: usize, value: String },

    /// The file could not be read at all.
    #[error("I/O error reading control file: {0}")]
    Io(#[from] io::Error),
}

impl ParseError {
    /// Structural errors mean the file itself is broken, and must be
    /// discarded rather than retried.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

/// Configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No configuration entry covers a destination.
    #[error("no pattern matched {channel}/{host}")]
    NoMatch { channel: String, host: String },

    /// A `${` reference in a command template is never closed.
    #[error("unterminated variable reference in {0:?}")]
    UnterminatedVariable(String),

    /// The command template expands to nothing runnable.
    #[error("command template expands to an empty argument list")]
    EmptyCommand,

    /// A `user` setting names an account that does not exist.
    #[error("unknown user {0:?}")]
    UnknownUser(String),

    /// A `group` setting names a group that does not exist.
    #[error("unknown group {0:?}")]
    UnknownGroup(String),

    /// A channel/host selector without the separating slash.
    #[error("invalid selector {0:?}, expected channel/host")]
    BadSelector(String),

    /// The postoffice path is relative or escapes with `..`.
    #[error("postoffice must be an absolute path without '..' components: {0}")]
    InvalidPostoffice(PathBuf),

    /// The configuration file could not be read.
    #[error("Failed to read config from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The configuration file is not valid RON.
    #[error("Failed to parse config: {0}")]
    Syntax(#[from] ron::error::SpannedError),
}

/// Transport agent failures.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Starting workers is suspended.
    #[error("Frozen")]
    Frozen,

    /// Too many forks in the current second.
    #[error("ForkRateLimit")]
    ForkRateLimit,

    /// The matched entry has no command to run.
    #[error("ConfBUG:NoCmdDefined!")]
    NoCommand,

    /// The command template could not be expanded.
    #[error("ConfBUG:{0}")]
    Template(#[from] ConfigError),

    /// `fork`/`exec` setup failed in the parent.
    #[error("System:ForkFailure! {0}")]
    ForkFailure(#[source] io::Error),

    /// Writing to the worker pipe failed for a reason other than back-pressure.
    #[error("write to worker {pid} failed: {source}")]
    Write {
        pid: i32,
        #[source]
        source: io::Error,
    },
}

impl WorkerError {
    /// Transient errors clear up on their own and the thread is retried on
    /// a later pass.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Frozen | Self::ForkRateLimit | Self::ForkFailure(_))
    }
}

/// Specialized `Result` type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_classification() {
        assert!(ParseError::MissingMessageId.is_structural());
        assert!(ParseError::UnknownFormat { bits: 0x80 }.is_structural());
        assert!(!ParseError::Io(io::Error::other("EMFILE")).is_structural());
    }

    #[test]
    fn test_worker_error_classification() {
        assert!(WorkerError::Frozen.is_transient());
        assert!(WorkerError::ForkRateLimit.is_transient());
        assert!(!WorkerError::NoCommand.is_transient());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(WorkerError::NoCommand.to_string(), "ConfBUG:NoCmdDefined!");
        assert_eq!(
            ParseError::UnknownFormat { bits: 0x10 }.to_string(),
            "unknown format bits 0x10"
        );

        let err = SchedulerError::from(ConfigError::NoMatch {
            channel: "uucp".to_string(),
            host: "x".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "Configuration error: no pattern matched uucp/x"
        );
    }
}
