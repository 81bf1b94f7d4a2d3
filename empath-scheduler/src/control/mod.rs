//! Control files: the on-disk description of one queued message.
//!
//! A control file is a sequence of records, each starting with a tag byte
//! and a state byte, followed by the payload:
//!
//! ```text
//! V 0x3
//! i 12345
//! l S12345
//! s smtp sender.example alice@sender.example
//! r          1700000000smtp a.example bob@a.example
//! N NOTIFY=SUCCESS,FAILURE
//! m Subject: hello
//! From: alice@sender.example
//!
//! ```
//!
//! Recipient records optionally carry a fixed-width pid slot (the worker
//! holding the lock on that recipient) and a fixed-width delay slot; the
//! format record decides whether those slots are present.

pub mod lock;
pub mod parser;

use std::fmt;

use crate::graph::ChainHead;

pub use parser::{ParseOptions, Parsed, RecipientRecord, load, parse};

/// Width of the pid slot in recipient records
pub const PID_SLOT: usize = 8;
/// Width of the delay slot in recipient records
pub const DELAY_SLOT: usize = 10;

/// Record types, keyed by their tag byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Format,
    Sender,
    Recipient,
    RecipientNotary,
    MessageHeaders,
    MimeStructure,
    MessageId,
    BodyOffset,
    EnvelopeId,
    DsnReturnMode,
    LogIdent,
    ErrorAddress,
    Obsoletes,
    Verbose,
    TurnMe,
    Diagnostic,
}

impl Tag {
    pub const fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            b'V' => Self::Format,
            b's' => Self::Sender,
            b'r' => Self::Recipient,
            b'N' => Self::RecipientNotary,
            b'm' => Self::MessageHeaders,
            b'M' => Self::MimeStructure,
            b'i' => Self::MessageId,
            b'o' => Self::BodyOffset,
            b'n' => Self::EnvelopeId,
            b'R' => Self::DsnReturnMode,
            b'l' => Self::LogIdent,
            b'E' => Self::ErrorAddress,
            b'x' => Self::Obsoletes,
            b'v' => Self::Verbose,
            b'T' => Self::TurnMe,
            b'd' => Self::Diagnostic,
            _ => return None,
        })
    }

    pub const fn byte(self) -> u8 {
        match self {
            Self::Format => b'V',
            Self::Sender => b's',
            Self::Recipient => b'r',
            Self::RecipientNotary => b'N',
            Self::MessageHeaders => b'm',
            Self::MimeStructure => b'M',
            Self::MessageId => b'i',
            Self::BodyOffset => b'o',
            Self::EnvelopeId => b'n',
            Self::DsnReturnMode => b'R',
            Self::LogIdent => b'l',
            Self::ErrorAddress => b'E',
            Self::Obsoletes => b'x',
            Self::Verbose => b'v',
            Self::TurnMe => b'T',
            Self::Diagnostic => b'd',
        }
    }

    /// Records that run until the next blank line rather than the next newline
    pub const fn is_block(self) -> bool {
        matches!(self, Self::MessageHeaders | Self::MimeStructure)
    }
}

/// Per-recipient state byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Still to be delivered
    Normal,
    /// Claimed by a transport agent
    Locked,
    /// Delivered
    Done,
    /// Failed permanently
    Failed,
}

impl State {
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b' ' => Some(Self::Normal),
            b'~' => Some(Self::Locked),
            b'+' => Some(Self::Done),
            b'-' => Some(Self::Failed),
            _ => None,
        }
    }

    pub const fn byte(self) -> u8 {
        match self {
            Self::Normal => b' ',
            Self::Locked => b'~',
            Self::Done => b'+',
            Self::Failed => b'-',
        }
    }
}

/// Bits of the format record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatFlags(u32);

impl FormatFlags {
    /// Recipient records carry a pid slot
    pub const PID_SLOT: Self = Self(0x1);
    /// Recipient records carry a delay slot
    pub const DELAY_SLOT: Self = Self(0x2);

    const KNOWN: u32 = 0x3;

    /// Accept a raw mask, refusing bits this scheduler does not understand
    pub const fn from_bits(bits: u32) -> Result<Self, u32> {
        if bits & !Self::KNOWN == 0 {
            Ok(Self(bits))
        } else {
            Err(bits & !Self::KNOWN)
        }
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// DSN `NOTIFY=` flags
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NotifyFlags(u8);

impl NotifyFlags {
    pub const SUCCESS: Self = Self(0x01);
    pub const FAILURE: Self = Self(0x02);
    pub const DELAY: Self = Self(0x04);
    pub const NEVER: Self = Self(0x08);
    pub const TRACE: Self = Self(0x10);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Parse the value of a `NOTIFY=` parameter; unknown words are ignored
    pub fn parse(value: &str) -> Self {
        value
            .split(',')
            .map(str::trim)
            .fold(Self::empty(), |flags, word| {
                let flag = match word.to_ascii_uppercase().as_str() {
                    "SUCCESS" => Self::SUCCESS,
                    "FAILURE" => Self::FAILURE,
                    "DELAY" => Self::DELAY,
                    "NEVER" => Self::NEVER,
                    "TRACE" => Self::TRACE,
                    _ => Self::empty(),
                };
                flags.union(flag)
            })
    }
}

impl Default for NotifyFlags {
    fn default() -> Self {
        Self::FAILURE
    }
}

impl fmt::Debug for NotifyFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::SUCCESS, "SUCCESS"),
            (Self::FAILURE, "FAILURE"),
            (Self::DELAY, "DELAY"),
            (Self::NEVER, "NEVER"),
            (Self::TRACE, "TRACE"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect::<Vec<_>>();

        write!(f, "NOTIFY={}", names.join(","))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sender {
    pub channel: String,
    pub host: String,
    pub user: String,
}

/// The in-memory record of one job
#[derive(Debug, Default)]
pub struct ControlFile {
    /// Numeric control file name
    pub id: u64,
    /// Control file name without hash prefix
    pub name: String,
    /// `""`, `"X/"` or `"X/Y/"`
    pub dir_hash: String,
    /// Owner of the control file
    pub uid: u32,
    /// Name of the message body file in the queue directory
    pub message_id: String,
    pub log_ident: String,
    pub sender: Option<Sender>,
    /// Where errors are reported; empty for error messages themselves
    pub error_address: Option<String>,
    pub envelope_id: Option<String>,
    pub dsn_ret_mode: Option<String>,
    pub verbose: Option<String>,
    pub body_offset: u64,
    pub format: FormatFlags,
    /// Byte offset of every record
    pub offsets: Vec<usize>,
    pub rcpnts_total: usize,
    pub rcpnts_work: usize,
    pub rcpnts_failed: usize,
    /// Modification time of the message body, base of all expiry times
    pub mtime: u64,
    /// The file carries diagnostic records
    pub had_error: bool,
    pub resync_count: u32,
    /// Vertices built from this file, in file order
    pub vertices: ChainHead,
}

impl ControlFile {
    /// Control file name including its hash prefix
    pub fn spool_name(&self) -> String {
        format!("{}{}", self.dir_hash, self.name)
    }

    pub fn is_error_message(&self) -> bool {
        self.sender.as_ref().is_some_and(|s| s.channel == "error")
    }
}
