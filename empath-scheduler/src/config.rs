//! Scheduler configuration.
//!
//! The configuration is a RON document holding the postoffice location, the
//! scheduler's own settings, and an ordered list of policy entries. Entries
//! are matched against a vertex's `(channel, host)` in source order and the
//! first match wins. Entries whose channel is the literal `*` never match;
//! they collect defaults that every later entry inherits.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};

use nix::unistd::{Group, User};
use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, glob};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename = "Empath")]
pub struct Config {
    pub postoffice: PathBuf,
    #[serde(default)]
    pub scheduler: Settings,
    #[serde(default)]
    pub entries: Vec<Entry>,
}

impl Config {
    /// # Errors
    ///
    /// If the text is not a valid configuration document.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(text)?)
    }

    /// # Errors
    ///
    /// If the file cannot be read or does not parse.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_ron(&text)
    }
}

/// Settings of the scheduler itself
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Settings {
    /// Levels of single-letter spool subdirectories (0, 1 or 2)
    #[serde(default)]
    pub hash_levels: u8,

    /// Base interval between directory scans
    #[serde(default = "defaults::scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// New entries accepted per directory scan
    #[serde(default = "defaults::scan_limit")]
    pub scan_limit: usize,

    /// Wall-clock budget of a directory scan
    #[serde(default = "defaults::scan_time_limit_secs")]
    pub scan_time_limit_secs: u64,

    /// Workers started per second, 0 for no limit
    #[serde(default)]
    pub fork_rate: u32,

    /// Global worker limit; derived from the descriptor limit when unset
    #[serde(default)]
    pub max_kids: Option<usize>,

    /// How long a recipient locked by a live process is left alone
    #[serde(default = "defaults::lock_backoff_secs")]
    pub lock_backoff_secs: u64,

    /// Resyncs of one job before it is dropped from memory
    #[serde(default = "defaults::max_resyncs")]
    pub max_resyncs: u32,

    #[serde(default = "defaults::sweep_secs")]
    pub idle_sweep_secs: u64,

    #[serde(default = "defaults::sweep_secs")]
    pub expiry2_sweep_secs: u64,

    #[serde(default = "defaults::report_interval_secs")]
    pub report_interval_secs: u64,

    /// Queue entries parsed per burst when the discovery queue is backed up
    #[serde(default = "defaults::drain_batch")]
    pub drain_batch: usize,

    #[serde(default = "defaults::drain_time_ms")]
    pub drain_time_ms: u64,

    #[serde(default)]
    pub notify_socket: Option<PathBuf>,

    #[serde(default)]
    pub query_socket: Option<PathBuf>,

    /// Transport agents live under `<mailbin>/ta/`
    #[serde(default = "defaults::mailbin")]
    pub mailbin: PathBuf,

    /// Variables available to command templates as `${NAME}`
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hash_levels: 0,
            scan_interval_secs: defaults::scan_interval_secs(),
            scan_limit: defaults::scan_limit(),
            scan_time_limit_secs: defaults::scan_time_limit_secs(),
            fork_rate: 0,
            max_kids: None,
            lock_backoff_secs: defaults::lock_backoff_secs(),
            max_resyncs: defaults::max_resyncs(),
            idle_sweep_secs: defaults::sweep_secs(),
            expiry2_sweep_secs: defaults::sweep_secs(),
            report_interval_secs: defaults::report_interval_secs(),
            drain_batch: defaults::drain_batch(),
            drain_time_ms: defaults::drain_time_ms(),
            notify_socket: None,
            query_socket: None,
            mailbin: defaults::mailbin(),
            environment: BTreeMap::new(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    pub const fn scan_interval_secs() -> u64 {
        10
    }

    pub const fn scan_limit() -> usize {
        40_000
    }

    pub const fn scan_time_limit_secs() -> u64 {
        5
    }

    pub const fn lock_backoff_secs() -> u64 {
        3600
    }

    pub const fn max_resyncs() -> u32 {
        25
    }

    pub const fn sweep_secs() -> u64 {
        60
    }

    pub const fn report_interval_secs() -> u64 {
        300
    }

    pub const fn drain_batch() -> usize {
        200
    }

    pub const fn drain_time_ms() -> u64 {
        2000
    }

    pub fn mailbin() -> PathBuf {
        PathBuf::from("/usr/lib/empath")
    }
}

/// One policy entry as written in the configuration file.
///
/// Every field but `channel` is optional; unset fields are inherited from
/// the `*` entries above this one, then from the global fallbacks.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Entry {
    pub channel: String,
    pub host: Option<String>,
    pub interval: Option<u64>,
    pub idlemax: Option<u64>,
    pub expiry: Option<u64>,
    pub expiry2: Option<u64>,
    /// Multipliers of `interval`, walked one step per retry
    pub retries: Option<Vec<u32>>,
    pub skew: Option<u64>,
    /// Workers per thread group
    pub max_kids: Option<usize>,
    /// Workers per channel
    pub max_channel: Option<usize>,
    /// Workers per host
    pub max_host: Option<usize>,
    /// Workers per thread
    pub max_thread: Option<usize>,
    /// Jobs a worker may hold without reporting back
    pub overfeed: Option<usize>,
    pub user: Option<String>,
    pub group: Option<String>,
    /// Niceness of the worker; 80 and above sets `priority - 100` absolutely
    pub priority: Option<i32>,
    pub command: Option<String>,
    /// Only start workers when an ETRN asks for this destination
    pub queue_only: Option<bool>,
}

impl Entry {
    fn is_defaults(&self) -> bool {
        self.channel == "*"
    }

    /// Overlay the fields `other` sets onto `self`
    #[must_use]
    fn merged(mut self, other: &Self) -> Self {
        macro_rules! take {
            ($($field:ident),*) => {
                $(
                    if other.$field.is_some() {
                        self.$field.clone_from(&other.$field);
                    }
                )*
            };
        }

        take!(
            host, interval, idlemax, expiry, expiry2, max_kids, max_channel, max_host,
            max_thread, overfeed, user, group, priority, command, queue_only
        );

        if other.retries.as_ref().is_some_and(|r| !r.is_empty()) {
            self.retries.clone_from(&other.retries);
        }
        if other.skew.is_some_and(|s| s > 0) {
            self.skew = other.skew;
        }

        self
    }
}

/// Resolves account names for the `user` and `group` settings
pub trait Accounts {
    /// `(uid, primary gid)` of a login name
    fn user(&self, name: &str) -> Option<(u32, u32)>;
    fn group(&self, name: &str) -> Option<u32>;
}

/// Account lookups through the system password and group databases
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAccounts;

impl Accounts for SystemAccounts {
    fn user(&self, name: &str) -> Option<(u32, u32)> {
        User::from_name(name)
            .ok()
            .flatten()
            .map(|user| (user.uid.as_raw(), user.gid.as_raw()))
    }

    fn group(&self, name: &str) -> Option<u32> {
        Group::from_name(name).ok().flatten().map(|group| group.gid.as_raw())
    }
}

/// A fully resolved policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub interval: u64,
    pub idlemax: u64,
    pub expiry: u64,
    pub expiry2: u64,
    pub retries: Vec<u32>,
    pub skew: u64,
    pub max_kids: usize,
    pub max_channel: usize,
    pub max_host: usize,
    pub max_thread: usize,
    pub overfeed: usize,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub priority: i32,
    pub command: Option<String>,
    pub queue_only: bool,
}

impl Policy {
    /// Whether the command template names the host, in which case a worker
    /// is tied to one host and is not told the host with every job
    pub fn binds_host(&self) -> bool {
        self.command.as_deref().is_some_and(|command| {
            command
                .split_whitespace()
                .any(|token| token == "$host" || token.contains("${host}"))
        })
    }

    /// Absolute `(expiry, expiry2)` deadlines for a message written at `mtime`
    pub const fn deadlines(&self, mtime: u64) -> (u64, u64) {
        let expiry = if self.expiry > 0 {
            mtime.saturating_add(self.expiry)
        } else {
            0
        };

        let mut expiry2 = if self.expiry > 0 && self.expiry2 > 0 {
            expiry.saturating_add(self.expiry2)
        } else {
            0
        };
        if expiry2 < expiry {
            expiry2 = expiry + 24 * 3600;
        }

        (expiry, expiry2)
    }
}

fn resolve_user(name: &str, accounts: &dyn Accounts) -> Result<(u32, Option<u32>), ConfigError> {
    if let Ok(uid) = name.parse() {
        return Ok((uid, None));
    }

    accounts
        .user(name)
        .map(|(uid, gid)| (uid, Some(gid)))
        .ok_or_else(|| ConfigError::UnknownUser(name.to_string()))
}

fn resolve_group(name: &str, accounts: &dyn Accounts) -> Result<u32, ConfigError> {
    name.parse()
        .ok()
        .or_else(|| accounts.group(name))
        .ok_or_else(|| ConfigError::UnknownGroup(name.to_string()))
}

/// Merge `entry` over `defaults` and apply the global fallbacks
///
/// # Errors
///
/// If a `user` or `group` setting names an unknown account.
pub fn fill_in(
    defaults: &Entry,
    entry: &Entry,
    global_max: usize,
    accounts: &dyn Accounts,
) -> Result<Policy, ConfigError> {
    let merged = defaults.clone().merged(entry);
    let interval = merged.interval.unwrap_or(3600);

    let (mut uid, mut gid) = (None, None);
    if let Some(user) = &merged.user {
        let (u, g) = resolve_user(user, accounts)?;
        uid = Some(u);
        gid = g;
    }
    if let Some(group) = &merged.group {
        gid = Some(resolve_group(group, accounts)?);
    }

    Ok(Policy {
        interval,
        idlemax: merged.idlemax.unwrap_or(interval * 3),
        expiry: merged.expiry.unwrap_or(0),
        expiry2: merged.expiry2.unwrap_or(0),
        retries: merged.retries.filter(|r| !r.is_empty()).unwrap_or_else(|| vec![1]),
        skew: merged.skew.unwrap_or(5),
        max_kids: merged.max_kids.unwrap_or(global_max),
        max_channel: merged.max_channel.unwrap_or(global_max),
        max_host: merged.max_host.unwrap_or(global_max),
        max_thread: merged.max_thread.unwrap_or(global_max),
        overfeed: merged.overfeed.unwrap_or(1).max(1),
        uid,
        gid,
        priority: merged.priority.unwrap_or(0),
        command: merged.command,
        queue_only: merged.queue_only.unwrap_or(false),
    })
}

/// A compiled, matchable entry
#[derive(Debug, Clone)]
pub struct Rule {
    /// Position of the entry in the configuration
    pub index: usize,
    pub channel: String,
    pub host: Option<String>,
    pub policy: Rc<Policy>,
}

impl Rule {
    pub fn matches(&self, channel: &str, host: &str) -> bool {
        if !glob::matches(&self.channel, channel) {
            return false;
        }

        match self.host.as_deref() {
            None | Some("" | "*") => true,
            Some(pattern) => glob::matches(pattern, host),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Rules {
    rules: Vec<Rule>,
}

impl Rules {
    /// Resolve every entry's policy up front
    ///
    /// # Errors
    ///
    /// If an entry names an unknown account.
    pub fn compile(
        entries: &[Entry],
        global_max: usize,
        accounts: &dyn Accounts,
    ) -> Result<Self, ConfigError> {
        let mut defaults = Entry::default();
        let mut rules = Vec::new();

        for (index, entry) in entries.iter().enumerate() {
            if entry.is_defaults() {
                defaults = defaults.merged(entry);
                continue;
            }

            rules.push(Rule {
                index,
                channel: entry.channel.clone(),
                host: entry.host.clone(),
                policy: Rc::new(fill_in(&defaults, entry, global_max, accounts)?),
            });
        }

        Ok(Self { rules })
    }

    /// First rule covering `channel`/`host`
    pub fn match_entry(&self, channel: &str, host: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.matches(channel, host))
    }

    pub const fn len(&self) -> usize {
        self.rules.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// `channel/host` glob pair restricting which destinations may start workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    channel: String,
    host: String,
}

impl Selector {
    /// # Errors
    ///
    /// If the text has no `/` separating channel and host.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let (channel, host) = text
            .split_once('/')
            .filter(|(channel, _)| !channel.is_empty())
            .ok_or_else(|| ConfigError::BadSelector(text.to_string()))?;

        Ok(Self {
            channel: channel.to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
        })
    }

    pub fn matches(&self, channel: &str, host: &str) -> bool {
        glob::matches(&self.channel, channel) && (self.host.is_empty() || glob::matches(&self.host, host))
    }
}
