//! The scheduler context and its main loop.
//!
//! Everything the scheduler knows lives in [`Scheduler`]: the job graph,
//! the worker pool, the discovery queue and the compiled configuration.
//! One loop iteration handles signals, scans the spool when due, runs the
//! periodic sweeps, absorbs queued jobs, starts workers for ready threads
//! and finally waits in [`Scheduler::mux`].

use std::{
    fmt::Write as _,
    path::PathBuf,
    rc::Rc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, SecondsFormat};
use empath_common::{Signal, internal, signal, tracing};

use crate::{
    config::{Config, Rules, Selector, Settings, SystemAccounts},
    control::{self, ParseOptions, State, lock},
    dirqueue::{DirQueue, Drained, Inserted, ScanLimits, spool_number},
    error::SchedulerError,
    graph::{FileId, Graph, VertexId},
    ipc::{self, Notify, Query},
    process::{Launcher, Pool},
    retry,
    spool::{Spool, split_dir_hash},
};

/// Queued jobs per extra second between scans
const SCAN_BACKLOG_DIVISOR: u64 = 32;
const MAX_SCAN_BACKOFF: u64 = 10;

/// Longest a rate-limited loop waits before trying to fork again
const FORK_RETRY: Duration = Duration::from_secs(1);

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

fn timestamp(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map_or_else(|| secs.to_string(), |t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// Command line overrides
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Re-read on `SIGUSR1`
    pub config_path: Option<PathBuf>,
    /// Start with worker creation frozen
    pub freeze: bool,
    /// Absorb the whole spool before starting any worker
    pub sync_start: bool,
    pub fork_rate: Option<u32>,
    /// `channel/host` restricting which destinations start workers
    pub select: Option<String>,
    pub scan_limits: Option<ScanLimits>,
}

/// Running totals for the interim report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub delivered: u64,
    pub failed: u64,
    pub expired: u64,
    pub completed: u64,
}

#[derive(Debug, Default)]
struct Timers {
    next_scan: u64,
    next_idle_cleanup: u64,
    next_expiry2: u64,
    next_report: u64,
}

pub struct Scheduler {
    pub(crate) settings: Settings,
    config_path: Option<PathBuf>,
    pub(crate) spool: Spool,
    rules: Rules,
    pub(crate) graph: Graph,
    pub(crate) pool: Pool,
    queue: DirQueue,
    select: Option<Selector>,
    pub(crate) notify: Option<Notify>,
    pub(crate) query: Option<Query>,
    timers: Timers,
    pub(crate) in_mux: bool,
    pub(crate) stats: Stats,
    exit: bool,
    sync_start: bool,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("spool", &self.spool)
            .field("rules", &self.rules.len())
            .field("jobs", &self.graph.files.iter().count())
            .field("pool", &self.pool)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Build the scheduler from a loaded configuration
    ///
    /// # Errors
    ///
    /// If the postoffice is unusable, an entry names an unknown account,
    /// the selector is malformed, or a socket cannot be bound.
    pub fn new(
        config: Config,
        options: Options,
        launcher: Box<dyn Launcher>,
    ) -> Result<Self, SchedulerError> {
        let settings = config.scheduler;
        let spool = Spool::new(config.postoffice, settings.hash_levels)?;
        spool.init()?;

        let mut pool = Pool::new(launcher, &settings);
        if let Some(rate) = options.fork_rate {
            pool.set_fork_rate(rate);
        }
        pool.frozen = options.freeze;

        let rules = Rules::compile(&config.entries, pool.global_max, &SystemAccounts)?;
        let select = options.select.as_deref().map(Selector::parse).transpose()?;

        let limits = options.scan_limits.unwrap_or_else(|| {
            ScanLimits::clamped(settings.scan_limit, settings.scan_time_limit_secs)
        });

        let notify = settings.notify_socket.as_deref().map(Notify::bind).transpose()?;
        let query = settings.query_socket.as_deref().map(Query::bind).transpose()?;

        tracing::info!(
            postoffice = %spool.root().display(),
            rules = rules.len(),
            global_max = pool.global_max,
            frozen = pool.frozen,
            "Scheduler configured"
        );

        Ok(Self {
            settings,
            config_path: options.config_path,
            spool,
            rules,
            graph: Graph::default(),
            pool,
            queue: DirQueue::new(limits),
            select,
            notify,
            query,
            timers: Timers::default(),
            in_mux: false,
            stats: Stats::default(),
            exit: false,
            sync_start: options.sync_start,
        })
    }

    pub const fn graph(&self) -> &Graph {
        &self.graph
    }

    pub const fn pool(&self) -> &Pool {
        &self.pool
    }

    pub const fn spool(&self) -> &Spool {
        &self.spool
    }

    pub const fn stats(&self) -> Stats {
        self.stats
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Run until told to stop
    ///
    /// # Errors
    ///
    /// Currently none; every failure inside the loop is logged and handled.
    pub fn run(&mut self) -> Result<(), SchedulerError> {
        self.startup(unix_now());

        while let Some(timeout) = self.step(unix_now()) {
            self.mux(timeout, unix_now());
        }

        self.pool.shutdown_kids();
        tracing::info!(
            delivered = self.stats.delivered,
            failed = self.stats.failed,
            expired = self.stats.expired,
            "Scheduler stopped"
        );

        Ok(())
    }

    /// First scan, recursing into hashed directories. With synchronous
    /// startup every queued job is absorbed before the first worker runs.
    pub fn startup(&mut self, now: u64) {
        self.scan(now, true, self.sync_start);

        if self.sync_start {
            let mut absorbed = 0usize;
            while self.drain_one(now) {
                absorbed += 1;
            }
            tracing::info!(absorbed, "Synchronous startup complete");
        }

        self.timers.next_idle_cleanup = now + self.settings.idle_sweep_secs;
        self.timers.next_expiry2 = now + self.settings.expiry2_sweep_secs;
        self.timers.next_report = now + self.settings.report_interval_secs;
    }

    /// One loop iteration up to the wait.
    ///
    /// Returns how long [`Scheduler::mux`] may wait, or `None` when the
    /// scheduler should stop.
    pub fn step(&mut self, now: u64) -> Option<Duration> {
        self.handle_signals(now);

        if self.exit {
            return None;
        }
        if self.pool.slow_shutdown && self.pool.is_empty() {
            tracing::info!("All workers gone, finishing slow shutdown");
            return None;
        }

        self.pool.reap_zombies();

        let sweep_idle = now >= self.timers.next_idle_cleanup;
        if now >= self.timers.next_scan {
            self.scan(now, sweep_idle, false);
        }
        self.run_timers(now);

        if self.queue.len() > 1 {
            self.drain_batch(now);
        }

        self.agenda(now);

        Some(self.timeout(now))
    }

    fn scan(&mut self, now: u64, include_subdirs: bool, unlimited: bool) {
        let spool = &self.spool;
        self.graph.prune_parked(|name| spool.control_path(name).exists());

        let graph = &self.graph;
        let found = self.queue.scan(
            &self.spool.transport_dir(),
            include_subdirs,
            &|inode| graph.is_processing(inode),
            now,
            unlimited,
        );

        let backlog = (self.queue.len() as u64 / SCAN_BACKLOG_DIVISOR).min(MAX_SCAN_BACKOFF);
        self.timers.next_scan = now + self.settings.scan_interval_secs + backlog;

        if found > 0 {
            internal!(level = DEBUG, found, queued = self.queue.len(), "Spool scanned");
        }
    }

    fn run_timers(&mut self, now: u64) {
        if now >= self.timers.next_idle_cleanup {
            self.pool.idle_cleanup(&mut self.graph, now);
            self.timers.next_idle_cleanup = now + self.settings.idle_sweep_secs;
        }
        if now >= self.timers.next_expiry2 {
            self.expiry2_sweep(now);
            self.timers.next_expiry2 = now + self.settings.expiry2_sweep_secs;
        }
        if now >= self.timers.next_report {
            self.report();
            self.timers.next_report = now + self.settings.report_interval_secs;
        }
    }

    fn report(&self) {
        tracing::info!(
            jobs = self.graph.files.iter().count(),
            vertices = self.graph.vertices.iter().count(),
            recipients = self.graph.recipient_count(),
            workers = self.pool.len(),
            queued = self.queue.len(),
            parked = self.graph.parked(),
            delivered = self.stats.delivered,
            failed = self.stats.failed,
            expired = self.stats.expired,
            "Interim report"
        );
    }

    fn timeout(&self, now: u64) -> Duration {
        let mut wake = self.timers.next_scan;

        if let Some(due) = self.queue.next_due() {
            wake = wake.min(due.max(now));
        }

        let earliest_thread = self
            .graph
            .threads
            .ids()
            .into_iter()
            .filter_map(|thread| self.graph.thread_wakeup(thread))
            .filter(|wakeup| *wakeup > now)
            .min();
        if let Some(wakeup) = earliest_thread {
            wake = wake.min(wakeup);
        }

        let timeout = Duration::from_secs(wake.saturating_sub(now));
        if self.pool.fork_rate_exhausted() {
            timeout.min(FORK_RETRY)
        } else {
            timeout
        }
    }

    /// Absorb up to `drain_batch` queued jobs within `drain_time_ms`
    fn drain_batch(&mut self, now: u64) {
        let started = Instant::now();
        let budget = Duration::from_millis(self.settings.drain_time_ms);

        for _ in 0..self.settings.drain_batch {
            if started.elapsed() > budget || !self.drain_one(now) {
                break;
            }
        }
    }

    /// Parse one due queue entry; `false` when nothing was ready
    pub(crate) fn drain_one(&mut self, now: u64) -> bool {
        match self.queue.drain(now) {
            Drained::Ready(entry) => {
                self.process_entry(&entry.name, entry.inode, now);
                true
            }
            Drained::Empty | Drained::NotReady => false,
        }
    }

    /// Read a control file and schedule its recipients
    fn process_entry(&mut self, name: &str, inode: u64, now: u64) {
        if self.graph.is_processing(inode) {
            return;
        }

        let options = ParseOptions {
            now,
            lock_backoff: self.settings.lock_backoff_secs,
            rereading: false,
        };

        let parsed = match control::load(&self.spool, name, inode, &options) {
            Ok(parsed) => parsed,
            Err(error) if error.is_structural() => {
                tracing::warn!(name, %error, "Discarding broken control file");
                self.spool.unlink_job(name, "", None);
                return;
            }
            Err(error) => {
                internal!(level = DEBUG, name, %error, "Control file unreadable, retrying later");
                return;
            }
        };

        if !parsed.turn_me.is_empty() {
            for host in &parsed.turn_me {
                self.graph.turn_me(host, now);
            }
            self.spool.unlink_job(name, "", None);
            return;
        }

        for obsolete in &parsed.obsoletes {
            self.obsolete(obsolete);
        }

        let file = self.graph.insert_file(parsed.file);
        for vertex in self.graph.build_vertices(file, &parsed.recipients) {
            self.bind(vertex);
        }

        let entry = &self.graph.files[file];
        internal!(
            level = DEBUG,
            ctl = entry.id,
            message_id = %entry.message_id,
            recipients = entry.rcpnts_work,
            "Job scheduled"
        );

        if entry.vertices.is_empty() {
            if entry.rcpnts_work > 0 {
                tracing::warn!(
                    ctl = entry.id,
                    remaining = entry.rcpnts_work,
                    "No recipient could be scheduled, leaving the job until the next reload"
                );
                let (inode, name) = (entry.id, entry.spool_name());
                self.graph.park(inode, name);
            }
            self.complete_file(file);
        }
    }

    /// Forget a superseded job and remove its control file
    fn obsolete(&mut self, name: &str) {
        let (_, base) = split_dir_hash(name);
        let Some(inode) = spool_number(base) else {
            tracing::warn!(name, "Obsoletes record names a malformed job");
            return;
        };

        let name = match self.graph.file_by_inode(inode) {
            Some(file) => self
                .graph
                .forget_file(file)
                .map_or_else(|| name.to_string(), |file| file.spool_name()),
            None => name.to_string(),
        };

        tracing::info!(name, "Removing obsoleted job");
        self.spool.unlink_job(&name, "", None);
    }

    /// Attach a vertex to the thread of the first matching rule, or drop it
    fn bind(&mut self, vertex: VertexId) {
        let (channel, host) = self.graph.destination(vertex);

        let Some(rule) = self.rules.match_entry(channel, host) else {
            tracing::warn!(
                ctl = self.graph.files[self.graph.vertices[vertex].file].id,
                channel,
                host,
                "No pattern matched, dropping recipients"
            );
            self.graph.destroy_vertex(vertex);
            return;
        };

        self.graph.bind_vertex(vertex, rule);
    }

    /// A job has no vertices left: unlink it when all work is done, else
    /// just drop it from memory
    pub(crate) fn complete_file(&mut self, file: FileId) {
        let Some(entry) = self.graph.remove_file(file) else {
            return;
        };

        if entry.rcpnts_work == 0 {
            self.spool
                .unlink_job(&entry.spool_name(), &entry.dir_hash, Some(&entry.message_id));
            self.stats.completed += 1;
            tracing::info!(
                ctl = entry.id,
                message_id = %entry.message_id,
                failed = entry.rcpnts_failed,
                "Job complete"
            );
        } else {
            internal!(
                level = DEBUG,
                ctl = entry.id,
                remaining = entry.rcpnts_work,
                "Job dropped from memory with work remaining"
            );
        }
    }

    /// Work out when a vertex that was just tried runs again
    pub(crate) fn reschedule_vertex(&mut self, vertex: VertexId, now: u64) {
        let (expiry, attempts) = {
            let v = &self.graph.vertices[vertex];
            (v.expiry, v.attempts)
        };
        if expiry > 0 && now >= expiry && attempts > 0 {
            self.expire_vertex(vertex, now);
            return;
        }

        if let Some(when) = self.graph.vertices[vertex].retry_at.take() {
            self.graph.vertices[vertex].wakeup = when.max(now);
            return;
        }

        let Some(thread) = self.graph.vertices[vertex].thread else {
            return;
        };
        let policy = Rc::clone(self.graph.policy(thread));
        let entry = &mut self.graph.vertices[vertex];
        let (wakeup, index) = retry::next_retry(&policy, entry.retry_index, now);
        entry.wakeup = wakeup;
        entry.retry_index = index;

        internal!(level = DEBUG, vertex = ?vertex, wakeup, "Vertex rescheduled");
    }

    /// Fail every remaining recipient of a vertex past its deadline
    fn expire_vertex(&mut self, vertex: VertexId, now: u64) {
        let (file, recipients, message) = {
            let v = &self.graph.vertices[vertex];
            (v.file, v.recipients.clone(), v.message.clone())
        };
        let message = message.unwrap_or_else(|| "delivery time expired".to_string());

        let (path, id) = {
            let entry = &self.graph.files[file];
            (self.spool.control_path(&entry.spool_name()), entry.id)
        };

        let states = recipients.iter().map(|offset| offset + 1).collect::<Vec<_>>();
        if let Err(error) = lock::rewrite_states(&path, &states, State::Failed) {
            tracing::error!(ctl = id, %error, "Unable to mark expired recipients failed");
        }
        for offset in &recipients {
            if let Err(error) = lock::append_diagnostic(&path, *offset, now, "expired", &message) {
                tracing::error!(ctl = id, offset, %error, "Unable to record expiry diagnostic");
            }
        }

        let entry = &mut self.graph.files[file];
        entry.rcpnts_failed += recipients.len();
        entry.rcpnts_work = entry.rcpnts_work.saturating_sub(recipients.len());
        entry.had_error = true;
        self.stats.expired += recipients.len() as u64;

        let (channel, host) = self.graph.destination(vertex);
        tracing::warn!(
            ctl = id,
            channel,
            host,
            recipients = recipients.len(),
            message = %message,
            "Recipients expired"
        );

        if let Some(file) = self.graph.destroy_vertex(vertex) {
            self.complete_file(file);
        }
    }

    /// Expire unfed vertices past their secondary deadline
    fn expiry2_sweep(&mut self, now: u64) {
        let due = self
            .graph
            .vertices
            .iter()
            .filter(|(_, v)| v.fed_by.is_none() && v.expiry2 > 0 && now >= v.expiry2)
            .map(|(id, _)| id)
            .collect::<Vec<_>>();

        for vertex in due {
            if self.graph.vertices.contains(vertex) {
                self.expire_vertex(vertex, now);
            }
        }
    }

    /// Drop a worker whose pipe closed and put its vertices back on the
    /// retry path
    pub(crate) fn reclaim_worker(&mut self, key: crate::graph::ProcKey, now: u64) {
        for vertex in self.pool.reclaim(&mut self.graph, key) {
            let Some(v) = self.graph.vertices.get_mut(vertex) else {
                continue;
            };
            v.outstanding = 0;
            v.attempts += 1;
            self.reschedule_vertex(vertex, now);
        }
    }

    /// Start or reuse workers for every thread with due work
    fn agenda(&mut self, now: u64) {
        if self.pool.frozen {
            return;
        }

        for thread in self.graph.ready_threads(now) {
            let Some(entry) = self.graph.threads.get(thread) else {
                continue;
            };
            let policy = self.graph.policy(thread);

            if policy.queue_only && !entry.turned {
                continue;
            }
            if let Some(select) = &self.select
                && !select.matches(&entry.channel, &entry.host)
            {
                continue;
            }
            let due = self.graph.due_count(thread, now);
            if entry.procs.len() >= policy.max_thread.min(due) {
                continue;
            }

            if let Err(error) = self.pool.dispatch(&mut self.graph, thread, now) {
                if error.is_transient() {
                    internal!(level = DEBUG, %error, "Worker start postponed");
                } else {
                    tracing::warn!(%error, "Unable to start worker");
                }
                if let Some(entry) = self.graph.threads.get_mut(thread) {
                    entry.pending = Some(error.to_string());
                }
            }
        }
    }

    pub(crate) fn receive_notifications(&mut self, now: u64) {
        let names = self.notify.as_ref().map(Notify::receive).unwrap_or_default();
        for name in names {
            self.receive_notify(&name, now);
        }
    }

    /// Queue a job announced by the router without waiting for a scan
    pub fn receive_notify(&mut self, name: &str, now: u64) {
        let (_, base) = split_dir_hash(name);
        let Some(inode) = spool_number(base) else {
            return;
        };
        if self.graph.is_processing(inode) {
            return;
        }

        let path = self.spool.control_path(name);
        match self.queue.insert(inode, name, &path, 0, now) {
            Inserted::Queued => internal!(level = DEBUG, name, "Notified job queued"),
            Inserted::AlreadyQueued => {}
            Inserted::NotRegular => tracing::warn!(name, "Notified job does not exist"),
        }
    }

    pub(crate) fn answer_queries(&mut self, now: u64) {
        let clients = self.query.as_ref().map(Query::accept).unwrap_or_default();
        if clients.is_empty() {
            return;
        }

        let snapshot = self.snapshot(now);
        for client in clients {
            ipc::answer(client, &snapshot);
        }
    }

    /// Text dump of threads, groups and totals
    pub fn snapshot(&self, now: u64) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# empath scheduler at {}", timestamp(now));

        for (id, thread) in self.graph.threads.iter() {
            let wakeup = match self.graph.thread_wakeup(id) {
                None => "-".to_string(),
                Some(w) if w <= now => "now".to_string(),
                Some(w) => timestamp(w),
            };
            let _ = write!(
                out,
                "thread {} {} vertices={} unfed={} workers={} wakeup={}",
                thread.channel,
                thread.host,
                self.graph.thread_vertices(id).len(),
                thread.unfed,
                thread.procs.len(),
                wakeup,
            );
            if let Some(pending) = &thread.pending {
                let _ = write!(out, " pending={pending:?}");
            }
            out.push('\n');
        }

        for (_, group) in self.graph.groups.iter() {
            let _ = writeln!(
                out,
                "group {} {} rule={} threads={} transporters={} idle={}",
                group.key.channel,
                group.key.host.as_deref().unwrap_or("*"),
                group.key.rule,
                group.threads.len(),
                group.transporters,
                group.idle.len(),
            );
        }

        for (key, proc) in self.pool.iter() {
            let _ = writeln!(
                out,
                "worker {} pid={} state={} overfed={} cmd={:?}",
                key, proc.pid, proc.state, proc.overfed, proc.cmdline
            );
        }

        let _ = writeln!(
            out,
            "total jobs={} vertices={} recipients={} workers={} queued={}",
            self.graph.files.iter().count(),
            self.graph.vertices.iter().count(),
            self.graph.recipient_count(),
            self.pool.len(),
            self.queue.len(),
        );

        out
    }

    fn handle_signals(&mut self, now: u64) {
        for pending in signal::take_pending() {
            match pending {
                Signal::Shutdown => {
                    tracing::info!("Shutdown requested");
                    self.exit = true;
                }
                Signal::SlowShutdown => {
                    tracing::info!(workers = self.pool.len(), "Slow shutdown requested");
                    self.pool.frozen = true;
                    self.pool.slow_shutdown = true;
                }
                Signal::Reload => self.reload(),
                Signal::DumpQueue => {
                    for line in self.snapshot(now).lines() {
                        tracing::info!("{line}");
                    }
                }
            }
        }
    }

    /// Re-read the configuration and swap in its entries. Vertices already
    /// bound keep their groups; new vertices get fresh ones.
    fn reload(&mut self) {
        let Some(path) = self.config_path.clone() else {
            tracing::warn!("Reload requested but no configuration file is known");
            return;
        };

        let rules = Config::load(&path).and_then(|config| {
            Rules::compile(&config.entries, self.pool.global_max, &SystemAccounts)
        });

        match rules {
            Ok(rules) => {
                tracing::info!(path = %path.display(), rules = rules.len(), "Configuration reloaded");
                self.rules = rules;
                self.graph.group_index.clear();

                let retried = self.graph.unpark_all();
                if retried > 0 {
                    tracing::info!(retried, "Parked jobs released for rescheduling");
                }
            }
            Err(error) => {
                tracing::error!(path = %path.display(), %error, "Reload failed, keeping old configuration");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{
        cell::RefCell,
        fs,
        io::{self, Read, Write},
        os::{fd::OwnedFd, unix::net::UnixStream},
        path::Path,
    };

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::Entry,
        process::{Exit, LaunchSpec, Launched},
    };

    #[derive(Default)]
    struct FakeLauncher {
        peers: Rc<RefCell<Vec<UnixStream>>>,
        pid: i32,
    }

    impl Launcher for FakeLauncher {
        fn launch(&mut self, _spec: &LaunchSpec<'_>) -> io::Result<Launched> {
            let (ours, theirs) = UnixStream::pair()?;
            theirs.set_nonblocking(true)?;
            self.peers.borrow_mut().push(theirs);
            self.pid += 1;

            Ok(Launched {
                pid: self.pid,
                to: OwnedFd::from(ours.try_clone()?),
                from: OwnedFd::from(ours),
            })
        }

        fn try_reap(&mut self, _pid: i32) -> io::Result<Option<Exit>> {
            Ok(Some(Exit::Code(0)))
        }

        fn signal(&mut self, _pid: i32, _signal: crate::process::Signal) {}
    }

    const NOW: u64 = 1_700_000_000;

    fn setup(root: &Path, entries: Vec<Entry>) -> (Scheduler, Rc<RefCell<Vec<UnixStream>>>) {
        let launcher = FakeLauncher::default();
        let peers = Rc::clone(&launcher.peers);
        let config = Config {
            postoffice: root.to_path_buf(),
            scheduler: Settings {
                max_kids: Some(10),
                ..Settings::default()
            },
            entries,
        };

        let options = Options {
            sync_start: true,
            ..Options::default()
        };

        let scheduler = Scheduler::new(config, options, Box::new(launcher)).unwrap();
        (scheduler, peers)
    }

    fn smtp(expiry: Option<u64>) -> Entry {
        Entry {
            channel: "smtp".to_string(),
            command: Some("smtp $host".to_string()),
            interval: Some(60),
            expiry,
            ..Entry::default()
        }
    }

    fn write_job(root: &Path, inode: u64, recipients: &str) {
        fs::write(root.join("queue").join(inode.to_string()), b"body").unwrap();
        fs::write(
            root.join("transport").join(inode.to_string()),
            format!("i {inode}\nl S{inode}\n{recipients}"),
        )
        .unwrap();
    }

    /// Byte offset of the first recipient record of a job
    fn offset(root: &Path, inode: u64) -> usize {
        fs::read_to_string(root.join("transport").join(inode.to_string()))
            .unwrap()
            .find("\nr")
            .unwrap()
            + 1
    }

    fn read_peer(peers: &Rc<RefCell<Vec<UnixStream>>>, index: usize) -> String {
        let mut buf = [0u8; 1024];
        match (&peers.borrow()[index]).read(&mut buf) {
            Ok(n) => String::from_utf8_lossy(&buf[..n]).into_owned(),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => String::new(),
            Err(e) => panic!("{e}"),
        }
    }

    fn say(peers: &Rc<RefCell<Vec<UnixStream>>>, index: usize, text: &str) {
        (&peers.borrow()[index]).write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn test_job_is_scheduled_and_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, peers) = setup(dir.path(), vec![smtp(None)]);
        write_job(dir.path(), 7, "r smtp a.example u\n");

        scheduler.startup(NOW);
        scheduler.step(NOW).unwrap();
        assert_eq!(scheduler.graph().vertices.iter().count(), 1);
        assert_eq!(scheduler.pool().len(), 1);

        say(&peers, 0, "#hungry\n");
        scheduler.mux(Duration::from_millis(100), NOW);
        assert_eq!(read_peer(&peers, 0), "7\n");

        let offset = offset(dir.path(), 7);
        say(&peers, 0, &format!("7/{offset}\tsmtp; 250\tok sent\n"));
        scheduler.mux(Duration::from_millis(100), NOW);

        assert_eq!(scheduler.stats().delivered, 1);
        assert_eq!(scheduler.stats().completed, 1);
        assert!(!dir.path().join("transport/7").exists());
        assert!(!dir.path().join("queue/7").exists());
    }

    #[test]
    fn test_deferral_reschedules_with_interval() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, peers) = setup(dir.path(), vec![smtp(None)]);
        write_job(dir.path(), 8, "r smtp a.example u\n");

        scheduler.startup(NOW);
        scheduler.step(NOW).unwrap();
        say(&peers, 0, "#hungry\n");
        scheduler.mux(Duration::from_millis(100), NOW);

        say(&peers, 0, &format!("8/{}\t\tdeferred try later\n", offset(dir.path(), 8)));
        scheduler.mux(Duration::from_millis(100), NOW);

        let (_, vertex) = scheduler.graph().vertices.iter().next().unwrap();
        assert!((NOW + 60..=NOW + 65).contains(&vertex.wakeup));
        assert_eq!(vertex.attempts, 1);
        assert!(vertex.fed_by.is_none());
        assert_eq!(vertex.message.as_deref(), Some("try later"));
    }

    #[test]
    fn test_repeated_deferral_counts_one_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, peers) = setup(dir.path(), vec![smtp(None)]);
        write_job(dir.path(), 8, "r smtp a.example u\n");

        scheduler.startup(NOW);
        scheduler.step(NOW).unwrap();
        say(&peers, 0, "#hungry\n");
        scheduler.mux(Duration::from_millis(100), NOW);

        let line = format!("8/{}\t\tdeferred try later\n", offset(dir.path(), 8));
        say(&peers, 0, &line);
        scheduler.mux(Duration::from_millis(100), NOW);
        say(&peers, 0, &line);
        scheduler.mux(Duration::from_millis(100), NOW);

        let (_, vertex) = scheduler.graph().vertices.iter().next().unwrap();
        assert_eq!(vertex.attempts, 1);
        assert_eq!(vertex.outstanding, 0);
        assert!(vertex.fed_by.is_none());
        assert!((NOW + 60..=NOW + 65).contains(&vertex.wakeup));
    }

    #[test]
    fn test_late_success_for_unheld_recipient_completes_job() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, peers) = setup(dir.path(), vec![smtp(None)]);
        write_job(dir.path(), 8, "r smtp a.example u\n");

        scheduler.startup(NOW);
        scheduler.step(NOW).unwrap();
        say(&peers, 0, "#hungry\n");
        scheduler.mux(Duration::from_millis(100), NOW);

        let offset = offset(dir.path(), 8);
        say(&peers, 0, &format!("8/{offset}\t\tdeferred try later\n"));
        scheduler.mux(Duration::from_millis(100), NOW);
        say(&peers, 0, &format!("8/{offset}\tsmtp; 250\tok sent after all\n"));
        scheduler.mux(Duration::from_millis(100), NOW);

        assert_eq!(scheduler.stats().delivered, 1);
        assert!(scheduler.graph().vertices.iter().next().is_none());
        assert!(!dir.path().join("transport/8").exists());
    }

    #[test]
    fn test_retryat_overrides_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, peers) = setup(dir.path(), vec![smtp(None)]);
        write_job(dir.path(), 8, "r smtp a.example u\n");

        scheduler.startup(NOW);
        scheduler.step(NOW).unwrap();
        say(&peers, 0, "#hungry\n");
        scheduler.mux(Duration::from_millis(100), NOW);

        say(
            &peers,
            0,
            &format!("8/{}\t\tretryat {} greylisted\n", offset(dir.path(), 8), NOW + 500),
        );
        scheduler.mux(Duration::from_millis(100), NOW);

        let (_, vertex) = scheduler.graph().vertices.iter().next().unwrap();
        assert_eq!(vertex.wakeup, NOW + 500);
        assert_eq!(vertex.retry_at, None);
    }

    #[test]
    fn test_expired_vertex_is_failed_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, peers) = setup(dir.path(), vec![smtp(Some(1))]);
        write_job(dir.path(), 9, "r smtp a.example u\n");

        let later = unix_now() + 10;
        scheduler.startup(later);
        scheduler.step(later).unwrap();
        say(&peers, 0, "#hungry\n");
        scheduler.mux(Duration::from_millis(100), later);

        say(&peers, 0, &format!("9/{}\t\tdeferred no route\n", offset(dir.path(), 9)));
        scheduler.mux(Duration::from_millis(100), later);

        assert_eq!(scheduler.stats().expired, 1);
        assert!(scheduler.graph().vertices.iter().next().is_none());

        // Failed recipients leave work at zero, so the job is removed
        assert!(!dir.path().join("transport/9").exists());
    }

    #[test]
    fn test_worker_exit_reschedules_held_vertex() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, peers) = setup(dir.path(), vec![smtp(None)]);
        write_job(dir.path(), 11, "r smtp a.example u\n");

        scheduler.startup(NOW);
        scheduler.step(NOW).unwrap();
        say(&peers, 0, "#hungry\n");
        scheduler.mux(Duration::from_millis(100), NOW);

        peers.borrow_mut().clear();
        scheduler.mux(Duration::from_millis(100), NOW);

        assert!(scheduler.pool().is_empty());
        let (_, vertex) = scheduler.graph().vertices.iter().next().unwrap();
        assert!(vertex.fed_by.is_none());
        assert_eq!(vertex.attempts, 1);
        assert!((NOW + 60..=NOW + 65).contains(&vertex.wakeup));
    }

    #[test]
    fn test_unmatched_destination_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, _peers) = setup(dir.path(), vec![smtp(None)]);
        write_job(dir.path(), 12, "r local - user\n");

        scheduler.startup(NOW);
        scheduler.step(NOW).unwrap();

        assert!(scheduler.graph().vertices.iter().next().is_none());
        assert!(scheduler.graph().files.iter().next().is_none());
        assert!(scheduler.pool().is_empty());
        // Work remains, so the files stay for a later configuration
        assert!(dir.path().join("transport/12").exists());
    }

    #[test]
    fn test_unmatched_job_is_not_rescanned() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, _peers) = setup(dir.path(), vec![smtp(None)]);
        write_job(dir.path(), 12, "r local - user\n");

        scheduler.startup(NOW);
        scheduler.step(NOW).unwrap();
        assert_eq!(scheduler.graph().parked(), 1);

        for k in 1..=3 {
            scheduler.step(NOW + 3600 * k).unwrap();
            assert_eq!(scheduler.queued(), 0, "rescanned at step {k}");
        }
        assert!(scheduler.graph().files.iter().next().is_none());

        scheduler.receive_notify("12", NOW + 3600 * 4);
        assert_eq!(scheduler.queued(), 0);
    }

    #[test]
    fn test_job_without_usable_recipients_is_not_rescanned() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, _peers) = setup(dir.path(), vec![smtp(None)]);
        write_job(dir.path(), 14, "r smtp\n");

        scheduler.startup(NOW);
        scheduler.step(NOW + 3600).unwrap();

        assert_eq!(scheduler.queued(), 0);
        assert!(dir.path().join("transport/14").exists());
    }

    #[test]
    fn test_parked_job_is_released_by_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, _peers) = setup(dir.path(), vec![smtp(None)]);
        write_job(dir.path(), 12, "r local - user\n");

        scheduler.startup(NOW);
        scheduler.step(NOW).unwrap();
        assert_eq!(scheduler.graph().parked(), 1);

        let config = dir.path().join("empath.ron");
        fs::write(
            &config,
            format!(
                r#"Empath (
                    postoffice: "{}",
                    entries: [(channel: "local", command: Some("local"))],
                )"#,
                dir.path().display()
            ),
        )
        .unwrap();
        scheduler.config_path = Some(config);
        scheduler.reload();

        assert_eq!(scheduler.graph().parked(), 0);
        scheduler.step(NOW + 3600).unwrap();
        assert_eq!(scheduler.queued(), 1);
    }

    #[test]
    fn test_removed_parked_job_is_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, _peers) = setup(dir.path(), vec![smtp(None)]);
        write_job(dir.path(), 12, "r local - user\n");

        scheduler.startup(NOW);
        scheduler.step(NOW).unwrap();
        assert_eq!(scheduler.graph().parked(), 1);

        fs::remove_file(dir.path().join("transport/12")).unwrap();
        scheduler.step(NOW + 3600).unwrap();
        assert_eq!(scheduler.graph().parked(), 0);
    }

    #[test]
    fn test_broken_control_file_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, _peers) = setup(dir.path(), vec![smtp(None)]);
        fs::write(dir.path().join("transport/13"), "l x\nr smtp a b\n").unwrap();

        scheduler.startup(NOW);
        scheduler.step(NOW).unwrap();

        assert!(!dir.path().join("transport/13").exists());
    }

    #[test]
    fn test_turn_me_wakes_queue_only_thread() {
        let dir = tempfile::tempdir().unwrap();
        let entry = Entry {
            queue_only: Some(true),
            ..smtp(None)
        };
        let (mut scheduler, _peers) = setup(dir.path(), vec![entry]);
        write_job(dir.path(), 14, "r smtp relay.example u\n");

        scheduler.startup(NOW);
        scheduler.step(NOW).unwrap();
        assert!(scheduler.pool().is_empty());

        fs::write(dir.path().join("transport/15"), "T relay.example\n").unwrap();
        scheduler.receive_notify("15", NOW);
        assert_eq!(scheduler.queued(), 1);
        scheduler.mux(Duration::ZERO, NOW);
        scheduler.step(NOW).unwrap();

        assert_eq!(scheduler.pool().len(), 1);
        assert!(!dir.path().join("transport/15").exists());
    }

    #[test]
    fn test_frozen_scheduler_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, _peers) = setup(dir.path(), vec![smtp(None)]);
        write_job(dir.path(), 16, "r smtp a.example u\n");

        scheduler.pool.frozen = true;
        scheduler.startup(NOW);
        scheduler.step(NOW).unwrap();

        assert!(scheduler.pool().is_empty());
        assert_eq!(scheduler.graph().vertices.iter().count(), 1);
    }

    #[test]
    fn test_snapshot_lists_threads() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, _peers) = setup(dir.path(), vec![smtp(None)]);
        write_job(dir.path(), 17, "r smtp a.example u\nr smtp b.example v\n");

        scheduler.pool.frozen = true;
        scheduler.startup(NOW);
        scheduler.step(NOW).unwrap();

        let snapshot = scheduler.snapshot(NOW);
        assert!(snapshot.contains("thread smtp a.example vertices=1 unfed=1 workers=0 wakeup=now"));
        assert!(snapshot.contains("thread smtp b.example"));
        assert!(snapshot.contains("total jobs=1 vertices=2 recipients=2 workers=0 queued=0"));
    }

    #[test]
    #[should_panic(expected = "re-entered")]
    fn test_mux_reentry_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, _peers) = setup(dir.path(), vec![smtp(None)]);

        scheduler.in_mux = true;
        scheduler.mux(Duration::ZERO, NOW);
    }
}
