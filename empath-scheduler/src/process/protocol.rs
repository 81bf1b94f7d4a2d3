//! The worker state machine.
//!
//! A worker asks for work by writing `#hungry`. Every command written to
//! it raises its `overfed` count and every `#hungry` lowers it, so the
//! count is the number of commands the worker has not caught up with.
//!
//! ```text
//! LARVA --first feed--> STUFFING --thread dry--> FINISHING --+--> STUFFING (other thread)
//!                                                            +--> IDLE (`#idle` sent)
//! ```

use std::{fs::File, os::fd::AsRawFd};

use empath_common::{internal, outgoing, tracing};

use super::{
    Pool, ProcState, ProcessInfo, Zombie, argv,
    launcher::{LaunchSpec, Signal},
    log_exit, set_nonblocking,
};
use crate::{
    error::WorkerError,
    graph::{Graph, GroupId, ProcKey, ThreadId, VertexId, WebId, WebKind},
    spool,
};

const IDLE_MARKER: &[u8] = b"#idle\n";
const SHUTDOWN_MARKER: &[u8] = b"\n";

fn adjust_kids(graph: &mut Graph, from: WebId, to: WebId) {
    if from == to {
        return;
    }

    if let Some(web) = graph.webs.get_mut(from) {
        web.kids = web.kids.saturating_sub(1);
    }
    graph.release_web(from);
    graph.webs[to].kids += 1;
}

impl Pool {
    /// Hook a worker onto a thread, moving its web accounting along
    fn attach(&mut self, graph: &mut Graph, key: ProcKey, thread: ThreadId) {
        let (channel, host) = {
            let thread = &graph.threads[thread];
            (thread.channel.clone(), thread.host.clone())
        };
        let (channel, host) = graph.webs_for(&channel, &host);

        if let Some(proc) = self.procs.get_mut(&key) {
            adjust_kids(graph, proc.channel, channel);
            adjust_kids(graph, proc.host, host);
            proc.channel = channel;
            proc.host = host;
            proc.thread = Some(thread);
            graph.threads[thread].procs.push(key);
        }
    }

    /// Take a worker off its thread, returning the thread
    fn detach(&mut self, graph: &mut Graph, key: ProcKey) -> Option<ThreadId> {
        let thread = self.procs.get_mut(&key)?.thread.take()?;

        if let Some(thread) = graph.threads.get_mut(thread) {
            thread.procs.retain(|k| *k != key);
        }

        Some(thread)
    }

    fn has_work(&self, graph: &Graph, key: ProcKey, now: u64) -> bool {
        self.procs
            .get(&key)
            .and_then(|proc| proc.thread)
            .is_some_and(|thread| graph.next_vertex(thread, now).is_some())
    }

    /// Queue the next vertex of the worker's thread and try to write it
    ///
    /// # Errors
    ///
    /// If the worker has no feed pipe, or the write fails.
    fn feed(&mut self, graph: &mut Graph, key: ProcKey, now: u64) -> Result<(), WorkerError> {
        let Some(proc) = self.procs.get_mut(&key) else {
            return Ok(());
        };
        let Some(thread) = proc.thread else {
            return Ok(());
        };
        let Some(vertex) = graph.next_vertex(thread, now) else {
            return Ok(());
        };
        if proc.writer.is_none() {
            return Err(WorkerError::Write {
                pid: proc.pid,
                source: std::io::ErrorKind::BrokenPipe.into(),
            });
        }

        let line = if self.slow_shutdown {
            String::from("\n")
        } else {
            job_line(graph, vertex, thread)
        };

        proc.outbuf.extend_from_slice(line.as_bytes());
        proc.overfed += 1;
        proc.feedtime = now;

        outgoing!(level = DEBUG, pid = proc.pid, command = %line.trim_end(), "Feeding worker");

        let file = &graph.files[graph.vertices[vertex].file];
        spool::verbose_note(
            file.verbose.as_deref(),
            &format!("Feeding to child; cmd: {}", proc.cmdline),
        );

        graph.mark_fed(vertex, key);
        let vertex = &mut graph.vertices[vertex];
        vertex.outstanding = vertex.recipients.len();
        vertex.deferred = false;
        vertex.retry_at = None;

        let pid = proc.pid;
        proc.flush_output()
            .map_err(|source| WorkerError::Write { pid, source })
    }

    /// React to a `#hungry` from a worker
    pub fn on_hungry(&mut self, graph: &mut Graph, key: ProcKey, now: u64) {
        let Some(proc) = self.procs.get_mut(&key) else {
            return;
        };

        proc.hungertime = now;
        proc.overfed = proc.overfed.saturating_sub(1);

        if proc.writer.is_none() {
            return;
        }

        if let Err(error) = self.advance(graph, key, now) {
            self.fail(key, &error);
        }
    }

    fn set_state(&mut self, key: ProcKey, state: ProcState) {
        if let Some(proc) = self.procs.get_mut(&key) {
            proc.state = state;
        }
    }

    fn advance(&mut self, graph: &mut Graph, key: ProcKey, now: u64) -> Result<(), WorkerError> {
        loop {
            let Some(proc) = self.procs.get(&key) else {
                return Ok(());
            };
            let (state, overfed, group, thread) = (proc.state, proc.overfed, proc.group, proc.thread);

            match state {
                ProcState::Larva => {
                    if let Some(proc) = self.procs.get_mut(&key) {
                        proc.overfed = 0;
                        proc.state = ProcState::Stuffing;
                    }

                    if self.has_work(graph, key, now) {
                        return self.feed(graph, key, now);
                    }
                }

                ProcState::Stuffing => {
                    if overfed > 0 {
                        return Ok(());
                    }

                    if !self.has_work(graph, key, now) {
                        self.set_state(key, ProcState::Finishing);
                        continue;
                    }

                    let overfeed = thread.map_or(1, |thread| graph.policy(thread).overfeed);

                    while self.has_work(graph, key, now) {
                        self.feed(graph, key, now)?;

                        let Some(proc) = self.procs.get(&key) else {
                            break;
                        };
                        if proc.state != ProcState::Stuffing
                            || proc.wants_write()
                            || proc.overfed >= overfeed
                        {
                            break;
                        }
                    }

                    return Ok(());
                }

                ProcState::Finishing => {
                    if overfed > 0 {
                        return Ok(());
                    }

                    let previous = self.detach(graph, key);
                    if let Some(next) = graph.pick_next_thread(group, now, previous) {
                        self.attach(graph, key, next);
                        if let Some(previous) = previous {
                            graph.prune_thread(previous);
                        }

                        internal!(
                            level = DEBUG,
                            key,
                            channel = %graph.threads[next].channel,
                            host = %graph.threads[next].host,
                            "Worker moved to another thread"
                        );

                        self.set_state(key, ProcState::Stuffing);
                        return self.feed(graph, key, now);
                    }

                    if let Some(previous) = previous {
                        self.attach(graph, key, previous);
                    }

                    let marker = if self.slow_shutdown {
                        SHUTDOWN_MARKER
                    } else {
                        IDLE_MARKER
                    };
                    let Some(proc) = self.procs.get_mut(&key) else {
                        return Ok(());
                    };
                    proc.outbuf.extend_from_slice(marker);
                    proc.state = ProcState::Idle;
                    proc.overfed += 1;

                    outgoing!(level = DEBUG, pid = proc.pid, "Parking worker");

                    let pid = proc.pid;
                    return proc
                        .flush_output()
                        .map_err(|source| WorkerError::Write { pid, source });
                }

                ProcState::Idle => {
                    assert!(
                        overfed == 0,
                        "idle worker {} still has {overfed} unanswered commands",
                        proc.pid,
                    );

                    if let Some(proc) = self.procs.get_mut(&key) {
                        proc.idle_since = now;
                    }

                    let previous = self.detach(graph, key);
                    graph.groups[group].idle.push_back(key);
                    if let Some(previous) = previous {
                        graph.prune_thread(previous);
                    }

                    return Ok(());
                }

                ProcState::Error => {
                    if let Some(proc) = self.procs.get_mut(&key) {
                        proc.writer = None;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Give a thread a worker: an idle one of its group if there is one,
    /// otherwise a new one when every limit allows.
    ///
    /// Returns whether a worker was put on the thread.
    ///
    /// # Errors
    ///
    /// The reason a new worker could not be started.
    pub fn dispatch(&mut self, graph: &mut Graph, thread: ThreadId, now: u64) -> Result<bool, WorkerError> {
        let group = graph.threads[thread].group;

        while let Some(key) = graph.groups[group].idle.pop_front() {
            let Some(proc) = self.procs.get_mut(&key) else {
                continue;
            };
            if proc.writer.is_none() {
                continue;
            }

            proc.state = ProcState::Stuffing;
            self.attach(graph, key, thread);
            internal!(level = DEBUG, key, "Idle worker reused");

            if let Err(error) = self.feed(graph, key, now) {
                self.fail(key, &error);
            }
            return Ok(true);
        }

        if !self.within_limits(graph, thread, group) {
            return Ok(false);
        }

        self.start_child(graph, thread, now).map(|()| true)
    }

    fn within_limits(&self, graph: &Graph, thread: ThreadId, group: GroupId) -> bool {
        let group = &graph.groups[group];
        let policy = &group.policy;
        let thread = &graph.threads[thread];

        group.transporters < policy.max_kids
            && self.procs.len() < self.global_max
            && graph.kids(WebKind::Channel, &thread.channel) < policy.max_channel
            && graph.kids(WebKind::Host, &thread.host) < policy.max_host
    }

    /// Start a new worker for a thread
    ///
    /// # Errors
    ///
    /// The pool is frozen or rate limited, the command is missing or does
    /// not expand, or the process could not be started.
    pub fn start_child(&mut self, graph: &mut Graph, thread: ThreadId, now: u64) -> Result<(), WorkerError> {
        if self.frozen {
            return Err(WorkerError::Frozen);
        }
        if !self.fork_rate.try_acquire() {
            return Err(WorkerError::ForkRateLimit);
        }

        let policy = std::rc::Rc::clone(graph.policy(thread));
        let template = policy.command.as_deref().ok_or(WorkerError::NoCommand)?;
        let (channel, host) = {
            let thread = &graph.threads[thread];
            (thread.channel.clone(), thread.host.clone())
        };

        let command = argv::expand(template, &channel, &host, &self.environment, &self.mailbin)?;
        let launched = self
            .launcher
            .launch(&LaunchSpec {
                command: &command,
                uid: policy.uid,
                gid: policy.gid,
                priority: policy.priority,
            })
            .map_err(WorkerError::ForkFailure)?;

        let reader = File::from(launched.from);
        let writer = File::from(launched.to);
        set_nonblocking(&reader).map_err(WorkerError::ForkFailure)?;
        set_nonblocking(&writer).map_err(WorkerError::ForkFailure)?;

        let key = reader.as_raw_fd();
        let (channel_web, host_web) = graph.webs_for(&channel, &host);
        graph.webs[channel_web].kids += 1;
        graph.webs[host_web].kids += 1;

        let group = graph.threads[thread].group;
        graph.groups[group].transporters += 1;
        graph.threads[thread].procs.push(key);
        graph.threads[thread].pending = None;

        tracing::info!(
            pid = launched.pid,
            channel = %channel,
            host = %host,
            cmdline = %command.snapshot(),
            "Transport agent started"
        );

        self.procs.insert(
            key,
            ProcessInfo {
                pid: launched.pid,
                reader,
                writer: Some(writer),
                state: ProcState::Larva,
                overfed: 1,
                outbuf: Vec::new(),
                carryover: Vec::new(),
                thread: Some(thread),
                group,
                channel: channel_web,
                host: host_web,
                hungertime: now,
                feedtime: 0,
                idle_since: 0,
                cmdline: command.snapshot(),
            },
        );

        Ok(())
    }

    /// Forget a worker whose pipe hit end of file or a hard error.
    ///
    /// Returns the vertices it still held; they go back through the retry
    /// path.
    pub fn reclaim(&mut self, graph: &mut Graph, key: ProcKey) -> Vec<VertexId> {
        let Some(proc) = self.procs.remove(&key) else {
            return Vec::new();
        };

        if !proc.carryover.is_empty() {
            tracing::warn!(
                pid = proc.pid,
                bytes = proc.carryover.len(),
                "Worker exited with a partial line, discarding it"
            );
        }

        for web in [proc.channel, proc.host] {
            if let Some(web) = graph.webs.get_mut(web) {
                web.kids = web.kids.saturating_sub(1);
            }
            graph.release_web(web);
        }

        match proc.thread {
            Some(thread) => {
                if let Some(thread) = graph.threads.get_mut(thread) {
                    thread.procs.retain(|k| *k != key);
                }
            }
            None => {
                if let Some(group) = graph.groups.get_mut(proc.group) {
                    group.idle.retain(|k| *k != key);
                }
            }
        }

        let held = graph
            .vertices
            .iter()
            .filter(|(_, vertex)| vertex.fed_by == Some(key))
            .map(|(id, _)| id)
            .collect::<Vec<_>>();
        for vertex in &held {
            graph.mark_unfed(*vertex);
        }

        if let Some(thread) = proc.thread {
            graph.prune_thread(thread);
        }
        if let Some(group) = graph.groups.get_mut(proc.group) {
            group.transporters = group.transporters.saturating_sub(1);
        }
        graph.prune_group(proc.group);

        match self.launcher.try_reap(proc.pid) {
            Ok(Some(exit)) => log_exit(proc.pid, &proc.cmdline, exit),
            Ok(None) => self.zombies.push(Zombie {
                pid: proc.pid,
                cmdline: proc.cmdline,
            }),
            Err(e) => tracing::warn!(pid = proc.pid, "Unable to reap worker: {e}"),
        }

        held
    }

    /// Tell every worker to leave: a blank line, end of file on its
    /// feed pipe, and `SIGQUIT`
    pub fn shutdown_kids(&mut self) {
        for proc in self.procs.values_mut() {
            if proc.writer.is_none() {
                continue;
            }

            proc.outbuf.extend_from_slice(b"\n\n");
            if let Err(e) = proc.flush_output() {
                internal!(level = DEBUG, pid = proc.pid, "Shutdown write failed: {e}");
            }
            proc.writer = None;
            proc.outbuf.clear();

            self.launcher.signal(proc.pid, Signal::SIGQUIT);
        }
    }

    /// Close idle workers parked longer than their group's `idlemax`
    pub fn idle_cleanup(&mut self, graph: &mut Graph, now: u64) {
        for group in graph.groups.values_mut() {
            let idlemax = group.policy.idlemax;
            let procs = &mut self.procs;

            group.idle.retain(|key| {
                let Some(proc) = procs.get_mut(key) else {
                    return false;
                };
                if now.saturating_sub(proc.idle_since) <= idlemax {
                    return true;
                }

                internal!(level = DEBUG, pid = proc.pid, "Closing idle worker");
                proc.outbuf.extend_from_slice(SHUTDOWN_MARKER);
                if let Err(e) = proc.flush_output() {
                    internal!(level = DEBUG, pid = proc.pid, "Idle shutdown write failed: {e}");
                }
                proc.writer = None;
                proc.outbuf.clear();
                proc.state = ProcState::Error;
                false
            });
        }
    }
}

/// The command telling a worker about a vertex
fn job_line(graph: &Graph, vertex: VertexId, thread: ThreadId) -> String {
    let file = &graph.files[graph.vertices[vertex].file];

    if graph.policy(thread).binds_host() {
        format!("{}\n", file.spool_name())
    } else {
        let (_, host) = graph.destination(vertex);
        format!("{}\t{host}\n", file.spool_name())
    }
}
