//! Threads and thread groups.
//!
//! A thread group is one matched configuration entry applied to one channel
//! (and one host, when the entry's command names the host). It owns the
//! resolved policy, the count of running workers and the chain of idle
//! workers that any of its threads may pick up.
//!
//! A thread is the FIFO of vertices for one `(channel, host)` inside a
//! group. Workers attach to a thread and are fed from it until it runs dry.

use std::{collections::VecDeque, rc::Rc};

use empath_common::{internal, tracing};

use crate::{
    config::{Policy, Rule},
    graph::{Chain, ChainHead, Graph, GroupId, ProcKey, ThreadId, VertexId, members, push_back, unlink},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    /// Index of the matched entry
    pub rule: usize,
    pub channel: String,
    /// Only set when the command binds the host
    pub host: Option<String>,
}

#[derive(Debug)]
pub struct ThreadGroup {
    pub key: GroupKey,
    pub policy: Rc<Policy>,
    pub threads: Vec<ThreadId>,
    /// Parked workers, oldest first
    pub idle: VecDeque<ProcKey>,
    /// Live workers of this group, attached or idle
    pub transporters: usize,
}

#[derive(Debug)]
pub struct Thread {
    pub group: GroupId,
    pub channel: String,
    pub host: String,
    pub vertices: ChainHead,
    /// Vertices not currently handed to a worker
    pub unfed: usize,
    /// Workers attached to this thread
    pub procs: Vec<ProcKey>,
    /// Why the last attempt to start a worker failed
    pub pending: Option<String>,
    /// Woken by a turn-me request; ignores `queue_only`
    pub turned: bool,
}

impl Graph {
    /// Place a vertex at the tail of the thread for its destination,
    /// creating the thread and group on first use, and compute its
    /// expiry deadlines from the policy.
    pub fn bind_vertex(&mut self, id: VertexId, rule: &Rule) -> ThreadId {
        let (channel, host) = {
            let (channel, host) = self.destination(id);
            (channel.to_string(), host.to_string())
        };

        let key = GroupKey {
            rule: rule.index,
            channel: channel.clone(),
            host: rule.policy.binds_host().then(|| host.clone()),
        };

        let group = match self.group_index.get(&key) {
            Some(group) => *group,
            None => {
                let group = self.groups.insert(ThreadGroup {
                    key: key.clone(),
                    policy: Rc::clone(&rule.policy),
                    threads: Vec::new(),
                    idle: VecDeque::new(),
                    transporters: 0,
                });
                self.group_index.insert(key, group);
                internal!(level = DEBUG, channel = %channel, rule = rule.index, "Thread group created");
                group
            }
        };

        let index = (group, channel, host);
        let thread = match self.thread_index.get(&index) {
            Some(thread) => *thread,
            None => {
                let thread = self.threads.insert(Thread {
                    group,
                    channel: index.1.clone(),
                    host: index.2.clone(),
                    vertices: ChainHead::default(),
                    unfed: 0,
                    procs: Vec::new(),
                    pending: None,
                    turned: false,
                });
                self.groups[group].threads.push(thread);
                self.thread_index.insert(index, thread);
                thread
            }
        };

        let mtime = self.files[self.vertices[id].file].mtime;
        let (expiry, expiry2) = rule.policy.deadlines(mtime);

        push_back(
            &mut self.vertices,
            &mut self.threads[thread].vertices,
            Chain::Thread,
            id,
        );

        let vertex = &mut self.vertices[id];
        vertex.thread = Some(thread);
        vertex.expiry = expiry;
        vertex.expiry2 = expiry2;
        if vertex.fed_by.is_none() {
            self.threads[thread].unfed += 1;
        }

        thread
    }

    /// Take a vertex off its thread without pruning the thread
    pub fn unlink_from_thread(&mut self, id: VertexId) -> Option<ThreadId> {
        let thread = self.vertices[id].thread.take()?;

        unlink(
            &mut self.vertices,
            &mut self.threads[thread].vertices,
            Chain::Thread,
            id,
        );
        if self.vertices[id].fed_by.is_none() {
            self.threads[thread].unfed -= 1;
        }

        Some(thread)
    }

    /// Record that `proc` now holds the vertex
    pub fn mark_fed(&mut self, id: VertexId, proc: ProcKey) {
        let vertex = &mut self.vertices[id];
        if vertex.fed_by.replace(proc).is_none()
            && let Some(thread) = vertex.thread
        {
            self.threads[thread].unfed -= 1;
        }
    }

    /// Return the vertex to its thread's pool of unfed work
    pub fn mark_unfed(&mut self, id: VertexId) {
        let vertex = &mut self.vertices[id];
        if vertex.fed_by.take().is_some()
            && let Some(thread) = vertex.thread
        {
            self.threads[thread].unfed += 1;
        }
    }

    pub fn policy(&self, thread: ThreadId) -> &Rc<Policy> {
        &self.groups[self.threads[thread].group].policy
    }

    pub fn thread_vertices(&self, thread: ThreadId) -> Vec<VertexId> {
        members(&self.vertices, &self.threads[thread].vertices, Chain::Thread)
    }

    /// Unfed vertices of a thread in FIFO order
    fn unfed_vertices(&self, thread: ThreadId) -> impl Iterator<Item = VertexId> + '_ {
        self.thread_vertices(thread)
            .into_iter()
            .filter(|id| self.vertices[*id].fed_by.is_none())
    }

    /// The next vertex to hand to a worker: the oldest unfed vertex that
    /// is due
    pub fn next_vertex(&self, thread: ThreadId, now: u64) -> Option<VertexId> {
        self.unfed_vertices(thread)
            .find(|id| self.vertices[*id].wakeup <= now)
    }

    /// Unfed vertices of a thread that are due
    pub fn due_count(&self, thread: ThreadId, now: u64) -> usize {
        self.unfed_vertices(thread)
            .filter(|id| self.vertices[*id].wakeup <= now)
            .count()
    }

    /// Earliest wakeup among a thread's unfed vertices
    pub fn thread_wakeup(&self, thread: ThreadId) -> Option<u64> {
        self.unfed_vertices(thread)
            .map(|id| self.vertices[id].wakeup)
            .min()
    }

    /// Threads with due, unfed work
    pub fn ready_threads(&self, now: u64) -> Vec<ThreadId> {
        self.threads
            .iter()
            .filter(|(_, thread)| thread.unfed > 0)
            .map(|(id, _)| id)
            .filter(|id| self.next_vertex(*id, now).is_some())
            .collect()
    }

    /// Find another thread of `group` a worker coming off `exclude` can
    /// serve: due work and room under the per-thread limit
    pub fn pick_next_thread(
        &self,
        group: GroupId,
        now: u64,
        exclude: Option<ThreadId>,
    ) -> Option<ThreadId> {
        let group = self.groups.get(group)?;

        group.threads.iter().copied().find(|id| {
            Some(*id) != exclude
                && self.threads[*id].procs.len() < group.policy.max_thread
                && (!group.policy.queue_only || self.threads[*id].turned)
                && self.next_vertex(*id, now).is_some()
        })
    }

    /// Delete a thread with no vertices and no workers, then its group if
    /// that was the group's last thread
    pub fn prune_thread(&mut self, id: ThreadId) {
        let Some(thread) = self.threads.get(id) else {
            return;
        };
        if !thread.vertices.is_empty() || !thread.procs.is_empty() {
            return;
        }

        let group = thread.group;
        if let Some(thread) = self.threads.remove(id) {
            let index = (group, thread.channel, thread.host);
            if self.thread_index.get(&index) == Some(&id) {
                self.thread_index.remove(&index);
            }
        }

        if let Some(group) = self.groups.get_mut(group) {
            group.threads.retain(|t| *t != id);
        }
        self.prune_group(group);
    }

    /// Delete a group with no threads and no workers
    pub fn prune_group(&mut self, id: GroupId) {
        let Some(group) = self.groups.get(id) else {
            return;
        };
        if !group.threads.is_empty() || group.transporters > 0 || !group.idle.is_empty() {
            return;
        }

        if let Some(group) = self.groups.remove(id) {
            if self.group_index.get(&group.key) == Some(&id) {
                self.group_index.remove(&group.key);
            }
            internal!(level = DEBUG, channel = %group.key.channel, "Thread group released");
        }
    }

    /// Wake every thread for `host` now, bypassing `queue_only`.
    ///
    /// Returns the number of threads woken.
    pub fn turn_me(&mut self, host: &str, now: u64) -> usize {
        let threads = self
            .threads
            .iter()
            .filter(|(_, thread)| thread.host.eq_ignore_ascii_case(host))
            .map(|(id, _)| id)
            .collect::<Vec<_>>();

        for thread in &threads {
            self.threads[*thread].turned = true;
            for vertex in self.thread_vertices(*thread) {
                if self.vertices[vertex].fed_by.is_none() {
                    self.vertices[vertex].wakeup = now;
                }
            }
        }

        if !threads.is_empty() {
            tracing::info!(host, threads = threads.len(), "Turn-me request woke threads");
        }

        threads.len()
    }
}
