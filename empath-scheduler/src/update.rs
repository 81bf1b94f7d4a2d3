//! Reports from transport agents.
//!
//! ```text
//! #hungry
//! #resync A/12345
//! 12345/210\tnotary-text\tok delivered
//! 12345/260\t\tretryat 1700003600 try again later
//! ```

use empath_common::{incoming, internal, tracing};

use crate::{
    graph::{FileId, ProcKey, VertexId},
    retry,
    scheduler::Scheduler,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Ok2,
    Ok3,
    Error,
    Error2,
    Deferred,
    DeferAll,
    /// Retry no earlier than this unix time
    RetryAt(u64),
}

impl Status {
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::Ok2 | Self::Ok3)
    }

    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Error | Self::Error2)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine<'a> {
    /// Control file number
    pub inode: u64,
    /// Byte offset of the recipient record
    pub offset: usize,
    pub notary: &'a str,
    pub status: Status,
    pub message: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report<'a> {
    Hungry,
    Resync(&'a str),
    Status(StatusLine<'a>),
    /// Any other `#` line
    Comment(&'a str),
    Malformed(&'a str),
}

fn parse_status(line: &str) -> Option<StatusLine<'_>> {
    let mut fields = line.splitn(3, '\t');
    let (inode, offset) = fields.next()?.split_once('/')?;
    let notary = fields.next()?;
    let rest = fields.next()?;

    let (word, message) = rest.split_once(' ').unwrap_or((rest, ""));
    let message = message.trim();

    let (status, message) = match word {
        "ok" => (Status::Ok, message),
        "ok2" => (Status::Ok2, message),
        "ok3" => (Status::Ok3, message),
        "error" => (Status::Error, message),
        "error2" => (Status::Error2, message),
        "deferred" => (Status::Deferred, message),
        "deferall" => (Status::DeferAll, message),
        "retryat" => {
            let (when, message) = message.split_once(' ').unwrap_or((message, ""));
            match when.parse() {
                Ok(when) => (Status::RetryAt(when), message.trim()),
                Err(_) => (Status::Deferred, message.trim()),
            }
        }
        _ => return None,
    };

    Some(StatusLine {
        inode: inode.trim().parse().ok()?,
        offset: offset.trim().parse().ok()?,
        notary,
        status,
        message,
    })
}

/// Classify one line written by a transport agent
pub fn parse_line(line: &str) -> Report<'_> {
    let line = line.trim_end_matches('\r');

    if line == "#hungry" {
        return Report::Hungry;
    }
    if let Some(name) = line.strip_prefix("#resync ") {
        return Report::Resync(name.trim());
    }
    if let Some(comment) = line.strip_prefix('#') {
        return Report::Comment(comment);
    }

    parse_status(line).map_or(Report::Malformed(line), Report::Status)
}

impl Scheduler {
    /// Act on one line from worker `key`
    pub(crate) fn handle_line(&mut self, key: ProcKey, line: &str, now: u64) {
        incoming!(level = DEBUG, key, line, "Worker report");

        match parse_line(line) {
            Report::Hungry => self.pool.on_hungry(&mut self.graph, key, now),
            Report::Resync(name) => self.resync(name, now),
            Report::Status(status) => self.apply_status(key, &status, now),
            Report::Comment(text) => internal!(level = DEBUG, key, text, "Worker comment"),
            Report::Malformed(text) => {
                tracing::warn!(key, line = text, "Ignoring malformed worker report");
            }
        }
    }

    fn apply_status(&mut self, key: ProcKey, report: &StatusLine<'_>, now: u64) {
        let Some(file) = self.graph.file_by_inode(report.inode) else {
            tracing::warn!(
                key,
                ctl = report.inode,
                "Status report for a job that is not scheduled"
            );
            return;
        };
        let Some(vertex) = self.graph.vertex_for_offset(file, report.offset) else {
            tracing::warn!(
                key,
                ctl = report.inode,
                offset = report.offset,
                "Status report for an unknown recipient"
            );
            return;
        };

        let holder = self.graph.vertices[vertex].fed_by;
        if holder != Some(key) {
            tracing::warn!(
                key,
                holder = ?holder,
                ctl = report.inode,
                offset = report.offset,
                status = ?report.status,
                "Status report from a worker not holding the recipient"
            );

            // A final result still counts once nobody else holds the recipient
            let terminal = report.status.is_success() || report.status.is_failure();
            if holder.is_none() && terminal {
                self.record_outcome(vertex, file, report, now);
                if self.graph.vertices[vertex].recipients.is_empty()
                    && let Some(file) = self.graph.destroy_vertex(vertex)
                {
                    self.complete_file(file);
                }
            }
            return;
        }

        self.record_outcome(vertex, file, report, now);

        let vertex_ref = &mut self.graph.vertices[vertex];
        vertex_ref.outstanding = vertex_ref.outstanding.saturating_sub(1);
        if vertex_ref.outstanding == 0 {
            self.finish_feed(vertex, now);
        }
    }

    fn record_outcome(
        &mut self,
        vertex: VertexId,
        file: FileId,
        report: &StatusLine<'_>,
        now: u64,
    ) {
        let (channel, host) = {
            let (channel, host) = self.graph.destination(vertex);
            (channel.to_string(), host.to_string())
        };

        match report.status {
            status if status.is_success() => {
                self.remove_recipient(vertex, report.offset);
                self.stats.delivered += 1;
                tracing::info!(
                    ctl = report.inode,
                    offset = report.offset,
                    channel = %channel,
                    host = %host,
                    message = report.message,
                    "Delivered"
                );
            }
            status if status.is_failure() => {
                self.remove_recipient(vertex, report.offset);
                self.graph.files[file].rcpnts_failed += 1;
                self.stats.failed += 1;
                tracing::warn!(
                    ctl = report.inode,
                    offset = report.offset,
                    channel = %channel,
                    host = %host,
                    notary = report.notary,
                    message = report.message,
                    "Delivery failed permanently"
                );
            }
            Status::RetryAt(when) => {
                let vertex = &mut self.graph.vertices[vertex];
                vertex.deferred = true;
                vertex.retry_at = Some(when);
                vertex.message = Some(report.message.to_string());
            }
            status => {
                let entry = &mut self.graph.vertices[vertex];
                entry.deferred = true;
                entry.message = Some(report.message.to_string());

                internal!(
                    level = DEBUG,
                    ctl = report.inode,
                    offset = report.offset,
                    channel = %channel,
                    host = %host,
                    message = report.message,
                    "Delivery deferred"
                );

                if status == Status::DeferAll {
                    self.defer_thread(vertex, now);
                }
            }
        }
    }

    fn remove_recipient(&mut self, vertex: VertexId, offset: usize) {
        let file = self.graph.vertices[vertex].file;
        self.graph.vertices[vertex].recipients.retain(|o| *o != offset);

        let file = &mut self.graph.files[file];
        file.rcpnts_work = file.rcpnts_work.saturating_sub(1);
    }

    /// Push every other unfed vertex of the thread out to this vertex's
    /// next retry time
    fn defer_thread(&mut self, vertex: VertexId, now: u64) {
        let Some(thread) = self.graph.vertices[vertex].thread else {
            return;
        };
        let policy = std::rc::Rc::clone(self.graph.policy(thread));
        let (wakeup, _) = retry::next_retry(&policy, self.graph.vertices[vertex].retry_index, now);

        for other in self.graph.thread_vertices(thread) {
            let other = &mut self.graph.vertices[other];
            if other.fed_by.is_none() && other.wakeup < wakeup {
                other.wakeup = wakeup;
            }
        }
    }

    /// Every recipient handed over with the last feed has been reported on
    fn finish_feed(&mut self, vertex: VertexId, now: u64) {
        self.graph.vertices[vertex].attempts += 1;
        self.graph.mark_unfed(vertex);

        if self.graph.vertices[vertex].recipients.is_empty() {
            if let Some(file) = self.graph.destroy_vertex(vertex) {
                self.complete_file(file);
            }
        } else {
            self.reschedule_vertex(vertex, now);
        }
    }
}
