//! Re-reading a job a worker has changed behind our back.
//!
//! A `#resync` asks the scheduler to bring its vertices for one control
//! file back in line with what is on disk. Old and new recipients are both
//! ordered by destination, so the two lists are walked side by side:
//! a vertex whose destination no longer appears is destroyed, a vertex
//! that still matches keeps only the recipients still pending, and
//! destinations that only appear in the new parse are ignored.

use empath_common::{internal, tracing};

use crate::{
    control::{self, ParseOptions, RecipientRecord},
    dirqueue::spool_number,
    graph::{FileId, Graph, VertexId},
    scheduler::Scheduler,
    spool::split_dir_hash,
};

/// What a reconcile changed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    /// Vertices torn down
    pub destroyed: usize,
    /// Recipients dropped from surviving vertices
    pub dropped: usize,
}

/// Pending recipient offsets of a fresh parse, grouped by destination in
/// parse order
fn group_by_destination(fresh: &[RecipientRecord]) -> Vec<((&str, &str), Vec<usize>)> {
    let mut groups: Vec<((&str, &str), Vec<usize>)> = Vec::new();

    for record in fresh {
        let Some((channel, host)) = &record.destination else {
            continue;
        };
        let key = (channel.as_str(), host.as_str());

        match groups.last_mut() {
            Some((last, offsets)) if *last == key => offsets.push(record.offset),
            _ => groups.push((key, vec![record.offset])),
        }
    }

    groups
}

fn same(graph: &Graph, vertex: VertexId, key: (&str, &str)) -> bool {
    graph.destination(vertex) == key
}

/// Bring the vertices of `file` in line with a fresh parse of its control
/// file
pub fn reconcile(graph: &mut Graph, file: FileId, fresh: &[RecipientRecord]) -> Reconciled {
    let fresh = group_by_destination(fresh);
    let old = graph.file_vertices(file);
    let mut result = Reconciled::default();

    let (mut i, mut j) = (0, 0);
    while i < old.len() && j < fresh.len() {
        let (key, offsets) = &fresh[j];

        if same(graph, old[i], *key) {
            let vertex = &mut graph.vertices[old[i]];
            let before = vertex.recipients.len();
            vertex.recipients.retain(|offset| offsets.contains(offset));
            vertex.outstanding = vertex.outstanding.min(vertex.recipients.len());
            result.dropped += before - vertex.recipients.len();

            if vertex.recipients.is_empty() {
                graph.destroy_vertex(old[i]);
                result.destroyed += 1;
            }

            i += 1;
            j += 1;
            continue;
        }

        match old[i + 1..].iter().position(|v| same(graph, *v, *key)) {
            // Everything before the match is gone from the file
            Some(skip) => {
                for vertex in &old[i..=i + skip] {
                    graph.destroy_vertex(*vertex);
                    result.destroyed += 1;
                }
                i += skip + 1;
            }
            None => j += 1,
        }
    }

    for vertex in &old[i..] {
        graph.destroy_vertex(*vertex);
        result.destroyed += 1;
    }

    result
}

impl Scheduler {
    /// Re-read the control file `name` and reconcile its vertices
    pub(crate) fn resync(&mut self, name: &str, now: u64) {
        let (_, base) = split_dir_hash(name);
        let Some(inode) = spool_number(base) else {
            tracing::warn!(name, "Resync request for a malformed job name");
            return;
        };
        let Some(file) = self.graph.file_by_inode(inode) else {
            internal!(level = DEBUG, name, "Resync request for a job that is not scheduled");
            return;
        };

        let count = {
            let file = &mut self.graph.files[file];
            file.resync_count += 1;
            file.resync_count
        };
        if count > self.settings.max_resyncs {
            tracing::warn!(
                name,
                resyncs = count,
                "Job resynced too often, dropping it from memory"
            );
            self.graph.forget_file(file);
            return;
        }

        let spool_name = self.graph.files[file].spool_name();
        let options = ParseOptions {
            now,
            lock_backoff: self.settings.lock_backoff_secs,
            rereading: true,
        };

        let parsed = match control::load(&self.spool, &spool_name, inode, &options) {
            Ok(parsed) => parsed,
            Err(error) => {
                tracing::warn!(name, %error, "Resync failed, dropping job from memory");
                self.graph.forget_file(file);
                return;
            }
        };

        let result = reconcile(&mut self.graph, file, &parsed.recipients);
        internal!(
            level = DEBUG,
            name,
            destroyed = result.destroyed,
            dropped = result.dropped,
            "Job resynced"
        );

        let entry = &mut self.graph.files[file];
        entry.rcpnts_work = parsed.file.rcpnts_work;
        entry.rcpnts_failed = parsed.file.rcpnts_failed;
        entry.had_error |= parsed.file.had_error;
        entry.offsets = parsed.file.offsets;

        if entry.vertices.is_empty() {
            self.complete_file(file);
        }
    }
}
