//! The scheduling graph.
//!
//! Control files, vertices, webs, threads and thread groups each live in an
//! [`Arena`] owned by [`Graph`]. A vertex sits on four intrusive chains at
//! once: its control file's, its channel web's, its host web's and (once
//! bound) its thread's. The chain links are stored in the vertex itself and
//! the owners only keep a [`ChainHead`].

use ahash::AHashMap;
use empath_common::{internal, tracing};

use crate::{
    arena::{Arena, Id},
    control::{ControlFile, NotifyFlags, RecipientRecord},
    threads::{GroupKey, Thread, ThreadGroup},
};

pub type FileId = Id<ControlFile>;
pub type VertexId = Id<Vertex>;
pub type WebId = Id<Web>;
pub type ThreadId = Id<Thread>;
pub type GroupId = Id<ThreadGroup>;

/// Process slot key: the read side descriptor of a worker
pub type ProcKey = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    File,
    Channel,
    Host,
    Thread,
}

impl Chain {
    const fn slot(self) -> usize {
        match self {
            Self::File => 0,
            Self::Channel => 1,
            Self::Host => 2,
            Self::Thread => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Link {
    prev: Option<VertexId>,
    next: Option<VertexId>,
}

/// Owner side of a vertex chain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainHead {
    head: Option<VertexId>,
    tail: Option<VertexId>,
    len: usize,
}

impl ChainHead {
    pub const fn first(&self) -> Option<VertexId> {
        self.head
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Recipients of one control file sharing a `(channel, host)`
#[derive(Debug)]
pub struct Vertex {
    pub file: FileId,
    /// Byte offsets of the recipient records
    pub recipients: Vec<usize>,
    pub channel: WebId,
    pub host: WebId,
    pub wakeup: u64,
    pub header_offset: Option<usize>,
    pub drpt_offset: Option<usize>,
    pub notify: NotifyFlags,
    pub expiry: u64,
    pub expiry2: u64,
    /// Reports received, not feeds sent
    pub attempts: u32,
    pub retry_index: usize,
    /// Explicit retry time reported by the worker
    pub retry_at: Option<u64>,
    /// Worker the vertex has been handed to
    pub fed_by: Option<ProcKey>,
    /// Recipients fed but not yet reported on
    pub outstanding: usize,
    /// A deferral was reported during the current feed
    pub deferred: bool,
    pub message: Option<String>,
    pub thread: Option<ThreadId>,
    links: [Link; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebKind {
    Channel,
    Host,
}

/// Per-name index of the vertices using a channel or host
#[derive(Debug)]
pub struct Web {
    pub name: String,
    pub kind: WebKind,
    pub vertices: ChainHead,
    /// Workers currently bound to this name
    pub kids: usize,
}

pub fn push_back(vertices: &mut Arena<Vertex>, head: &mut ChainHead, chain: Chain, id: VertexId) {
    let slot = chain.slot();

    vertices[id].links[slot] = Link {
        prev: head.tail,
        next: None,
    };
    match head.tail {
        Some(tail) => vertices[tail].links[slot].next = Some(id),
        None => head.head = Some(id),
    }

    head.tail = Some(id);
    head.len += 1;
}

pub fn unlink(vertices: &mut Arena<Vertex>, head: &mut ChainHead, chain: Chain, id: VertexId) {
    let slot = chain.slot();
    let Link { prev, next } = std::mem::take(&mut vertices[id].links[slot]);

    match prev {
        Some(prev) => vertices[prev].links[slot].next = next,
        None => head.head = next,
    }
    match next {
        Some(next) => vertices[next].links[slot].prev = prev,
        None => head.tail = prev,
    }

    head.len -= 1;
}

pub fn next(vertices: &Arena<Vertex>, chain: Chain, id: VertexId) -> Option<VertexId> {
    vertices[id].links[chain.slot()].next
}

/// Snapshot of a chain, for walks that modify it
pub fn members(vertices: &Arena<Vertex>, head: &ChainHead, chain: Chain) -> Vec<VertexId> {
    let mut out = Vec::with_capacity(head.len);
    let mut cursor = head.head;

    while let Some(id) = cursor {
        out.push(id);
        cursor = next(vertices, chain, id);
    }

    out
}

#[derive(Debug, Default)]
pub struct Graph {
    pub files: Arena<ControlFile>,
    pub vertices: Arena<Vertex>,
    pub webs: Arena<Web>,
    pub threads: Arena<Thread>,
    pub groups: Arena<ThreadGroup>,
    by_inode: AHashMap<u64, FileId>,
    /// Jobs with work left but nothing schedulable, by inode, holding their
    /// spool name. Scans skip them until the next reload.
    parked: AHashMap<u64, String>,
    channels: AHashMap<String, WebId>,
    hosts: AHashMap<String, WebId>,
    pub(crate) group_index: AHashMap<GroupKey, GroupId>,
    pub(crate) thread_index: AHashMap<(GroupId, String, String), ThreadId>,
}

impl Graph {
    /// Whether a control file with this inode is being scheduled or parked
    pub fn is_processing(&self, inode: u64) -> bool {
        self.by_inode.contains_key(&inode) || self.parked.contains_key(&inode)
    }

    pub fn park(&mut self, inode: u64, spool_name: String) {
        self.parked.insert(inode, spool_name);
    }

    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    /// Let every parked job be picked up again; returns how many there were
    pub fn unpark_all(&mut self) -> usize {
        let count = self.parked.len();
        self.parked.clear();
        count
    }

    /// Drop parked jobs whose control file is gone
    pub fn prune_parked(&mut self, exists: impl Fn(&str) -> bool) {
        self.parked.retain(|_, name| exists(name));
    }

    pub fn file_by_inode(&self, inode: u64) -> Option<FileId> {
        self.by_inode.get(&inode).copied()
    }

    pub fn insert_file(&mut self, file: ControlFile) -> FileId {
        let inode = file.id;
        let id = self.files.insert(file);
        self.by_inode.insert(inode, id);
        id
    }

    /// Forget a control file. Its vertices must already be gone.
    pub fn remove_file(&mut self, id: FileId) -> Option<ControlFile> {
        let file = self.files.remove(id)?;
        assert!(
            file.vertices.is_empty(),
            "control file {} removed with live vertices",
            file.id
        );

        if self.by_inode.get(&file.id) == Some(&id) {
            self.by_inode.remove(&file.id);
        }

        Some(file)
    }

    pub fn web_name(&self, id: WebId) -> &str {
        &self.webs[id].name
    }

    fn web(&mut self, kind: WebKind, name: &str) -> WebId {
        let index = match kind {
            WebKind::Channel => &mut self.channels,
            WebKind::Host => &mut self.hosts,
        };

        if let Some(id) = index.get(name) {
            return *id;
        }

        let id = self.webs.insert(Web {
            name: name.to_string(),
            kind,
            vertices: ChainHead::default(),
            kids: 0,
        });
        index.insert(name.to_string(), id);
        id
    }

    /// Look up (creating on demand) the webs for a destination
    pub fn webs_for(&mut self, channel: &str, host: &str) -> (WebId, WebId) {
        (
            self.web(WebKind::Channel, channel),
            self.web(WebKind::Host, host),
        )
    }

    /// Workers bound to a channel or host name
    pub fn kids(&self, kind: WebKind, name: &str) -> usize {
        let index = match kind {
            WebKind::Channel => &self.channels,
            WebKind::Host => &self.hosts,
        };

        index.get(name).map_or(0, |id| self.webs[*id].kids)
    }

    /// Destroy a web once nothing references it any more
    pub fn release_web(&mut self, id: WebId) {
        let Some(web) = self.webs.get(id) else {
            return;
        };
        if !web.vertices.is_empty() || web.kids > 0 {
            return;
        }

        if let Some(web) = self.webs.remove(id) {
            let index = match web.kind {
                WebKind::Channel => &mut self.channels,
                WebKind::Host => &mut self.hosts,
            };
            if index.get(&web.name) == Some(&id) {
                index.remove(&web.name);
            }
        }
    }

    /// Group the sorted recipients of `file` into vertices.
    ///
    /// One vertex is made per run of equal `(channel, host)`. Recipients
    /// whose destination could not be parsed are skipped.
    pub fn build_vertices(&mut self, file: FileId, recipients: &[RecipientRecord]) -> Vec<VertexId> {
        let mut built = Vec::new();
        let mut run: Vec<&RecipientRecord> = Vec::new();
        let mut current: Option<&(String, String)> = None;

        for recipient in recipients {
            let Some(destination) = recipient.destination.as_ref() else {
                tracing::warn!(
                    ctl = self.files[file].id,
                    offset = recipient.offset,
                    address = %recipient.raw,
                    "Skipping recipient with malformed channel/host"
                );
                continue;
            };

            if current.is_some_and(|c| c != destination) {
                built.push(self.new_vertex(file, &run));
                run.clear();
            }

            current = Some(destination);
            run.push(recipient);
        }

        if !run.is_empty() {
            built.push(self.new_vertex(file, &run));
        }

        built
    }

    fn new_vertex(&mut self, file: FileId, run: &[&RecipientRecord]) -> VertexId {
        let first = run[0];
        let (channel, host) = first
            .destination
            .as_ref()
            .map(|(c, h)| (c.as_str(), h.as_str()))
            .unwrap_or_default();
        let (channel, host) = self.webs_for(channel, host);

        let id = self.vertices.insert(Vertex {
            file,
            recipients: run.iter().map(|r| r.offset).collect(),
            channel,
            host,
            wakeup: first.wakeup,
            header_offset: first.header_offset,
            drpt_offset: first.drpt_offset,
            notify: first.notify,
            expiry: 0,
            expiry2: 0,
            attempts: 0,
            retry_index: 0,
            retry_at: None,
            fed_by: None,
            outstanding: 0,
            deferred: false,
            message: None,
            thread: None,
            links: [Link::default(); 4],
        });

        push_back(
            &mut self.vertices,
            &mut self.files[file].vertices,
            Chain::File,
            id,
        );
        push_back(
            &mut self.vertices,
            &mut self.webs[channel].vertices,
            Chain::Channel,
            id,
        );
        push_back(
            &mut self.vertices,
            &mut self.webs[host].vertices,
            Chain::Host,
            id,
        );

        id
    }

    /// Vertices of a control file, in file order
    pub fn file_vertices(&self, file: FileId) -> Vec<VertexId> {
        members(&self.vertices, &self.files[file].vertices, Chain::File)
    }

    /// Channel and host names of a vertex
    pub fn destination(&self, id: VertexId) -> (&str, &str) {
        let vertex = &self.vertices[id];
        (self.web_name(vertex.channel), self.web_name(vertex.host))
    }

    /// Find the vertex of `file` holding the recipient record at `offset`
    pub fn vertex_for_offset(&self, file: FileId, offset: usize) -> Option<VertexId> {
        self.file_vertices(file)
            .into_iter()
            .find(|id| self.vertices[*id].recipients.contains(&offset))
    }

    /// Tear a vertex out of every chain and free it.
    ///
    /// Returns the control file when this was its last vertex; the caller
    /// decides what happens to the file.
    pub fn destroy_vertex(&mut self, id: VertexId) -> Option<FileId> {
        if let Some(thread) = self.unlink_from_thread(id) {
            self.prune_thread(thread);
        }

        let (file, channel, host) = {
            let vertex = &self.vertices[id];
            (vertex.file, vertex.channel, vertex.host)
        };

        unlink(
            &mut self.vertices,
            &mut self.files[file].vertices,
            Chain::File,
            id,
        );
        unlink(
            &mut self.vertices,
            &mut self.webs[channel].vertices,
            Chain::Channel,
            id,
        );
        unlink(
            &mut self.vertices,
            &mut self.webs[host].vertices,
            Chain::Host,
            id,
        );

        self.vertices.remove(id);
        self.release_web(channel);
        self.release_web(host);

        internal!(level = DEBUG, vertex = ?id, "Vertex destroyed");

        self.files[file].vertices.is_empty().then_some(file)
    }

    /// Drop a control file and all of its vertices from memory, leaving
    /// the spool files alone
    pub fn forget_file(&mut self, file: FileId) -> Option<ControlFile> {
        for id in self.file_vertices(file) {
            self.destroy_vertex(id);
        }
        self.remove_file(file)
    }

    /// Total pending recipients across all vertices
    pub fn recipient_count(&self) -> usize {
        self.vertices.iter().map(|(_, v)| v.recipients.len()).sum()
    }
}
