//! Discovery queue for job files found in the transport directory.
//!
//! Files found by a directory scan (or announced over the notify socket)
//! wait here until the event loop has time to parse them. Entries are
//! served oldest-ctime first; newcomers that arrive while the scheduler is
//! backed up are parked in a second, delayed array so they cannot jump the
//! line ahead of the files already waiting.

use std::{
    fs,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use ahash::AHashSet;
use empath_common::tracing;

/// Per-scan budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanLimits {
    /// Stop a scan after this many new entries
    pub entries: usize,
    /// Stop a scan after this much wall-clock time
    pub time: Duration,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            entries: 40_000,
            time: Duration::from_secs(5),
        }
    }
}

impl ScanLimits {
    /// Operator supplied limits, clamped to values that keep the loop alive
    #[must_use]
    pub fn clamped(entries: usize, seconds: u64) -> Self {
        Self {
            entries: entries.max(10),
            time: Duration::from_secs(seconds.clamp(2, 15)),
        }
    }
}

/// A discovered job file waiting to be parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirQueueEntry {
    /// Numeric file name
    pub inode: u64,
    /// Path relative to the transport directory (`123`, `A/123`, `A/B/123`)
    pub name: String,
    pub path: PathBuf,
    pub ctime: i64,
    pub not_before: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    Queued,
    /// The inode is already waiting in the queue
    AlreadyQueued,
    /// The path vanished or is not a regular file
    NotRegular,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Drained {
    /// Nothing queued at all
    Empty,
    /// Entries exist but none is due yet
    NotReady,
    Ready(DirQueueEntry),
}

#[derive(Debug, Default)]
pub struct DirQueue {
    immediate: Vec<DirQueueEntry>,
    delayed: Vec<DirQueueEntry>,
    index: AHashSet<u64>,
    sorted: bool,
    limits: ScanLimits,
}

/// Parse the leading digits of a spool file name
pub fn spool_number(name: &str) -> Option<u64> {
    let digits = name.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    name[..digits].parse().ok()
}

fn is_hash_dir(name: &str) -> bool {
    name.len() == 1 && name.bytes().all(|b| b.is_ascii_uppercase())
}

impl DirQueue {
    #[must_use]
    pub fn new(limits: ScanLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub const fn set_limits(&mut self, limits: ScanLimits) {
        self.limits = limits;
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, inode: u64) -> bool {
        self.index.contains(&inode)
    }

    /// Queue a file for parsing once `delay` seconds have passed
    pub fn insert(&mut self, inode: u64, name: &str, path: &Path, delay: i64, now: u64) -> Inserted {
        if self.index.contains(&inode) {
            tracing::debug!(inode, name, "Tried to queue a file that is already queued");
            return Inserted::AlreadyQueued;
        }

        let Ok(metadata) = fs::symlink_metadata(path) else {
            return Inserted::NotRegular;
        };
        if !metadata.file_type().is_file() {
            return Inserted::NotRegular;
        }

        let not_before = if delay > 0 {
            now.saturating_add(delay.unsigned_abs())
        } else {
            now
        };

        let entry = DirQueueEntry {
            inode,
            name: name.to_string(),
            path: path.to_path_buf(),
            ctime: metadata.ctime(),
            not_before,
        };

        if delay <= 0 && self.delayed.is_empty() {
            self.immediate.push(entry);
        } else {
            self.delayed.push(entry);
        }

        self.index.insert(inode);
        self.sorted = false;

        Inserted::Queued
    }

    /// Hand out the oldest entry that is due
    pub fn drain(&mut self, now: u64) -> Drained {
        if self.index.is_empty() {
            return Drained::Empty;
        }

        if self.immediate.is_empty() {
            std::mem::swap(&mut self.immediate, &mut self.delayed);
            self.sorted = false;
        }

        if !self.sorted {
            // Oldest at the tail, so the common case pops from the end
            self.immediate.sort_by(|a, b| b.ctime.cmp(&a.ctime));
            self.sorted = true;
        }

        let Some(position) = self.immediate.iter().rposition(|e| e.not_before <= now) else {
            return Drained::NotReady;
        };

        let entry = self.immediate.remove(position);
        self.index.remove(&entry.inode);

        Drained::Ready(entry)
    }

    /// Earliest time at which something in the queue becomes due
    pub fn next_due(&self) -> Option<u64> {
        // Only the array `drain` will look at counts
        let pool = if self.immediate.is_empty() {
            &self.delayed
        } else {
            &self.immediate
        };

        pool.iter().map(|e| e.not_before).min()
    }

    /// Scan `root` for job files.
    ///
    /// `in_processing` tells whether an inode is already scheduled, so a
    /// file is never tracked twice. With `unlimited` the scan budgets are
    /// ignored (synchronous startup).
    pub fn scan(
        &mut self,
        root: &Path,
        include_subdirs: bool,
        in_processing: &dyn Fn(u64) -> bool,
        now: u64,
        unlimited: bool,
    ) -> usize {
        let started = Instant::now();
        let mut found = 0;

        self.scan_dir(
            root,
            "",
            if include_subdirs { 2 } else { 0 },
            in_processing,
            now,
            unlimited,
            started,
            &mut found,
        );

        if found > 0 {
            tracing::debug!(found, queued = self.len(), "Directory scan complete");
        }

        found
    }

    #[allow(clippy::too_many_arguments)]
    fn scan_dir(
        &mut self,
        dir: &Path,
        prefix: &str,
        depth: usize,
        in_processing: &dyn Fn(u64) -> bool,
        now: u64,
        unlimited: bool,
        started: Instant,
        found: &mut usize,
    ) -> bool {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(dir = %dir.display(), error = %err, "Unable to scan directory");
                return true;
            }
        };

        for entry in entries.flatten() {
            if !unlimited
                && (*found > self.limits.entries || started.elapsed() > self.limits.time)
            {
                return false;
            }

            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };

            if depth > 0 && is_hash_dir(&name) {
                if entry.file_type().is_ok_and(|t| t.is_dir()) {
                    let prefix = format!("{prefix}{name}/");
                    if !self.scan_dir(
                        &entry.path(),
                        &prefix,
                        depth - 1,
                        in_processing,
                        now,
                        unlimited,
                        started,
                        found,
                    ) {
                        return false;
                    }
                }
                continue;
            }

            let Some(inode) = spool_number(&name) else {
                continue;
            };

            if self.index.contains(&inode) || in_processing(inode) {
                continue;
            }

            let relative = format!("{prefix}{name}");
            if self.insert(inode, &relative, &entry.path(), 0, now) == Inserted::Queued {
                *found += 1;
            }
        }

        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;

    use super::*;

    fn touch(root: &Path, name: &str) -> PathBuf {
        let path = root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, b"x").unwrap();
        path
    }

    #[test]
    fn test_spool_number() {
        assert_eq!(spool_number("12345"), Some(12345));
        assert_eq!(spool_number("12-x"), Some(12));
        assert_eq!(spool_number("x12"), None);
        assert_eq!(spool_number(""), None);
    }

    #[test]
    fn test_limits_are_clamped() {
        let limits = ScanLimits::clamped(1, 60);
        assert_eq!(limits.entries, 10);
        assert_eq!(limits.time, Duration::from_secs(15));

        let limits = ScanLimits::clamped(500, 0);
        assert_eq!(limits.time, Duration::from_secs(2));
    }

    #[test]
    fn test_duplicate_insert_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = touch(dir.path(), "42");
        let mut queue = DirQueue::default();

        assert_eq!(queue.insert(42, "42", &path, 0, 100), Inserted::Queued);
        assert_eq!(queue.insert(42, "42", &path, 0, 100), Inserted::AlreadyQueued);
        assert_eq!(queue.len(), 1);

        let Drained::Ready(entry) = queue.drain(100) else {
            panic!("expected an entry");
        };
        assert_eq!(entry.inode, 42);
        assert_eq!(queue.drain(100), Drained::Empty);
    }

    #[test]
    fn test_missing_and_irregular_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = DirQueue::default();

        assert_eq!(
            queue.insert(1, "1", &dir.path().join("1"), 0, 0),
            Inserted::NotRegular
        );
        fs::create_dir(dir.path().join("2")).unwrap();
        assert_eq!(
            queue.insert(2, "2", &dir.path().join("2"), 0, 0),
            Inserted::NotRegular
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_delayed_entries_wait() {
        let dir = tempfile::tempdir().unwrap();
        let path = touch(dir.path(), "7");
        let mut queue = DirQueue::default();

        queue.insert(7, "7", &path, 30, 1000);
        assert_eq!(queue.next_due(), Some(1030));
        assert_eq!(queue.drain(1000), Drained::NotReady);
        assert!(matches!(queue.drain(1030), Drained::Ready(e) if e.inode == 7));
    }

    #[test]
    fn test_newcomers_queue_behind_delayed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "1");
        let b = touch(dir.path(), "2");
        let mut queue = DirQueue::default();

        queue.insert(1, "1", &a, 10, 0);
        // The delayed array is not empty, so this one parks there too
        queue.insert(2, "2", &b, 0, 0);

        assert!(matches!(queue.drain(0), Drained::Ready(e) if e.inode == 2));
        assert_eq!(queue.drain(5), Drained::NotReady);
        assert!(matches!(queue.drain(10), Drained::Ready(e) if e.inode == 1));
    }

    #[test]
    fn test_scan_finds_hashed_files() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "100");
        touch(dir.path(), "A/200");
        touch(dir.path(), "B/C/300");
        touch(dir.path(), "notes");
        touch(dir.path(), "lower/400");

        let mut queue = DirQueue::default();
        let found = queue.scan(dir.path(), true, &|inode| inode == 300, 0, false);

        assert_eq!(found, 2);
        assert!(queue.contains(100));
        assert!(queue.contains(200));
        assert!(!queue.contains(300));
        assert!(!queue.contains(400));

        let mut flat = DirQueue::default();
        assert_eq!(flat.scan(dir.path(), false, &|_| false, 0, false), 1);
    }

    #[test]
    fn test_rescan_does_not_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "100");

        let mut queue = DirQueue::default();
        assert_eq!(queue.scan(dir.path(), false, &|_| false, 0, false), 1);
        assert_eq!(queue.scan(dir.path(), false, &|_| false, 0, false), 0);
        assert_eq!(queue.len(), 1);
    }
}
