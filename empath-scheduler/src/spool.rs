//! Postoffice layout as seen by the scheduler.
//!
//! ```text
//! <postoffice>/transport/[X/[Y/]]<inode>   control files
//! <postoffice>/queue/[X/[Y/]]<message-id>  message bodies
//! ```
//!
//! Large spools hash both trees into one or two levels of single-letter
//! subdirectories. The hash is derived from the message id, so a control
//! file and its message body always live under the same prefix.

use std::{
    fs,
    io::{self, ErrorKind, Write},
    path::{Component, Path, PathBuf},
};

use empath_common::{internal, tracing};

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct Spool {
    root: PathBuf,
    hash_levels: u8,
}

/// Subdirectory prefix for a message id: `""`, `"X/"` or `"X/Y/"`
pub fn dir_hash(id: u64, levels: u8) -> String {
    match levels {
        0 => String::new(),
        1 => format!("{}/", letter(id % 26)),
        _ => {
            let hash = id % (26 * 26);
            format!("{}/{}/", letter(hash / 26), letter(hash % 26))
        }
    }
}

fn letter(n: u64) -> char {
    char::from(b'A' + u8::try_from(n % 26).unwrap_or(0))
}

/// Split `A/B/123` into its hash prefix and file name
pub fn split_dir_hash(name: &str) -> (&str, &str) {
    let bytes = name.as_bytes();
    let mut split = 0;

    for _ in 0..2 {
        match bytes.get(split..split + 2) {
            Some([letter, b'/']) if letter.is_ascii_uppercase() => split += 2,
            _ => break,
        }
    }

    name.split_at(split)
}

impl Spool {
    /// # Errors
    ///
    /// Rejects relative postoffice paths, and paths with `..` components.
    pub fn new(root: impl Into<PathBuf>, hash_levels: u8) -> Result<Self, ConfigError> {
        let root = root.into();

        if !root.is_absolute() || root.components().any(|c| c == Component::ParentDir) {
            return Err(ConfigError::InvalidPostoffice(root));
        }

        Ok(Self {
            root,
            hash_levels: hash_levels.min(2),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub const fn hash_levels(&self) -> u8 {
        self.hash_levels
    }

    pub fn transport_dir(&self) -> PathBuf {
        self.root.join("transport")
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.root.join("queue")
    }

    /// Path of a control file, `name` including any hash prefix
    pub fn control_path(&self, name: &str) -> PathBuf {
        self.transport_dir().join(name)
    }

    pub fn queue_path(&self, dir_hash: &str, message_id: &str) -> PathBuf {
        self.queue_dir().join(format!("{dir_hash}{message_id}"))
    }

    /// Create the spool directories if they are missing
    ///
    /// # Errors
    ///
    /// If a directory cannot be created, or exists as something else.
    pub fn init(&self) -> io::Result<()> {
        internal!("Initialising spool at {}", self.root.display());

        for dir in [self.transport_dir(), self.queue_dir()] {
            if !dir.try_exists()? {
                internal!("{} does not exist, creating...", dir.display());
                fs::create_dir_all(&dir)?;
            } else if !dir.is_dir() {
                return Err(io::Error::new(
                    ErrorKind::NotADirectory,
                    format!("Expected {} to be a Directory, but it is not", dir.display()),
                ));
            }
        }

        Ok(())
    }

    /// Move a top-level job into its hashed subdirectories.
    ///
    /// Returns the new hash prefix, or `None` when hashing is disabled or
    /// the control file could not be moved (the job then stays where it is).
    pub fn relocate(&self, name: &str, message_id: &str) -> Option<String> {
        if self.hash_levels == 0 {
            return None;
        }

        let id = crate::dirqueue::spool_number(message_id)?;
        let prefix = dir_hash(id, self.hash_levels);

        let from = self.control_path(name);
        let to = self.control_path(&format!("{prefix}{name}"));
        if let Err(err) = rename_creating(&from, &to) {
            tracing::warn!(name, error = %err, "Unable to move control file into hashed directory");
            return None;
        }

        let from = self.queue_path("", message_id);
        let to = self.queue_path(&prefix, message_id);
        if let Err(err) = rename_creating(&from, &to) {
            // Reported again when the parser stats the queue file
            tracing::warn!(message_id, error = %err, "Unable to move queue file into hashed directory");
        }

        Some(prefix)
    }

    /// Remove a finished (or broken) job's files
    pub fn unlink_job(&self, control_name: &str, dir_hash: &str, message_id: Option<&str>) {
        let mut paths = vec![self.control_path(control_name)];
        if let Some(mid) = message_id {
            paths.push(self.queue_path(dir_hash, mid));
        }

        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::error!(path = %path.display(), error = %err, "Unable to unlink spool file");
                }
            }
        }
    }
}

fn rename_creating(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Err(err) if err.kind() == ErrorKind::NotFound && from.exists() => {
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(from, to)
        }
        other => other,
    }
}

/// Append a note to a job's verbose log, if the job asked for one
pub fn verbose_note(path: Option<&str>, note: &str) {
    let Some(path) = path else {
        return;
    };

    let result = fs::OpenOptions::new()
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{note}"));

    if let Err(err) = result {
        tracing::debug!(path, error = %err, "Unable to append to verbose log");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_dir_hash() {
        assert_eq!(dir_hash(12345, 0), "");
        assert_eq!(dir_hash(0, 1), "A/");
        assert_eq!(dir_hash(27, 1), "B/");
        assert_eq!(dir_hash(27, 2), "B/B/");
        assert_eq!(dir_hash(676 + 25, 2), "A/Z/");
    }

    #[test]
    fn test_split_dir_hash() {
        assert_eq!(split_dir_hash("123"), ("", "123"));
        assert_eq!(split_dir_hash("A/123"), ("A/", "123"));
        assert_eq!(split_dir_hash("A/B/123"), ("A/B/", "123"));
        assert_eq!(split_dir_hash("a/123"), ("", "a/123"));
    }

    #[test]
    fn test_rejects_relative_postoffice() {
        assert!(Spool::new("relative/po", 0).is_err());
        assert!(Spool::new("/var/spool/../po", 0).is_err());
        assert!(Spool::new("/var/spool/po", 0).is_ok());
    }

    #[test]
    fn test_relocate_moves_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path(), 1).unwrap();
        spool.init().unwrap();

        fs::write(spool.control_path("27"), b"ctl").unwrap();
        fs::write(spool.queue_path("", "27"), b"body").unwrap();

        assert_eq!(spool.relocate("27", "27").as_deref(), Some("B/"));
        assert!(spool.control_path("B/27").exists());
        assert!(spool.queue_path("B/", "27").exists());
        assert!(!spool.control_path("27").exists());
    }

    #[test]
    fn test_relocate_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path(), 0).unwrap();
        assert_eq!(spool.relocate("27", "27"), None);
    }

    #[test]
    fn test_unlink_job_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(dir.path(), 0).unwrap();
        spool.init().unwrap();

        fs::write(spool.control_path("5"), b"ctl").unwrap();
        spool.unlink_job("5", "", Some("5"));
        assert!(!spool.control_path("5").exists());
    }
}
