//! Recipient locks and the other in-place edits the scheduler makes to
//! control files.
//!
//! Transport agents lock a recipient by writing `~` into its state byte and
//! their pid into the pid slot. A crashed agent leaves the lock behind, so
//! the scheduler checks the holder before trusting it.

use std::{
    fs::OpenOptions,
    io::{self, Write},
    os::unix::fs::FileExt,
    path::Path,
};

use nix::{errno::Errno, sys::signal::kill, unistd::Pid};

use super::{FormatFlags, PID_SLOT, State, Tag};

/// Whether `pid` names a live process
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }

    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

/// The pid recorded in a recipient record's pid slot, if there is one
pub fn holder(record: &[u8], format: FormatFlags) -> Option<i32> {
    if !format.contains(FormatFlags::PID_SLOT) {
        return None;
    }

    let slot = record.get(2..2 + PID_SLOT)?;
    std::str::from_utf8(slot)
        .ok()?
        .trim()
        .parse()
        .ok()
        .filter(|pid| *pid > 0)
}

/// Overwrite the state byte at each of `offsets`
///
/// # Errors
///
/// If the control file cannot be opened or written.
pub fn rewrite_states(path: &Path, offsets: &[usize], state: State) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;

    for &offset in offsets {
        file.write_all_at(&[state.byte()], offset as u64)?;
    }

    Ok(())
}

/// Append a diagnostic record for the recipient record at `offset`
///
/// # Errors
///
/// If the control file cannot be opened or appended to.
pub fn append_diagnostic(
    path: &Path,
    offset: usize,
    now: u64,
    status: &str,
    message: &str,
) -> io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    let message = message.replace('\n', " ");

    writeln!(
        file,
        "{} {offset} {now}\t{status}\t{message}",
        char::from(Tag::Diagnostic.byte())
    )
}
