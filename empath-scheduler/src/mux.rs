//! One pass of I/O multiplexing.
//!
//! Every worker's report pipe is polled for input and, when output is
//! pending, its feed pipe for room. The notify and query sockets join the
//! same poll. A pass ends by draining one entry of the directory queue.

use std::{
    io::{ErrorKind, Read},
    os::fd::AsFd,
    time::Duration,
};

use empath_common::{internal, tracing};
use nix::{
    errno::Errno,
    poll::{PollFd, PollFlags, PollTimeout, poll},
};

use crate::{graph::ProcKey, scheduler::Scheduler};

const READ_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy)]
enum Source {
    Reader(ProcKey),
    Writer(ProcKey),
    Notify,
    Query,
}

/// Split complete lines off the front of `carryover`
fn take_lines(carryover: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();

    while let Some(end) = carryover.iter().position(|b| *b == b'\n') {
        let line = carryover.drain(..=end).collect::<Vec<_>>();
        lines.push(String::from_utf8_lossy(&line[..end]).into_owned());
    }

    lines
}

impl Scheduler {
    /// Wait up to `timeout` for I/O and handle whatever is ready
    ///
    /// # Panics
    ///
    /// If called again from inside a pass, or if `poll` reports a bad
    /// descriptor set.
    pub fn mux(&mut self, timeout: Duration, now: u64) {
        assert!(!self.in_mux, "event multiplexer re-entered");
        self.in_mux = true;

        let mut sources = Vec::with_capacity(self.pool.len() * 2 + 2);

        let ready = {
            let mut fds = Vec::with_capacity(sources.capacity());

            for (key, proc) in self.pool.iter() {
                fds.push(PollFd::new(proc.reader.as_fd(), PollFlags::POLLIN));
                sources.push(Source::Reader(*key));

                if proc.wants_write()
                    && let Some(fd) = proc.writer_fd()
                {
                    fds.push(PollFd::new(fd, PollFlags::POLLOUT));
                    sources.push(Source::Writer(*key));
                }
            }
            if let Some(notify) = &self.notify {
                fds.push(PollFd::new(notify.fd(), PollFlags::POLLIN));
                sources.push(Source::Notify);
            }
            if let Some(query) = &self.query {
                fds.push(PollFd::new(query.fd(), PollFlags::POLLIN));
                sources.push(Source::Query);
            }

            // Longer waits are cut short and the loop simply comes round again
            let timeout = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);

            match poll(&mut fds, PollTimeout::from(timeout)) {
                Ok(0) => Vec::new(),
                Ok(_) => fds
                    .iter()
                    .map(|fd| fd.revents().is_some_and(|revents| !revents.is_empty()))
                    .collect(),
                Err(Errno::EINTR | Errno::EAGAIN) => Vec::new(),
                Err(errno @ (Errno::EBADF | Errno::EINVAL | Errno::EFAULT)) => {
                    panic!("poll rejected the descriptor set: {errno}")
                }
                Err(errno) => {
                    tracing::error!("poll failed: {errno}");
                    Vec::new()
                }
            }
        };

        for (source, _) in sources.into_iter().zip(ready).filter(|(_, ready)| *ready) {
            match source {
                Source::Reader(key) => self.read_from(key, now),
                Source::Writer(key) => self.pool.flush(key),
                Source::Notify => self.receive_notifications(now),
                Source::Query => self.answer_queries(now),
            }
        }

        self.drain_one(now);
        self.in_mux = false;
    }

    /// Read one chunk from a worker and act on every complete line
    fn read_from(&mut self, key: ProcKey, now: u64) {
        let mut buf = [0u8; READ_SIZE];

        let lines = {
            let Some((reader, carryover)) = self.pool.input_mut(key) else {
                return;
            };

            match reader.read(&mut buf) {
                Ok(0) => None,
                Ok(n) => {
                    carryover.extend_from_slice(&buf[..n]);
                    Some(take_lines(carryover))
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                    Some(Vec::new())
                }
                Err(e) => {
                    tracing::warn!(key, "Worker pipe read failed: {e}");
                    None
                }
            }
        };

        match lines {
            Some(lines) => {
                for line in lines {
                    self.handle_line(key, &line, now);
                }
            }
            None => {
                internal!(level = DEBUG, key, "Worker pipe closed");
                self.reclaim_worker(key, now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_take_lines_keeps_partial_tail() {
        let mut carryover = b"#hungry\n12/3\t\tok\n12/4\t".to_vec();

        assert_eq!(take_lines(&mut carryover), vec!["#hungry", "12/3\t\tok"]);
        assert_eq!(carryover, b"12/4\t");

        carryover.extend_from_slice(b"\tdeferred\n");
        assert_eq!(take_lines(&mut carryover), vec!["12/4\t\tdeferred"]);
        assert!(carryover.is_empty());
    }

    #[test]
    fn test_take_lines_without_newline() {
        let mut carryover = b"#hun".to_vec();
        assert!(take_lines(&mut carryover).is_empty());
        assert_eq!(carryover, b"#hun");
    }
}
