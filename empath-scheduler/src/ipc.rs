//! Local sockets: new-job notifications in, queue snapshots out.
//!
//! The router announces a freshly written job by sending `NEW <name>` as a
//! datagram to the notify socket. Anyone connecting to the query socket
//! gets a text snapshot of the scheduler state and the connection closed.

use std::{
    fs,
    io::{self, ErrorKind, Write},
    os::{
        fd::{AsFd, BorrowedFd},
        unix::net::{UnixDatagram, UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
    time::Duration,
};

use empath_common::{incoming, internal, tracing};

/// Datagrams taken per event loop pass
const MAX_DATAGRAMS: usize = 10;

const DATAGRAM_SIZE: usize = 1024;

/// How long a slow query client may stall a snapshot write
const QUERY_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

fn remove_stale(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Pull the job name out of a `NEW` notification
pub fn parse_notify(text: &str) -> Option<&str> {
    let name = text.trim().strip_prefix("NEW")?.trim_start();

    let mut parts = name.rsplit('/');
    let base = parts.next()?;
    let hashes = parts.collect::<Vec<_>>();

    let valid = !base.is_empty()
        && base.bytes().all(|b| b.is_ascii_digit())
        && hashes.len() <= 2
        && hashes
            .iter()
            .all(|h| h.len() == 1 && h.bytes().all(|b| b.is_ascii_uppercase()));

    valid.then_some(name)
}

#[derive(Debug)]
pub struct Notify {
    socket: UnixDatagram,
    path: PathBuf,
}

impl Notify {
    /// Bind the notification socket, replacing a stale one
    ///
    /// # Errors
    ///
    /// If the socket cannot be bound.
    pub fn bind(path: &Path) -> io::Result<Self> {
        remove_stale(path)?;
        let socket = UnixDatagram::bind(path)?;
        socket.set_nonblocking(true)?;

        internal!("Listening for job notifications on {}", path.display());

        Ok(Self {
            socket,
            path: path.to_path_buf(),
        })
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }

    /// Take the job names of up to [`MAX_DATAGRAMS`] waiting notifications
    pub fn receive(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut buf = [0u8; DATAGRAM_SIZE];

        for _ in 0..MAX_DATAGRAMS {
            match self.socket.recv(&mut buf) {
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buf[..n]);
                    incoming!(level = DEBUG, notification = %text.trim_end(), "Notification");

                    match parse_notify(&text) {
                        Some(name) => names.push(name.to_string()),
                        None => tracing::warn!(
                            notification = %text.trim_end(),
                            "Ignoring malformed notification"
                        ),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::warn!("Notification socket read failed: {e}");
                    break;
                }
            }
        }

        names
    }
}

impl Drop for Notify {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[derive(Debug)]
pub struct Query {
    listener: UnixListener,
    path: PathBuf,
}

impl Query {
    /// Bind the query socket, replacing a stale one
    ///
    /// # Errors
    ///
    /// If the socket cannot be bound.
    pub fn bind(path: &Path) -> io::Result<Self> {
        remove_stale(path)?;
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;

        internal!("Answering queue queries on {}", path.display());

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }

    /// Connections waiting to be answered
    pub fn accept(&self) -> Vec<UnixStream> {
        let mut clients = Vec::new();

        loop {
            match self.listener.accept() {
                Ok((stream, _)) => clients.push(stream),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::warn!("Query socket accept failed: {e}");
                    break;
                }
            }
        }

        clients
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Write a snapshot to a query client and hang up
pub fn answer(mut client: UnixStream, snapshot: &str) {
    let result = client
        .set_nonblocking(false)
        .and_then(|()| client.set_write_timeout(Some(QUERY_WRITE_TIMEOUT)))
        .and_then(|()| client.write_all(snapshot.as_bytes()));

    if let Err(e) = result {
        internal!(level = DEBUG, "Query client went away: {e}");
    }
}

/// Send a `NEW` notification for `name` to a running scheduler
///
/// # Errors
///
/// If nothing listens on `socket`.
pub fn notify(socket: &Path, name: &str) -> io::Result<()> {
    let sender = UnixDatagram::unbound()?;
    sender.send_to(format!("NEW {name}").as_bytes(), socket)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::io::Read;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_notify() {
        assert_eq!(parse_notify("NEW 12345"), Some("12345"));
        assert_eq!(parse_notify("NEW A/B/12345\n"), Some("A/B/12345"));
        assert_eq!(parse_notify("NEW   7"), Some("7"));
        assert_eq!(parse_notify("NEW"), None);
        assert_eq!(parse_notify("NEW A/"), None);
        assert_eq!(parse_notify("NEW ../etc"), None);
        assert_eq!(parse_notify("NEW ../12"), None);
        assert_eq!(parse_notify("NEW A/B/C/12"), None);
        assert_eq!(parse_notify("OLD 1"), None);
    }

    #[test]
    fn test_notifications_are_received() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify");
        let socket = Notify::bind(&path).unwrap();

        notify(&path, "12").unwrap();
        notify(&path, "A/34").unwrap();
        UnixDatagram::unbound()
            .unwrap()
            .send_to(b"garbage", &path)
            .unwrap();

        assert_eq!(socket.receive(), vec!["12".to_string(), "A/34".to_string()]);
        assert!(socket.receive().is_empty());

        drop(socket);
        assert!(!path.exists());
    }

    #[test]
    fn test_notifications_per_pass_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify");
        let socket = Notify::bind(&path).unwrap();

        for n in 0..15 {
            notify(&path, &n.to_string()).unwrap();
        }

        assert_eq!(socket.receive().len(), MAX_DATAGRAMS);
        assert_eq!(socket.receive().len(), 5);
    }

    #[test]
    fn test_query_answers_and_hangs_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("query");
        let query = Query::bind(&path).unwrap();

        let mut client = UnixStream::connect(&path).unwrap();
        let clients = query.accept();
        assert_eq!(clients.len(), 1);

        for client in clients {
            answer(client, "total jobs=0\n");
        }

        let mut text = String::new();
        client.read_to_string(&mut text).unwrap();
        assert_eq!(text, "total jobs=0\n");
    }

    #[test]
    fn test_stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify");
        fs::write(&path, b"").unwrap();

        assert!(Notify::bind(&path).is_ok());
    }
}
