#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    cell::RefCell,
    fs,
    io::{self, ErrorKind, Read, Write},
    os::{fd::OwnedFd, unix::net::UnixStream},
    path::Path,
    rc::Rc,
    time::Duration,
};

use empath_scheduler::{
    Config, Options, Scheduler,
    process::{Exit, LaunchSpec, Launched, Launcher, ProcState, Signal},
};
use pretty_assertions::assert_eq;

type Peers = Rc<RefCell<Vec<UnixStream>>>;

/// Hands the scheduler one end of a socket pair per "process"
#[derive(Default)]
struct PairLauncher {
    peers: Peers,
    commands: Rc<RefCell<Vec<String>>>,
    pid: i32,
}

impl Launcher for PairLauncher {
    fn launch(&mut self, spec: &LaunchSpec<'_>) -> io::Result<Launched> {
        let (ours, theirs) = UnixStream::pair()?;
        theirs.set_nonblocking(true)?;
        self.peers.borrow_mut().push(theirs);
        self.commands.borrow_mut().push(spec.command.snapshot());
        self.pid += 1;

        Ok(Launched {
            pid: self.pid,
            to: OwnedFd::from(ours.try_clone()?),
            from: OwnedFd::from(ours),
        })
    }

    fn try_reap(&mut self, _pid: i32) -> io::Result<Option<Exit>> {
        Ok(Some(Exit::Code(0)))
    }

    fn signal(&mut self, _pid: i32, _signal: Signal) {}
}

struct Harness {
    scheduler: Scheduler,
    peers: Peers,
    commands: Rc<RefCell<Vec<String>>>,
    root: tempfile::TempDir,
}

const NOW: u64 = 1_700_000_000;

impl Harness {
    fn new(entries: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        let config = Config::from_ron(&format!(
            r#"Empath (
                postoffice: {:?},
                scheduler: (max_kids: Some(8), mailbin: "/usr/lib/empath"),
                entries: {entries},
            )"#,
            root.path().display().to_string()
        ))
        .unwrap();

        let launcher = PairLauncher::default();
        let peers = Rc::clone(&launcher.peers);
        let commands = Rc::clone(&launcher.commands);
        let options = Options {
            sync_start: true,
            ..Options::default()
        };

        Self {
            scheduler: Scheduler::new(config, options, Box::new(launcher)).unwrap(),
            peers,
            commands,
            root,
        }
    }

    fn path(&self) -> &Path {
        self.root.path()
    }

    fn write_job(&self, inode: u64, body: &str) {
        fs::write(self.path().join("queue").join(inode.to_string()), b"Subject: hi\n\nhi\n").unwrap();
        fs::write(
            self.path().join("transport").join(inode.to_string()),
            format!("i {inode}\nl S{inode}\ns smtp sender.example alice\n{body}"),
        )
        .unwrap();
    }

    /// Offsets of every recipient record of a job, in file order
    fn offsets(&self, inode: u64) -> Vec<usize> {
        let text = fs::read_to_string(self.path().join("transport").join(inode.to_string())).unwrap();
        let mut offsets = Vec::new();
        let mut at = 0;

        for line in text.split_inclusive('\n') {
            if line.starts_with('r') {
                offsets.push(at);
            }
            at += line.len();
        }

        offsets
    }

    fn say(&self, worker: usize, text: &str) {
        (&self.peers.borrow()[worker]).write_all(text.as_bytes()).unwrap();
    }

    fn heard(&self, worker: usize) -> String {
        let mut out = String::new();
        let mut buf = [0u8; 512];
        let peers = self.peers.borrow();

        loop {
            match (&peers[worker]).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.push_str(std::str::from_utf8(&buf[..n]).unwrap()),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => panic!("{e}"),
            }
        }

        out
    }

    fn pass(&mut self) {
        self.scheduler.mux(Duration::from_millis(200), NOW);
    }

    fn states(&self) -> Vec<ProcState> {
        self.scheduler.pool().iter().map(|(_, p)| p.state).collect()
    }
}

const SHARED_GROUP: &str = r#"[
    (channel: "*", interval: Some(600)),
    (channel: "smtp", command: Some("smtp -c $channel"), max_kids: Some(1)),
]"#;

#[test]
fn three_recipients_two_vertices_one_worker() {
    let mut h = Harness::new(SHARED_GROUP);
    h.write_job(
        40,
        "r smtp a.example one\nr smtp b.example two\nr smtp A.example three\n",
    );

    h.scheduler.startup(NOW);
    h.scheduler.step(NOW).unwrap();

    assert_eq!(h.scheduler.graph().vertices.iter().count(), 2);
    assert_eq!(h.scheduler.pool().len(), 1);
    assert_eq!(h.states(), vec![ProcState::Larva]);
    assert_eq!(*h.commands.borrow(), vec!["/usr/lib/empath/ta/smtp -c smtp".to_string()]);

    h.say(0, "#hungry\n");
    h.pass();
    assert_eq!(h.heard(0), "40\ta.example\n");
    assert_eq!(h.states(), vec![ProcState::Stuffing]);

    // A second pass must not start another worker: the group allows one
    h.scheduler.step(NOW).unwrap();
    assert_eq!(h.scheduler.pool().len(), 1);

    let offsets = h.offsets(40);
    h.say(0, &format!("40/{}\tsmtp; 250\tok\n", offsets[0]));
    h.say(0, &format!("40/{}\tsmtp; 250\tok\n", offsets[2]));
    h.pass();

    assert_eq!(h.scheduler.graph().vertices.iter().count(), 1);
    assert_eq!(h.scheduler.stats().delivered, 2);

    h.say(0, "#hungry\n");
    h.pass();
    assert_eq!(h.heard(0), "40\tb.example\n");

    h.say(0, &format!("40/{}\tsmtp; 250\tok\n", offsets[1]));
    h.say(0, "#hungry\n");
    h.pass();

    assert_eq!(h.heard(0), "#idle\n");
    assert_eq!(h.states(), vec![ProcState::Idle]);
    assert!(h.scheduler.graph().files.iter().next().is_none());
    assert!(!h.path().join("transport/40").exists());
    assert!(!h.path().join("queue/40").exists());
}

#[test]
fn idle_worker_is_reused_for_a_new_job() {
    let mut h = Harness::new(SHARED_GROUP);
    h.write_job(50, "r smtp a.example one\n");

    h.scheduler.startup(NOW);
    h.scheduler.step(NOW).unwrap();
    h.say(0, "#hungry\n");
    h.pass();
    assert_eq!(h.heard(0), "50\ta.example\n");

    h.say(0, &format!("50/{}\t\tok\n#hungry\n", h.offsets(50)[0]));
    h.pass();
    assert_eq!(h.heard(0), "#idle\n");

    // Answering `#idle` parks the worker on its group
    h.say(0, "#hungry\n");
    h.pass();
    assert_eq!(h.states(), vec![ProcState::Idle]);
    assert!(h.scheduler.graph().threads.iter().next().is_none());

    h.write_job(51, "r smtp c.example x\n");
    h.scheduler.receive_notify("51", NOW);
    h.pass();
    h.scheduler.step(NOW).unwrap();

    assert_eq!(h.scheduler.pool().len(), 1);
    assert_eq!(h.heard(0), "51\tc.example\n");
    assert_eq!(h.states(), vec![ProcState::Stuffing]);
}

#[test]
fn host_bound_command_gets_bare_job_names() {
    let mut h = Harness::new(r#"[(channel: "smtp", command: Some("smtp $host"))]"#);
    h.write_job(60, "r smtp a.example one\nr smtp b.example two\n");

    h.scheduler.startup(NOW);
    h.scheduler.step(NOW).unwrap();

    assert_eq!(h.scheduler.pool().len(), 2);
    let mut commands = h.commands.borrow().clone();
    commands.sort();
    assert_eq!(
        commands,
        vec![
            "/usr/lib/empath/ta/smtp a.example".to_string(),
            "/usr/lib/empath/ta/smtp b.example".to_string(),
        ]
    );

    h.say(0, "#hungry\n");
    h.say(1, "#hungry\n");
    h.pass();

    assert_eq!(h.heard(0), "60\n");
    assert_eq!(h.heard(1), "60\n");
}

#[test]
fn worker_resync_drops_recipients_finished_on_disk() {
    let mut h = Harness::new(SHARED_GROUP);
    h.write_job(70, "r smtp a.example one\nr smtp a.example two\n");

    h.scheduler.startup(NOW);
    h.scheduler.step(NOW).unwrap();
    h.say(0, "#hungry\n");
    h.pass();
    assert_eq!(h.heard(0), "70\ta.example\n");

    // The worker marks the first recipient delivered itself
    let path = h.path().join("transport/70");
    let mut text = fs::read_to_string(&path).unwrap();
    let first = h.offsets(70)[0];
    text.replace_range(first + 1..first + 2, "+");
    fs::write(&path, text).unwrap();

    h.say(0, "#resync 70\n");
    h.pass();

    let (_, vertex) = h.scheduler.graph().vertices.iter().next().unwrap();
    assert_eq!(vertex.recipients, vec![h.offsets(70)[1]]);
    assert_eq!(vertex.outstanding, 1);

    h.say(0, &format!("70/{}\t\tok\n", h.offsets(70)[1]));
    h.pass();

    assert!(h.scheduler.graph().files.iter().next().is_none());
    assert!(!path.exists());
}

#[test]
fn failed_recipients_keep_the_job_accounted() {
    let mut h = Harness::new(SHARED_GROUP);
    h.write_job(80, "r smtp a.example one\nr smtp a.example two\n");

    h.scheduler.startup(NOW);
    h.scheduler.step(NOW).unwrap();
    h.say(0, "#hungry\n");
    h.pass();

    let offsets = h.offsets(80);
    h.say(0, &format!("80/{}\tsmtp; 550\terror no such user\n", offsets[0]));
    h.say(0, &format!("80/{}\tsmtp; 451\tdeferred busy\n", offsets[1]));
    h.pass();

    assert_eq!(h.scheduler.stats().failed, 1);
    let (_, vertex) = h.scheduler.graph().vertices.iter().next().unwrap();
    assert_eq!(vertex.recipients, vec![offsets[1]]);
    assert!(vertex.fed_by.is_none());
    assert!(vertex.wakeup >= NOW + 600);

    let (_, file) = h.scheduler.graph().files.iter().next().unwrap();
    assert_eq!(file.rcpnts_failed, 1);
    assert_eq!(file.rcpnts_work, 1);
}

#[test]
fn query_snapshot_reports_workers() {
    let mut h = Harness::new(SHARED_GROUP);
    h.write_job(90, "r smtp a.example one\n");

    h.scheduler.startup(NOW);
    h.scheduler.step(NOW).unwrap();

    let snapshot = h.scheduler.snapshot(NOW);
    assert!(snapshot.contains("thread smtp a.example vertices=1 unfed=1 workers=1"));
    assert!(snapshot.contains("state=LARVA"));
    assert!(snapshot.contains("group smtp * rule=1 threads=1 transporters=1 idle=0"));
}
