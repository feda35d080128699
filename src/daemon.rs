//! The rules-engine daemon: listens on the kernel process-event
//! channel, reclassifies processes whose identity changed, and serves a
//! local control socket that lets tools pin pids against
//! reclassification.
//!
//! The daemon is single-threaded: one poll loop multiplexes the
//! netlink channel and the control socket. Reload signals only raise a
//! flag; the work happens between poll rounds so handlers never touch
//! shared state.

use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, Signal, SigmaskHow};
use nix::time::{clock_gettime, ClockId};
use nix::unistd::{chown, Gid, Uid};

use crate::classify::{procname_of_pid, uid_gid_of_pid};
use crate::error::*;
use crate::events::{EventSocket, ProcEvent};
use crate::rules::{FLAG_CANCEL_UNCHANGE, FLAG_UNCHANGE_CHILDREN};
use crate::Context;

/// Reply sent to a control-socket client after its pid was recorded.
pub const SUCCESS_REPLY: &[u8] = b"SUCCESS_STORE_PID\0";

/// Default path of the control socket.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/cgred.socket";

const RECEIVE_BUFFER_SIZE: usize = 32768;

static RELOAD_RULES: AtomicBool = AtomicBool::new(false);
static RELOAD_TEMPLATES: AtomicBool = AtomicBool::new(false);
static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigusr2(_: libc::c_int) {
    RELOAD_RULES.store(true, Ordering::Relaxed);
}

extern "C" fn on_sigusr1(_: libc::c_int) {
    RELOAD_TEMPLATES.store(true, Ordering::Relaxed);
}

extern "C" fn on_term(_: libc::c_int) {
    TERMINATE.store(true, Ordering::Relaxed);
}

/// The set of pids the daemon must leave alone.
#[derive(Debug)]
pub struct UnchangedPids {
    entries: Vec<(libc::pid_t, i32)>,
}

impl Default for UnchangedPids {
    fn default() -> Self {
        UnchangedPids {
            entries: Vec::with_capacity(100),
        }
    }
}

impl UnchangedPids {
    /// Record a pid. Idempotent: a pid already present keeps its
    /// original flags.
    pub fn store(&mut self, pid: libc::pid_t, flags: i32) {
        if self.entries.iter().any(|(p, _)| *p == pid) {
            return;
        }
        self.entries.push((pid, flags));
        debug!("stored unchanged process (pid {}, flags {})", pid, flags);
    }

    pub fn remove(&mut self, pid: libc::pid_t) {
        if let Some(idx) = self.entries.iter().position(|(p, _)| *p == pid) {
            self.entries.remove(idx);
            debug!("removed unchanged process (pid {})", pid);
        }
    }

    pub fn is_member(&self, pid: libc::pid_t) -> bool {
        self.entries.iter().any(|(p, _)| *p == pid)
    }

    /// Member whose children inherit the mark.
    pub fn is_child_unchanged(&self, pid: libc::pid_t) -> bool {
        self.entries
            .iter()
            .any(|(p, flags)| *p == pid && flags & FLAG_UNCHANGE_CHILDREN != 0)
    }
}

/// Pids whose reclassification recently finished, with the monotonic
/// time it did. A fork that the kernel timestamped before that moment
/// happened while the parent was still being moved, so the child must
/// be moved too.
#[derive(Debug, Default)]
struct ParentInfoList {
    entries: Vec<(libc::pid_t, u64)>,
}

impl ParentInfoList {
    fn store(&mut self, pid: libc::pid_t, timestamp_ns: u64) {
        self.entries.push((pid, timestamp_ns));
    }

    /// Purge entries from before the fork, then test whether the
    /// parent finished a reclassification after the fork happened.
    fn fork_inherits_reclassification(&mut self, parent: libc::pid_t, fork_ns: u64) -> bool {
        self.entries.retain(|(_, ts)| *ts > fork_ns);
        self.entries
            .iter()
            .any(|(pid, ts)| *pid == parent && fork_ns <= *ts)
    }
}

fn monotonic_now_ns() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => (ts.tv_sec() as u64) * 1_000_000_000 + ts.tv_nsec() as u64,
        Err(err) => {
            warn!("failed to read the monotonic clock: {}", err);
            0
        }
    }
}

/// Identity override taken from the event itself: the status file may
/// not reflect the change yet.
enum IdOverride {
    None,
    Uid(u32),
    Gid(u32),
}

/// The daemon engine. Owns the registry and the parent-info window;
/// the embedding binary drives [`RulesDaemon::run`].
pub struct RulesDaemon {
    ctx: Arc<Context>,
    unchanged: UnchangedPids,
    parents: ParentInfoList,
    socket_path: PathBuf,
    socket_uid: Option<u32>,
    socket_gid: Option<u32>,
    template_reloader: Option<Box<dyn Fn(&Context) + Send>>,
}

impl RulesDaemon {
    pub fn new(ctx: Arc<Context>) -> RulesDaemon {
        RulesDaemon {
            ctx,
            unchanged: UnchangedPids::default(),
            parents: ParentInfoList::default(),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            socket_uid: None,
            socket_gid: None,
            template_reloader: None,
        }
    }

    pub fn set_socket_path<P: Into<PathBuf>>(&mut self, path: P) {
        self.socket_path = path.into();
    }

    /// Owner applied to the control socket after bind (mode is always
    /// 0660).
    pub fn set_socket_owner(&mut self, uid: Option<u32>, gid: Option<u32>) {
        self.socket_uid = uid;
        self.socket_gid = gid;
    }

    /// Called on SIGUSR1 to rebuild the template database.
    pub fn set_template_reloader<F>(&mut self, reloader: F)
    where
        F: Fn(&Context) + Send + 'static,
    {
        self.template_reloader = Some(Box::new(reloader));
    }

    /// Reclassify one pid. The pid having already exited is not an
    /// error; a classification that failed because the pid vanished
    /// mid-flight leaves a parent-info record so a racing fork still
    /// gets handled.
    fn classify_pid(&mut self, pid: libc::pid_t, id_override: IdOverride) {
        let (mut euid, mut egid) = match uid_gid_of_pid(pid) {
            Ok(ids) => ids,
            Err(_) => return,
        };
        let procname = match procname_of_pid(pid) {
            Ok(name) => name,
            Err(_) => return,
        };

        match id_override {
            IdOverride::Uid(uid) => euid = uid,
            IdOverride::Gid(gid) => egid = gid,
            IdOverride::None => {}
        }

        match self.ctx.classify(euid, egid, Some(&procname), pid, true) {
            Ok(()) => {
                info!(
                    "cgroup change for pid {}, uid {}, gid {}, procname {} succeeded",
                    pid, euid, egid, procname
                );
                self.parents.store(pid, monotonic_now_ns());
            }
            Err(err)
                if err.kind() == ErrorKind::Other
                    && matches!(err.os_error(), Some(libc::ESRCH) | Some(libc::ENOENT)) =>
            {
                // The process went away while we were moving it; a
                // child forked during the attempt still needs moving.
                self.parents.store(pid, monotonic_now_ns());
            }
            Err(err) => {
                warn!(
                    "cgroup change for pid {}, uid {}, gid {}, procname {} failed: {}",
                    pid, euid, egid, procname, err
                );
            }
        }
    }

    /// Dispatch one kernel event.
    pub fn handle_event(&mut self, event: &ProcEvent) {
        match *event {
            ProcEvent::Uid { pid, euid } => {
                if self.unchanged.is_member(pid) {
                    return;
                }
                debug!("uid event: pid {}, euid {}", pid, euid);
                self.classify_pid(pid, IdOverride::Uid(euid));
            }
            ProcEvent::Gid { pid, egid } => {
                if self.unchanged.is_member(pid) {
                    return;
                }
                debug!("gid event: pid {}, egid {}", pid, egid);
                self.classify_pid(pid, IdOverride::Gid(egid));
            }
            ProcEvent::Exec { pid } => {
                if self.unchanged.is_member(pid) {
                    return;
                }
                debug!("exec event: pid {}", pid);
                self.classify_pid(pid, IdOverride::None);
            }
            ProcEvent::Fork {
                parent_pid,
                child_pid,
                timestamp_ns,
            } => {
                if self.unchanged.is_child_unchanged(parent_pid) {
                    self.unchanged.store(child_pid, FLAG_UNCHANGE_CHILDREN);
                    return;
                }
                if self
                    .parents
                    .fork_inherits_reclassification(parent_pid, timestamp_ns)
                {
                    debug!(
                        "fork of {} during reclassification, classifying child {}",
                        parent_pid, child_pid
                    );
                    self.classify_pid(child_pid, IdOverride::None);
                }
            }
            ProcEvent::Exit { pid } => {
                self.unchanged.remove(pid);
            }
        }
    }

    /// Serve one control-socket client: `i32` pid, then `i32` flags.
    /// [`FLAG_CANCEL_UNCHANGE`] removes the pid; anything else stores
    /// it with those flags.
    pub fn handle_control_client(&mut self, stream: &mut UnixStream) {
        let mut word = [0u8; 4];

        if let Err(err) = stream.read_exact(&mut word) {
            warn!("error reading daemon socket: {}", err);
            return;
        }
        let pid = i32::from_ne_bytes(word);

        if !Path::new(&format!("/proc/{}", pid)).exists() {
            warn!("there is no such process (pid {})", pid);
            return;
        }

        if let Err(err) = stream.read_exact(&mut word) {
            warn!("error reading daemon socket: {}", err);
            return;
        }
        let flags = i32::from_ne_bytes(word);

        if flags == FLAG_CANCEL_UNCHANGE {
            self.unchanged.remove(pid);
        } else {
            self.unchanged.store(pid, flags);
        }

        if let Err(err) = stream.write_all(SUCCESS_REPLY) {
            warn!("cannot write to daemon socket: {}", err);
        }
    }

    fn bind_control_socket(&self) -> Result<UnixListener> {
        let _ = fs::remove_file(&self.socket_path);
        let listener = UnixListener::bind(&self.socket_path).map_err(Error::from_os)?;
        listener.set_nonblocking(true).map_err(Error::from_os)?;

        chown(
            self.socket_path.as_path(),
            self.socket_uid.map(Uid::from_raw),
            self.socket_gid.map(Gid::from_raw),
        )?;
        fs::set_permissions(&self.socket_path, fs::Permissions::from_mode(0o660))
            .map_err(Error::from_os)?;

        debug!(
            "control socket {} bound, owner {:?}:{:?}",
            self.socket_path.display(),
            self.socket_uid,
            self.socket_gid
        );
        Ok(listener)
    }

    fn install_signal_handlers() -> Result<()> {
        let flags = SaFlags::SA_RESTART;
        let mask = SigSet::empty();
        unsafe {
            sigaction(
                Signal::SIGUSR2,
                &SigAction::new(SigHandler::Handler(on_sigusr2), flags, mask),
            )?;
            sigaction(
                Signal::SIGUSR1,
                &SigAction::new(SigHandler::Handler(on_sigusr1), flags, mask),
            )?;
            sigaction(
                Signal::SIGTERM,
                &SigAction::new(SigHandler::Handler(on_term), flags, mask),
            )?;
            sigaction(
                Signal::SIGINT,
                &SigAction::new(SigHandler::Handler(on_term), flags, mask),
            )?;
        }
        Ok(())
    }

    fn service_flags(&mut self) {
        if RELOAD_RULES.swap(false, Ordering::Relaxed) {
            info!("reloading rules configuration");
            match self.ctx.reload_rules() {
                Ok(()) => {
                    for rule in self.ctx.rules_snapshot() {
                        info!("rule: {}", rule);
                    }
                }
                Err(err) => warn!("rules reload failed, keeping previous rules: {}", err),
            }
            if let Some(ref reloader) = self.template_reloader {
                reloader(&self.ctx);
            }
        }

        if RELOAD_TEMPLATES.swap(false, Ordering::Relaxed) {
            info!("reloading templates configuration");
            if let Some(ref reloader) = self.template_reloader {
                reloader(&self.ctx);
            }
        }
    }

    /// The daemon main loop: poll the event channel and the control
    /// socket until SIGINT/SIGTERM.
    pub fn run(&mut self) -> Result<()> {
        let events = EventSocket::open()?;
        let listener = self.bind_control_socket()?;
        Self::install_signal_handlers()?;

        // Reload signals are only let through while parked in poll, so
        // they can never interrupt an I/O operation half-way.
        let mut reload_set = SigSet::empty();
        reload_set.add(Signal::SIGUSR1);
        reload_set.add(Signal::SIGUSR2);
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&reload_set), None)?;

        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
        info!("daemon running, control socket {}", self.socket_path.display());

        loop {
            if TERMINATE.load(Ordering::Relaxed) {
                info!("terminating on signal");
                break;
            }
            self.service_flags();

            let mut fds = [
                PollFd::new(events.as_raw_fd(), PollFlags::POLLIN),
                PollFd::new(listener.as_raw_fd(), PollFlags::POLLIN),
            ];

            sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&reload_set), None)?;
            let poll_result = poll(&mut fds, -1);
            sigprocmask(SigmaskHow::SIG_BLOCK, Some(&reload_set), None)?;

            match poll_result {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => {
                    error!("poll error: {}", err);
                    return Err(err.into());
                }
            }

            let netlink_ready = fds[0]
                .revents()
                .map(|r| r.contains(PollFlags::POLLIN))
                .unwrap_or(false);
            let control_ready = fds[1]
                .revents()
                .map(|r| r.contains(PollFlags::POLLIN))
                .unwrap_or(false);

            if netlink_ready {
                match events.receive(&mut buf) {
                    Ok(batch) => {
                        for event in &batch {
                            self.handle_event(event);
                        }
                    }
                    Err(err) => warn!("netlink receive failed: {}", err),
                }
            }

            if control_ready {
                loop {
                    match listener.accept() {
                        Ok((mut stream, _)) => self.handle_control_client(&mut stream),
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(err) => {
                            warn!("accept error: {}", err);
                            break;
                        }
                    }
                }
            }
        }

        let _ = fs::remove_file(&self.socket_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountTable;

    fn test_daemon() -> (RulesDaemon, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let rules = dir.path().join("cgrules.conf");
        fs::write(&rules, "").unwrap();

        let ctx = Context::with_mounts(MountTable::default());
        ctx.set_rules_source(&rules, dir.path().join("cgrules.d"));
        (RulesDaemon::new(Arc::new(ctx)), dir)
    }

    #[test]
    fn registry_store_is_idempotent() {
        let mut reg = UnchangedPids::default();
        reg.store(10, 0);
        reg.store(10, FLAG_UNCHANGE_CHILDREN);
        assert!(reg.is_member(10));
        // First flags win.
        assert!(!reg.is_child_unchanged(10));

        reg.remove(10);
        assert!(!reg.is_member(10));
    }

    #[test]
    fn child_inheritance_needs_the_flag() {
        let mut reg = UnchangedPids::default();
        reg.store(20, FLAG_UNCHANGE_CHILDREN);
        assert!(reg.is_child_unchanged(20));
        reg.store(21, 0);
        assert!(!reg.is_child_unchanged(21));
    }

    #[test]
    fn fork_window_matches_only_recent_reclassification() {
        let mut parents = ParentInfoList::default();
        parents.store(100, 1_000);

        // Fork stamped before the reclassification finished: inherits.
        let mut p = ParentInfoList::default();
        p.store(100, 1_000);
        assert!(p.fork_inherits_reclassification(100, 500));

        // Fork stamped after: the entry is purged, no inheritance.
        assert!(!parents.fork_inherits_reclassification(100, 2_000));
        assert!(parents.entries.is_empty());

        // Different parent: no inheritance.
        let mut p = ParentInfoList::default();
        p.store(100, 1_000);
        assert!(!p.fork_inherits_reclassification(101, 500));
    }

    #[test]
    fn fork_event_propagates_the_unchanged_mark() {
        let (mut daemon, _dir) = test_daemon();
        daemon.unchanged.store(30, FLAG_UNCHANGE_CHILDREN);

        daemon.handle_event(&ProcEvent::Fork {
            parent_pid: 30,
            child_pid: 31,
            timestamp_ns: 1,
        });
        assert!(daemon.unchanged.is_member(31));
        assert!(daemon.unchanged.is_child_unchanged(31));

        daemon.handle_event(&ProcEvent::Exit { pid: 31 });
        assert!(!daemon.unchanged.is_member(31));
    }

    #[test]
    fn successful_event_records_a_parent_window() {
        let (mut daemon, _dir) = test_daemon();
        let pid = std::process::id() as libc::pid_t;

        // Empty rule list: classification is a no-op success, which
        // still opens the fork-inheritance window.
        daemon.handle_event(&ProcEvent::Exec { pid });
        assert!(daemon.parents.entries.iter().any(|(p, _)| *p == pid));
    }

    #[test]
    fn vanished_pid_event_is_silent() {
        let (mut daemon, _dir) = test_daemon();
        // A pid that cannot exist on this system.
        daemon.handle_event(&ProcEvent::Exec { pid: i32::MAX - 1 });
        assert!(daemon.parents.entries.is_empty());
    }

    #[test]
    fn control_protocol_round_trip() {
        let (mut daemon, _dir) = test_daemon();
        let (mut client, mut server) = UnixStream::pair().unwrap();
        let pid = std::process::id() as i32;

        client.write_all(&pid.to_ne_bytes()).unwrap();
        client.write_all(&FLAG_UNCHANGE_CHILDREN.to_ne_bytes()).unwrap();
        daemon.handle_control_client(&mut server);

        let mut reply = [0u8; SUCCESS_REPLY.len()];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply[..], SUCCESS_REPLY);
        assert!(daemon.unchanged.is_child_unchanged(pid));

        // Cancel it again.
        client.write_all(&pid.to_ne_bytes()).unwrap();
        client.write_all(&FLAG_CANCEL_UNCHANGE.to_ne_bytes()).unwrap();
        daemon.handle_control_client(&mut server);
        let mut reply = [0u8; SUCCESS_REPLY.len()];
        client.read_exact(&mut reply).unwrap();
        assert!(!daemon.unchanged.is_member(pid));
    }

    #[test]
    fn unknown_pid_gets_no_reply() {
        let (mut daemon, _dir) = test_daemon();
        let (mut client, mut server) = UnixStream::pair().unwrap();

        client.write_all(&(i32::MAX - 1).to_ne_bytes()).unwrap();
        client.write_all(&0i32.to_ne_bytes()).unwrap();
        daemon.handle_control_client(&mut server);
        drop(server);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert!(reply.is_empty());
    }
}
