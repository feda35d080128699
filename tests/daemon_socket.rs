//! The control-socket protocol over a real UNIX stream socket.

use std::fs;
use std::os::unix::net::UnixListener;
use std::sync::Arc;
use std::thread;

use cgroupctl::daemon::RulesDaemon;
use cgroupctl::rules::{register_unchanged_process, FLAG_CANCEL_UNCHANGE, FLAG_UNCHANGE_CHILDREN};
use cgroupctl::{Context, MountTable};

#[test]
fn register_and_cancel_over_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("cgred.socket");

    let rules = dir.path().join("cgrules.conf");
    fs::write(&rules, "").unwrap();
    let ctx = Context::with_mounts(MountTable::default());
    ctx.set_rules_source(&rules, dir.path().join("cgrules.d"));

    let mut daemon = RulesDaemon::new(Arc::new(ctx));
    let listener = UnixListener::bind(&socket_path).unwrap();

    let server = thread::spawn(move || {
        // Serve exactly two clients: store, then cancel.
        for _ in 0..2 {
            let (mut stream, _) = listener.accept().unwrap();
            daemon.handle_control_client(&mut stream);
        }
    });

    let pid = std::process::id() as libc::pid_t;
    register_unchanged_process(&socket_path, pid, FLAG_UNCHANGE_CHILDREN).unwrap();
    register_unchanged_process(&socket_path, pid, FLAG_CANCEL_UNCHANGE).unwrap();

    server.join().unwrap();
}

#[test]
fn absent_daemon_counts_as_success() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("nobody-listens.socket");
    register_unchanged_process(&socket_path, 1, 0).unwrap();
}
