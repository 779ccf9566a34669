//! Hand the notification fd to an in-test agent and answer everything it
//! receives with "continue".
//!
//! Kernels or sandboxes that refuse seccomp listeners skip these tests.

use std::io;
use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::prctl;
use pid1_seccomp::{
    FilterProgram, HandoffConfig, NotifSizes, Responder, ResponderExit, hand_off_over,
    recv_descriptors,
};

/// Tried on a throwaway thread, which keeps the filter.
fn listeners_supported() -> bool {
    if NotifSizes::query().is_err() {
        return false;
    }
    thread::spawn(|| {
        prctl::set_no_new_privs().is_ok() && FilterProgram::build(false).install().is_ok()
    })
    .join()
    .unwrap_or(false)
}

fn accept_with_deadline(listener: &UnixListener) -> UnixStream {
    listener.set_nonblocking(true).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).unwrap();
                return stream;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                assert!(Instant::now() < deadline, "pid1 never connected");
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => panic!("accept failed: {e}"),
        }
    }
}

fn spawn_pid1(socket: &Path, extra: &[&str], program: &[&str]) -> Child {
    Command::new(env!("CARGO_BIN_EXE_pid1"))
        .env_remove("PID1_SECCOMP_INTERCEPT_NET")
        .env_remove("PID1_SECCOMP_SEND_PROCESS_FDS")
        .arg("--seccomp-socket")
        .arg(socket)
        .args(extra)
        .arg("--")
        .args(program)
        .stdin(Stdio::null())
        .spawn()
        .unwrap()
}

/// Act as the agent for one pid1 run. Returns the number of descriptors
/// received and pid1's exit code.
fn run_agent(extra: &[&str], program: &[&str]) -> (usize, i32) {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("agent.sock");
    let listener = UnixListener::bind(&socket).unwrap();

    let mut child = spawn_pid1(&socket, extra, program);
    let stream = accept_with_deadline(&listener);

    let mut fds = match recv_descriptors(stream.as_fd()) {
        Ok(fds) => fds,
        Err(e) => {
            let _ = child.kill();
            panic!("pid1 sent no descriptors: {e}");
        }
    };
    let count = fds.len();
    let listener_fd = fds.remove(0);

    let responder = thread::spawn(move || Responder::new(listener_fd, None)?.run());
    let status = child.wait().unwrap();
    assert_eq!(responder.join().unwrap().unwrap(), ResponderExit::HangUp);
    (count, status.code().unwrap())
}

#[test]
fn notification_fd_reaches_the_agent() {
    if !listeners_supported() {
        eprintln!("seccomp listeners unavailable, skipping");
        return;
    }
    let (count, code) = run_agent(&[], &["/bin/sh", "-c", "exit 3"]);
    assert_eq!(count, 1);
    assert_eq!(code, 3);
}

#[test]
fn process_descriptors_are_sent_along() {
    if !listeners_supported() {
        eprintln!("seccomp listeners unavailable, skipping");
        return;
    }
    let (count, code) = run_agent(&["--seccomp-send-process-fds"], &["/bin/true"]);
    assert_eq!(count, 3);
    assert_eq!(code, 0);
}

#[test]
fn network_interception_resolves_its_own_handoff() {
    if !listeners_supported() {
        eprintln!("seccomp listeners unavailable, skipping");
        return;
    }
    let (count, code) = run_agent(&["--seccomp-intercept-net"], &["/bin/sh", "-c", "exit 4"]);
    assert_eq!(count, 1);
    assert_eq!(code, 4);
}

#[test]
fn main_program_runs_when_the_listener_is_not_delivered() {
    if !listeners_supported() {
        eprintln!("seccomp listeners unavailable, skipping");
        return;
    }

    // The agent is gone before the bundle is sent. pid1 inherits the filter
    // from this thread; its tcsetpgrp is trapped and must still be answered.
    let code = thread::spawn(|| {
        let (ours, agent) = UnixStream::pair().unwrap();
        drop(agent);
        assert!(hand_off_over(&ours, &HandoffConfig::default()).is_err());

        let output = Command::new(env!("CARGO_BIN_EXE_pid1"))
            .env_remove("PID1_SECCOMP_NOTIFY_SOCK_PATH")
            .args(["--", "/bin/sh", "-c", "exit 5"])
            .stdin(Stdio::null())
            .output()
            .unwrap();
        assert!(
            !String::from_utf8_lossy(&output.stderr).contains("ENOSYS"),
            "{}",
            String::from_utf8_lossy(&output.stderr)
        );
        output.status.code().unwrap()
    })
    .join()
    .unwrap();
    assert_eq!(code, 5);
}
